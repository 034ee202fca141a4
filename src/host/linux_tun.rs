//! Linux TUN device for the CLI binary.
//!
//! Device creation goes through the TUNSETIFF ioctl; addressing,
//! routing and MTU are applied with the `ip` tool when the engine calls
//! `establish`. Per-application rules have no plain-Linux equivalent
//! and are ignored with a warning.

use std::ffi::CStr;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;

use libc::{c_char, c_short, c_void, close, ioctl, open, O_RDWR};
use tracing::{debug, info, warn};

use crate::device::{TunDevice, TunReader, TunWriter};

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x400454CA;

/// Interface request structure for TUNSETIFF.
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; 16],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// A queued configuration step, applied at `establish`.
enum Step {
    Address(IpAddr, u8),
    Dns(IpAddr),
    Route(String),
    Mtu(u16),
}

/// Linux TUN device.
pub struct LinuxTun {
    fd: OwnedFd,
    name: String,
    steps: Vec<Step>,
}

impl LinuxTun {
    /// Create a TUN device; the kernel assigns a `tun%d` name.
    pub fn create() -> io::Result<Self> {
        unsafe {
            let fd = open(b"/dev/net/tun\0".as_ptr() as *const c_char, O_RDWR);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut ifr = IfReq {
                ifr_name: [0; 16],
                ifr_flags: (libc::IFF_TUN | libc::IFF_NO_PI) as c_short,
                _pad: [0; 22],
            };

            if ioctl(fd, TUNSETIFF, &mut ifr as *mut _ as *mut c_void) < 0 {
                close(fd);
                return Err(io::Error::last_os_error());
            }

            let name = CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned();
            info!("Created TUN device: {}", name);

            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
                name,
                steps: Vec::new(),
            })
        }
    }

    fn run_ip(&self, args: &[&str]) -> io::Result<()> {
        let status = Command::new("ip").args(args).status()?;
        if !status.success() {
            return Err(io::Error::other(format!("ip {} failed", args.join(" "))));
        }
        Ok(())
    }
}

impl TunDevice for LinuxTun {
    fn add_address(&mut self, addr: IpAddr, prefix: u8) -> io::Result<()> {
        self.steps.push(Step::Address(addr, prefix));
        Ok(())
    }

    fn add_dns_server(&mut self, addr: IpAddr) -> io::Result<()> {
        self.steps.push(Step::Dns(addr));
        Ok(())
    }

    fn add_route(&mut self, cidr: &str) -> io::Result<()> {
        self.steps.push(Step::Route(cidr.to_string()));
        Ok(())
    }

    fn add_allowed_application(&mut self, id: &str) -> io::Result<()> {
        warn!(app = id, "Per-application rules are not supported here, ignoring");
        Ok(())
    }

    fn set_mtu(&mut self, mtu: u16) -> io::Result<()> {
        self.steps.push(Step::Mtu(mtu));
        Ok(())
    }

    fn establish(self: Box<Self>) -> io::Result<(Box<dyn TunReader>, Box<dyn TunWriter>)> {
        self.run_ip(&["link", "set", "dev", &self.name, "up"])?;

        for step in &self.steps {
            match step {
                Step::Address(addr, prefix) => {
                    self.run_ip(&[
                        "addr",
                        "add",
                        &format!("{addr}/{prefix}"),
                        "dev",
                        &self.name,
                    ])?;
                    debug!(%addr, prefix, "Address configured");
                }
                Step::Dns(addr) => {
                    // Best effort through systemd-resolved.
                    let status = Command::new("resolvectl")
                        .args(["dns", &self.name, &addr.to_string()])
                        .status();
                    if !matches!(status, Ok(s) if s.success()) {
                        warn!(%addr, "Could not apply DNS server, continuing");
                    }
                }
                Step::Route(cidr) => {
                    self.run_ip(&["route", "add", cidr, "dev", &self.name])?;
                    debug!(route = %cidr, "Route installed");
                }
                Step::Mtu(mtu) => {
                    self.run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()])?;
                }
            }
        }

        let read_fd = self.fd.try_clone()?;
        let write_fd = self.fd.try_clone()?;
        info!(device = %self.name, "Device established");

        Ok((
            Box::new(FdReader { fd: read_fd }),
            Box::new(FdWriter { fd: write_fd }),
        ))
    }
}

struct FdReader {
    fd: OwnedFd,
}

impl TunReader for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

struct FdWriter {
    fd: OwnedFd,
}

impl TunWriter for FdWriter {
    fn write(&mut self, buf: &[u8], off: usize, len: usize) -> io::Result<()> {
        let data = &buf[off..off + len];
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const c_void,
                data.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
