//! Host collaborator interfaces.
//!
//! The engine never creates platform resources itself: the host hands it
//! a virtual device factory, a trust store and a notification surface.
//! All three are synchronous; blocking device I/O is moved onto blocking
//! tasks by the packet pumps.

use std::io;
use std::net::IpAddr;

/// Notification channels understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Terminal errors
    Error,
    /// Reconnection attempts
    Reconnect,
    /// Orderly disconnects
    Disconnect,
    /// Untrusted server certificates, body is PEM
    Certificate,
}

/// Host notification surface.
pub trait Reporter: Send + Sync {
    /// Deliver a notification. `id` correlates updates to one event.
    fn notify(&self, channel: Channel, body: &str, id: u32);
}

/// A reporter that drops everything, for tests and detached runs.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn notify(&self, _channel: Channel, _body: &str, _id: u32) {}
}

/// Source of PEM-encoded CA certificates for the custom validator.
pub trait TrustStore: Send + Sync {
    /// Return `(file name, PEM bytes)` for every configured CA.
    fn list_ca_certs(&self) -> io::Result<Vec<(String, Vec<u8>)>>;
}

/// An empty trust store.
pub struct EmptyTrustStore;

impl TrustStore for EmptyTrustStore {
    fn list_ca_certs(&self) -> io::Result<Vec<(String, Vec<u8>)>> {
        Ok(Vec::new())
    }
}

/// Reads L3 datagrams from the established device.
pub trait TunReader: Send {
    /// Read one datagram into `buf`, returning its length. Blocks.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Writes L3 datagrams to the established device.
pub trait TunWriter: Send {
    /// Write one datagram. Blocks.
    fn write(&mut self, buf: &[u8], off: usize, len: usize) -> io::Result<()>;
}

/// Virtual network device under construction.
///
/// The engine configures addresses, DNS, routes and per-app rules, then
/// calls `establish` exactly once to obtain the packet endpoints.
pub trait TunDevice: Send {
    /// Add an interface address.
    fn add_address(&mut self, addr: IpAddr, prefix: u8) -> io::Result<()>;

    /// Add a DNS server.
    fn add_dns_server(&mut self, addr: IpAddr) -> io::Result<()>;

    /// Add a route in CIDR notation.
    fn add_route(&mut self, cidr: &str) -> io::Result<()>;

    /// Allow-list an application identifier.
    fn add_allowed_application(&mut self, id: &str) -> io::Result<()>;

    /// Set the device MTU.
    fn set_mtu(&mut self, mtu: u16) -> io::Result<()>;

    /// Bring the device up and return its packet endpoints.
    fn establish(self: Box<Self>) -> io::Result<(Box<dyn TunReader>, Box<dyn TunWriter>)>;
}
