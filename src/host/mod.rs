//! Host-side collaborators for the CLI binary.
//!
//! The engine treats the virtual device, trust store and notification
//! surface as externally provided; this module is the CLI's provision
//! of them. GUI hosts supply their own.

#[cfg(target_os = "linux")]
pub mod linux_tun;

use std::io;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::device::{Channel, Reporter, TrustStore};

/// Trust store over a directory of PEM files.
pub struct DirTrustStore {
    dir: PathBuf,
}

impl DirTrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TrustStore for DirTrustStore {
    fn list_ca_certs(&self) -> io::Result<Vec<(String, Vec<u8>)>> {
        let mut certs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_pem = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "pem" | "crt" | "cer"));
            if !is_pem {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            certs.push((name, std::fs::read(&path)?));
        }
        certs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(certs)
    }
}

/// Reporter that forwards notifications to the log.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn notify(&self, channel: Channel, body: &str, id: u32) {
        match channel {
            Channel::Error => warn!(id, "{body}"),
            Channel::Reconnect => info!(id, "Reconnecting: {body}"),
            Channel::Disconnect => info!(id, "Disconnected: {body}"),
            Channel::Certificate => warn!(id, "Untrusted server certificate:\n{body}"),
        }
    }
}
