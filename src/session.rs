//! Shared per-tunnel session state.
//!
//! One `Session` exists per engine run. Configuration is immutable;
//! negotiated values live behind a mutex and follow the ownership
//! convention that exactly one task writes a field during its phase
//! (the IPCP negotiator owns `ipv4`, the authenticator owns `hlak`,
//! and so on). Frame identifiers are allocated atomically and wrap
//! modulo 256.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::config::{AuthProtocol, Config};
use crate::crypto::HashProtocol;

/// Mutable session values produced by negotiation.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Effective MRU after LCP
    pub mru: u16,
    /// Authentication protocol agreed during LCP
    pub auth: Option<AuthProtocol>,
    /// IPv4 address after IPCP
    pub ipv4: Ipv4Addr,
    /// IPv6 interface identifier after IPv6CP
    pub ipv6_interface_id: [u8; 8],
    /// DNS address proposed by the server during IPCP
    pub proposed_dns: Ipv4Addr,
    /// Higher-layer authentication key for crypto binding
    pub hlak: Option<Vec<u8>>,
    /// Server nonce from Call-Connect-Ack
    pub nonce: [u8; 32],
    /// Hash protocol chosen from the server's bitmask
    pub hash_protocol: HashProtocol,
}

/// Shared session state for one tunnel attempt.
pub struct Session {
    /// Immutable user configuration.
    pub config: Arc<Config>,
    /// Correlation GUID for the duplex-post exchange, fixed at start.
    pub guid: String,
    frame_id: AtomicU8,
    negotiated: Mutex<Negotiated>,
}

impl Session {
    /// Create the session for a fresh tunnel attempt.
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let ipv4 = if config.ppp.request_static_ipv4 {
            config.ppp.static_ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED)
        } else {
            Ipv4Addr::UNSPECIFIED
        };

        Arc::new(Self {
            guid: Uuid::new_v4().to_string().to_uppercase(),
            frame_id: AtomicU8::new(0),
            negotiated: Mutex::new(Negotiated {
                mru: config.ppp.mru,
                auth: None,
                ipv4,
                ipv6_interface_id: [0u8; 8],
                proposed_dns: Ipv4Addr::UNSPECIFIED,
                hlak: None,
                nonce: [0u8; 32],
                hash_protocol: HashProtocol::Sha256,
            }),
            config,
        })
    }

    /// Allocate the next PPP frame identifier, wrapping modulo 256.
    pub fn next_frame_id(&self) -> u8 {
        self.frame_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Lock the negotiated state.
    pub fn negotiated(&self) -> MutexGuard<'_, Negotiated> {
        self.negotiated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PppConfig;
    use std::collections::HashSet;
    use std::sync::Arc as StdArc;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            hostname: "vpn.example.com".into(),
            port: 443,
            username: "u".into(),
            password: "p".into(),
            proxy: None,
            tls: Default::default(),
            ppp: PppConfig::default(),
            dns: Default::default(),
            routes: Default::default(),
            reconnect: Default::default(),
        })
    }

    #[test]
    fn frame_ids_wrap_modulo_256() {
        let session = Session::new(config());
        for expected in 0..=255u8 {
            assert_eq!(session.next_frame_id(), expected);
        }
        assert_eq!(session.next_frame_id(), 0);
    }

    #[test]
    fn frame_ids_unique_across_threads() {
        let session = Session::new(config());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let session = StdArc::clone(&session);
            handles.push(std::thread::spawn(move || {
                (0..32).map(|_| session.next_frame_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "frame id {id} allocated twice");
            }
        }
        assert_eq!(seen.len(), 128);
    }

    #[test]
    fn static_ipv4_seeds_negotiated_state() {
        let mut cfg = (*config()).clone();
        cfg.ppp.request_static_ipv4 = true;
        cfg.ppp.static_ipv4 = Some(Ipv4Addr::new(10, 0, 0, 5));
        let session = Session::new(Arc::new(cfg));
        assert_eq!(session.negotiated().ipv4, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn guid_is_uppercase() {
        let session = Session::new(config());
        assert_eq!(session.guid, session.guid.to_uppercase());
        assert_eq!(session.guid.len(), 36);
    }
}
