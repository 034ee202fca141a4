//! IPv6CP option set and negotiation policy.
//!
//! Only the Interface-Identifier option is negotiated; address
//! autoconfiguration beyond the link-local identifier is left to the
//! host stack.

use std::sync::Arc;

use tracing::debug;

use crate::codec::ppp::{find_option, RawOption};
use crate::error::Error;
use crate::message::{PhaseFailure, Where};
use crate::session::Session;

use super::negotiator::NegotiationPolicy;

/// IPv6CP option types we negotiate.
pub mod options {
    pub const INTERFACE_IDENTIFIER: u8 = 1;
}

/// IPv6CP policy for the generic negotiator.
pub struct Ipv6cpPolicy {
    session: Arc<Session>,
}

impl Ipv6cpPolicy {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    fn option_identifier(opt: &RawOption) -> Option<[u8; 8]> {
        opt.data.as_slice().try_into().ok()
    }
}

impl NegotiationPolicy for Ipv6cpPolicy {
    fn server_reject(&self, opts: &[RawOption]) -> Vec<RawOption> {
        opts.iter()
            .filter(|opt| opt.kind != options::INTERFACE_IDENTIFIER)
            .cloned()
            .collect()
    }

    fn server_nak(&self, _opts: &[RawOption]) -> Vec<RawOption> {
        Vec::new()
    }

    fn accept_server(&mut self, opts: &[RawOption]) {
        if let Some(id) =
            find_option(opts, options::INTERFACE_IDENTIFIER).and_then(Self::option_identifier)
        {
            debug!(identifier = ?id, "Peer interface identifier");
        }
    }

    fn client_request(&mut self) -> Vec<RawOption> {
        vec![RawOption::new(
            options::INTERFACE_IDENTIFIER,
            self.session.negotiated().ipv6_interface_id.to_vec(),
        )]
    }

    fn accept_client_nak(&mut self, opts: &[RawOption]) -> Result<(), PhaseFailure> {
        if let Some(id) =
            find_option(opts, options::INTERFACE_IDENTIFIER).and_then(Self::option_identifier)
        {
            debug!(identifier = ?id, "Adopting server-assigned interface identifier");
            self.session.negotiated().ipv6_interface_id = id;
        }
        Ok(())
    }

    fn accept_client_reject(&mut self, opts: &[RawOption]) -> Result<(), PhaseFailure> {
        if find_option(opts, options::INTERFACE_IDENTIFIER).is_some() {
            return Err(PhaseFailure::new(
                Where::Ipv6cpIdentifier,
                Error::OptionRejected,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PppConfig};

    fn session() -> Arc<Session> {
        Session::new(Arc::new(Config {
            hostname: "vpn.example.com".into(),
            port: 443,
            username: "u".into(),
            password: "p".into(),
            proxy: None,
            tls: Default::default(),
            ppp: PppConfig {
                ipv6_enabled: true,
                ..PppConfig::default()
            },
            dns: Default::default(),
            routes: Default::default(),
            reconnect: Default::default(),
        }))
    }

    #[test]
    fn request_carries_interface_identifier() {
        let mut policy = Ipv6cpPolicy::new(session());
        let opts = policy.client_request();
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].kind, options::INTERFACE_IDENTIFIER);
        assert_eq!(opts[0].data.len(), 8);
    }

    #[test]
    fn adopts_nak_identifier() {
        let policy_session = session();
        let mut policy = Ipv6cpPolicy::new(policy_session.clone());
        let id = [1, 2, 3, 4, 5, 6, 7, 8];
        policy
            .accept_client_nak(&[RawOption::new(options::INTERFACE_IDENTIFIER, id.to_vec())])
            .unwrap();
        assert_eq!(policy_session.negotiated().ipv6_interface_id, id);
    }

    #[test]
    fn identifier_reject_is_fatal() {
        let mut policy = Ipv6cpPolicy::new(session());
        let failure = policy
            .accept_client_reject(&[RawOption::new(
                options::INTERFACE_IDENTIFIER,
                vec![0; 8],
            )])
            .unwrap_err();
        assert_eq!(failure.at, Where::Ipv6cpIdentifier);
        assert_eq!(failure.error, Error::OptionRejected);
    }

    #[test]
    fn unknown_options_rejected() {
        let policy = Ipv6cpPolicy::new(session());
        let rejects = policy.server_reject(&[
            RawOption::new(options::INTERFACE_IDENTIFIER, vec![0; 8]),
            RawOption::new(0x02, vec![0x01]),
        ]);
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].kind, 0x02);
    }
}
