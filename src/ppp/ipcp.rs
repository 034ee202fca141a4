//! IPCP option set and negotiation policy.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::debug;

use crate::codec::ppp::{find_option, RawOption};
use crate::error::Error;
use crate::message::{PhaseFailure, Where};
use crate::session::Session;

use super::negotiator::NegotiationPolicy;

/// IPCP option types we negotiate.
pub mod options {
    pub const IP_ADDRESS: u8 = 3;
    pub const PRIMARY_DNS: u8 = 129;
}

/// IPCP policy for the generic negotiator.
pub struct IpcpPolicy {
    session: Arc<Session>,
    dns_rejected: bool,
}

impl IpcpPolicy {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            dns_rejected: false,
        }
    }

    fn option_addr(opt: &RawOption) -> Option<Ipv4Addr> {
        let bytes: [u8; 4] = opt.data.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(bytes))
    }
}

impl NegotiationPolicy for IpcpPolicy {
    fn server_reject(&self, opts: &[RawOption]) -> Vec<RawOption> {
        // The client does not serve DNS, so the server's own DNS options
        // are rejected along with everything we do not understand.
        opts.iter()
            .filter(|opt| opt.kind != options::IP_ADDRESS)
            .cloned()
            .collect()
    }

    fn server_nak(&self, _opts: &[RawOption]) -> Vec<RawOption> {
        Vec::new()
    }

    fn accept_server(&mut self, opts: &[RawOption]) {
        if let Some(addr) = find_option(opts, options::IP_ADDRESS).and_then(Self::option_addr) {
            debug!(peer = %addr, "Peer IPv4 address");
        }
    }

    fn client_request(&mut self) -> Vec<RawOption> {
        let negotiated = self.session.negotiated();
        let mut opts = vec![RawOption::new(
            options::IP_ADDRESS,
            negotiated.ipv4.octets().to_vec(),
        )];

        if self.session.config.dns.request_address && !self.dns_rejected {
            opts.push(RawOption::new(
                options::PRIMARY_DNS,
                negotiated.proposed_dns.octets().to_vec(),
            ));
        }
        opts
    }

    fn accept_client_nak(&mut self, opts: &[RawOption]) -> Result<(), PhaseFailure> {
        if let Some(addr) = find_option(opts, options::IP_ADDRESS).and_then(Self::option_addr) {
            if self.session.config.ppp.request_static_ipv4 {
                // The configured address is a requirement, not a hint.
                return Err(PhaseFailure::new(Where::Ipcp, Error::AddressRejected));
            }
            debug!(%addr, "Adopting server-assigned IPv4 address");
            self.session.negotiated().ipv4 = addr;
        }

        if let Some(dns) = find_option(opts, options::PRIMARY_DNS).and_then(Self::option_addr) {
            // Adopted verbatim, matching long-standing client behavior.
            debug!(%dns, "Adopting server-proposed DNS");
            self.session.negotiated().proposed_dns = dns;
        }

        Ok(())
    }

    fn accept_client_reject(&mut self, opts: &[RawOption]) -> Result<(), PhaseFailure> {
        for opt in opts {
            match opt.kind {
                options::IP_ADDRESS => {
                    return Err(PhaseFailure::new(Where::IpcpIp, Error::OptionRejected));
                }
                options::PRIMARY_DNS => {
                    debug!("Server rejected the DNS request, continuing without");
                    self.dns_rejected = true;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DnsConfig, PppConfig};

    fn session_with(ppp: PppConfig, dns: DnsConfig) -> Arc<Session> {
        Session::new(Arc::new(Config {
            hostname: "vpn.example.com".into(),
            port: 443,
            username: "u".into(),
            password: "p".into(),
            proxy: None,
            tls: Default::default(),
            ppp,
            dns,
            routes: Default::default(),
            reconnect: Default::default(),
        }))
    }

    fn session() -> Arc<Session> {
        session_with(PppConfig::default(), DnsConfig::default())
    }

    #[test]
    fn rejects_server_dns_and_unknown_options() {
        let policy = IpcpPolicy::new(session());
        let opts = vec![
            RawOption::new(options::IP_ADDRESS, vec![192, 0, 2, 1]),
            RawOption::new(options::PRIMARY_DNS, vec![192, 0, 2, 53]),
            RawOption::new(0x02, vec![0, 0x2D, 0x0F, 0x01]), // IP-Compression
        ];
        let rejects = policy.server_reject(&opts);
        assert_eq!(rejects.len(), 2);
        assert_eq!(rejects[0].kind, options::PRIMARY_DNS);
        assert_eq!(rejects[1].kind, 0x02);
    }

    #[test]
    fn request_includes_dns_only_when_configured() {
        let mut policy = IpcpPolicy::new(session());
        let opts = policy.client_request();
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].kind, options::IP_ADDRESS);

        let mut policy = IpcpPolicy::new(session_with(
            PppConfig::default(),
            DnsConfig {
                request_address: true,
                ..DnsConfig::default()
            },
        ));
        let opts = policy.client_request();
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[1].kind, options::PRIMARY_DNS);
        assert_eq!(opts[1].data, vec![0, 0, 0, 0]);
    }

    #[test]
    fn adopts_nak_address_when_dynamic() {
        let policy_session = session();
        let mut policy = IpcpPolicy::new(policy_session.clone());
        policy
            .accept_client_nak(&[RawOption::new(options::IP_ADDRESS, vec![192, 0, 2, 10])])
            .unwrap();
        assert_eq!(
            policy_session.negotiated().ipv4,
            Ipv4Addr::new(192, 0, 2, 10)
        );
    }

    #[test]
    fn static_address_nak_is_fatal() {
        let session = session_with(
            PppConfig {
                request_static_ipv4: true,
                static_ipv4: Some(Ipv4Addr::new(10, 0, 0, 5)),
                ..PppConfig::default()
            },
            DnsConfig::default(),
        );
        // The static address seeds the first request.
        let mut policy = IpcpPolicy::new(session);
        let opts = policy.client_request();
        assert_eq!(opts[0].data, vec![10, 0, 0, 5]);

        let failure = policy
            .accept_client_nak(&[RawOption::new(options::IP_ADDRESS, vec![192, 0, 2, 10])])
            .unwrap_err();
        assert_eq!(failure.at, Where::Ipcp);
        assert_eq!(failure.error, Error::AddressRejected);
    }

    #[test]
    fn dns_nak_value_adopted_unvalidated() {
        let policy_session = session_with(
            PppConfig::default(),
            DnsConfig {
                request_address: true,
                ..DnsConfig::default()
            },
        );
        let mut policy = IpcpPolicy::new(policy_session.clone());
        policy
            .accept_client_nak(&[RawOption::new(options::PRIMARY_DNS, vec![0, 0, 0, 0])])
            .unwrap();
        assert_eq!(policy_session.negotiated().proposed_dns, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn ip_reject_is_fatal_dns_reject_is_not() {
        let mut policy = IpcpPolicy::new(session_with(
            PppConfig::default(),
            DnsConfig {
                request_address: true,
                ..DnsConfig::default()
            },
        ));

        policy
            .accept_client_reject(&[RawOption::new(options::PRIMARY_DNS, vec![0, 0, 0, 0])])
            .unwrap();
        // DNS is gone from subsequent requests.
        assert_eq!(policy.client_request().len(), 1);

        let failure = policy
            .accept_client_reject(&[RawOption::new(options::IP_ADDRESS, vec![0, 0, 0, 0])])
            .unwrap_err();
        assert_eq!(failure.at, Where::IpcpIp);
        assert_eq!(failure.error, Error::OptionRejected);
    }
}
