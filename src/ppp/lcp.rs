//! LCP option set and negotiation policy.

use std::sync::Arc;

use tracing::debug;

use crate::codec::ppp::{find_option, RawOption};
use crate::config::{AuthProtocol, DEFAULT_MRU, MIN_MRU};
use crate::crypto;
use crate::error::Error;
use crate::message::{PhaseFailure, Where};
use crate::session::Session;

use super::negotiator::NegotiationPolicy;

/// LCP option types we negotiate.
pub mod options {
    pub const MRU: u8 = 1;
    pub const AUTH_PROTOCOL: u8 = 3;
    pub const MAGIC_NUMBER: u8 = 5;
}

/// Auth protocol numbers inside the Authentication-Protocol option.
const AUTH_PAP: u16 = 0xC023;
const AUTH_CHAP: u16 = 0xC223;
const AUTH_EAP: u16 = 0xC227;

/// CHAP algorithm byte for MS-CHAPv2.
const CHAP_ALGORITHM_MSCHAPV2: u8 = 0x81;

/// LCP policy for the generic negotiator.
pub struct LcpPolicy {
    session: Arc<Session>,
    mru_rejected: bool,
    magic_rejected: bool,
}

impl LcpPolicy {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            mru_rejected: false,
            magic_rejected: false,
        }
    }

    /// Decode the peer's Authentication-Protocol option value.
    fn parse_auth(data: &[u8]) -> Option<AuthProtocol> {
        if data.len() < 2 {
            return None;
        }
        let protocol = u16::from_be_bytes([data[0], data[1]]);
        match protocol {
            AUTH_PAP => Some(AuthProtocol::Pap),
            AUTH_CHAP if data.get(2) == Some(&CHAP_ALGORITHM_MSCHAPV2) => {
                Some(AuthProtocol::Mschapv2)
            }
            AUTH_EAP => Some(AuthProtocol::EapMschapv2),
            _ => None,
        }
    }

    /// The option value for one of our auth protocols.
    fn auth_option(proto: AuthProtocol) -> RawOption {
        match proto {
            AuthProtocol::Pap => RawOption::new(options::AUTH_PROTOCOL, AUTH_PAP.to_be_bytes()),
            AuthProtocol::Mschapv2 => RawOption::new(
                options::AUTH_PROTOCOL,
                vec![0xC2, 0x23, CHAP_ALGORITHM_MSCHAPV2],
            ),
            AuthProtocol::EapMschapv2 => {
                RawOption::new(options::AUTH_PROTOCOL, AUTH_EAP.to_be_bytes())
            }
        }
    }

    /// The best enabled protocol, by the fixed EAP > MSCHAPv2 > PAP
    /// priority. The server's own preference is deliberately ignored.
    fn preferred_auth(&self) -> Option<AuthProtocol> {
        [
            AuthProtocol::EapMschapv2,
            AuthProtocol::Mschapv2,
            AuthProtocol::Pap,
        ]
        .into_iter()
        .find(|proto| self.session.config.auth_enabled(*proto))
    }
}

impl NegotiationPolicy for LcpPolicy {
    fn server_reject(&self, options: &[RawOption]) -> Vec<RawOption> {
        options
            .iter()
            .filter(|opt| {
                !matches!(
                    opt.kind,
                    options::MRU | options::AUTH_PROTOCOL | options::MAGIC_NUMBER
                )
            })
            .cloned()
            .collect()
    }

    fn server_nak(&self, opts: &[RawOption]) -> Vec<RawOption> {
        let mut naks = Vec::new();
        let config = &self.session.config;

        if let Some(mru) = find_option(opts, options::MRU) {
            if let Ok(peer_mru) = mru.as_u16() {
                if peer_mru < config.ppp.mtu {
                    naks.push(RawOption::u16(options::MRU, config.ppp.mtu));
                }
            }
        }

        if let Some(auth) = find_option(opts, options::AUTH_PROTOCOL) {
            let acceptable = Self::parse_auth(&auth.data)
                .is_some_and(|proto| config.auth_enabled(proto));
            if !acceptable {
                if let Some(preferred) = self.preferred_auth() {
                    naks.push(Self::auth_option(preferred));
                }
            }
        }

        naks
    }

    fn accept_server(&mut self, opts: &[RawOption]) {
        if let Some(auth) = find_option(opts, options::AUTH_PROTOCOL) {
            if let Some(proto) = Self::parse_auth(&auth.data) {
                debug!(%proto, "Authentication protocol agreed");
                self.session.negotiated().auth = Some(proto);
            }
        }
    }

    fn client_request(&mut self) -> Vec<RawOption> {
        let mut opts = Vec::new();
        if !self.mru_rejected {
            opts.push(RawOption::u16(options::MRU, self.session.negotiated().mru));
        }
        if !self.magic_rejected {
            let magic: [u8; 4] = crypto::random_bytes();
            opts.push(RawOption::new(options::MAGIC_NUMBER, magic.to_vec()));
        }
        opts
    }

    fn accept_client_nak(&mut self, opts: &[RawOption]) -> Result<(), PhaseFailure> {
        if let Some(mru) = find_option(opts, options::MRU) {
            if let Ok(peer_mru) = mru.as_u16() {
                let clamped = peer_mru.clamp(MIN_MRU, self.session.config.ppp.mru);
                debug!(peer = peer_mru, effective = clamped, "Peer adjusted our MRU");
                self.session.negotiated().mru = clamped;
            }
        }
        // A Nak'd magic number just gets a fresh value on the next request.
        Ok(())
    }

    fn accept_client_reject(&mut self, opts: &[RawOption]) -> Result<(), PhaseFailure> {
        for opt in opts {
            match opt.kind {
                options::MRU => {
                    self.mru_rejected = true;
                    if DEFAULT_MRU > self.session.config.ppp.mru {
                        return Err(PhaseFailure::new(Where::LcpMru, Error::OptionRejected));
                    }
                    self.session.negotiated().mru = DEFAULT_MRU;
                }
                options::AUTH_PROTOCOL => {
                    return Err(PhaseFailure::new(Where::LcpAuth, Error::OptionRejected));
                }
                options::MAGIC_NUMBER => self.magic_rejected = true,
                _ => {}
            }
        }
        Ok(())
    }
}
