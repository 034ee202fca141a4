//! Control-channel vocabulary shared by every engine task.
//!
//! Each cooperative task (negotiator, authenticator, SSTP client, pumps)
//! reports exactly one outcome to the engine: `Proceeded` when its phase
//! is done, or the error that ended it. The `Where` tag identifies the
//! reporting layer so the host can render a precise diagnosis.

use crate::error::Error;

/// Layer tags for control messages and terminal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Where {
    /// HTTP CONNECT proxy exchange
    Proxy,
    /// TCP connect and TLS handshake
    Tls,
    /// Certificate handling (trust-store files, path validation)
    Cert,
    /// SSTP call-setup request phase
    SstpRequest,
    /// SSTP post-connected control task and echo liveness
    SstpControl,
    /// LCP negotiation
    Lcp,
    /// LCP MRU option specifically
    LcpMru,
    /// LCP authentication option specifically
    LcpAuth,
    /// PPP control task (echo/terminate/rejects)
    PppControl,
    /// PAP authenticator
    Pap,
    /// MS-CHAPv2 authenticator
    Chap,
    /// EAP-MSCHAPv2 authenticator
    Eap,
    /// IPCP negotiation
    Ipcp,
    /// IPCP IPv4-Address option specifically
    IpcpIp,
    /// IPv6CP negotiation
    Ipv6cp,
    /// IPv6CP Interface-Identifier option specifically
    Ipv6cpIdentifier,
    /// Incoming demultiplexer
    Demux,
    /// Outgoing multiplexer
    Mux,
    /// Virtual device setup
    Tun,
    /// Route parsing and installation
    Route,
}

impl std::fmt::Display for Where {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Where::Proxy => "PROXY",
            Where::Tls => "TLS",
            Where::Cert => "CERT",
            Where::SstpRequest => "SSTP_REQUEST",
            Where::SstpControl => "SSTP_CONTROL",
            Where::Lcp => "LCP",
            Where::LcpMru => "LCP_MRU",
            Where::LcpAuth => "LCP_AUTH",
            Where::PppControl => "PPP_CONTROL",
            Where::Pap => "PAP",
            Where::Chap => "CHAP",
            Where::Eap => "EAP",
            Where::Ipcp => "IPCP",
            Where::IpcpIp => "IPCP_IP",
            Where::Ipv6cp => "IPV6CP",
            Where::Ipv6cpIdentifier => "IPV6CP_IDENTIFIER",
            Where::Demux => "DEMUX",
            Where::Mux => "MUX",
            Where::Tun => "TUN",
            Where::Route => "ROUTE",
        };
        f.write_str(s)
    }
}

/// What a task has to say about its phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Phase completed; the engine may advance.
    Proceeded,
    /// Phase failed; the engine tears the tunnel down.
    Failed(Error),
}

impl Outcome {
    /// Whether this outcome lets the engine advance.
    pub fn is_proceeded(&self) -> bool {
        matches!(self, Outcome::Proceeded)
    }
}

/// One message on the engine's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Reporting layer.
    pub from: Where,
    /// What happened there.
    pub outcome: Outcome,
}

impl ControlMessage {
    /// A phase-completed message.
    pub fn proceeded(from: Where) -> Self {
        Self {
            from,
            outcome: Outcome::Proceeded,
        }
    }

    /// A phase-failed message.
    pub fn failed(from: Where, error: Error) -> Self {
        Self {
            from,
            outcome: Outcome::Failed(error),
        }
    }
}

/// A failure with its originating layer attached, used by phases that
/// run inline in the engine rather than as tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    /// Originating layer.
    pub at: Where,
    /// What went wrong.
    pub error: Error,
}

impl PhaseFailure {
    pub fn new(at: Where, error: Error) -> Self {
        Self { at, error }
    }
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.at, self.error)
    }
}

/// Terminal outcome of an engine run, published to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    /// The layer that ended the run.
    pub from: Where,
    /// `None` for an orderly host-requested shutdown.
    pub error: Option<Error>,
}

impl std::fmt::Display for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(e) => write!(f, "{}: {}", self.from, e),
            None => write!(f, "{}: closed", self.from),
        }
    }
}
