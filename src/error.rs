//! Error types for the SSTP client engine.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tunnel engine.
///
/// Every variant maps to one terminal outcome of a phase or pump; the
/// engine pairs it with a [`Where`](crate::message::Where) tag when it
/// travels on the control channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Echo-timer expiry or a phase that exceeded its total budget
    #[error("Operation timed out")]
    Timeout,

    /// Configure-Request retry budget spent
    #[error("Request retry budget exhausted")]
    CountExhausted,

    /// Unknown SSTP message type or PPP protocol number
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// A message that is not valid in the current phase
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Codec failure or a bad CA file
    #[error("Parsing failed: {0}")]
    ParsingFailed(String),

    /// TLS hostname or certificate-path failure
    #[error("Certificate verification failed: {0}")]
    VerificationFailed(String),

    /// SSTP Call-Connect-Nak
    #[error("Server negatively acknowledged the call")]
    NegativeAcknowledged,

    /// Peer sent Call-Abort
    #[error("Peer requested abort")]
    AbortRequested,

    /// Peer sent Call-Disconnect
    #[error("Peer requested disconnect")]
    DisconnectRequested,

    /// Peer sent LCP Terminate-Request
    #[error("Peer requested link termination")]
    TerminateRequested,

    /// Peer sent LCP Protocol-Reject
    #[error("Peer rejected a protocol")]
    ProtocolRejected,

    /// Peer sent LCP Code-Reject
    #[error("Peer rejected a code")]
    CodeRejected,

    /// PPP authentication rejection or proxy 403
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// IPCP rejected a statically requested address
    #[error("Requested address rejected by peer")]
    AddressRejected,

    /// A required configure option was rejected by the peer
    #[error("Required option rejected by peer")]
    OptionRejected,

    /// Negotiation finished with an all-zero address
    #[error("No valid address was negotiated")]
    InvalidAddress,

    /// SSTP length field out of range
    #[error("Invalid SSTP packet size: {0}")]
    InvalidPacketSize(usize),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Create a parsing error.
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::ParsingFailed(msg.into())
    }

    /// Create an unexpected-message error.
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::UnexpectedMessage(msg.into())
    }

    /// Create an unknown-type error.
    pub fn unknown<S: Into<String>>(msg: S) -> Self {
        Self::UnknownType(msg.into())
    }

    /// Check whether this error came from the peer tearing the call down,
    /// as opposed to a local failure.
    pub fn is_peer_initiated(&self) -> bool {
        matches!(
            self,
            Self::AbortRequested
                | Self::DisconnectRequested
                | Self::TerminateRequested
                | Self::ProtocolRejected
                | Self::CodeRejected
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
