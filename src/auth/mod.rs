//! PPP authenticators.
//!
//! One authenticator runs between LCP completion and the network phase,
//! chosen by the protocol agreed during LCP. On success it leaves the
//! higher-layer authentication key in the session: the 16-byte MPPE
//! master key for the MS-CHAPv2 family, 32 zero bytes for PAP.

pub mod eap;
pub mod mschap;
pub mod pap;

pub use eap::EapAuthenticator;
pub use mschap::MschapAuthenticator;
pub use pap::PapAuthenticator;

/// The all-zero key PAP leaves behind for crypto binding.
pub const ZERO_HLAK_LEN: usize = 32;
