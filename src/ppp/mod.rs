//! PPP negotiation: the generic Configure machine, the per-protocol
//! policies, and the steady-state control task.

pub mod control;
pub mod ipcp;
pub mod ipv6cp;
pub mod lcp;
pub mod negotiator;

pub use control::PppControl;
pub use ipcp::IpcpPolicy;
pub use ipv6cp::Ipv6cpPolicy;
pub use lcp::LcpPolicy;
pub use negotiator::{NegotiationPolicy, Negotiator};
