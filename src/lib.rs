//! SSTP VPN client engine.
//!
//! Opens a TLS tunnel to an SSTP server (optionally through an HTTP
//! CONNECT proxy), performs the SSTP call-setup handshake, negotiates a
//! PPP session inside the tunnel (LCP, authentication, IPCP/IPv6CP),
//! binds the session to the server certificate, and bridges IP
//! datagrams between the tunnel and a host-provided virtual device.

pub mod auth;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod demux;
pub mod device;
pub mod engine;
pub mod error;
pub mod host;
pub mod mailbox;
pub mod message;
pub mod mux;
pub mod ppp;
pub mod route;
pub mod session;
pub mod sstp;
pub mod timer;
pub mod transport;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use message::{Terminal, Where};
pub use session::Session;
