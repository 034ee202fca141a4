//! Configuration surface for the tunnel engine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Smallest MRU/MTU the link will operate with.
pub const MIN_MRU: u16 = 68;

/// Largest MRU/MTU the link will operate with.
pub const MAX_MRU: u16 = 2000;

/// Default MRU/MTU when the peer does not negotiate one.
pub const DEFAULT_MRU: u16 = 1500;

/// PPP authentication protocols the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProtocol {
    /// Password Authentication Protocol
    Pap,
    /// MS-CHAPv2 carried in PPP CHAP
    Mschapv2,
    /// MS-CHAPv2 carried in EAP
    EapMschapv2,
}

impl std::fmt::Display for AuthProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthProtocol::Pap => write!(f, "PAP"),
            AuthProtocol::Mschapv2 => write!(f, "MSCHAPv2"),
            AuthProtocol::EapMschapv2 => write!(f, "EAP-MSCHAPv2"),
        }
    }
}

/// TLS protocol version selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// Let the library pick.
    #[default]
    Default,
    /// Restrict to TLS 1.2.
    Tls12,
    /// Restrict to TLS 1.3.
    Tls13,
}

/// HTTP proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy hostname
    pub host: String,

    /// Proxy port
    pub port: u16,

    /// Proxy username (optional)
    pub username: Option<String>,

    /// Proxy password (optional)
    pub password: Option<String>,
}

/// TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Verify the peer hostname against `Config::hostname` after the handshake
    #[serde(default = "default_true")]
    pub verify_host: bool,

    /// Build the validator from the trust store instead of system roots
    #[serde(default)]
    pub specify_trust: bool,

    /// Directory of PEM CA files, consulted only when `specify_trust` is set
    #[serde(default)]
    pub cert_dir: String,

    /// Restrict the enabled protocol version
    #[serde(default)]
    pub version: TlsVersion,

    /// Restrict ciphersuites to the configured list
    #[serde(default)]
    pub select_suites: bool,

    /// Ciphersuite names, consulted only when `select_suites` is set
    #[serde(default)]
    pub suites: Vec<String>,

    /// Send a server-name extension different from `Config::hostname`
    #[serde(default)]
    pub use_custom_sni: bool,

    /// The custom server name, consulted only when `use_custom_sni` is set
    #[serde(default)]
    pub custom_sni: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify_host: true,
            specify_trust: false,
            cert_dir: String::new(),
            version: TlsVersion::Default,
            select_suites: false,
            suites: Vec::new(),
            use_custom_sni: false,
            custom_sni: String::new(),
        }
    }
}

/// PPP link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PppConfig {
    /// Maximum receive unit proposed to the peer
    #[serde(default = "default_mru")]
    pub mru: u16,

    /// Maximum transmit unit for outgoing datagrams
    #[serde(default = "default_mru")]
    pub mtu: u16,

    /// Enabled authentication protocols, in preference order
    #[serde(default = "default_auth_protocols")]
    pub auth_protocols: Vec<AuthProtocol>,

    /// Authentication phase budget in seconds
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,

    /// Negotiate IPv4 (IPCP) and bridge IPv4 datagrams
    #[serde(default = "default_true")]
    pub ipv4_enabled: bool,

    /// Negotiate IPv6 (IPv6CP) and bridge IPv6 datagrams
    #[serde(default)]
    pub ipv6_enabled: bool,

    /// Request a specific IPv4 address instead of accepting the server's
    #[serde(default)]
    pub request_static_ipv4: bool,

    /// The static IPv4 address, consulted only when `request_static_ipv4` is set
    #[serde(default)]
    pub static_ipv4: Option<Ipv4Addr>,
}

impl Default for PppConfig {
    fn default() -> Self {
        Self {
            mru: DEFAULT_MRU,
            mtu: DEFAULT_MRU,
            auth_protocols: default_auth_protocols(),
            auth_timeout: default_auth_timeout(),
            ipv4_enabled: true,
            ipv6_enabled: false,
            request_static_ipv4: false,
            static_ipv4: None,
        }
    }
}

/// DNS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Ask the server for a DNS address during IPCP
    #[serde(default)]
    pub request_address: bool,

    /// Install a custom DNS server on the device instead
    #[serde(default)]
    pub use_custom_server: bool,

    /// The custom DNS address, consulted only when `use_custom_server` is set
    #[serde(default)]
    pub custom_address: Option<Ipv4Addr>,
}

/// Routing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesConfig {
    /// Route all traffic through the tunnel
    #[serde(default)]
    pub add_default_route: bool,

    /// Route RFC 1918 ranges (and fc00::/7) through the tunnel
    #[serde(default)]
    pub route_private_addresses: bool,

    /// Install the custom route list
    #[serde(default)]
    pub add_custom_routes: bool,

    /// Newline-separated CIDR strings, consulted only when `add_custom_routes` is set
    #[serde(default)]
    pub custom_routes: String,

    /// Restrict the tunnel to the allow-listed applications
    #[serde(default)]
    pub enable_app_based_rule: bool,

    /// Application identifiers for the allow list
    #[serde(default)]
    pub allowed_apps: Vec<String>,
}

/// Host-side reconnection policy. The engine itself never retries; the
/// binary consumes this after a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Restart the engine after a failed run
    #[serde(default)]
    pub enabled: bool,

    /// Number of restart attempts
    #[serde(default = "default_reconnect_count")]
    pub count: u32,

    /// Seconds to wait between attempts
    #[serde(default = "default_reconnect_interval")]
    pub interval: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: default_reconnect_count(),
            interval: default_reconnect_interval(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server hostname. TLS host-verify target and duplex-post Host header.
    pub hostname: String,

    /// Server port (default: 443)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for PPP authentication
    pub username: String,

    /// Password for PPP authentication
    pub password: String,

    /// HTTP proxy, tunneled through with CONNECT when present
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// TLS options
    #[serde(default)]
    pub tls: TlsConfig,

    /// PPP link options
    #[serde(default)]
    pub ppp: PppConfig,

    /// DNS options
    #[serde(default)]
    pub dns: DnsConfig,

    /// Routing options
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Host-side reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_port() -> u16 {
    443
}
fn default_true() -> bool {
    true
}
fn default_mru() -> u16 {
    DEFAULT_MRU
}
fn default_auth_protocols() -> Vec<AuthProtocol> {
    vec![AuthProtocol::Mschapv2]
}
fn default_auth_timeout() -> u64 {
    10
}
fn default_reconnect_count() -> u32 {
    3
}
fn default_reconnect_interval() -> u64 {
    10
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            anyhow::bail!("Hostname cannot be empty");
        }

        if self.username.is_empty() {
            anyhow::bail!("Username cannot be empty");
        }

        if !(MIN_MRU..=MAX_MRU).contains(&self.ppp.mru) {
            anyhow::bail!(
                "The given MRU is out of range ({}..={})",
                MIN_MRU,
                MAX_MRU
            );
        }

        if !(MIN_MRU..=MAX_MRU).contains(&self.ppp.mtu) {
            anyhow::bail!(
                "The given MTU is out of range ({}..={})",
                MIN_MRU,
                MAX_MRU
            );
        }

        if self.ppp.auth_protocols.is_empty() {
            anyhow::bail!("At least one authentication protocol must be enabled");
        }

        if self.ppp.auth_timeout < 1 {
            anyhow::bail!("Authentication timeout must be at least 1 second");
        }

        if !self.ppp.ipv4_enabled && !self.ppp.ipv6_enabled {
            anyhow::bail!("At least one of IPv4 and IPv6 must be enabled");
        }

        if self.ppp.request_static_ipv4 && self.ppp.static_ipv4.is_none() {
            anyhow::bail!("A static IPv4 address is requested but none is configured");
        }

        if self.dns.use_custom_server && self.dns.custom_address.is_none() {
            anyhow::bail!("A custom DNS server is requested but none is configured");
        }

        if self.tls.use_custom_sni && self.tls.custom_sni.is_empty() {
            anyhow::bail!("A custom SNI is requested but none is configured");
        }

        if self.tls.specify_trust && self.tls.cert_dir.is_empty() {
            anyhow::bail!("A custom trust store is requested but no directory is configured");
        }

        if self.tls.select_suites && self.tls.suites.is_empty() {
            anyhow::bail!("Ciphersuite selection is requested but the list is empty");
        }

        if self.reconnect.enabled && self.reconnect.count < 1 {
            anyhow::bail!("Reconnection count must be at least 1");
        }

        Ok(())
    }

    /// Whether an authentication protocol is enabled.
    pub fn auth_enabled(&self, proto: AuthProtocol) -> bool {
        self.ppp.auth_protocols.contains(&proto)
    }

    /// The server address as `host:port`.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// The server name sent in the TLS client hello.
    pub fn sni_target(&self) -> &str {
        if self.tls.use_custom_sni {
            &self.tls.custom_sni
        } else {
            &self.hostname
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            hostname: "vpn.example.com".into(),
            port: 443,
            username: "user".into(),
            password: "pass".into(),
            proxy: None,
            tls: TlsConfig::default(),
            ppp: PppConfig::default(),
            dns: DnsConfig::default(),
            routes: RoutesConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_mru() {
        let mut config = base_config();
        config.ppp.mru = 64;
        assert!(config.validate().is_err());
        config.ppp.mru = 2001;
        assert!(config.validate().is_err());
        config.ppp.mru = MIN_MRU;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_auth_set() {
        let mut config = base_config();
        config.ppp.auth_protocols.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_both_families_disabled() {
        let mut config = base_config();
        config.ppp.ipv4_enabled = false;
        config.ppp.ipv6_enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_static_request_without_address() {
        let mut config = base_config();
        config.ppp.request_static_ipv4 = true;
        assert!(config.validate().is_err());
        config.ppp.static_ipv4 = Some(Ipv4Addr::new(10, 0, 0, 5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn minimal_json_round_trip() {
        let json = r#"{
            "hostname": "vpn.example.com",
            "username": "u",
            "password": "p",
            "ppp": { "auth_protocols": ["pap"] }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 443);
        assert_eq!(config.ppp.mru, DEFAULT_MRU);
        assert_eq!(config.ppp.auth_protocols, vec![AuthProtocol::Pap]);
        assert!(config.validate().is_ok());

        let text = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.hostname, config.hostname);
        assert_eq!(back.ppp.auth_protocols, config.ppp.auth_protocols);
    }
}
