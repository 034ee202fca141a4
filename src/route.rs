//! Route list assembly for device setup.

use std::net::IpAddr;

use crate::config::Config;
use crate::error::{Error, Result};

/// RFC 1918 ranges plus the IPv6 unique-local block.
const PRIVATE_RANGES_V4: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];
const PRIVATE_RANGE_V6: &str = "fc00::/7";

/// Parse and validate one CIDR string.
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let (addr_str, prefix_str) = cidr
        .split_once('/')
        .ok_or_else(|| Error::parse(format!("route '{cidr}' is missing a prefix length")))?;

    let addr: IpAddr = addr_str
        .parse()
        .map_err(|_| Error::parse(format!("route '{cidr}' has an invalid address")))?;

    let prefix: u8 = prefix_str
        .parse()
        .map_err(|_| Error::parse(format!("route '{cidr}' has an invalid prefix length")))?;

    let max_prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max_prefix {
        return Err(Error::parse(format!(
            "route '{cidr}' prefix exceeds {max_prefix}"
        )));
    }

    Ok((addr, prefix))
}

/// Assemble the full route list for the device, in installation order:
/// default routes, private ranges, then custom routes as configured.
/// A malformed custom route aborts the whole list.
pub fn collect_routes(config: &Config) -> Result<Vec<String>> {
    let mut routes = Vec::new();

    if config.routes.add_default_route {
        if config.ppp.ipv4_enabled {
            routes.push("0.0.0.0/0".to_string());
        }
        if config.ppp.ipv6_enabled {
            routes.push("::/0".to_string());
        }
    }

    if config.routes.route_private_addresses {
        if config.ppp.ipv4_enabled {
            routes.extend(PRIVATE_RANGES_V4.iter().map(|r| r.to_string()));
        }
        if config.ppp.ipv6_enabled {
            routes.push(PRIVATE_RANGE_V6.to_string());
        }
    }

    if config.routes.add_custom_routes {
        for line in config.routes.custom_routes.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            parse_cidr(line)?;
            routes.push(line.to_string());
        }
    }

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PppConfig};

    fn config() -> Config {
        Config {
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
        }
    }

    #[test]
    fn parses_v4_and_v6_cidrs() {
        assert!(parse_cidr("192.168.1.0/24").is_ok());
        assert!(parse_cidr("2001:db8::/32").is_ok());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("not-an-address/8").is_err());
    }

    #[test]
    fn custom_routes_keep_order() {
        let mut cfg = config();
        cfg.routes.add_custom_routes = true;
        cfg.routes.custom_routes = "192.168.1.0/24\n2001:db8::/32".into();

        let routes = collect_routes(&cfg).unwrap();
        assert_eq!(routes, vec!["192.168.1.0/24", "2001:db8::/32"]);
    }

    #[test]
    fn malformed_custom_route_aborts() {
        let mut cfg = config();
        cfg.routes.add_custom_routes = true;
        cfg.routes.custom_routes = "192.168.1.0/24\nbogus".into();

        assert!(matches!(
            collect_routes(&cfg),
            Err(Error::ParsingFailed(_))
        ));
    }

    #[test]
    fn private_ranges_respect_enabled_families() {
        let mut cfg = config();
        cfg.routes.route_private_addresses = true;
        cfg.ppp.ipv6_enabled = false;

        let routes = collect_routes(&cfg).unwrap();
        assert_eq!(routes, vec!["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]);

        cfg.ppp.ipv6_enabled = true;
        let routes = collect_routes(&cfg).unwrap();
        assert!(routes.contains(&"fc00::/7".to_string()));
    }

    #[test]
    fn default_route_first() {
        let mut cfg = config();
        cfg.routes.add_default_route = true;
        cfg.routes.route_private_addresses = true;

        let routes = collect_routes(&cfg).unwrap();
        assert_eq!(routes[0], "0.0.0.0/0");
    }
}
