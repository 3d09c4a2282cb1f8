//! Bind-address selectors.
//!
//! A binding spec is `selector[:port]` where the selector is a literal IP
//! address, a CIDR block (the first local interface address inside the
//! block wins) or an interface name (that interface's first address).
//! Resolution failures are fatal at startup.

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("no local interface matches {0:?}")]
    NoMatch(String),
    #[error("invalid binding spec {0:?}")]
    Invalid(String),
    #[error("interface enumeration failed: {0}")]
    Interfaces(#[from] std::io::Error),
}

/// Resolve a binding spec to a concrete socket address.
pub fn resolve_binding(spec: &str, default_port: u16) -> Result<SocketAddr, BindingError> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    // A bare IPv6 CIDR contains colons of its own, so try the whole spec
    // as a network before splitting a port off.
    let (selector, port) = if spec.parse::<ipnet::IpNet>().is_ok() {
        (spec.to_string(), default_port)
    } else {
        split_port(spec, default_port)?
    };

    if let Ok(net) = selector.parse::<ipnet::IpNet>() {
        for iface in if_addrs::get_if_addrs()? {
            if net.contains(&iface.ip()) {
                return Ok(SocketAddr::new(iface.ip(), port));
            }
        }
        return Err(BindingError::NoMatch(selector));
    }

    for iface in if_addrs::get_if_addrs()? {
        if iface.name == selector {
            return Ok(SocketAddr::new(iface.ip(), port));
        }
    }
    Err(BindingError::NoMatch(selector))
}

/// Split a trailing `:port` off a selector. Bare IPv6 literals never reach
/// this point, they parse as addresses above.
fn split_port(spec: &str, default_port: u16) -> Result<(String, u16), BindingError> {
    match spec.rsplit_once(':') {
        Some((head, port))
            if !head.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            let port = port
                .parse()
                .map_err(|_| BindingError::Invalid(spec.to_string()))?;
            Ok((head.to_string(), port))
        }
        Some(_) => Err(BindingError::Invalid(spec.to_string())),
        None => Ok((spec.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_with_port() {
        let addr = resolve_binding("127.0.0.1:9000", 7511).unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn literal_without_port_gets_default() {
        let addr = resolve_binding("0.0.0.0", 7511).unwrap();
        assert_eq!(addr.port(), 7511);
    }

    #[test]
    fn ipv6_literal() {
        let addr = resolve_binding("::1", 7510).unwrap();
        assert_eq!(addr.ip(), "::1".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port(), 7510);
    }

    #[test]
    fn loopback_cidr_matches_lo() {
        let addr = resolve_binding("127.0.0.0/8:9100", 7511).unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 9100);
    }

    #[test]
    fn unknown_selector_is_an_error() {
        assert!(matches!(
            resolve_binding("definitely-not-an-interface", 7511),
            Err(BindingError::NoMatch(_))
        ));
    }
}
