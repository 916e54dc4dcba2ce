// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Address helpers for registration.

use crate::error::DirectoryError;
use faststr::FastStr;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Splits `host:port`, accepting bracketed IPv6 hosts such as `[::1]:8080`.
///
/// An empty host is replaced by [`local_ipv4`].
pub fn split_host_port(addr: &str) -> Result<(FastStr, u16), DirectoryError> {
    let invalid = |reason: &str| DirectoryError::InvalidRegistration(FastStr::from_string(format!("address {addr:?}: {reason}")));
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = rest.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
    };
    if !addr.starts_with('[') && host.contains(':') {
        return Err(invalid("IPv6 host must be bracketed"));
    }
    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
    let host = if host.is_empty() {
        let ip = local_ipv4().ok_or_else(|| invalid("no local IPv4 address for empty host"))?;
        FastStr::from_string(ip.to_string())
    } else {
        FastStr::new(host)
    };
    Ok((host, port))
}

/// Returns the first non-loopback IPv4 address among the local interfaces.
///
/// Falls back to the address of the default route interface when no interface lists one.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let listed = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => first_ipv4(interfaces.into_iter().map(|(_, ip)| ip)),
        Err(e) => {
            debug!("[LOGIMESH] list local interfaces failed: {e}");
            None
        },
    };
    listed.or_else(|| local_ip_address::local_ip().ok().and_then(|ip| first_ipv4([ip])))
}

fn first_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|ip| match ip {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::{first_ipv4, split_host_port};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use crate::error::DirectoryError;
    use assert_matches::assert_matches;

    #[test]
    fn test_split_host_port() {
        let (host, port) = split_host_port("10.0.0.1:8080").unwrap();
        assert_eq!((host.as_str(), port), ("10.0.0.1", 8080));

        let (host, port) = split_host_port("[::1]:9000").unwrap();
        assert_eq!((host.as_str(), port), ("::1", 9000));

        let (host, _) = split_host_port("svc.local:1").unwrap();
        assert_eq!(host.as_str(), "svc.local");
    }

    #[test]
    fn test_split_host_port_errors() {
        for addr in ["10.0.0.1", "10.0.0.1:", "10.0.0.1:http", "10.0.0.1:70000", "[::1", "[::1]", "::1:80"] {
            assert_matches!(split_host_port(addr), Err(DirectoryError::InvalidRegistration(_)), "{addr}");
        }
    }

    #[test]
    fn test_first_ipv4_skips_loopback_and_ipv6() {
        let addrs = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7)),
        ];
        assert_eq!(first_ipv4(addrs), Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(first_ipv4([IpAddr::V4(Ipv4Addr::LOCALHOST)]), None);
    }
}
