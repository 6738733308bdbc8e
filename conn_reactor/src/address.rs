//! Turning textual hosts, IP addresses and service names into socket addresses.
//!
//! Name lookups here are synchronous. Outbound connection setup is the only
//! caller that may need a DNS lookup, and it accepts that it will block for the
//! duration of one resolver call.

use crate::error::ResolveError;

use std::{
    ffi::CString,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

/// The address families a connection can use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum AddressFamily {
    #[strum(serialize = "IPv4")]
    V4,
    #[strum(serialize = "IPv6")]
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        Self::of_ip(&addr.ip())
    }

    pub fn of_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// The wildcard address for this family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Every family, in the order listeners are created.
    pub fn all() -> [Self; 2] {
        [Self::V4, Self::V6]
    }
}

fn parse_ip(text: &str) -> Option<IpAddr> {
    let text = text.trim();
    let text = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(text);
    text.parse().ok()
}

/// Is `text` already a numeric IP address? Returns the family it parses as.
pub fn is_ip(text: &str) -> Option<AddressFamily> {
    parse_ip(text).map(|ip| AddressFamily::of_ip(&ip))
}

/// Is `text` the IPv4 or IPv6 "any" wildcard address?
pub fn is_any(text: &str) -> bool {
    parse_ip(text).map_or(false, |ip| ip.is_unspecified())
}

/// Pick the local address to bind to for `family`, if one was configured.
///
/// Addresses of the wrong family, unparseable strings and the wildcard address
/// all mean "don't bind explicitly".
pub fn local_bind_address(local: Option<&str>, family: AddressFamily) -> Option<IpAddr> {
    let local = local?;
    match parse_ip(local) {
        Some(ip) if AddressFamily::of_ip(&ip) == family && !ip.is_unspecified() => Some(ip),
        Some(_) => None,
        None => {
            tracing::warn!(address = local, %family, "Invalid local address");
            None
        }
    }
}

/// Look a service name up in the system services database. Numeric strings are
/// returned as-is; unknown names give `default`.
pub fn lookup_port(service: &str, default: u16) -> u16 {
    service_port(service).unwrap_or(default)
}

static SERVICES_LOCK: Mutex<()> = Mutex::new(());

fn service_port(service: &str) -> Option<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Some(port);
    }

    let name = CString::new(service).ok()?;

    // getservbyname() hands back libc's static storage
    let _guard = SERVICES_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    // SAFETY: the result is null or points at libc's static entry, which is
    // read before returning. Every lookup in this crate holds SERVICES_LOCK, so
    // no other thread of ours can overwrite it meanwhile. Code outside the
    // crate calling getservbyname() directly is not covered by the lock.
    let port = unsafe {
        let entry = libc::getservbyname(name.as_ptr(), std::ptr::null());
        if entry.is_null() {
            return None;
        }
        (*entry).s_port
    };

    Some(u16::from_be(port as u16))
}

/// Resolve a host (numeric IPv4, numeric IPv6, or hostname) and port.
///
/// The host may carry a `/service` suffix, which overrides `port`.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
    let (host, port) = match host.rsplit_once('/') {
        Some((h, service)) => (
            h,
            service_port(service).ok_or_else(|| ResolveError::UnknownService(service.to_string()))?,
        ),
        None => (host, port),
    };

    if let Some(ip) = parse_ip(host) {
        return Ok(SocketAddr::new(ip, port));
    }

    if host.is_empty() {
        return Err(ResolveError::InvalidAddress(host.to_string()));
    }

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ResolveError::Lookup(host.to_string(), e))?;

    addrs
        .next()
        .ok_or_else(|| ResolveError::InvalidAddress(host.to_string()))
}

/// Resolve `host/service` or `host:port` into the first address found, plus the
/// port if one was given.
pub fn lookup_ip(spec: &str) -> Option<(IpAddr, Option<u16>)> {
    if let Some((host, service)) = spec.rsplit_once('/') {
        let port = service_port(service)?;
        return resolve(host, port).ok().map(|a| (a.ip(), Some(port)));
    }

    if let Some(ip) = parse_ip(spec) {
        return Some((ip, None));
    }

    // An IPv4 address or hostname with ":port" added. IPv6 literals always
    // contain more than one colon.
    if let Some((host, port)) = spec.rsplit_once(':') {
        if !host.contains(':') {
            let port = service_port(port)?;
            return resolve(host, port).ok().map(|a| (a.ip(), Some(port)));
        }
    }

    resolve(spec, 0).ok().map(|a| (a.ip(), None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_addresses() {
        assert_eq!(is_ip("192.0.2.1"), Some(AddressFamily::V4));
        assert_eq!(is_ip("2001:db8::1"), Some(AddressFamily::V6));
        assert_eq!(is_ip("[::1]"), Some(AddressFamily::V6));
        assert_eq!(is_ip("www.example.com"), None);
        assert_eq!(is_ip(""), None);
    }

    #[test]
    fn wildcard() {
        assert!(is_any("0.0.0.0"));
        assert!(is_any("::"));
        assert!(!is_any("127.0.0.1"));
        assert!(!is_any("not an address"));
    }

    #[test]
    fn local_bind() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(local_bind_address(Some("10.0.0.1"), AddressFamily::V4), Some(v4));
        assert_eq!(local_bind_address(Some("10.0.0.1"), AddressFamily::V6), None);
        assert_eq!(local_bind_address(Some("0.0.0.0"), AddressFamily::V4), None);
        assert_eq!(local_bind_address(None, AddressFamily::V4), None);
    }

    #[test]
    fn resolve_numeric() {
        let addr = resolve("127.0.0.1", 1984).unwrap();
        assert_eq!(addr, "127.0.0.1:1984".parse().unwrap());

        let addr = resolve("::1", 1984).unwrap();
        assert_eq!(AddressFamily::of(&addr), AddressFamily::V6);
        assert_eq!(addr.port(), 1984);
    }

    #[test]
    fn resolve_service_suffix() {
        let addr = resolve("127.0.0.1/8080", 1984).unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(resolve("127.0.0.1/no-such-service-here", 1).is_err());
    }

    #[test]
    fn resolve_garbage() {
        assert!(resolve("", 80).is_err());
    }

    #[test]
    fn ports() {
        assert_eq!(lookup_port("8080", 1), 8080);
        assert_eq!(lookup_port("no-such-service-here", 1984), 1984);
    }

    #[test]
    fn service_lookups_from_many_threads() {
        // Whatever the services database says, every thread must agree with it
        let http = lookup_port("http", 1);
        let smtp = lookup_port("smtp", 2);

        let workers: Vec<_> = (0..8)
            .map(|n| {
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if n % 2 == 0 {
                            assert_eq!(lookup_port("http", 1), http);
                        } else {
                            assert_eq!(lookup_port("smtp", 2), smtp);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn lookup_with_port() {
        let (ip, port) = lookup_ip("127.0.0.1:25").unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(port, Some(25));

        let (ip, port) = lookup_ip("10.1.2.3").unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(port, None);

        let (_, port) = lookup_ip("127.0.0.1/443").unwrap();
        assert_eq!(port, Some(443));
    }
}
