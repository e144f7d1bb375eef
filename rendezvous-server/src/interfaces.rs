//! Local interface enumeration
//!
//! The server binds one listener per local IPv4 address so it answers on
//! every interface with that interface's own source address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// IPv4 addresses of all local interfaces, loopback included
#[cfg(unix)]
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            log::warn!(
                "getifaddrs failed: {}",
                std::io::Error::last_os_error()
            );
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);

                // An interface can carry the same address under several aliases
                if !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    Vec::new()
}

/// Socket addresses to bind for `port`
///
/// Explicit addresses win. Otherwise every local IPv4 interface is used, and
/// if none can be found the wildcard address.
pub fn listen_addrs(explicit: &[IpAddr], port: u16) -> Vec<SocketAddr> {
    if !explicit.is_empty() {
        return explicit.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
    }

    let found = local_ipv4_addrs();
    if found.is_empty() {
        log::warn!("No IPv4 interfaces found, listening on 0.0.0.0");
        return vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)];
    }

    found
        .into_iter()
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_enumeration_includes_loopback() {
        let addrs = local_ipv4_addrs();
        assert!(addrs.contains(&Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_explicit_addresses_win() {
        let explicit = vec!["127.0.0.1".parse().unwrap()];
        let addrs = listen_addrs(&explicit, 20018);
        assert_eq!(addrs, vec!["127.0.0.1:20018".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_all_interfaces_share_port() {
        for addr in listen_addrs(&[], 4242) {
            assert_eq!(addr.port(), 4242);
            assert!(addr.is_ipv4());
        }
    }
}
