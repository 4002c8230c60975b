//! Conversions between `std::net::SocketAddr` and the raw sockaddr forms the
//! kernel exchanges.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result};

/// Renders an endpoint into kernel sockaddr storage.
pub(crate) fn to_storage(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Reads an endpoint back out of kernel sockaddr storage.
///
/// The stored length must match the platform address length for the family;
/// anything else is an invalid argument.
pub(crate) fn from_storage(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            if (len as usize) < size_of::<libc::sockaddr_in>() {
                return Err(Error::InvalidArgument);
            }
            // SAFETY: family and length checked above.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            if (len as usize) < size_of::<libc::sockaddr_in6>() {
                return Err(Error::InvalidArgument);
            }
            // SAFETY: family and length checked above.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let (storage, len) = to_storage(addr);
        assert_eq!(from_storage(&storage, len).unwrap(), addr);
    }

    #[test]
    fn v6_round_trips() {
        let addr: SocketAddr = "[2001:db8::17]:9".parse().unwrap();
        let (storage, len) = to_storage(addr);
        assert_eq!(from_storage(&storage, len).unwrap(), addr);
    }

    #[test]
    fn truncated_lengths_are_invalid() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let (storage, _) = to_storage(addr);
        assert!(matches!(
            from_storage(&storage, 2),
            Err(Error::InvalidArgument)
        ));
    }
}
