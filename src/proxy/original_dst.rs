//! Original destination lookup for intercepted connections.
//!
//! Traffic reaches the proxy through a NAT redirect, so the accepted
//! socket's local address is the proxy's own. The address the workload
//! actually dialed is recovered per connection by a [`DestinationResolver`].

use super::error::{ProxyError, ProxyResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Recovers the address an accepted connection was originally sent to.
pub trait DestinationResolver: Send + Sync {
    /// Original destination of `stream`.
    fn original_destination(&self, stream: &TcpStream) -> ProxyResult<SocketAddr>;
}

/// Reads the pre-NAT destination from the socket (`SO_ORIGINAL_DST`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOriginalDst;

impl DestinationResolver for SocketOriginalDst {
    fn original_destination(&self, stream: &TcpStream) -> ProxyResult<SocketAddr> {
        let local = stream.local_addr()?;
        let original = sys::original_dst(stream, local).map_err(|e| {
            ProxyError::OriginalDestination {
                local,
                message: e.to_string(),
            }
        })?;

        // Without a redirect the kernel reports the socket's own address.
        if original == local {
            return Err(ProxyError::OriginalDestination {
                local,
                message: "connection was not redirected".to_string(),
            });
        }
        Ok(original)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::fd::AsRawFd;
    use tokio::net::TcpStream;

    /// From `linux/netfilter_ipv4.h`; the IPv6 option shares the value.
    const SO_ORIGINAL_DST: libc::c_int = 80;

    pub(super) fn original_dst(stream: &TcpStream, local: SocketAddr) -> io::Result<SocketAddr> {
        let level = if local.is_ipv4() {
            libc::SOL_IP
        } else {
            libc::SOL_IPV6
        };

        // SAFETY: storage is large enough for any socket address and len
        // tells the kernel its size.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                level,
                SO_ORIGINAL_DST,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                // SAFETY: the kernel wrote a sockaddr_in for AF_INET.
                let sin = unsafe { *(&storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                // SAFETY: the kernel wrote a sockaddr_in6 for AF_INET6.
                let sin6 = unsafe { *(&storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            family => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected address family {}", family),
            )),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;

    pub(super) fn original_dst(_stream: &TcpStream, _local: SocketAddr) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SO_ORIGINAL_DST is only available on Linux",
        ))
    }
}

/// Fixed destinations keyed by the listener address a connection
/// arrived on, for deployments without transparent interception.
#[derive(Debug, Clone, Default)]
pub struct StaticDestinations {
    routes: HashMap<SocketAddr, SocketAddr>,
    fallback: Option<SocketAddr>,
}

impl StaticDestinations {
    /// Empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send every connection to `destination`, whatever listener it hit.
    pub fn fixed(destination: SocketAddr) -> Self {
        Self {
            routes: HashMap::new(),
            fallback: Some(destination),
        }
    }

    /// Route connections arriving on `listen` to `destination`.
    pub fn with_route(mut self, listen: SocketAddr, destination: SocketAddr) -> Self {
        self.routes.insert(listen, destination);
        self
    }

    /// Destination for a listener address.
    pub fn lookup(&self, listen: &SocketAddr) -> Option<SocketAddr> {
        self.routes.get(listen).copied().or(self.fallback)
    }
}

impl DestinationResolver for StaticDestinations {
    fn original_destination(&self, stream: &TcpStream) -> ProxyResult<SocketAddr> {
        let local = stream.local_addr()?;
        self.lookup(&local)
            .ok_or_else(|| ProxyError::OriginalDestination {
                local,
                message: "no static route for listener".to_string(),
            })
    }
}
