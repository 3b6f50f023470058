//! DNS safety for outbound webhook delivery (§4.3a): resolved addresses
//! are filtered to public, globally-routable IPs, closing off delivery to
//! internal infrastructure reachable only via SSRF through a webhook URL.

use std::error::Error as StdError;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use futures::FutureExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::task::spawn_blocking;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Returns `true` if `addr` is safe to connect a webhook delivery to.
fn is_publicly_routable(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => {
            !(ip.octets()[0] == 0
                || ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_multicast()
                || ip.is_unspecified()
                || ip.is_documentation())
        }
        IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_multicast() || ip.is_unspecified()),
    }
}

/// DNS resolver that filters resolved addresses to public, routable IPs,
/// or passes all addresses through unfiltered when `allow_private` is set
/// (for local development and integration tests against loopback targets).
pub struct SafeResolver {
    allow_private: bool,
}

impl SafeResolver {
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }
}

impl Resolve for SafeResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let allow_private = self.allow_private;
        let resolve_host = move || (name.as_str(), 0).to_socket_addrs();

        let future_result = spawn_blocking(resolve_host).map(move |result| match result {
            Ok(Ok(addrs)) => {
                let resolved: Vec<SocketAddr> = addrs.collect();
                if allow_private {
                    return Ok(Box::new(resolved.into_iter()) as Addrs);
                }
                let filtered: Vec<SocketAddr> =
                    resolved.into_iter().filter(is_publicly_routable).collect();
                if filtered.is_empty() {
                    let err: BoxError = Box::new(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "no publicly routable address for destination host",
                    ));
                    return Err(err);
                }
                Ok(Box::new(filtered.into_iter()) as Addrs)
            }
            Ok(Err(err)) => {
                let err: BoxError = Box::new(err);
                Err(err)
            }
            Err(join_err) => {
                if join_err.is_cancelled() {
                    let err: BoxError =
                        Box::new(io::Error::new(io::ErrorKind::Interrupted, join_err));
                    Err(err)
                } else {
                    panic!("background DNS resolution task failed: {join_err:?}")
                }
            }
        });

        Box::pin(future_result)
    }
}
