//! Replica selection for reads

use rand::Rng;
use std::net::{IpAddr, SocketAddr};

/// Check if `addr` lives on this host
#[must_use]
pub fn is_local(addr: &SocketAddr, local_addrs: &[IpAddr]) -> bool {
    addr.ip().is_loopback() || local_addrs.contains(&addr.ip())
}

/// Pick the replica to read from
///
/// The first local candidate wins; otherwise one is chosen uniformly at
/// random. Returns an index into `candidates`, or `None` if it is empty.
pub fn choose_replica<R: Rng + ?Sized>(
    candidates: &[SocketAddr],
    local_addrs: &[IpAddr],
    rng: &mut R,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    candidates
        .iter()
        .position(|addr| is_local(addr, local_addrs))
        .or_else(|| Some(rng.gen_range(0..candidates.len())))
}
