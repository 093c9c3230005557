//! Loopback port allocation for editor instances

use crate::error::BullpenError;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::warn;

/// How long a single connect probe may take
const PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// Result of probing a loopback port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Something accepted our connection
    Bound,
    /// The connection was refused, nothing listens there
    Free,
    /// Neither of the above (timeout, unexpected error)
    Inconclusive,
}

/// Probe a loopback port with a TCP connect
pub fn probe_port(port: u16) -> ProbeOutcome {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(_) => ProbeOutcome::Bound,
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => ProbeOutcome::Free,
        Err(_) => ProbeOutcome::Inconclusive,
    }
}

/// Hands out ports from `[start, end)` and remembers which ones are claimed.
///
/// Not synchronized on its own; the registry keeps it under its lock.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: BTreeSet::new(),
        }
    }

    /// Claim the lowest port that is neither allocated nor bound on loopback
    pub fn allocate(&mut self) -> Result<u16, BullpenError> {
        self.allocate_with(probe_port)
    }

    /// Same as [`allocate`](Self::allocate) with a custom probe
    pub fn allocate_with<F>(&mut self, mut probe: F) -> Result<u16, BullpenError>
    where
        F: FnMut(u16) -> ProbeOutcome,
    {
        for port in self.start..self.end {
            if self.allocated.contains(&port) {
                continue;
            }
            match probe(port) {
                ProbeOutcome::Bound => continue,
                ProbeOutcome::Free => {}
                // Fail open: an inconclusive probe is treated as free. If the
                // port really is taken, the instance fails its startup check
                // and the port is released again.
                ProbeOutcome::Inconclusive => {
                    warn!(port, "Port probe inconclusive, treating port as free");
                }
            }
            self.allocated.insert(port);
            return Ok(port);
        }

        Err(BullpenError::ResourceExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool. Returns whether it was held.
    pub fn release(&mut self, port: u16) -> bool {
        self.allocated.remove(&port)
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.contains(&port)
    }

    /// Claimed ports in ascending order
    pub fn allocated(&self) -> Vec<u16> {
        self.allocated.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    /// Total number of ports in the range
    pub fn capacity(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_lowest_free_port() {
        let mut ports = PortAllocator::new(6000, 6003);

        assert_eq!(ports.allocate_with(|_| ProbeOutcome::Free).unwrap(), 6000);
        assert_eq!(ports.allocate_with(|_| ProbeOutcome::Free).unwrap(), 6001);
        assert_eq!(ports.allocated(), vec![6000, 6001]);
        assert_eq!(ports.capacity(), 3);
    }

    #[test]
    fn test_skips_ports_bound_elsewhere() {
        let mut ports = PortAllocator::new(6000, 6003);

        let port = ports
            .allocate_with(|p| if p == 6000 { ProbeOutcome::Bound } else { ProbeOutcome::Free })
            .unwrap();
        assert_eq!(port, 6001);
        assert!(!ports.is_allocated(6000));
    }

    #[test]
    fn test_inconclusive_probe_fails_open() {
        let mut ports = PortAllocator::new(6000, 6001);

        assert_eq!(ports.allocate_with(|_| ProbeOutcome::Inconclusive).unwrap(), 6000);
    }

    #[test]
    fn test_exhaustion_leaves_set_unchanged() {
        let mut ports = PortAllocator::new(6000, 6002);
        ports.allocate_with(|_| ProbeOutcome::Free).unwrap();

        let err = ports
            .allocate_with(|_| ProbeOutcome::Bound)
            .unwrap_err();
        assert!(matches!(
            err,
            BullpenError::ResourceExhausted { start: 6000, end: 6002 }
        ));
        assert_eq!(ports.allocated(), vec![6000]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ports = PortAllocator::new(6000, 6002);
        let port = ports.allocate_with(|_| ProbeOutcome::Free).unwrap();

        assert!(ports.release(port));
        assert!(!ports.release(port));
        assert!(ports.is_empty());

        // Released port is handed out again
        assert_eq!(ports.allocate_with(|_| ProbeOutcome::Free).unwrap(), port);
    }

    #[test]
    fn test_probe_detects_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(probe_port(port), ProbeOutcome::Bound);

        drop(listener);
        assert_ne!(probe_port(port), ProbeOutcome::Bound);
    }

    #[test]
    fn test_allocate_skips_real_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut ports = PortAllocator::new(port, port.saturating_add(1));
        assert!(ports.allocate().is_err());
        assert!(ports.is_empty());
    }
}
