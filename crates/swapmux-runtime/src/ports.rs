//! Port Allocator: hands out and recycles TCP ports from a configured range.
//!
//! Grounded on `gglib-runtime/src/process/ports.rs`'s `is_port_available`/
//! `allocate_port` free functions, generalized from a fixed base-port +
//! linear-scan-of-100 pair into a struct owning a configurable range and its
//! own round-robin free list, per section 4.1 of the spec (hand ports out in
//! round-robin order to reduce the odds of re-binding a socket TIME_WAIT
//! still holds).

use std::collections::VecDeque;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use swapmux_core::SwapmuxError;

/// Probes a candidate port by actually binding to it and immediately
/// dropping the listener. This catches sockets held by processes outside
/// our own bookkeeping, which a pure in-memory "used" set cannot see.
async fn probe(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Hands out ports in `[start, start+count)`, round-robin, bind-probed on
/// every `acquire` to avoid colliding with sockets outside the allocator's
/// control (e.g. a previous run's upstream still in `TIME_WAIT`).
pub struct PortAllocator {
    free: Mutex<VecDeque<u16>>,
    range_len: u16,
}

impl PortAllocator {
    #[must_use]
    pub fn new(start: u16, count: u16) -> Self {
        let free = (start..start.saturating_add(count)).collect();
        Self {
            free: Mutex::new(free),
            range_len: count,
        }
    }

    /// Returns a free, bind-probed port, or `NoPortAvailable` if every port
    /// in the range is either already leased or held by something else.
    pub async fn acquire(&self) -> Result<u16, SwapmuxError> {
        let mut free = self.free.lock().await;
        let attempts = free.len().max(usize::from(self.range_len));
        for _ in 0..attempts {
            let Some(port) = free.pop_front() else {
                break;
            };
            if probe(port).await {
                return Ok(port);
            }
            // Held by something outside our bookkeeping; cycle it to the
            // back and try the next candidate rather than discarding it.
            free.push_back(port);
        }
        Err(SwapmuxError::NoPortAvailable)
    }

    /// Returns a previously acquired port to the free list, at the tail, so
    /// round-robin allocation order is preserved.
    pub async fn release(&self, port: u16) {
        let mut free = self.free.lock().await;
        if !free.contains(&port) {
            free.push_back(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let allocator = PortAllocator::new(18000, 4);
        let p1 = allocator.acquire().await.unwrap();
        let p2 = allocator.acquire().await.unwrap();
        assert_ne!(p1, p2);
        allocator.release(p1).await;
        let p3 = allocator.acquire().await.unwrap();
        assert_eq!(p3, p1, "released port should be recycled");
    }

    #[tokio::test]
    async fn exhaustion_surfaces_no_port_available() {
        let allocator = PortAllocator::new(18100, 2);
        let _a = allocator.acquire().await.unwrap();
        let _b = allocator.acquire().await.unwrap();
        let err = allocator.acquire().await.unwrap_err();
        assert!(matches!(err, SwapmuxError::NoPortAvailable));
    }
}
