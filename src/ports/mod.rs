//! Exclusive local-port reservations for session-bound auxiliary servers.
//!
//! The in-memory reservation table is the single source of truth. The lock
//! is held across the whole check-then-reserve sequence, so concurrent
//! allocations can never hand out the same port twice.

use std::collections::HashMap;
use std::net::TcpListener;

use tokio::sync::Mutex;

use crate::error::{Error, Result};

pub struct PortAllocator {
    start: u16,
    end: u16,
    /// port to owning session id
    reservations: Mutex<HashMap<u16, String>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a port for a session. A free preferred port wins; otherwise
    /// the configured range is scanned, skipping ports already reserved
    /// here or in use elsewhere on the host.
    pub async fn allocate(&self, session_id: &str, preferred: Option<u16>) -> Result<u16> {
        let mut reservations = self.reservations.lock().await;

        // Re-allocation for the same session returns its existing port.
        if let Some((port, _)) = reservations.iter().find(|(_, id)| *id == session_id) {
            return Ok(*port);
        }

        let candidates = preferred
            .into_iter()
            .chain(self.start..=self.end)
            .filter(|p| !reservations.contains_key(p));

        for port in candidates {
            if port_is_bindable(port) {
                reservations.insert(port, session_id.to_string());
                return Ok(port);
            }
        }

        Err(Error::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Release a session's reservation. Idempotent: releasing a session
    /// that holds nothing is a no-op.
    pub async fn release(&self, session_id: &str) {
        let mut reservations = self.reservations.lock().await;
        reservations.retain(|_, id| id != session_id);
    }

    pub async fn reserved_port(&self, session_id: &str) -> Option<u16> {
        let reservations = self.reservations.lock().await;
        reservations
            .iter()
            .find(|(_, id)| *id == session_id)
            .map(|(port, _)| *port)
    }

    pub async fn reservation_count(&self) -> usize {
        self.reservations.lock().await.len()
    }
}

/// Confirm the port is actually free by binding and immediately dropping
/// a throwaway listener.
fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn preferred_port_wins_when_free() {
        let alloc = PortAllocator::new(23400, 23410);
        let port = alloc.allocate("s1", Some(23407)).await.unwrap();
        assert_eq!(port, 23407);
    }

    #[tokio::test]
    async fn occupied_preferred_port_falls_back_to_range() {
        let alloc = PortAllocator::new(23420, 23430);
        // Hold the preferred port so the bind probe fails
        let _holder = TcpListener::bind(("127.0.0.1", 23425)).unwrap();
        let port = alloc.allocate("s1", Some(23425)).await.unwrap();
        assert_ne!(port, 23425);
        assert!((23420..=23430).contains(&port));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_ports_are_reusable() {
        let alloc = PortAllocator::new(23440, 23445);
        let port = alloc.allocate("s1", None).await.unwrap();

        alloc.release("s1").await;
        alloc.release("s1").await; // second release is a no-op
        alloc.release("never-allocated").await;

        let again = alloc.allocate("s2", Some(port)).await.unwrap();
        assert_eq!(again, port);
    }

    #[tokio::test]
    async fn same_session_reallocation_returns_same_port() {
        let alloc = PortAllocator::new(23450, 23460);
        let a = alloc.allocate("s1", None).await.unwrap();
        let b = alloc.allocate("s1", None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.reservation_count().await, 1);
    }

    #[tokio::test]
    async fn exhausted_range_is_a_typed_error() {
        let alloc = PortAllocator::new(23470, 23472);
        let _a = alloc.allocate("s1", None).await.unwrap();
        let _b = alloc.allocate("s2", None).await.unwrap();
        let _c = alloc.allocate("s3", None).await.unwrap();
        let err = alloc.allocate("s4", None).await.unwrap_err();
        assert_eq!(err.code(), "PORTS_EXHAUSTED");
    }

    #[tokio::test]
    async fn concurrent_allocations_never_collide() {
        let alloc = Arc::new(PortAllocator::new(23500, 23540));

        let mut handles = Vec::new();
        for i in 0..20 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move {
                alloc.allocate(&format!("s{i}"), None).await
            }));
        }

        let mut ports = Vec::new();
        for handle in handles {
            ports.push(handle.await.unwrap().unwrap());
        }

        let unique: std::collections::HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len(), "duplicate port handed out");
        assert_eq!(alloc.reservation_count().await, 20);
    }
}
