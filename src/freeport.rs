//! Process-wide free-port allocation.
//!
//! Ports handed out here are never returned twice by the same process, even
//! after the listener that used one has gone away. Callers that bind a port
//! of their own choosing register it so the allocator skips it.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Error, Result};

static TAKEN: Lazy<Mutex<HashSet<u16>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Marks a port as taken so [`next_free_port`] never hands it out.
pub fn register_port(port: u16) {
    TAKEN.lock().insert(port);
}

/// Returns a currently-free TCP port on localhost, distinct from every port
/// previously returned or registered in this process.
pub fn next_free_port() -> Result<u16> {
    loop {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| Error::Bind(format!("free port probe: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Bind(format!("free port probe: {e}")))?
            .port();
        drop(listener);
        if TAKEN.lock().insert(port) {
            return Ok(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_never_repeated() {
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let port = next_free_port().expect("allocate port");
            assert!(seen.insert(port), "port {port} returned twice");
        }
    }

    #[test]
    fn registered_ports_are_skipped() {
        let port = next_free_port().expect("allocate port");
        register_port(port);
        for _ in 0..20 {
            assert_ne!(next_free_port().expect("allocate port"), port);
        }
    }
}
