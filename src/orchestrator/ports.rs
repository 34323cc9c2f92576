//! Free-port discovery for dev servers.
//!
//! Ports are probed by binding a throwaway listener. A port that is handed
//! out stays in an allocator-local in-use set until [`PortAllocator::release`]
//! is called, so two projects allocating concurrently never receive the same
//! port even though nothing holds the socket open in between.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Mutex;

use tracing::debug;

use crate::errors::OrchestratorError;

pub struct PortAllocator {
    host: IpAddr,
    in_use: Mutex<HashSet<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Probe ports `start..start + window` in order and return the first one
    /// that can be bound and is not already handed out.
    pub fn allocate(&self, start: u16, window: u16) -> Result<u16, OrchestratorError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        for offset in 0..window {
            let Some(port) = start.checked_add(offset) else {
                break;
            };
            if port == 0 || in_use.contains(&port) {
                continue;
            }
            if self.is_free(port) {
                in_use.insert(port);
                debug!(port, "Allocated port");
                return Ok(port);
            }
        }
        Err(OrchestratorError::PortExhausted { start, window })
    }

    /// Return a port to the pool. Releasing an unknown port is a no-op.
    pub fn release(&self, port: u16) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        if in_use.remove(&port) {
            debug!(port, "Released port");
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }

    /// Bind and immediately drop a listener on `port`.
    pub fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((self.host, port)).is_ok()
    }
}
