use std::collections::HashSet;
use std::hash::Hash;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use crate::error::{GatewayError, GatewayResult};

const MAX_PORT_ATTEMPTS: usize = 32;

/// In-flight claims on a uniqueness key (agent name, host port) held while an
/// agent is being provisioned. The ledger is the durable record; a claim only
/// has to live until the ledger write that commits it.
pub struct Reservations<T> {
    held: Arc<Mutex<HashSet<T>>>,
}

impl<T> Clone for Reservations<T> {
    fn clone(&self) -> Self {
        Self {
            held: self.held.clone(),
        }
    }
}

impl<T> Default for Reservations<T> {
    fn default() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

/// Released on drop.
pub struct Reservation<T: Eq + Hash> {
    value: T,
    held: Arc<Mutex<HashSet<T>>>,
}

impl<T: Eq + Hash> Reservation<T> {
    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T: Eq + Hash> Drop for Reservation<T> {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.value);
    }
}

impl<T: Eq + Hash + Clone> Reservations<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `value`; `None` when someone else holds it.
    pub fn try_reserve(&self, value: T) -> Option<Reservation<T>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(value.clone()) {
            return None;
        }
        Some(Reservation {
            value,
            held: self.held.clone(),
        })
    }

    #[cfg(test)]
    pub fn is_held(&self, value: &T) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(value)
    }
}

/// Ask the OS for a free host port that is neither in `in_use` nor claimed by
/// a concurrent provisioning, and claim it. Gives up after a bounded number of
/// attempts.
pub fn reserve_port(
    claims: &Reservations<u16>,
    in_use: &HashSet<u16>,
) -> GatewayResult<Reservation<u16>> {
    for _ in 0..MAX_PORT_ATTEMPTS {
        let port = {
            let listener = TcpListener::bind("0.0.0.0:0").map_err(|e| {
                GatewayError::PortAllocation(format!("failed to bind probe socket: {}", e))
            })?;
            listener
                .local_addr()
                .map_err(|e| GatewayError::PortAllocation(e.to_string()))?
                .port()
        };

        if in_use.contains(&port) {
            continue;
        }
        if let Some(claim) = claims.try_reserve(port) {
            return Ok(claim);
        }
    }

    Err(GatewayError::PortAllocation(format!(
        "no free port after {} attempts",
        MAX_PORT_ATTEMPTS
    )))
}
