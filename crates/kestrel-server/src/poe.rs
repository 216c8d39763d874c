//! PoE guard
//!
//! Counts, per switch port, how many operations currently hold the port
//! forced off. Power is restored when the last holder releases it.

use kestrel_common::PortRef;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PoeGuard {
    held: BTreeMap<PortRef, u32>,
}

impl PoeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a forced-off hold; returns the new count
    pub fn hold(&mut self, port: PortRef) -> u32 {
        let count = self.held.entry(port).or_insert(0);
        *count += 1;
        debug!(port = %port, count = *count, "PoE hold");
        *count
    }

    /// Drop one hold. Returns `true` when the port should be powered again.
    ///
    /// Releasing a port that is not held does nothing and returns `false`.
    pub fn release(&mut self, port: PortRef) -> bool {
        match self.held.get_mut(&port) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.held.remove(&port);
                true
            }
            None => false,
        }
    }

    /// Forget every hold on `port`, e.g. after an explicit power-on
    pub fn clear(&mut self, port: PortRef) {
        self.held.remove(&port);
    }

    pub fn count(&self, port: PortRef) -> u32 {
        self.held.get(&port).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
