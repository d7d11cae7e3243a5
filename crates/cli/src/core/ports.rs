//! TCP port bookkeeping for dev-server previews.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::config::PortSettings;
use super::errors::{EngineError, EngineResult};

/// Hands out the lowest free port in `[base, max]`.
///
/// One instance is shared (behind an `Arc`) by every session; acquire and
/// release run inside a single critical section.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    max: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        Self {
            base,
            max: max.max(base),
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn from_settings(settings: &PortSettings) -> Self {
        Self::new(settings.base, settings.max)
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    // Poisoning cannot leave the set half-updated.
    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.in_use
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks and returns the smallest free port.
    pub fn acquire(&self) -> EngineResult<u16> {
        let mut in_use = self.lock();
        let port = (self.base..=self.max)
            .find(|candidate| !in_use.contains(candidate))
            .ok_or_else(|| EngineError::ResourceExhausted {
                resource: "port",
                detail: format!("all ports in {}-{} are in use", self.base, self.max),
            })?;
        in_use.insert(port);
        debug!(port, "port acquired");
        Ok(port)
    }

    /// Releases `port`. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            debug!(port, "port released");
        }
    }

    pub fn is_in_use(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Ports currently handed out, ascending.
    pub fn in_use(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::from_settings(&PortSettings::default())
    }
}
