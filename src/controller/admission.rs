//! Resource Admission
//!
//! A single counter of approved resource units, shared by every concurrent
//! approval decision. Check and increment happen in one compare-and-swap, so
//! two approvals can never race past the ceiling together.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Counter of approved units against a fixed ceiling
#[derive(Debug)]
pub struct ResourceGate {
    ceiling: u32,
    in_use: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

impl ResourceGate {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            in_use: Arc::new(AtomicU32::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Highest number of units ever held at once
    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::Acquire)
    }

    /// Reserve `units`, or `None` if that would exceed the ceiling
    pub fn try_acquire(&self, units: u32) -> Option<ResourcePermit> {
        if units == 0 || units > self.ceiling {
            return None;
        }

        let ceiling = self.ceiling;
        let previous = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(units)
                    .filter(|next| *next <= ceiling)
            })
            .ok()?;

        self.peak.fetch_max(previous + units, Ordering::AcqRel);

        Some(ResourcePermit {
            units,
            in_use: self.in_use.clone(),
        })
    }
}

/// Approved units; released on drop
#[derive(Debug)]
pub struct ResourcePermit {
    units: u32,
    in_use: Arc<AtomicU32>,
}

impl ResourcePermit {
    pub fn units(&self) -> u32 {
        self.units
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.units, Ordering::AcqRel);
    }
}
