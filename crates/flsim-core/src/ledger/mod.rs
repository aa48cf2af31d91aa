use std::collections::HashSet;

use flsim_model::SiteName;

/// Names of clients that completed, or were reserved for, the END_RUN task.
///
/// Lives inside the scheduler pool and is only touched under its lock.
#[derive(Debug, Default)]
pub struct EndRunLedger {
    order: Vec<SiteName>,
    seen: HashSet<SiteName>,
    capacity: usize,
}

impl EndRunLedger {
    /// Ledger for a pool of `capacity` clients.
    pub fn new(capacity: usize) -> Self {
        Self {
            order: Vec::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `name`. Returns `false` if it was already present or the ledger is full.
    pub fn insert(&mut self, name: &str) -> bool {
        if self.order.len() >= self.capacity || self.seen.contains(name) {
            return false;
        }
        self.seen.insert(name.to_string());
        self.order.push(name.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All clients are accounted for.
    pub fn is_complete(&self) -> bool {
        self.order.len() == self.capacity
    }

    /// Names in insertion order.
    pub fn names(&self) -> &[SiteName] {
        &self.order
    }
}
