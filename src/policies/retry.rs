//! # Bounded retry accounting.
//!
//! Almost every state of the refill cycle carries an attempt budget: 100
//! `rfid_get` probes, 150 first-meter reads, 5 dispensing reads, 2 final
//! reads, 3 fault recoveries. [`RetryBudget`] is the shared bookkeeping for
//! those counters so exhaustion checks read the same everywhere.
//!
//! A budget never goes negative and can be re-armed on state entry.

/// A decrementing attempt counter.
#[derive(Clone, Copy, Debug)]
pub struct RetryBudget {
    limit: u32,
    left: u32,
}

impl RetryBudget {
    /// Creates a budget of `limit` attempts, fully charged.
    pub fn new(limit: u32) -> Self {
        Self { limit, left: limit }
    }

    /// Consumes one attempt. Returns `true` if an attempt was available.
    pub fn consume(&mut self) -> bool {
        if self.left == 0 {
            return false;
        }
        self.left -= 1;
        true
    }

    /// True once every attempt has been consumed.
    pub fn exhausted(&self) -> bool {
        self.left == 0
    }

    /// Remaining attempts.
    pub fn remaining(&self) -> u32 {
        self.left
    }

    /// Attempts already spent.
    pub fn spent(&self) -> u32 {
        self.limit - self.left
    }

    /// Re-arms the budget to its original limit.
    pub fn rearm(&mut self) {
        self.left = self.limit;
    }

    /// Re-arms the budget to a new limit.
    pub fn rearm_to(&mut self, limit: u32) {
        self.limit = limit;
        self.left = limit;
    }
}
