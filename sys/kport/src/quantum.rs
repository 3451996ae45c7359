// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Round-robin time quantum.
//!
//! The port owns the counter only in the sense that it *reloads* it whenever
//! the preemptive switch seats a new thread. Counting it down and deciding
//! what an exhausted quantum means is up to the scheduler's timer code, which
//! gets `&mut Quantum` on every tick.

/// Countdown of ticks left before the current thread should yield to an
/// equal-priority peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Quantum {
    remaining: u32,
    reload: u32,
}

impl Quantum {
    /// Creates a quantum of `reload` ticks, already loaded. A `reload` of zero
    /// disables round robin.
    pub const fn new(reload: u32) -> Self {
        Self {
            remaining: reload,
            reload,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.reload != 0
    }

    pub fn reload_value(&self) -> u32 {
        self.reload
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Checks whether the current thread has used up its quantum. Always false
    /// when round robin is disabled.
    pub fn is_exhausted(&self) -> bool {
        self.is_enabled() && self.remaining == 0
    }

    /// Charges one tick against the quantum, saturating at zero.
    pub fn charge(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    /// Refills the quantum for a newly seated thread.
    pub fn reload(&mut self) {
        self.remaining = self.reload;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_and_saturates() {
        let mut q = Quantum::new(2);
        assert!(!q.is_exhausted());
        q.charge();
        assert_eq!(q.remaining(), 1);
        q.charge();
        assert!(q.is_exhausted());
        q.charge();
        assert_eq!(q.remaining(), 0);
        q.reload();
        assert_eq!(q.remaining(), 2);
    }

    #[test]
    fn zero_disables_round_robin() {
        let mut q = Quantum::new(0);
        q.charge();
        assert!(!q.is_enabled());
        assert!(!q.is_exhausted());
    }
}
