// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Port tracing support.
//!
//! This is intended to help measure the timing of tick processing and context
//! switches, and to see which thread handed off to which, as an aid to
//! debugging scheduling problems.
//!
//! The port does not assume any particular way of getting this information
//! out. Code that wants it populates an `EventsTable` and attaches it to a
//! kernel with `Kernel::configure_events_table`. A typical implementation
//! toggles GPIOs for a logic analyzer or appends to a RAM ring buffer. Be
//! careful of observer effect: every hook runs with the kernel locked.

/// Hooks that must be provided by the board setup code if it wants to enable
/// port tracing.
///
/// If you provide an `EventsTable`, you have to provide every hook. This
/// eliminates one null pointer check / conditional branch from each
/// _implemented_ event, because we expect the implemented events to outnumber
/// the stubbed ones. If you would like to omit (say) the `tick_enter` event,
/// the simplest method is:
///
/// ```ignore
///   tick_enter: || (),
/// ```
pub struct EventsTable {
    /// Called on entry to the timer tick handler.
    pub tick_enter: fn(),
    /// Called on exit from the timer tick handler.
    pub tick_exit: fn(),
    /// Called on entry to the deferred preemption handler, after the outgoing
    /// thread's registers have been saved.
    pub preempt_enter: fn(),
    /// Called on exit from the deferred preemption handler, just before the
    /// incoming thread's registers are restored.
    pub preempt_exit: fn(),
    /// Called whenever the current thread changes, with the indices of the
    /// outgoing and incoming threads.
    pub context_switch: fn(usize, usize),
}

/// A kernel's (optional) attachment to an events table.
///
/// Any table referenced here has static scope, so handing out copies is fine.
#[derive(Copy, Clone, Default)]
pub(crate) struct Events(Option<&'static EventsTable>);

impl Events {
    pub(crate) fn new(table: &'static EventsTable) -> Self {
        Self(Some(table))
    }

    pub(crate) fn tick_enter(self) {
        if let Some(t) = self.0 {
            (t.tick_enter)()
        }
    }

    pub(crate) fn tick_exit(self) {
        if let Some(t) = self.0 {
            (t.tick_exit)()
        }
    }

    pub(crate) fn preempt_enter(self) {
        if let Some(t) = self.0 {
            (t.preempt_enter)()
        }
    }

    pub(crate) fn preempt_exit(self) {
        if let Some(t) = self.0 {
            (t.preempt_exit)()
        }
    }

    pub(crate) fn context_switch(self, from: usize, to: usize) {
        if let Some(t) = self.0 {
            (t.context_switch)(from, to)
        }
    }
}

impl core::fmt::Debug for Events {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Events").field(&self.0.is_some()).finish()
    }
}
