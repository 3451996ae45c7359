// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel context object and switch bookkeeping.
//!
//! A context switch on this port always has the same shape:
//!
//! 1. Architecture code saves the outgoing thread's registers onto its stack.
//! 2. Ordinary Rust, in this module, records where they went and works out
//!    whose registers come back.
//! 3. Architecture code restores the incoming thread's registers.
//!
//! Steps 1 and 3 are assembly on real hardware (see `arch::arm_m`) and a
//! simulated register file in tests (see `arch::fake`). Step 2 lives here, in
//! methods on [`Kernel`], which bundles the thread table, the current-thread
//! pointer, the round-robin quantum, and the scheduler that makes every
//! actual decision.
//!
//! All of this state is shared between thread code and interrupt handlers.
//! It may only be touched inside a critical section, or from a handler that
//! runs at the kernel priority level or above; the methods below that are
//! called from handlers assume exactly that.

use crate::arch::Processor;
use crate::config::PortConfig;
use crate::fail::halt;
use crate::mask::{CriticalSection, PriorityMask};
use crate::profiling::{Events, EventsTable};
use crate::quantum::Quantum;
use crate::thread::{Context, StackPtr, Thread, ThreadId, ThreadState};
use crate::util::index2_distinct;

/// The scheduling policy the port defers to.
///
/// This is implemented by the surrounding kernel. The port calls it only from
/// inside critical sections (or interrupt handlers at kernel level), so
/// implementations need no locking of their own.
pub trait Scheduler {
    /// Removes and returns the thread at the head of the ready queue, or
    /// `None` if the queue is empty.
    fn pop_head(&mut self) -> Option<ThreadId>;

    /// Inserts a thread that was just preempted into the ready queue, behind
    /// any threads of equal priority. The thread's state is already `Ready`.
    fn push_tail(&mut self, id: ThreadId);

    /// Advances virtual time by one tick: wakes expired timers (moving their
    /// threads into the ready queue) and charges the round-robin quantum.
    fn advance_timers(&mut self, threads: &mut [Thread], quantum: &mut Quantum);

    /// Decides, after `advance_timers`, whether `current` should be preempted.
    fn reschedule_required(
        &self,
        threads: &[Thread],
        current: ThreadId,
        quantum: &Quantum,
    ) -> bool;
}

/// Reasons a [`Kernel`] can't be assembled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The thread table is empty; something has to be running.
    NoThreads,
    /// The initial current thread isn't in the table.
    CurrentOutOfRange(ThreadId),
    /// A thread other than the initial current one is marked `Current`.
    ExtraCurrent(ThreadId),
    /// The kernel mask level doesn't hold off anything the user level lets
    /// through, so critical sections would protect nothing.
    MaskLevels,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoThreads => write!(f, "thread table is empty"),
            Self::CurrentOutOfRange(id) => {
                write!(f, "current thread {} is not in the table", id.0)
            }
            Self::ExtraCurrent(id) => {
                write!(f, "thread {} is already marked current", id.0)
            }
            Self::MaskLevels => {
                write!(f, "kernel mask level is not above the user level")
            }
        }
    }
}

/// Kernel state shared between the switch paths.
#[derive(Debug)]
pub struct Kernel<'t, S> {
    threads: &'t mut [Thread],
    current: ThreadId,
    sched: S,
    mask: PriorityMask,
    quantum: Quantum,
    events: Events,
}

impl<'t, S: Scheduler> Kernel<'t, S> {
    /// Assembles a kernel around a thread table.
    ///
    /// `current` is the thread that is executing right now (i.e. the caller);
    /// it is marked `Current` and its saved context is ignored until it is
    /// first switched out. Every other thread must already hold a context
    /// laid out the way the architecture's save would have left it.
    pub fn new(
        threads: &'t mut [Thread],
        current: ThreadId,
        sched: S,
        config: &PortConfig,
    ) -> Result<Self, ConfigError> {
        if threads.is_empty() {
            return Err(ConfigError::NoThreads);
        }
        if current.0 >= threads.len() {
            return Err(ConfigError::CurrentOutOfRange(current));
        }
        if let Some(i) = threads
            .iter()
            .enumerate()
            .position(|(i, t)| i != current.0 && t.is_current())
        {
            return Err(ConfigError::ExtraCurrent(ThreadId(i)));
        }
        if !config.kernel.is_stricter_than(config.user) {
            return Err(ConfigError::MaskLevels);
        }

        threads[current.0].set_state(ThreadState::Current);

        Ok(Self {
            threads,
            current,
            sched,
            mask: config.priority_mask(),
            quantum: Quantum::new(config.time_quantum),
            events: Events::default(),
        })
    }

    /// Attaches a tracing table to this kernel.
    pub fn configure_events_table(&mut self, table: &'static EventsTable) {
        self.events = Events::new(table);
    }

    /// The thread presently executing.
    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id.0)
    }

    pub fn threads(&self) -> &[Thread] {
        self.threads
    }

    /// Mutable access to the thread table, for the scheduler's own state
    /// changes (blocking, waking). Callers must hold a critical section and
    /// must not mark a second thread `Current`.
    pub fn threads_mut(&mut self) -> &mut [Thread] {
        self.threads
    }

    pub fn scheduler(&self) -> &S {
        &self.sched
    }

    /// Mutable access to the scheduler. Same locking rules as `threads_mut`.
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.sched
    }

    pub fn quantum(&self) -> &Quantum {
        &self.quantum
    }

    pub fn priority_mask(&self) -> &PriorityMask {
        &self.mask
    }

    /// Enters a critical section; see [`PriorityMask::lock`].
    pub fn lock<P: Processor + ?Sized>(&self, cpu: &mut P) -> CriticalSection {
        self.mask.lock(cpu)
    }

    /// Ends a critical section; see [`PriorityMask::unlock`].
    pub fn unlock<P: Processor + ?Sized>(&self, cpu: &mut P, cs: CriticalSection) {
        self.mask.unlock(cpu, cs)
    }

    /// Bookkeeping half of a cooperative switch from `outgoing` (which must be
    /// the current thread) to `incoming`.
    ///
    /// The caller owns `outgoing`'s fate and must have moved it out of
    /// `Current` already (queued as `Ready`, or blocked); leaving it
    /// `Current` halts. On return `incoming` is `Current` and is the current
    /// thread. Returns the two saved contexts for the architecture code to
    /// transfer between, or `None` if `outgoing` and `incoming` are the same
    /// thread and there is nothing to do.
    ///
    /// Must be called inside a critical section, which stays held across the
    /// transfer.
    pub fn cooperative_switch(
        &mut self,
        outgoing: ThreadId,
        incoming: ThreadId,
    ) -> Option<(&mut Context, &Context)> {
        if outgoing != self.current {
            halt(format_args!(
                "cooperative switch from thread {} but thread {} is current",
                outgoing.0, self.current.0
            ));
        }
        if incoming.0 >= self.threads.len() {
            halt(format_args!(
                "cooperative switch to nonexistent thread {}",
                incoming.0
            ));
        }
        if outgoing == incoming {
            return None;
        }

        let (out, inc) =
            index2_distinct(self.threads, outgoing.0, incoming.0)?;
        if out.is_current() {
            halt(format_args!(
                "outgoing thread {} is still marked current",
                outgoing.0
            ));
        }
        inc.set_state(ThreadState::Current);
        self.current = incoming;
        self.events.context_switch(outgoing.0, incoming.0);

        Some((out.context_mut(), inc.context()))
    }

    /// Bookkeeping half of a preemptive switch.
    ///
    /// Called from the deferred-preemption handler with the kernel locked and
    /// the current thread's registers saved at `saved`. Requeues the current
    /// thread at the tail of the ready queue, seats whichever thread the
    /// scheduler puts at the head, reloads the round-robin quantum, and
    /// returns the saved context to restore.
    pub fn preempt(&mut self, saved: StackPtr) -> StackPtr {
        self.events.preempt_enter();

        let outgoing = self.current;
        let out = &mut self.threads[outgoing.0];
        out.set_saved_stack_pointer(saved);
        out.set_state(ThreadState::Ready);
        self.sched.push_tail(outgoing);

        let Some(incoming) = self.sched.pop_head() else {
            halt("ready queue empty at preemption");
        };
        let Some(inc) = self.threads.get_mut(incoming.0) else {
            halt(format_args!(
                "ready queue produced nonexistent thread {}",
                incoming.0
            ));
        };
        inc.set_state(ThreadState::Current);
        let resume = inc.saved_stack_pointer();
        self.current = incoming;

        if self.quantum.is_enabled() {
            self.quantum.reload();
        }

        self.events.context_switch(outgoing.0, incoming.0);
        self.events.preempt_exit();
        resume
    }

    /// Timer tick processing, called from the periodic timer interrupt.
    ///
    /// This never switches threads itself: if the scheduler wants a different
    /// thread, the deferred-preemption exception is set pending, and the
    /// switch happens once every more urgent interrupt has been serviced.
    pub fn tick<P: Processor + ?Sized>(&mut self, cpu: &mut P) {
        self.events.tick_enter();
        let cs = self.mask.lock_from_isr(cpu);

        self.sched.advance_timers(self.threads, &mut self.quantum);
        if self
            .sched
            .reschedule_required(self.threads, self.current, &self.quantum)
        {
            cpu.pend_preemption();
        }

        self.mask.unlock_from_isr(cpu, cs);
        self.events.tick_exit();
    }
}

/// Object-safe view of a [`Kernel`] for the architecture's vector handlers,
/// which can't be generic over the scheduler type.
pub trait Dispatch {
    fn current(&self) -> ThreadId;

    fn cooperative_switch(
        &mut self,
        outgoing: ThreadId,
        incoming: ThreadId,
    ) -> Option<(&mut Context, &Context)>;

    fn preempt(&mut self, saved: StackPtr) -> StackPtr;

    fn tick(&mut self, cpu: &mut dyn Processor);
}

impl<S: Scheduler> Dispatch for Kernel<'_, S> {
    fn current(&self) -> ThreadId {
        Kernel::current(self)
    }

    fn cooperative_switch(
        &mut self,
        outgoing: ThreadId,
        incoming: ThreadId,
    ) -> Option<(&mut Context, &Context)> {
        Kernel::cooperative_switch(self, outgoing, incoming)
    }

    fn preempt(&mut self, saved: StackPtr) -> StackPtr {
        Kernel::preempt(self, saved)
    }

    fn tick(&mut self, cpu: &mut dyn Processor) {
        Kernel::tick(self, cpu)
    }
}
