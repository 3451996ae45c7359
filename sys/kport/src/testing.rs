// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the unit tests: a FIFO round-robin scheduler, thread
//! tables booted on a `SimCpu`, continuations for the threads running on it,
//! and an events table that counts.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use crate::arch::{RegisterFile, SimCpu};
use crate::kernel::{Kernel, Scheduler};
use crate::mask::{CriticalSection, Mask};
use crate::profiling::EventsTable;
use crate::quantum::Quantum;
use crate::thread::{StackPtr, Thread, ThreadId, ThreadState};

/// Single-priority scheduler: a FIFO ready queue plus one-shot sleep timers.
///
/// Each tick first checks whether the quantum was already used up, and only
/// then charges the tick. So a thread gets its full quantum of charged ticks
/// and is switched out on the tick after.
#[derive(Debug, Default)]
pub(crate) struct FifoScheduler {
    ready: VecDeque<ThreadId>,
    sleepers: Vec<(ThreadId, u64)>,
    now: u64,
    expired: bool,
}

impl FifoScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_ready(ids: &[ThreadId]) -> Self {
        Self {
            ready: ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Wakes `id` after `ticks` ticks.
    pub(crate) fn sleep(&mut self, id: ThreadId, ticks: u64) {
        self.sleepers.push((id, self.now + ticks));
    }

    /// Takes `id` out of the ready queue, as a scheduler does before handing
    /// the processor to it directly.
    pub(crate) fn remove(&mut self, id: ThreadId) {
        self.ready.retain(|&t| t != id);
    }

    pub(crate) fn queue(&self) -> Vec<ThreadId> {
        self.ready.iter().copied().collect()
    }
}

impl Scheduler for FifoScheduler {
    fn pop_head(&mut self) -> Option<ThreadId> {
        self.ready.pop_front()
    }

    fn push_tail(&mut self, id: ThreadId) {
        self.ready.push_back(id);
    }

    fn advance_timers(&mut self, threads: &mut [Thread], quantum: &mut Quantum) {
        self.now += 1;
        let now = self.now;
        let ready = &mut self.ready;
        self.sleepers.retain(|&(id, deadline)| {
            if deadline > now {
                return true;
            }
            threads[id.0].set_state(ThreadState::Ready);
            ready.push_back(id);
            false
        });

        self.expired = quantum.is_exhausted();
        quantum.charge();
    }

    fn reschedule_required(
        &self,
        _threads: &[Thread],
        _current: ThreadId,
        _quantum: &Quantum,
    ) -> bool {
        self.expired && !self.ready.is_empty()
    }
}

/// Register contents that identify thread `i`.
pub(crate) fn pattern(i: usize) -> RegisterFile {
    let tag = 0x1000_0000 | (i as u32) << 8;
    let mut regs = RegisterFile {
        lr: 0x0800_0001 | tag,
        pc: 0x0800_0000 + 0x100 * i as u32,
        // Thumb bit set, no exception active.
        xpsr: 0x0100_0000,
        ..RegisterFile::default()
    };
    for (n, r) in regs.r.iter_mut().enumerate() {
        *r = tag | n as u32;
    }
    if cfg!(feature = "fpu-context") {
        for (n, s) in regs.s_hi.iter_mut().enumerate() {
            *s = tag | 0x80 | n as u32;
        }
    }
    regs
}

/// Builds `n` threads on `cpu`. Thread 0 is running, with `pattern(0)` live;
/// every other thread `i` has a primed context that resumes into
/// `pattern(i)` unmasked.
pub(crate) fn boot(cpu: &mut SimCpu, n: usize) -> Vec<Thread> {
    cpu.set_psp(SimCpu::stack_top(0).addr() as u32);
    *cpu.registers_mut() = pattern(0);

    let mut threads =
        vec![Thread::new(StackPtr::default(), ThreadState::Current)];
    for i in 1..n {
        let sp =
            cpu.prime_stack(SimCpu::stack_top(i), &pattern(i), Mask::UNMASKED);
        threads.push(Thread::new(sp, ThreadState::Ready));
    }
    threads
}

/// Where each simulated thread picks up when it is next seated.
///
/// `SimCpu` only swaps register files; it can't run the code a thread
/// executes after its `svc` returns. A thread that yields from inside a
/// critical section leaves its token here, and `resume` plays the rest of
/// that thread's yield (ending the section) once the thread is current
/// again, however it got there.
#[derive(Default)]
pub(crate) struct Continuations {
    parked: HashMap<ThreadId, CriticalSection>,
}

impl Continuations {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The current thread hands the processor to `to`: under the kernel
    /// lock it takes `to` off the ready queue, queues itself, and switches.
    /// It stays suspended, lock held, until something seats it again.
    pub(crate) fn yield_to(
        &mut self,
        cpu: &mut SimCpu,
        k: &mut Kernel<'_, FifoScheduler>,
        to: ThreadId,
    ) {
        let from = k.current();
        if from == to {
            return;
        }
        let cs = k.lock(cpu);
        k.scheduler_mut().remove(to);
        k.scheduler_mut().push_tail(from);
        k.threads_mut()[from.0].set_state(ThreadState::Ready);
        self.parked.insert(from, cs);
        cpu.request_cooperative_switch(k, from, to);
        self.resume(cpu, k);
    }

    /// Lets the current thread run on from where it stopped. A thread that
    /// was in `yield_to` unlocks, and whatever that unmasks is taken, which
    /// can seat yet another suspended thread.
    pub(crate) fn resume(
        &mut self,
        cpu: &mut SimCpu,
        k: &mut Kernel<'_, FifoScheduler>,
    ) {
        while let Some(cs) = self.parked.remove(&k.current()) {
            k.unlock(cpu, cs);
            cpu.service_pending(k);
        }
    }

    pub(crate) fn is_parked(&self, id: ThreadId) -> bool {
        self.parked.contains_key(&id)
    }
}

#[derive(Default)]
struct Counts {
    ticks: usize,
    preemptions: usize,
    switches: Vec<(usize, usize)>,
}

thread_local! {
    static COUNTS: RefCell<Counts> = RefCell::new(Counts::default());
}

/// Events table that tallies into per-test-thread counters.
pub(crate) struct SwitchLog;

static SWITCH_LOG: EventsTable = EventsTable {
    tick_enter: || COUNTS.with(|c| c.borrow_mut().ticks += 1),
    tick_exit: || (),
    preempt_enter: || COUNTS.with(|c| c.borrow_mut().preemptions += 1),
    preempt_exit: || (),
    context_switch: |from, to| {
        COUNTS.with(|c| c.borrow_mut().switches.push((from, to)))
    },
};

impl SwitchLog {
    /// Clears the counters and attaches the table to `kernel`.
    pub(crate) fn attach<S: Scheduler>(kernel: &mut Kernel<'_, S>) {
        COUNTS.with(|c| *c.borrow_mut() = Counts::default());
        kernel.configure_events_table(&SWITCH_LOG);
    }

    pub(crate) fn ticks() -> usize {
        COUNTS.with(|c| c.borrow().ticks)
    }

    pub(crate) fn preemptions() -> usize {
        COUNTS.with(|c| c.borrow().preemptions)
    }

    pub(crate) fn switches() -> Vec<(usize, usize)> {
        COUNTS.with(|c| c.borrow().switches.clone())
    }
}
