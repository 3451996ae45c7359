// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The part of a thread this layer is allowed to see.
//!
//! Threads are created, stacked, and queued by the surrounding kernel. The
//! port only ever reads and writes two things: where the thread's registers
//! were left (its saved stack pointer), and whether it is `Current` or
//! `Ready`.

use static_assertions::const_assert_eq;

/// Index of a thread in the kernel's thread table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ThreadId(pub usize);

impl ThreadId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Opaque handle to a thread's saved register state: the value of its process
/// stack pointer after the context was pushed.
///
/// Only meaningful while the thread is not running.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct StackPtr(usize);

impl StackPtr {
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> usize {
        self.0
    }
}

/// Per-thread saved context.
///
/// The switch entry sequences write and read `sp` directly, so this must stay
/// a single pointer-sized word at offset 0.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Context {
    sp: StackPtr,
}

const_assert_eq!(core::mem::size_of::<Context>(), core::mem::size_of::<usize>());

impl Context {
    pub const fn new(sp: StackPtr) -> Self {
        Self { sp }
    }

    pub fn stack_pointer(&self) -> StackPtr {
        self.sp
    }

    pub fn set_stack_pointer(&mut self, sp: StackPtr) {
        self.sp = sp;
    }
}

/// Scheduling state as far as the port is concerned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Running (or about to run) on the processor. Exactly one thread is in
    /// this state outside of an in-progress switch.
    Current,
    /// Eligible to run, sitting in the ready queue.
    Ready,
    /// Anything else (blocked, sleeping, suspended, ...). The code is the
    /// scheduler's business; the port never looks at it.
    Other(u16),
}

/// One schedulable execution context.
#[repr(C)] // so location of Context is predictable
#[derive(Debug)]
pub struct Thread {
    /// Saved context of the thread while it is switched out.
    ctx: Context,
    // NOTE: it is critical that the above field appear first!
    state: ThreadState,
}

const_assert_eq!(core::mem::offset_of!(Thread, ctx), 0);

impl Thread {
    /// Wraps a context prepared by thread creation code.
    ///
    /// `sp` must point at a frame laid out exactly as the architecture's
    /// context save would have left it.
    pub const fn new(sp: StackPtr, state: ThreadState) -> Self {
        Self {
            ctx: Context::new(sp),
            state,
        }
    }

    pub fn saved_stack_pointer(&self) -> StackPtr {
        self.ctx.stack_pointer()
    }

    pub fn set_saved_stack_pointer(&mut self, sp: StackPtr) {
        self.ctx.set_stack_pointer(sp);
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub fn is_current(&self) -> bool {
        self.state == ThreadState::Current
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }
}
