// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARM Cortex-M port layer for a preemptive real-time kernel.
//!
//! This is the part of the kernel that touches literal processor state: it
//! saves and restores thread register files, hands the processor from one
//! thread to another, masks interrupts by priority to make critical sections,
//! and turns the periodic timer interrupt into (deferred) preemption.
//!
//! It deliberately does *not* decide which thread should run. Every such
//! decision comes from a [`kernel::Scheduler`] supplied by the surrounding
//! kernel; the port only carries it out.
//!
//! # Layout
//!
//! - [`mask`]: priority-mask critical sections.
//! - [`thread`]: the slice of thread state this layer reads and writes.
//! - [`kernel`]: the kernel context object and the switch bookkeeping that
//!   runs between a context save and the matching restore.
//! - [`arch`]: the register-level half. On ARM this is assembly bolted to the
//!   SVCall, PendSV and SysTick vectors; elsewhere it's a simulated Cortex-M
//!   used for testing.
//! - [`fail`]: the terminal `halt` routine.
//!
//! # Design principles
//!
//! Like the rest of the kernel, this code prefers safe Rust and simple
//! algorithms. The unsafe core is confined to `arch`, and everything between
//! "registers are saved" and "registers are restored" is ordinary Rust
//! operating on an explicit context object, which is what lets the tests run
//! many independent kernels on a host.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod config;
pub mod fail;
pub mod kernel;
pub mod mask;
pub mod profiling;
pub mod quantum;
pub mod thread;
mod util;

#[cfg(test)]
mod testing;

pub use fail::halt;
pub use kernel::{ConfigError, Dispatch, Kernel, Scheduler};
pub use mask::{CriticalSection, Mask, NestingPolicy, PriorityMask};
pub use quantum::Quantum;
pub use thread::{Context, StackPtr, Thread, ThreadId, ThreadState};
