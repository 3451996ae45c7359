// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M and ARMv8-M Mainline.
//!
//! # Notes on ARM-M interrupts
//!
//! Three exceptions carry the port:
//!
//! - `SVCall` performs cooperative switches. A thread that wants to hand the
//!   processor to another (with the kernel locked) executes `SVC` with
//!   pointers to both saved contexts in `r0` and `r1`.
//! - `SysTick` is the periodic timer tick. It only runs the scheduler's timer
//!   processing and never switches by itself.
//! - `PendSV` performs deferred preemption.
//!
//! The last one deserves an explanation, and it has to do with interrupt
//! latency. On any exception the processor stacks a small subset of machine
//! state (`r0`-`r3`, `r12`, `lr`, `pc`, `xPSR`) on the process stack and then
//! calls our handler, which follows the normal C calling convention. That's
//! fine if we return to the code we interrupted, but a context switch returns
//! somewhere else, and the remaining registers must be deposited somewhere
//! predictable first and read back (possibly from a different thread) on the
//! way out.
//!
//! That full save/restore is only worth doing in a handler that will actually
//! switch. `SVCall` always does. `SysTick` usually doesn't, and neither do
//! most device interrupts; if one of them discovers that a switch is needed,
//! it sets `PendSV` pending instead. `PendSV` runs at the lowest priority, so
//! it kicks in once every other handler has finished, and performs the full
//! sequence around a call into the portable preemption code.
//!
//! # Saved context layout
//!
//! Both switch handlers push the same frame below the hardware-stacked one,
//! and store the resulting process stack pointer in the thread's [`Context`]:
//!
//! ```text
//!   (higher addresses)
//!   xPSR pc lr r12 r3 r2 r1 r0    hardware frame
//!   EXC_RETURN r11 ... r4 MASK    software frame, MASK in the r3 slot
//!   s31 ... s16                   only with `fpu-context`
//!   (lower addresses; saved sp points here)
//! ```
//!
//! `MASK` is the BASEPRI value the thread runs with once resumed: the user
//! level if it was preempted, or whatever it had (normally the kernel level)
//! if it switched away cooperatively from inside a critical section.
//!
//! # Priorities
//!
//! `install` sets SVCall *above* the kernel mask level, because cooperative
//! switches are requested with the kernel locked; SysTick at or below the
//! kernel level, because it touches kernel state; and PendSV at the lowest
//! level there is.

use core::arch::{asm, global_asm};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{self, PortConfig};
use crate::kernel::Dispatch;
use crate::mask::{CriticalSection, Mask, PriorityMask};
use crate::thread::{Context, StackPtr, ThreadId};

use super::Processor;

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

cfg_if::cfg_if! {
    if #[cfg(feature = "klog-semihosting")] {
        macro_rules! klog {
            ($s:expr) => {
                cortex_m_semihosting::hprintln!($s)
            };
            ($s:expr, $($tt:tt)*) => {
                cortex_m_semihosting::hprintln!($s, $($tt)*)
            };
        }
    } else if #[cfg(feature = "klog-itm")] {
        macro_rules! klog {
            ($s:expr) => {
                #[allow(unused_unsafe)]
                unsafe {
                    let itm = cortex_m::peripheral::ITM::PTR
                        as *mut cortex_m::peripheral::itm::RegisterBlock;
                    let stim = &mut (*itm).stim[0];
                    cortex_m::iprintln!(stim, $s);
                }
            };
            ($s:expr, $($tt:tt)*) => {
                #[allow(unused_unsafe)]
                unsafe {
                    let itm = cortex_m::peripheral::ITM::PTR
                        as *mut cortex_m::peripheral::itm::RegisterBlock;
                    let stim = &mut (*itm).stim[0];
                    cortex_m::iprintln!(stim, $s, $($tt)*);
                }
            };
        }
    } else {
        macro_rules! klog {
            ($s:expr) => {};
            ($s:expr, $($tt:tt)*) => {};
        }
    }
}

/// The critical section levels this image was built with.
const PRIORITY_MASK: PriorityMask = PortConfig::DEFAULT.priority_mask();

/// The real processor. It has no state of its own; every operation goes
/// straight to the core registers.
#[derive(Copy, Clone, Debug, Default)]
pub struct ArmCpu;

impl Processor for ArmCpu {
    fn mask(&self) -> Mask {
        Mask(cortex_m::register::basepri::read())
    }

    fn set_mask(&mut self, mask: Mask) {
        // Safety: BASEPRI only ever goes between levels the port configured,
        // and lowering it can't break any invariant the port relies on that
        // the caller's critical section token doesn't already vouch for.
        unsafe { cortex_m::register::basepri::write(mask.0) }
    }

    fn pend_preemption(&mut self) {
        // This sets the bit to pend a PendSV interrupt. PendSV will happen
        // after the current ISR (and any chained ISRs) returns, and perform
        // the context switch.
        cortex_m::peripheral::SCB::set_pendsv();
    }
}

/// Enters a critical section from thread context.
#[inline(always)]
pub fn lock() -> CriticalSection {
    PRIORITY_MASK.lock(&mut ArmCpu)
}

/// Ends a critical section entered with [`lock`].
#[inline(always)]
pub fn unlock(cs: CriticalSection) {
    PRIORITY_MASK.unlock(&mut ArmCpu, cs)
}

/// Enters a critical section from an interrupt handler.
#[inline(always)]
pub fn lock_from_isr() -> CriticalSection {
    PRIORITY_MASK.lock_from_isr(&mut ArmCpu)
}

/// Ends a critical section entered with [`lock_from_isr`].
#[inline(always)]
pub fn unlock_from_isr(cs: CriticalSection) {
    PRIORITY_MASK.unlock_from_isr(&mut ArmCpu, cs)
}

/// Requests a preemptive switch from an interrupt handler that has made a
/// thread ready. It happens once every handler has returned.
#[inline(always)]
pub fn pend_preemption() {
    ArmCpu.pend_preemption()
}

/// Kernel context object the vector handlers operate on, registered by
/// [`install`].
static mut KERNEL: Option<NonNull<dyn Dispatch>> = None;

/// Guards `KERNEL` against reentrant use. Starts out `true` so that any
/// vector arriving before `install` trips it.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(true);

/// Sets exception priorities and registers `kernel` with the vector handlers.
///
/// # Safety
///
/// Call this exactly once, from thread mode on the process stack, with
/// interrupts at or below the kernel level not yet able to reach the port (in
/// particular before [`start_tick`]). The caller must be the thread `kernel`
/// considers current, and `kernel` must not be touched except through
/// [`with_kernel`] afterwards.
pub unsafe fn install(kernel: &'static mut dyn Dispatch) {
    let scb = &*cortex_m::peripheral::SCB::PTR;
    // SHPR is byte-addressed here: entry n holds exception n + 4.
    scb.shpr[7].write(config::SVCALL_PRIORITY);
    scb.shpr[10].write(config::PENDSV_PRIORITY);
    scb.shpr[11].write(config::SYSTICK_PRIORITY);

    *core::ptr::addr_of_mut!(KERNEL) = Some(NonNull::from(kernel));
    KERNEL_IN_USE.store(false, Ordering::Release);

    klog!(
        "port: svcall {:#04x} kernel {:#04x} systick {:#04x} pendsv {:#04x} quantum {}",
        config::SVCALL_PRIORITY,
        config::KERNEL_PRIORITY,
        config::SYSTICK_PRIORITY,
        config::PENDSV_PRIORITY,
        config::TIME_QUANTUM,
    );
}

/// Starts the SysTick timer interrupting every `divisor` core clocks.
///
/// # Safety
///
/// [`install`] must have run first.
pub unsafe fn start_tick(divisor: u32) {
    uassert!(divisor > 1 && divisor <= 1 << 24);
    let syst = &*cortex_m::peripheral::SYST::PTR;
    // Program reload value.
    syst.rvr.write(divisor - 1);
    // Clear current value.
    syst.cvr.write(0);
    // Enable counter and interrupt, clocked from the core.
    syst.csr.modify(|v| v | 0b111);
}

/// Runs `body` with exclusive access to the installed kernel.
///
/// Handlers at the kernel level reach the kernel through this too, so thread
/// code must hold a critical section for the duration. Reentrant use halts.
pub fn with_kernel<R>(body: impl FnOnce(&mut dyn Dispatch) -> R) -> R {
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        crate::fail::halt("kernel context used reentrantly or before install");
    }

    // Safety: KERNEL is only written by `install` before the flag is first
    // cleared, and the flag now excludes every other user.
    let Some(mut kernel) = (unsafe { *core::ptr::addr_of!(KERNEL) }) else {
        crate::fail::halt("kernel context missing");
    };
    // Safety: the pointer came from a `&'static mut` given up by `install`,
    // and the flag makes this the only live reference.
    let r = body(unsafe { kernel.as_mut() });

    KERNEL_IN_USE.store(false, Ordering::Release);
    r
}

/// Hands the processor from `outgoing` (the calling thread) to `incoming`.
///
/// Returns when `outgoing` is next switched back in. Must be called from
/// thread mode with the kernel locked; the critical section is still held on
/// return. A switch to oneself returns immediately.
pub fn request_cooperative_switch(outgoing: ThreadId, incoming: ThreadId) {
    let handoff = with_kernel(|k| {
        k.cooperative_switch(outgoing, incoming)
            .map(|(out, inc)| (out as *mut Context, inc as *const Context))
    });
    let Some((out, inc)) = handoff else {
        return;
    };

    // Safety: both pointers are into the static thread table, and nothing
    // else touches those contexts while the kernel is locked. SVCall
    // outranks the kernel mask, so it is taken right here.
    unsafe {
        asm!(
            "svc #0",
            in("r0") inc,
            in("r1") out,
            clobber_abi("C"),
        );
    }
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    with_kernel(|k| k.tick(&mut ArmCpu));
}

/// The Rust side of the PendSV handler, after the outgoing thread's registers
/// have been saved at `saved`. Returns the incoming thread's saved context.
#[no_mangle]
unsafe extern "C" fn pendsv_entry(saved: usize) -> usize {
    with_kernel(|k| k.preempt(StackPtr::from_addr(saved))).addr()
}

cfg_if::cfg_if! {
    if #[cfg(feature = "fpu-context")] {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                @ r0 and r1 carried the incoming and outgoing contexts, but a
                @ late-arriving exception may have reused them. Read the copies
                @ from the hardware frame instead.
                mrs r2, PSP
                ldr r0, [r2]
                ldr r1, [r2, #4]
                @ the caller's mask goes with it, in the r3 slot.
                mrs r3, BASEPRI
                stmdb r2!, {{r3-r11, lr}}
                vstmdb r2!, {{s16-s31}}
                str r2, [r1]

                ldr r2, [r0]
                vldmia r2!, {{s16-s31}}
                ldmia r2!, {{r3-r11, lr}}
                msr PSP, r2
                msr BASEPRI, r3

                @ resume
                bx lr
            ",
        }

        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ lock the kernel. It stays locked until the incoming thread's
                @ own mask is reinstated on the way out.
                mov r0, #{kernel}
                msr BASEPRI, r0
                @ a preempted thread was running unmasked.
                movs r3, #0
                mrs r2, PSP
                stmdb r2!, {{r3-r11, lr}}
                vstmdb r2!, {{s16-s31}}

                mov r0, r2
                bl pendsv_entry

                @ r0 now points at the incoming thread's saved context.
                vldmia r0!, {{s16-s31}}
                ldmia r0!, {{r3-r11, lr}}
                msr PSP, r0
                msr BASEPRI, r3

                @ resume
                bx lr
            ",
            kernel = const config::KERNEL_PRIORITY,
        }
    } else {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                @ r0 and r1 carried the incoming and outgoing contexts, but a
                @ late-arriving exception may have reused them. Read the copies
                @ from the hardware frame instead.
                mrs r2, PSP
                ldr r0, [r2]
                ldr r1, [r2, #4]
                @ the caller's mask goes with it, in the r3 slot.
                mrs r3, BASEPRI
                stmdb r2!, {{r3-r11, lr}}
                str r2, [r1]

                ldr r2, [r0]
                ldmia r2!, {{r3-r11, lr}}
                msr PSP, r2
                msr BASEPRI, r3

                @ resume
                bx lr
            ",
        }

        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ lock the kernel. It stays locked until the incoming thread's
                @ own mask is reinstated on the way out.
                mov r0, #{kernel}
                msr BASEPRI, r0
                @ a preempted thread was running unmasked.
                movs r3, #0
                mrs r2, PSP
                stmdb r2!, {{r3-r11, lr}}

                mov r0, r2
                bl pendsv_entry

                @ r0 now points at the incoming thread's saved context.
                ldmia r0!, {{r3-r11, lr}}
                msr PSP, r0
                msr BASEPRI, r3

                @ resume
                bx lr
            ",
            kernel = const config::KERNEL_PRIORITY,
        }
    }
}

/// Masks every configurable interrupt, for `halt`.
pub fn disable_interrupts() {
    cortex_m::interrupt::disable();
}

/// Stops the processor for good.
pub fn park(_msg: &dyn core::fmt::Display) -> ! {
    loop {
        cortex_m::asm::nop();
    }
}

/// `critical-section` provider built on the port's mask, so that crates
/// written against `critical_section::with` are safe against kernel-level
/// interrupts.
///
/// `critical-section` requires nesting, so this always behaves like
/// [`NestingPolicy::Restore`](crate::mask::NestingPolicy::Restore) whatever
/// the port's own policy is.
#[cfg(feature = "critical-section-impl")]
mod cs_impl {
    use super::PRIORITY_MASK;
    use crate::mask::Mask;
    use critical_section::RawRestoreState;

    struct PortCriticalSection;
    critical_section::set_impl!(PortCriticalSection);

    unsafe impl critical_section::Impl for PortCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let prev = Mask(cortex_m::register::basepri::read());
            let kernel = PRIORITY_MASK.kernel_level();
            if !prev.is_stricter_than(kernel) {
                cortex_m::register::basepri::write(kernel.0);
            }
            prev.0
        }

        unsafe fn release(prev: RawRestoreState) {
            cortex_m::register::basepri::write(prev);
        }
    }
}
