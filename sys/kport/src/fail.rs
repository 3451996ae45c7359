// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terminal failure handling.
//!
//! Once the port decides the system can't continue (an empty ready queue at
//! preemption, a switch that names a thread that doesn't exist, a panic),
//! it calls [`halt`], which never returns. Halting:
//!
//! 1. disables interrupts,
//! 2. records why, for tooling,
//! 3. logs the reason through `klog!`,
//! 4. gives an installed [`HaltHook`] the chance to take over (to reset the
//!    board, say), and
//! 5. otherwise parks the processor forever.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kport::fail::PORT_HAS_HALTED` is a `bool`. It is false from boot, and
//!   set to true by the first call to `halt`.
//!
//! - `kport::fail::PORT_EPITAPH` is an array of `u8`. The first `halt` writes
//!   as much of its reason into this buffer (as UTF-8) as fits, truncating if
//!   the buffer fills. For printing, trim off any trailing NUL bytes.

use core::fmt::{Display, Write};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Flag that gets set to `true` by the first `halt`, giving tools a
/// one-stop-shop for triage.
#[used]
static PORT_HAS_HALTED: AtomicBool = AtomicBool::new(false);

const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of the
/// event that caused the halt, padded with NULs.
#[used]
static mut PORT_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Board-supplied replacement for parking the processor.
pub struct HaltHook {
    /// Called with the halt reason, with interrupts already disabled.
    pub on_halt: fn(&dyn Display) -> !,
}

static HALT_HOOK: AtomicPtr<HaltHook> = AtomicPtr::new(core::ptr::null_mut());

/// Installs `hook` to run on every subsequent halt.
pub fn configure_halt_hook(hook: &'static HaltHook) {
    HALT_HOOK.store(hook as *const _ as *mut _, Ordering::Release);
}

/// Checks whether `halt` has been reached since boot.
pub fn has_halted() -> bool {
    PORT_HAS_HALTED.load(Ordering::Relaxed)
}

/// Stops the system. The processor is left with interrupts disabled and
/// executes nothing further on behalf of any thread.
#[inline(always)]
pub fn halt(msg: impl Display) -> ! {
    halt_impl(&msg)
}

#[inline(never)]
fn halt_impl(msg: &dyn Display) -> ! {
    crate::arch::disable_interrupts();

    if let Some(buf) = begin_epitaph() {
        let mut writer = Eulogist { dest: buf };
        write!(writer, "{msg}").ok();
    }

    klog!("port halted: {}", msg);

    let hook = HALT_HOOK.load(Ordering::Acquire);
    if !hook.is_null() {
        // Safety: the only pointers stored here come from `&'static HaltHook`.
        let hook = unsafe { &*hook };
        (hook.on_halt)(msg);
    }

    crate::arch::park(msg)
}

/// Claims the epitaph buffer. Only the first halt gets it; a later one (a
/// panic inside the halt hook, for example) must not clobber the original
/// reason.
fn begin_epitaph() -> Option<&'static mut [u8; EPITAPH_LEN]> {
    if PORT_HAS_HALTED.swap(true, Ordering::AcqRel) {
        return None;
    }
    // Safety: we can get a mutable reference to the epitaph because only one
    // execution of this function will successfully set that flag.
    Some(unsafe { &mut *core::ptr::addr_of_mut!(PORT_EPITAPH) })
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(all(target_os = "none", feature = "panic-handler"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    halt(info)
}
