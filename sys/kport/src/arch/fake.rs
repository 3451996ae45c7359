// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated Cortex-M, for running the port on a development host.
//!
//! `SimCpu` models just enough of the processor for the switch paths to be
//! exercised end to end: a register file, a word-addressed RAM holding the
//! thread stacks, BASEPRI, the hardware exception frame, and pending state for
//! PendSV and SysTick. Its save and restore routines write and read exactly the
//! frame the ARM assembly does, so a context primed here has the same shape a
//! real one would.
//!
//! Nothing here is cycle accurate, and only thread-mode entry to exceptions is
//! modeled (no nesting beyond tail-chaining).

use crate::config::PortConfig;
use crate::kernel::Dispatch;
use crate::mask::Mask;
use crate::thread::{StackPtr, ThreadId};

use super::Processor;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! klog {
    ($s:expr) => {
        eprintln!($s)
    };
    ($s:expr, $($tt:tt)*) => {
        eprintln!($s, $($tt)*)
    };
}

/// Base address of simulated RAM.
pub const RAM_BASE: u32 = 0x2000_0000;
/// Bytes of stack carved out for each thread by [`SimCpu::stack_top`].
pub const STACK_BYTES: u32 = 1024;
const RAM_WORDS: usize = 16 * STACK_BYTES as usize / 4;

/// EXC_RETURN value for "back to thread mode, on the process stack".
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

const SVCALL_EXCEPTION: u32 = 11;
const PENDSV_EXCEPTION: u32 = 14;
const SYSTICK_EXCEPTION: u32 = 15;

/// Words in the hardware-stacked exception frame.
const HW_FRAME_WORDS: u32 = 8;
/// Words in the software frame: the saved mask, r4-r11, and EXC_RETURN.
const SW_FRAME_WORDS: u32 = 10;
/// Words of callee-saved FPU state, s16-s31.
#[cfg(feature = "fpu-context")]
const FP_FRAME_WORDS: u32 = 16;

/// Value scribbled into caller-saved registers by handler code, so a test
/// can't accidentally pass by reading stale registers.
const CLOBBER: u32 = 0xDEAD_0000;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    struct Pending: u8 {
        const PENDSV = 1 << 0;
        const SYSTICK = 1 << 1;
    }
}

/// Architectural registers visible to a thread.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RegisterFile {
    /// r0 through r12.
    pub r: [u32; 13],
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
    /// s16 through s31; only preserved across switches with `fpu-context`.
    pub s_hi: [u32; 16],
}

#[derive(Debug)]
pub struct SimCpu {
    regs: RegisterFile,
    psp: u32,
    basepri: Mask,
    mask_writes: usize,
    /// Priority of the exception being handled, if any.
    active: Option<u8>,
    pending: Pending,
    pending_irqs: Vec<u8>,
    serviced: usize,
    ram: Vec<u32>,
    config: PortConfig,
}

impl SimCpu {
    pub fn new() -> Self {
        Self::with_config(PortConfig::DEFAULT)
    }

    pub fn with_config(config: PortConfig) -> Self {
        Self {
            regs: RegisterFile::default(),
            psp: RAM_BASE + STACK_BYTES,
            basepri: Mask::UNMASKED,
            mask_writes: 0,
            active: None,
            pending: Pending::empty(),
            pending_irqs: Vec::new(),
            serviced: 0,
            ram: vec![0; RAM_WORDS],
            config,
        }
    }

    /// Top of the `slot`th thread stack in simulated RAM.
    pub fn stack_top(slot: usize) -> StackPtr {
        StackPtr::from_addr((RAM_BASE + (slot as u32 + 1) * STACK_BYTES) as usize)
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    pub fn psp(&self) -> u32 {
        self.psp
    }

    pub fn set_psp(&mut self, psp: u32) {
        self.psp = psp;
    }

    /// Number of writes to the mask register so far.
    pub fn mask_writes(&self) -> usize {
        self.mask_writes
    }

    pub fn preemption_pending(&self) -> bool {
        self.pending.contains(Pending::PENDSV)
    }

    /// Raises an external interrupt at hardware priority `priority`. Returns
    /// `true` if it was serviced right away, `false` if it was left pending.
    pub fn interrupt(&mut self, priority: u8) -> bool {
        if self.deliverable(priority) {
            self.serviced += 1;
            true
        } else {
            self.pending_irqs.push(priority);
            false
        }
    }

    pub fn pending_interrupts(&self) -> usize {
        self.pending_irqs.len()
    }

    /// External interrupts serviced so far, whether at once or late.
    pub fn serviced_interrupts(&self) -> usize {
        self.serviced
    }

    /// Services every pending external interrupt the current mask allows.
    /// Returns how many ran.
    pub fn deliver_interrupts(&mut self) -> usize {
        let before = self.pending_irqs.len();
        let mut irqs = core::mem::take(&mut self.pending_irqs);
        irqs.retain(|&p| !self.deliverable(p));
        self.pending_irqs = irqs;
        let n = before - self.pending_irqs.len();
        self.serviced += n;
        n
    }

    /// Lays out a brand new context below `top`, as thread creation code
    /// would, such that restoring it starts the thread with `regs` live and
    /// `mask` in effect.
    pub fn prime_stack(
        &mut self,
        top: StackPtr,
        regs: &RegisterFile,
        mask: Mask,
    ) -> StackPtr {
        let mut sp = top.addr() as u32;

        sp -= HW_FRAME_WORDS * 4;
        self.write_hw_frame(sp, regs);

        sp -= SW_FRAME_WORDS * 4;
        self.write_words(sp, &[u32::from(mask.0)]);
        self.write_words(sp + 4, &regs.r[4..=11]);
        self.write_words(sp + 36, &[EXC_RETURN_THREAD_PSP]);

        #[cfg(feature = "fpu-context")]
        {
            sp -= FP_FRAME_WORDS * 4;
            self.write_words(sp, &regs.s_hi);
        }

        StackPtr::from_addr(sp as usize)
    }

    /// Takes SysTick, if the mask allows; otherwise leaves it pending. Any
    /// PendSV the tick requested is tail-chained afterwards.
    pub fn systick(&mut self, kernel: &mut dyn Dispatch) -> bool {
        if !self.deliverable(self.config.systick_priority) {
            self.pending.insert(Pending::SYSTICK);
            return false;
        }
        self.pending.remove(Pending::SYSTICK);

        self.exception_entry(SYSTICK_EXCEPTION, self.config.systick_priority);
        kernel.tick(self);
        self.exception_return();

        self.service_pending(kernel);
        true
    }

    /// Takes whichever of SysTick and PendSV are pending and deliverable,
    /// most urgent first. This is what the hardware does on every exception
    /// return and every write that lowers the mask.
    pub fn service_pending(&mut self, kernel: &mut dyn Dispatch) -> bool {
        if self.pending.contains(Pending::SYSTICK)
            && self.deliverable(self.config.systick_priority)
        {
            // This tail-chains any PendSV itself.
            return self.systick(kernel);
        }
        if self.pending.contains(Pending::PENDSV)
            && self.deliverable(self.config.pendsv_priority)
        {
            self.pendsv(kernel);
            return true;
        }
        false
    }

    /// The thread side of a cooperative switch, executed by the thread
    /// `outgoing` with the kernel locked.
    ///
    /// Returns once `outgoing` has been handed the processor back; here, that
    /// means immediately, with `incoming`'s registers live.
    pub fn request_cooperative_switch(
        &mut self,
        kernel: &mut dyn Dispatch,
        outgoing: ThreadId,
        incoming: ThreadId,
    ) {
        let Some((out, inc)) = kernel.cooperative_switch(outgoing, incoming)
        else {
            return;
        };

        if !self.deliverable(self.config.svcall_priority) {
            crate::fail::halt("SVCall escalated to HardFault");
        }
        self.exception_entry(SVCALL_EXCEPTION, self.config.svcall_priority);

        // The mask in effect is the thread's own; it comes back with it.
        let saved = self.save(self.basepri);
        out.set_stack_pointer(saved);
        let resume = inc.stack_pointer();
        self.restore(resume);

        self.service_pending(kernel);
    }

    fn pendsv(&mut self, kernel: &mut dyn Dispatch) {
        self.pending.remove(Pending::PENDSV);
        self.exception_entry(PENDSV_EXCEPTION, self.config.pendsv_priority);

        self.set_mask(self.config.kernel);
        // The outgoing thread was preempted, so it ran at the user level.
        let saved = self.save(self.config.user);
        let resume = kernel.preempt(saved);
        self.restore(resume);
    }

    /// Pushes the software frame for the thread whose exception frame is on
    /// the process stack. Like `stmdb r2!` in the handlers, this doesn't
    /// move PSP itself.
    pub fn save(&mut self, mask: Mask) -> StackPtr {
        let mut sp = self.psp;

        sp -= SW_FRAME_WORDS * 4;
        self.write_words(sp, &[u32::from(mask.0)]);
        let callee = self.regs.r[4..=11].to_vec();
        self.write_words(sp + 4, &callee);
        self.write_words(sp + 36, &[self.regs.lr]);

        #[cfg(feature = "fpu-context")]
        {
            sp -= FP_FRAME_WORDS * 4;
            let fp = self.regs.s_hi;
            self.write_words(sp, &fp);
        }

        StackPtr::from_addr(sp as usize)
    }

    /// Pops a software frame saved by `save` (or `prime_stack`), reinstates
    /// its mask, and returns from the exception into that thread.
    pub fn restore(&mut self, sp: StackPtr) {
        let mut sp = sp.addr() as u32;

        #[cfg(feature = "fpu-context")]
        {
            for (i, s) in self.regs.s_hi.iter_mut().enumerate() {
                *s = read_word(&self.ram, sp + 4 * i as u32);
            }
            sp += FP_FRAME_WORDS * 4;
        }

        let mask = read_word(&self.ram, sp);
        self.regs.r[3] = mask;
        for i in 0..8 {
            self.regs.r[4 + i] = read_word(&self.ram, sp + 4 + 4 * i as u32);
        }
        self.regs.lr = read_word(&self.ram, sp + 36);
        sp += SW_FRAME_WORDS * 4;

        self.psp = sp;
        self.set_mask(Mask(mask as u8));
        self.exception_return();
    }

    fn deliverable(&self, priority: u8) -> bool {
        !interrupts_disabled()
            && !self.basepri.holds_off(priority)
            && self.active.map_or(true, |a| priority < a)
    }

    fn exception_entry(&mut self, number: u32, priority: u8) {
        uassert!(self.active.is_none());

        self.psp -= HW_FRAME_WORDS * 4;
        let regs = self.regs.clone();
        self.write_hw_frame(self.psp, &regs);

        self.regs.lr = EXC_RETURN_THREAD_PSP;
        self.regs.xpsr = (self.regs.xpsr & !0x1FF) | number;
        for r in [0, 1, 2, 3, 12] {
            self.regs.r[r] = CLOBBER | r as u32;
        }
        self.active = Some(priority);
    }

    fn exception_return(&mut self) {
        uassert!(self.active.is_some());
        uassert!(self.regs.lr == EXC_RETURN_THREAD_PSP);

        let sp = self.psp;
        let word = |i: u32| read_word(&self.ram, sp + 4 * i);
        let frame = [
            word(0),
            word(1),
            word(2),
            word(3),
            word(4),
            word(5),
            word(6),
            word(7),
        ];
        self.regs.r[..4].copy_from_slice(&frame[..4]);
        self.regs.r[12] = frame[4];
        self.regs.lr = frame[5];
        self.regs.pc = frame[6];
        self.regs.xpsr = frame[7];

        self.psp += HW_FRAME_WORDS * 4;
        self.active = None;
    }

    fn write_hw_frame(&mut self, sp: u32, regs: &RegisterFile) {
        let frame = [
            regs.r[0], regs.r[1], regs.r[2], regs.r[3], regs.r[12], regs.lr,
            regs.pc, regs.xpsr,
        ];
        self.write_words(sp, &frame);
    }

    fn write_words(&mut self, addr: u32, words: &[u32]) {
        for (i, &w) in words.iter().enumerate() {
            let slot = word_index(addr + 4 * i as u32);
            self.ram[slot] = w;
        }
    }
}

impl Default for SimCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for SimCpu {
    fn mask(&self) -> Mask {
        self.basepri
    }

    fn set_mask(&mut self, mask: Mask) {
        self.basepri = mask;
        self.mask_writes += 1;
    }

    fn pend_preemption(&mut self) {
        self.pending.insert(Pending::PENDSV);
    }
}

fn word_index(addr: u32) -> usize {
    // Anything outside RAM, or misaligned, is a bus fault on real parts.
    uassert!(addr % 4 == 0);
    let slot = addr.wrapping_sub(RAM_BASE) as usize / 4;
    uassert!(addr >= RAM_BASE && slot < RAM_WORDS);
    slot
}

fn read_word(ram: &[u32], addr: u32) -> u32 {
    ram[word_index(addr)]
}

thread_local! {
    // PRIMASK. One per test thread, shared by every `SimCpu` on it, since
    // `halt` has no processor handle to go through.
    static PRIMASK: core::cell::Cell<bool> =
        const { core::cell::Cell::new(false) };
}

/// Sets PRIMASK: from here on no `SimCpu` on this thread takes an exception,
/// whatever its mask says.
pub fn disable_interrupts() {
    PRIMASK.with(|p| p.set(true));
}

pub fn interrupts_disabled() -> bool {
    PRIMASK.with(|p| p.get())
}

/// Stops "the processor." On a host, that means unwinding the test.
pub fn park(msg: &dyn core::fmt::Display) -> ! {
    panic!("HALT: {msg}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn regs_strategy() -> impl Strategy<Value = RegisterFile> {
        (
            proptest::array::uniform13(any::<u32>()),
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            proptest::array::uniform16(any::<u32>()),
        )
            .prop_map(|(r, lr, pc, xpsr, s_hi)| RegisterFile {
                r,
                lr,
                pc,
                xpsr,
                s_hi,
            })
    }

    #[test]
    fn primed_stack_layout() {
        let mut cpu = SimCpu::new();
        let mut regs = RegisterFile::default();
        for (i, r) in regs.r.iter_mut().enumerate() {
            *r = 0x100 + i as u32;
        }
        regs.lr = 0x0800_0001;
        regs.pc = 0x0800_1000;
        regs.xpsr = 0x0100_0000;

        let top = SimCpu::stack_top(0).addr() as u32;
        let sp = cpu.prime_stack(SimCpu::stack_top(0), &regs, Mask(0x20));
        let sp = sp.addr() as u32;

        #[cfg(feature = "fpu-context")]
        let sp = sp + FP_FRAME_WORDS * 4;
        assert_eq!(sp, top - (HW_FRAME_WORDS + SW_FRAME_WORDS) * 4);
        assert_eq!(read_word(&cpu.ram, sp), 0x20);
        assert_eq!(read_word(&cpu.ram, sp + 4), 0x104);
        assert_eq!(read_word(&cpu.ram, sp + 32), 0x10B);
        assert_eq!(read_word(&cpu.ram, sp + 36), EXC_RETURN_THREAD_PSP);
        // Hardware frame: r0 at the bottom, xPSR at the top.
        assert_eq!(read_word(&cpu.ram, sp + 40), 0x100);
        assert_eq!(read_word(&cpu.ram, sp + 56), 0x10C);
        assert_eq!(read_word(&cpu.ram, top - 4), 0x0100_0000);
    }

    #[test]
    fn masked_systick_stays_pending() {
        struct Unreachable;
        impl Dispatch for Unreachable {
            fn current(&self) -> ThreadId {
                ThreadId(0)
            }
            fn cooperative_switch(
                &mut self,
                _: ThreadId,
                _: ThreadId,
            ) -> Option<(&mut crate::Context, &crate::Context)> {
                unreachable!()
            }
            fn preempt(&mut self, _: StackPtr) -> StackPtr {
                unreachable!()
            }
            fn tick(&mut self, _: &mut dyn Processor) {
                unreachable!()
            }
        }

        let mut cpu = SimCpu::new();
        cpu.set_mask(PortConfig::DEFAULT.kernel);
        assert!(!cpu.systick(&mut Unreachable));
        assert!(cpu.pending.contains(Pending::SYSTICK));
    }

    proptest! {
        /// Whatever a thread had in its registers when it was preempted is
        /// exactly what it has when it resumes.
        #[test]
        fn save_restore_round_trip(
            regs in regs_strategy(),
            mask in prop_oneof![Just(0u8), Just(0x20u8)],
        ) {
            let mut cpu = SimCpu::new();
            cpu.set_psp(SimCpu::stack_top(0).addr() as u32);
            *cpu.registers_mut() = regs.clone();

            cpu.exception_entry(PENDSV_EXCEPTION, 0xF0);
            let sp = cpu.save(Mask(mask));
            cpu.registers_mut().r = [0; 13];
            cpu.registers_mut().s_hi = [0; 16];
            cpu.restore(sp);

            let mut expected = regs;
            if !cfg!(feature = "fpu-context") {
                expected.s_hi = [0; 16];
            }
            prop_assert_eq!(cpu.registers(), &expected);
            prop_assert_eq!(cpu.mask(), Mask(mask));
            prop_assert_eq!(cpu.psp(), SimCpu::stack_top(0).addr() as u32);
        }
    }
}
