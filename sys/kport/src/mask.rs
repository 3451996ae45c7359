// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Critical sections by interrupt priority masking.
//!
//! Rather than turning interrupts off wholesale, a critical section raises the
//! processor's priority threshold (BASEPRI) to the configured *kernel* level.
//! Interrupts at that level or less urgent are held off until the section
//! ends; interrupts configured more urgently than the kernel level keep
//! running, which bounds their latency at the cost of forbidding them from
//! touching kernel state.
//!
//! Calls must be paired by the caller. This module keeps no nesting count;
//! what ending an inner section does is the configured [`NestingPolicy`].
//! To make the pairing harder to get wrong, `lock` hands back a
//! [`CriticalSection`] token that the matching `unlock` consumes.

use core::marker::PhantomData;

use crate::arch::Processor;

/// An interrupt priority threshold, in hardware form.
///
/// This is the BASEPRI value: zero masks nothing, otherwise exceptions whose
/// priority is numerically greater than or equal to the value are held off.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Mask(pub u8);

impl Mask {
    /// Threshold that lets everything through.
    pub const UNMASKED: Self = Self(0);

    pub fn is_unmasked(self) -> bool {
        self.0 == 0
    }

    /// Checks whether an exception of hardware priority `priority` is held
    /// off while this mask is in effect.
    pub fn holds_off(self, priority: u8) -> bool {
        !self.is_unmasked() && priority >= self.0
    }

    /// Checks whether `self` holds off strictly more than `other` does.
    pub fn is_stricter_than(self, other: Mask) -> bool {
        match (self.is_unmasked(), other.is_unmasked()) {
            (true, _) => false,
            (false, true) => true,
            (false, false) => self.0 < other.0,
        }
    }
}

/// What ending a critical section writes back to the mask register.
///
/// The port keeps no nesting count, so a `lock` issued while already locked
/// is legal but its `unlock` has to pick *something* to restore.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NestingPolicy {
    /// `unlock` always lowers the mask to the user level. An inner section's
    /// `unlock` therefore ends the outer one too. This is the classic
    /// behavior, and the cheapest.
    Flat,
    /// `lock` never weakens a stricter mask already in place, and `unlock`
    /// writes back the value its `lock` displaced, so sections nest as long
    /// as they are released in LIFO order.
    Restore,
}

/// Proof that a critical section is held, returned by the `lock` family and
/// consumed by the matching `unlock`.
///
/// This is deliberately neither `Send` nor `Clone`: a critical section
/// belongs to the execution context that opened it.
#[must_use = "a critical section must be ended with the matching unlock"]
#[derive(Debug)]
pub struct CriticalSection {
    displaced: Mask,
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection {
    /// The mask value that was in effect before this section began.
    pub fn displaced(&self) -> Mask {
        self.displaced
    }
}

/// The priority masking primitive, parameterized by configured levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PriorityMask {
    kernel: Mask,
    user: Mask,
    nesting: NestingPolicy,
}

impl PriorityMask {
    pub const fn new(kernel: Mask, user: Mask, nesting: NestingPolicy) -> Self {
        Self {
            kernel,
            user,
            nesting,
        }
    }

    pub fn kernel_level(&self) -> Mask {
        self.kernel
    }

    pub fn user_level(&self) -> Mask {
        self.user
    }

    pub fn nesting(&self) -> NestingPolicy {
        self.nesting
    }

    /// Enters a critical section from thread (non-interrupt) context.
    pub fn lock<P: Processor + ?Sized>(&self, cpu: &mut P) -> CriticalSection {
        let displaced = cpu.mask();
        if self.should_raise(displaced) {
            cpu.set_mask(self.kernel);
        }
        CriticalSection {
            displaced,
            _not_send: PhantomData,
        }
    }

    /// Ends a critical section entered with [`Self::lock`].
    pub fn unlock<P: Processor + ?Sized>(
        &self,
        cpu: &mut P,
        cs: CriticalSection,
    ) {
        cpu.set_mask(self.exit_level(&cs));
    }

    /// Enters a critical section from inside an interrupt handler.
    ///
    /// Exception entry has already raised the running priority, so this only
    /// touches the mask register when it would actually change.
    pub fn lock_from_isr<P: Processor + ?Sized>(
        &self,
        cpu: &mut P,
    ) -> CriticalSection {
        let displaced = cpu.mask();
        if displaced != self.kernel && self.should_raise(displaced) {
            cpu.set_mask(self.kernel);
        }
        CriticalSection {
            displaced,
            _not_send: PhantomData,
        }
    }

    /// Ends a critical section entered with [`Self::lock_from_isr`].
    pub fn unlock_from_isr<P: Processor + ?Sized>(
        &self,
        cpu: &mut P,
        cs: CriticalSection,
    ) {
        let target = self.exit_level(&cs);
        if cpu.mask() != target {
            cpu.set_mask(target);
        }
    }

    /// Runs `body` inside a thread-context critical section.
    pub fn with_lock<P: Processor + ?Sized, R>(
        &self,
        cpu: &mut P,
        body: impl FnOnce(&mut P) -> R,
    ) -> R {
        let cs = self.lock(cpu);
        let r = body(cpu);
        self.unlock(cpu, cs);
        r
    }

    fn should_raise(&self, current: Mask) -> bool {
        match self.nesting {
            NestingPolicy::Flat => true,
            NestingPolicy::Restore => !current.is_stricter_than(self.kernel),
        }
    }

    fn exit_level(&self, cs: &CriticalSection) -> Mask {
        match self.nesting {
            NestingPolicy::Flat => self.user,
            NestingPolicy::Restore => cs.displaced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SimCpu;

    const KERNEL: Mask = Mask(0x20);
    const USER: Mask = Mask::UNMASKED;

    #[test]
    fn lock_raises_and_unlock_lowers() {
        let mut cpu = SimCpu::new();
        let pm = PriorityMask::new(KERNEL, USER, NestingPolicy::Flat);

        let cs = pm.lock(&mut cpu);
        assert_eq!(cpu.mask(), KERNEL);
        assert_eq!(cs.displaced(), USER);
        pm.unlock(&mut cpu, cs);
        assert_eq!(cpu.mask(), USER);
    }

    #[test]
    fn flat_inner_unlock_ends_outer_section() {
        let mut cpu = SimCpu::new();
        let pm = PriorityMask::new(KERNEL, USER, NestingPolicy::Flat);

        let outer = pm.lock(&mut cpu);
        let inner = pm.lock(&mut cpu);
        pm.unlock(&mut cpu, inner);
        assert_eq!(cpu.mask(), USER);
        pm.unlock(&mut cpu, outer);
        assert_eq!(cpu.mask(), USER);
    }

    #[test]
    fn restore_nests_in_lifo_order() {
        let mut cpu = SimCpu::new();
        let pm = PriorityMask::new(KERNEL, USER, NestingPolicy::Restore);

        let outer = pm.lock(&mut cpu);
        let inner = pm.lock(&mut cpu);
        pm.unlock(&mut cpu, inner);
        assert_eq!(cpu.mask(), KERNEL);
        pm.unlock(&mut cpu, outer);
        assert_eq!(cpu.mask(), USER);
    }

    #[test]
    fn restore_never_weakens_a_stricter_mask() {
        let mut cpu = SimCpu::new();
        cpu.set_mask(Mask(0x10));
        let pm = PriorityMask::new(KERNEL, USER, NestingPolicy::Restore);

        let cs = pm.lock(&mut cpu);
        assert_eq!(cpu.mask(), Mask(0x10));
        pm.unlock(&mut cpu, cs);
        assert_eq!(cpu.mask(), Mask(0x10));
    }

    #[test]
    fn from_isr_variants_skip_redundant_writes() {
        let mut cpu = SimCpu::new();
        let pm = PriorityMask::new(KERNEL, USER, NestingPolicy::Flat);

        cpu.set_mask(KERNEL);
        let writes = cpu.mask_writes();
        let cs = pm.lock_from_isr(&mut cpu);
        assert_eq!(cpu.mask_writes(), writes);
        cpu.set_mask(USER);
        let writes = cpu.mask_writes();
        pm.unlock_from_isr(&mut cpu, cs);
        assert_eq!(cpu.mask_writes(), writes);

        let cs = pm.lock_from_isr(&mut cpu);
        assert_eq!(cpu.mask(), KERNEL);
        pm.unlock_from_isr(&mut cpu, cs);
        assert_eq!(cpu.mask(), USER);
    }

    #[test]
    fn with_lock_holds_for_the_closure() {
        let mut cpu = SimCpu::new();
        let pm = PriorityMask::new(KERNEL, USER, NestingPolicy::Flat);

        let seen = pm.with_lock(&mut cpu, |cpu| cpu.mask());
        assert_eq!(seen, KERNEL);
        assert_eq!(cpu.mask(), USER);
    }

    /// Interrupts at or below the kernel level wait for the section to end;
    /// more urgent ones are taken immediately.
    #[test]
    fn critical_section_orders_interrupts_by_priority() {
        let mut cpu = SimCpu::new();
        let pm = PriorityMask::new(KERNEL, USER, NestingPolicy::Flat);

        let cs = pm.lock(&mut cpu);
        assert!(cpu.interrupt(0x00));
        assert!(cpu.interrupt(0x10));
        assert!(!cpu.interrupt(0x20));
        assert!(!cpu.interrupt(0x80));
        assert!(!cpu.interrupt(0xF0));
        assert_eq!(cpu.pending_interrupts(), 3);
        assert_eq!(cpu.serviced_interrupts(), 2);

        pm.unlock(&mut cpu, cs);
        assert_eq!(cpu.deliver_interrupts(), 3);
        assert_eq!(cpu.pending_interrupts(), 0);
        assert_eq!(cpu.serviced_interrupts(), 5);
    }

    #[test]
    fn mask_ordering() {
        assert!(Mask(0x10).is_stricter_than(Mask(0x20)));
        assert!(Mask(0x20).is_stricter_than(Mask::UNMASKED));
        assert!(!Mask::UNMASKED.is_stricter_than(Mask(0x20)));
        assert!(!Mask(0x20).is_stricter_than(Mask(0x20)));
        assert!(Mask(0x20).holds_off(0x20));
        assert!(!Mask(0x20).holds_off(0x1F));
        assert!(!Mask::UNMASKED.holds_off(0xFF));
    }
}
