// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time port configuration.
//!
//! The raw constants are generated by `build.rs` from the `PORT_CONFIG`
//! environment variable (TOML; see `build-kconfig` for the keys), falling back
//! to defaults. All priorities are already in hardware form.

use crate::mask::{Mask, NestingPolicy, PriorityMask};

include!(concat!(env!("OUT_DIR"), "/pconfig.rs"));

/// Port settings as a value, so that kernels with different settings can
/// coexist (in tests, mostly). Hardware builds use [`PortConfig::DEFAULT`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortConfig {
    /// Mask written while a critical section is held.
    pub kernel: Mask,
    /// Mask in effect outside critical sections.
    pub user: Mask,
    pub nesting: NestingPolicy,
    /// Round-robin quantum in ticks; zero disables round robin.
    pub time_quantum: u32,
    pub svcall_priority: u8,
    pub systick_priority: u8,
    pub pendsv_priority: u8,
}

impl PortConfig {
    /// The configuration this image was built with.
    pub const DEFAULT: Self = Self {
        kernel: Mask(KERNEL_PRIORITY),
        user: Mask::UNMASKED,
        nesting: NESTING,
        time_quantum: TIME_QUANTUM,
        svcall_priority: SVCALL_PRIORITY,
        systick_priority: SYSTICK_PRIORITY,
        pendsv_priority: PENDSV_PRIORITY,
    };

    pub const fn priority_mask(&self) -> PriorityMask {
        PriorityMask::new(self.kernel, self.user, self.nesting)
    }

    /// Same settings with a different round-robin quantum.
    pub const fn with_time_quantum(self, time_quantum: u32) -> Self {
        Self {
            time_quantum,
            ..self
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
