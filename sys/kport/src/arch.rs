// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names: `klog!`, `uassert!`, `disable_interrupts`, `park`, and the
//! `Processor` implementation used by the portable code.

use crate::mask::Mask;

/// The handful of processor operations the portable switch code needs.
///
/// Register save and restore are *not* here: they can't be expressed as
/// ordinary calls, and live in the architecture's exception entry sequences
/// instead. This trait covers what can be done from normal Rust.
pub trait Processor {
    /// Reads the current interrupt priority threshold.
    fn mask(&self) -> Mask;

    /// Writes the interrupt priority threshold.
    fn set_mask(&mut self, mask: Mask);

    /// Sets the deferred-preemption exception pending. It will be taken once
    /// nothing more urgent is running or masking it.
    fn pend_preemption(&mut self);
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        // Everything else gets the simulator, which is how the portable code
        // is tested on a development host.
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
