// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

/// Port configuration passed into the `kport` build.
///
/// Priority levels here are *logical* NVIC levels, where 0 is the most urgent
/// and `(1 << priority_bits) - 1` the least. The build script shifts them into
/// the implemented top bits of the 8-bit priority fields.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PortConfig {
    /// Number of priority bits implemented by the NVIC on this part.
    pub priority_bits: u8,
    /// Level of the SVCall exception used for cooperative switches. This must
    /// be more urgent than `kernel_priority`, since switches are requested
    /// from inside critical sections.
    pub svcall_priority: u8,
    /// Level written to BASEPRI while a critical section is held. Interrupts
    /// at this level or less urgent are held off.
    pub kernel_priority: u8,
    /// Level of the periodic timer interrupt. Must not be more urgent than
    /// `kernel_priority`, because the tick handler touches kernel state.
    pub systick_priority: u8,
    /// Round-robin time quantum, in ticks. Zero disables round robin.
    pub time_quantum: u32,
    /// What `unlock` does when it ends a critical section.
    pub nesting: Nesting,
}

/// Build-time spelling of the critical section nesting policy.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum Nesting {
    /// `unlock` always writes the user level.
    Flat,
    /// `unlock` writes back whatever `lock` displaced.
    Restore,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            priority_bits: 4,
            svcall_priority: 1,
            kernel_priority: 2,
            systick_priority: 8,
            time_quantum: 20,
            nesting: Nesting::Flat,
        }
    }
}

impl PortConfig {
    /// Lowest (least urgent) logical level, used for PendSV.
    pub fn lowest_priority(&self) -> u8 {
        ((1u16 << self.priority_bits) - 1) as u8
    }

    /// Converts a logical level into the value found in an 8-bit priority
    /// field (or BASEPRI).
    pub fn hardware_priority(&self, level: u8) -> u8 {
        level << (8 - self.priority_bits)
    }

    /// Checks the relationships between the configured levels.
    pub fn check(&self) -> Result<(), String> {
        if !(1..=8).contains(&self.priority_bits) {
            return Err(format!(
                "priority_bits must be 1..=8, got {}",
                self.priority_bits
            ));
        }
        let lowest = self.lowest_priority();
        for (name, level) in [
            ("svcall_priority", self.svcall_priority),
            ("kernel_priority", self.kernel_priority),
            ("systick_priority", self.systick_priority),
        ] {
            if level > lowest {
                return Err(format!(
                    "{name} = {level} exceeds the lowest level {lowest}"
                ));
            }
        }
        // BASEPRI = 0 means "mask nothing", so the kernel level can't be 0.
        if self.kernel_priority == 0 {
            return Err("kernel_priority must be nonzero".into());
        }
        if self.svcall_priority >= self.kernel_priority {
            return Err(format!(
                "svcall_priority ({}) must be more urgent than \
                 kernel_priority ({})",
                self.svcall_priority, self.kernel_priority
            ));
        }
        if self.systick_priority < self.kernel_priority {
            return Err(format!(
                "systick_priority ({}) must not be more urgent than \
                 kernel_priority ({})",
                self.systick_priority, self.kernel_priority
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let c = PortConfig::default();
        assert_eq!(c.check(), Ok(()));
        assert_eq!(c.lowest_priority(), 15);
        assert_eq!(c.hardware_priority(c.kernel_priority), 0x20);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let c: PortConfig =
            toml::from_str("time_quantum = 0\nnesting = \"restore\"\n")
                .unwrap();
        assert_eq!(c.time_quantum, 0);
        assert_eq!(c.nesting, Nesting::Restore);
        assert_eq!(c.kernel_priority, 2);
    }

    #[test]
    fn svcall_must_outrank_kernel() {
        let c = PortConfig {
            svcall_priority: 2,
            ..PortConfig::default()
        };
        assert!(c.check().is_err());
    }

    #[test]
    fn systick_cannot_outrank_kernel() {
        let c = PortConfig {
            systick_priority: 1,
            svcall_priority: 0,
            ..PortConfig::default()
        };
        assert!(c.check().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let r: Result<PortConfig, _> = toml::from_str("quantum = 3\n");
        assert!(r.is_err());
    }
}
