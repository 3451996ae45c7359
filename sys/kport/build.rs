// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use build_kconfig::{Nesting, PortConfig};
use build_util::MProfile;

fn main() -> Result<()> {
    let profile = build_util::expose_m_profile()?;
    // Baseline profiles have no BASEPRI, and an SVC issued under PRIMASK
    // escalates to HardFault, so cooperative switches can't work there.
    let baseline = env::var("TARGET")
        .map(|t| t.starts_with("thumbv8m.base"))
        .unwrap_or(false);
    if profile == Some(MProfile::V6) || baseline {
        bail!("this port requires BASEPRI (ARMv7-M or ARMv8-M Mainline)");
    }

    let config: PortConfig = build_util::config_or_default()?;
    config.check().map_err(|e| anyhow!("bad port config: {e}"))?;

    generate_consts(&config)?;

    Ok(())
}

fn generate_consts(config: &PortConfig) -> Result<()> {
    let out = &PathBuf::from(env::var_os("OUT_DIR").unwrap());
    let mut file = File::create(out.join("pconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    // Everything below is emitted in hardware form, i.e. already shifted into
    // the implemented top bits of an 8-bit priority field.
    for (name, level) in [
        ("SVCALL_PRIORITY", config.svcall_priority),
        ("KERNEL_PRIORITY", config.kernel_priority),
        ("SYSTICK_PRIORITY", config.systick_priority),
        ("PENDSV_PRIORITY", config.lowest_priority()),
    ] {
        writeln!(
            file,
            "pub const {name}: u8 = {:#04x};",
            config.hardware_priority(level)
        )?;
    }
    writeln!(file, "pub const TIME_QUANTUM: u32 = {};", config.time_quantum)?;
    let nesting = match config.nesting {
        Nesting::Flat => "Flat",
        Nesting::Restore => "Restore",
    };
    writeln!(
        file,
        "pub const NESTING: NestingPolicy = NestingPolicy::{nesting};"
    )?;

    Ok(())
}
