// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;

/// Name of the environment variable carrying the port configuration.
pub const PORT_CONFIG_VAR: &str = "PORT_CONFIG";

/// M-profile architecture version of the target being built.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MProfile {
    V6,
    V7,
    V8,
}

/// Exposes the CPU's M-profile architecture version. This isn't available in
/// rustc's standard environment.
///
/// This will set one of `cfg(armv6m`), `cfg(armv7m)`, or `cfg(armv8m)`
/// depending on the value of the `TARGET` environment variable. Non-thumb
/// targets (the host, when running the simulator) get no cfg and `None`.
pub fn expose_m_profile() -> Result<Option<MProfile>> {
    let target = env::var("TARGET").context("TARGET not set by cargo")?;

    let profile = if target.starts_with("thumbv6m") {
        Some(MProfile::V6)
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        Some(MProfile::V7)
    } else if target.starts_with("thumbv8m") {
        Some(MProfile::V8)
    } else if target.starts_with("thumb") {
        anyhow::bail!("Don't know the target {}", target);
    } else {
        None
    };

    match profile {
        Some(MProfile::V6) => println!("cargo:rustc-cfg=armv6m"),
        Some(MProfile::V7) => println!("cargo:rustc-cfg=armv7m"),
        Some(MProfile::V8) => println!("cargo:rustc-cfg=armv8m"),
        None => (),
    }
    Ok(profile)
}

///
/// Pulls the port configuration for purposes of a build script, using
/// `T::default()` if the environment variable is missing. If the variable is
/// present but fails to parse, this fails with `Err` rather than quietly
/// building with defaults.
///
pub fn config_or_default<T: DeserializeOwned + Default>() -> Result<T> {
    toml_from_env_def(PORT_CONFIG_VAR)
}

fn toml_from_env_def<T: DeserializeOwned + Default>(var: &str) -> Result<T> {
    // We want to emit this whether or not the env var is present, so that we'll
    // be re-run if it becomes present.
    println!("cargo:rerun-if-env-changed={}", var);

    let config = match env::var(var) {
        Ok(text) => {
            println!("--- toml for ${} ---", var);
            println!("{}", text);
            text
        }
        Err(_) => {
            println!("--- var ${} not present, using default ---", var);
            return Ok(T::default());
        }
    };
    let rval = toml::from_str(&config)
        .with_context(|| format!("parsing ${var} as TOML"))?;
    Ok(rval)
}
