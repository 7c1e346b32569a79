//! Runtime configuration.
//!
//! All knobs are read once from `HU_*` environment variables when the
//! preload library initializes and are frozen for the lifetime of the
//! process. Boolean variables follow the convention of the original
//! tool: the literal string `"1"` means enabled, anything else (including
//! unset) means disabled.

use std::env;
use std::path::PathBuf;

/// Frozen configuration captured at init.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Report destination. `None` produces a single stderr warning at
    /// init and disables file output for the whole run.
    pub file: Option<PathBuf>,
    /// Retain freed records and diagnose invalid deallocations.
    pub doublefree: bool,
    /// Guarded allocations with a trailing no-access fence page.
    pub overflow: bool,
    /// Guarded allocations with a protected free-quarantine.
    pub useafterfree: bool,
    /// Emit the per-site leak detail block in the report.
    pub leak: bool,
    /// Suppress symbolization in report output.
    pub nosyms: bool,
    /// Allocations strictly smaller than this are not tracked.
    pub minsize: usize,
    /// If nonzero, an on-demand report handler is installed on this signal.
    pub signo: i32,
}

impl Config {
    /// Read the configuration from `HU_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            file: env::var_os("HU_FILE").map(PathBuf::from),
            doublefree: env_flag("HU_DOUBLEFREE"),
            overflow: env_flag("HU_OVERFLOW"),
            useafterfree: env_flag("HU_USEAFTERFREE"),
            leak: env_flag("HU_LEAK"),
            nosyms: env_flag("HU_NOSYMS"),
            minsize: parse_number(env::var("HU_MINSIZE").ok().as_deref()),
            signo: parse_number(env::var("HU_SIGNO").ok().as_deref()),
        }
    }

    /// True when the page-fenced allocator should be engaged.
    #[must_use]
    pub const fn guarded(&self) -> bool {
        self.overflow || self.useafterfree
    }

    /// True when freed records must be retained for later diagnosis.
    #[must_use]
    pub const fn keep_freed(&self) -> bool {
        self.doublefree || self.useafterfree
    }
}

fn env_flag(name: &str) -> bool {
    parse_flag(env::var(name).ok().as_deref())
}

/// `"1"` enables, everything else disables.
fn parse_flag(value: Option<&str>) -> bool {
    matches!(value, Some("1"))
}

/// Decimal parse with a silent zero default for missing or malformed values.
fn parse_number<T: Default + std::str::FromStr>(value: Option<&str>) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_default()
}
