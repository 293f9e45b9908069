//! Tunables for planning, code generation and dispatch.
//!
//! Defaults suit production use. `JitConfig::from_env()` applies the
//! `CONVJIT_*` environment overrides; `global()` caches that result once.

use std::sync::OnceLock;

use crate::dispatch::IsaLevel;

/// Default executable bytes reserved per generated routine.
pub const DEFAULT_CODE_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JitConfig {
    /// Highest ISA the planner may target, regardless of what the host has.
    pub max_isa: Option<IsaLevel>,
    /// Executable bytes reserved per routine. Larger emissions fail.
    pub code_capacity: usize,
    /// Ceiling on the spatial unroll factor.
    pub max_ur_w: usize,
    /// Force float reductions to be split into input-channel chunks of at
    /// most this many channels.
    pub max_ic_chunk: Option<usize>,
    /// Worker count for the dispatcher; `None` uses the global rayon pool.
    pub num_threads: Option<usize>,
    /// Percentage of L1D one reduction step may occupy.
    pub l1_budget_percent: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            max_isa: None,
            code_capacity: DEFAULT_CODE_CAPACITY,
            max_ur_w: 28,
            max_ic_chunk: None,
            num_threads: None,
            l1_budget_percent: 85,
        }
    }
}

impl JitConfig {
    /// Defaults with the `CONVJIT_MAX_ISA`, `CONVJIT_CODE_CAPACITY` and
    /// `CONVJIT_NUM_THREADS` overrides applied. Unparseable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        let mut cfg = JitConfig::default();
        if let Ok(v) = std::env::var("CONVJIT_MAX_ISA") {
            match v.parse::<IsaLevel>() {
                Ok(level) => cfg.max_isa = Some(level),
                Err(e) => log::warn!("ignoring CONVJIT_MAX_ISA: {e}"),
            }
        }
        if let Some(bytes) = parse_usize_env("CONVJIT_CODE_CAPACITY") {
            cfg.code_capacity = bytes;
        }
        if let Some(n) = parse_usize_env("CONVJIT_NUM_THREADS") {
            cfg.num_threads = Some(n.max(1));
        }
        cfg
    }

    pub fn with_max_isa(mut self, level: IsaLevel) -> Self {
        self.max_isa = Some(level);
        self
    }

    pub fn with_code_capacity(mut self, bytes: usize) -> Self {
        self.code_capacity = bytes;
        self
    }

    pub fn with_max_ur_w(mut self, ur_w: usize) -> Self {
        self.max_ur_w = ur_w.max(1);
        self
    }

    pub fn with_max_ic_chunk(mut self, channels: usize) -> Self {
        self.max_ic_chunk = Some(channels.max(1));
        self
    }

    pub fn with_num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n.max(1));
        self
    }
}

fn parse_usize_env(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {key}={raw}: not an unsigned integer");
            None
        }
    }
}

static GLOBAL: OnceLock<JitConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use.
pub fn global() -> &'static JitConfig {
    GLOBAL.get_or_init(JitConfig::from_env)
}
