//! CPU capability detection.
//!
//! Queries the running processor once for the vector extensions the kernel
//! generators can target. Detection never fails: anything unknown resolves
//! to the baseline level.

use std::fmt;
use std::str::FromStr;

use crate::cache_params::CacheSizes;

/// Ordered code-generation target. Each level implies every level below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsaLevel {
    /// SSE4.1, 16 xmm registers. f32 kernels only, multiply and add
    /// instead of FMA.
    Baseline,
    /// AVX2 + FMA, 16 ymm registers.
    Avx2,
    /// AVX-512 F/BW/VL/DQ, 32 zmm registers.
    Avx512Core,
    /// Avx512Core plus VNNI (`vpdpbusd`).
    Avx512CoreVnni,
}

impl IsaLevel {
    /// Number of architectural vector registers at this level.
    pub const fn vector_registers(self) -> usize {
        match self {
            IsaLevel::Baseline | IsaLevel::Avx2 => 16,
            IsaLevel::Avx512Core | IsaLevel::Avx512CoreVnni => 32,
        }
    }

    /// Registers the planner may hand out. The SSE emitter holds one back
    /// to lower three-operand forms onto destructive two-operand encodings.
    pub const fn allocatable_registers(self) -> usize {
        match self {
            IsaLevel::Baseline => self.vector_registers() - 1,
            _ => self.vector_registers(),
        }
    }

    /// Vector register width in bytes.
    pub const fn vector_bytes(self) -> usize {
        match self {
            IsaLevel::Baseline => 16,
            IsaLevel::Avx2 => 32,
            IsaLevel::Avx512Core | IsaLevel::Avx512CoreVnni => 64,
        }
    }

    pub const fn is_avx512(self) -> bool {
        matches!(self, IsaLevel::Avx512Core | IsaLevel::Avx512CoreVnni)
    }

    pub const fn name(self) -> &'static str {
        match self {
            IsaLevel::Baseline => "sse41",
            IsaLevel::Avx2 => "avx2",
            IsaLevel::Avx512Core => "avx512_core",
            IsaLevel::Avx512CoreVnni => "avx512_core_vnni",
        }
    }
}

impl fmt::Display for IsaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IsaLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sse41" | "sse4.1" | "baseline" => Ok(IsaLevel::Baseline),
            "avx2" => Ok(IsaLevel::Avx2),
            "avx512_core" | "avx512" => Ok(IsaLevel::Avx512Core),
            "avx512_core_vnni" | "vnni" => Ok(IsaLevel::Avx512CoreVnni),
            other => Err(format!("unknown ISA level '{other}'")),
        }
    }
}

/// Vector extensions and data-cache sizes of the target processor.
///
/// Immutable once built. Planners consult it; generated code never does.
/// A set built with [`CapabilitySet::for_level`] describes a machine other
/// than the host, so it carries [`CacheSizes::FALLBACK`] until overridden
/// with [`CapabilitySet::with_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilitySet {
    pub sse41: bool,
    pub avx: bool,
    pub avx2: bool,
    pub fma: bool,
    pub avx512f: bool,
    pub avx512bw: bool,
    pub avx512vl: bool,
    pub avx512dq: bool,
    pub avx512vnni: bool,
    pub cache: CacheSizes,
}

impl CapabilitySet {
    /// The most conservative set: baseline SIMD only.
    pub const fn baseline() -> Self {
        CapabilitySet {
            sse41: true,
            avx: false,
            avx2: false,
            fma: false,
            avx512f: false,
            avx512bw: false,
            avx512vl: false,
            avx512dq: false,
            avx512vnni: false,
            cache: CacheSizes::FALLBACK,
        }
    }

    /// Query the processor. Prefer [`crate::dispatch::capabilities`], which
    /// caches the result for the process lifetime.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            return CapabilitySet {
                sse41: is_x86_feature_detected!("sse4.1"),
                avx: is_x86_feature_detected!("avx"),
                avx2: is_x86_feature_detected!("avx2"),
                fma: is_x86_feature_detected!("fma"),
                avx512f: is_x86_feature_detected!("avx512f"),
                avx512bw: is_x86_feature_detected!("avx512bw"),
                avx512vl: is_x86_feature_detected!("avx512vl"),
                avx512dq: is_x86_feature_detected!("avx512dq"),
                avx512vnni: is_x86_feature_detected!("avx512vnni"),
                cache: crate::cache_params::cache_sizes(),
            };
        }
        #[allow(unreachable_code)]
        CapabilitySet::baseline()
    }

    /// Same extensions, planned against different cache sizes.
    pub const fn with_cache(mut self, cache: CacheSizes) -> Self {
        self.cache = cache;
        self
    }

    /// Capability set that exposes exactly `level` (and everything below).
    /// Useful for planning against a machine other than the host.
    pub const fn for_level(level: IsaLevel) -> Self {
        let mut caps = CapabilitySet::baseline();
        if matches!(
            level,
            IsaLevel::Avx2 | IsaLevel::Avx512Core | IsaLevel::Avx512CoreVnni
        ) {
            caps.avx = true;
            caps.avx2 = true;
            caps.fma = true;
        }
        if level.is_avx512() {
            caps.avx512f = true;
            caps.avx512bw = true;
            caps.avx512vl = true;
            caps.avx512dq = true;
        }
        if matches!(level, IsaLevel::Avx512CoreVnni) {
            caps.avx512vnni = true;
        }
        caps
    }

    /// Highest code-generation level this set fully supports.
    pub fn isa_level(&self) -> IsaLevel {
        let avx2 = self.avx && self.avx2 && self.fma;
        let avx512 =
            avx2 && self.avx512f && self.avx512bw && self.avx512vl && self.avx512dq;
        if avx512 && self.avx512vnni {
            IsaLevel::Avx512CoreVnni
        } else if avx512 {
            IsaLevel::Avx512Core
        } else if avx2 {
            IsaLevel::Avx2
        } else {
            IsaLevel::Baseline
        }
    }

    /// Restrict this set so that `isa_level()` never exceeds `max`.
    pub fn capped(&self, max: IsaLevel) -> Self {
        if self.isa_level() <= max {
            return *self;
        }
        let limit = CapabilitySet::for_level(max);
        CapabilitySet {
            sse41: self.sse41 && limit.sse41,
            avx: self.avx && limit.avx,
            avx2: self.avx2 && limit.avx2,
            fma: self.fma && limit.fma,
            avx512f: self.avx512f && limit.avx512f,
            avx512bw: self.avx512bw && limit.avx512bw,
            avx512vl: self.avx512vl && limit.avx512vl,
            avx512dq: self.avx512dq && limit.avx512dq,
            avx512vnni: self.avx512vnni && limit.avx512vnni,
            cache: self.cache,
        }
    }

    /// True when code generated for `level` may run on this processor.
    pub fn supports(&self, level: IsaLevel) -> bool {
        self.isa_level() >= level
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut feats = Vec::new();
        if self.avx512f {
            feats.push("AVX-512");
        }
        if self.avx512vnni {
            feats.push("VNNI");
        }
        if self.avx2 {
            feats.push("AVX2");
        }
        if self.fma {
            feats.push("FMA");
        }
        if self.sse41 {
            feats.push("SSE4.1");
        }
        if feats.is_empty() {
            feats.push("Scalar");
        }
        write!(f, "{} [{}]", feats.join("+"), self.isa_level())
    }
}
