use crate::Arch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compiler configuration.
///
/// Only a subset of these fields affects generated bytes; the cache key
/// deriver in `kiln-cache` hashes exactly that subset (arch, opt level,
/// fast-math, debug).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompileConfig {
    pub arch: Arch,
    pub opt_level: u8,
    pub fast_math: bool,
    pub debug: bool,

    /// Enable the on-disk persistence tier shared across process runs.
    pub offline_cache: bool,
    /// Eviction policy name consumed verbatim by the cache cleaner:
    /// `"never"`, `"version"`, `"lru"` or `"fifo"`.
    pub offline_cache_cleaning_policy: String,
    pub offline_cache_max_size_bytes: u64,
    /// Fraction of entries removed per cleaning pass, in `(0, 1]`.
    pub offline_cache_cleaning_factor: f64,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            arch: Arch::X64,
            opt_level: 2,
            fast_math: false,
            debug: false,
            offline_cache: true,
            offline_cache_cleaning_policy: "lru".to_string(),
            offline_cache_max_size_bytes: 100 * 1024 * 1024,
            offline_cache_cleaning_factor: 0.25,
        }
    }
}

/// Device capabilities that participate in cache keys.
///
/// Backed by a sorted map so iteration order is deterministic regardless of
/// insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilityConfig {
    caps: BTreeMap<String, u32>,
}

impl DeviceCapabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: u32) {
        self.caps.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.caps.get(name).copied()
    }

    /// Capabilities in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.caps.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}
