use crate::error::CacheError;
use std::path::PathBuf;

/// Subdirectory of the cache root owned by the kernel compilation manager.
pub const KERNEL_CACHE_SUBDIR: &str = "kernels";
/// Subdirectory of the cache root owned by the assembly-text cache.
pub const ASM_CACHE_SUBDIR: &str = "asm";

/// Configuration for resolving the on-disk cache root.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Override the cache root (subsystem directories are still appended).
    pub cache_root_override: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os("KILN_CACHE_DIR").map(PathBuf::from),
        }
    }

    /// Resolve the effective cache root.
    pub fn cache_root(&self) -> Result<PathBuf, CacheError> {
        Ok(match &self.cache_root_override {
            Some(root) => root.clone(),
            None => default_cache_root()?,
        })
    }
}

fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".kiln").join("cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_the_default_root() {
        let config = CacheConfig {
            cache_root_override: Some(PathBuf::from("/tmp/kiln-cache-test")),
        };
        assert_eq!(
            config.cache_root().unwrap(),
            PathBuf::from("/tmp/kiln-cache-test")
        );
    }
}
