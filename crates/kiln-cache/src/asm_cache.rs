use crate::cleaner::{clean_cache_dir, CacheFileRule, CleanPolicy};
use crate::error::CacheError;
use crate::key::asm_cache_key;
use crate::lock::{warn_lock_busy, CacheLockFile};
use crate::metadata::{
    load_store, save_store, save_store_debug, CacheEntryMeta, CacheMode, CacheStoreData,
    METADATA_DEBUG_FILENAME, METADATA_FILENAME, METADATA_LOCK_FILENAME,
};
use crate::util::{atomic_write, now_millis, read_file_limited, remove_file_best_effort};
use std::path::{Path, PathBuf};

/// File extension for persisted assembly text.
pub const ASM_ARTIFACT_EXT: &str = "asm";

const ASM_FILE_RULE: CacheFileRule = CacheFileRule {
    artifact_ext: ASM_ARTIFACT_EXT,
};

/// Configuration for the secondary assembly-text cache.
#[derive(Clone, Debug)]
pub struct AsmCacheConfig {
    /// Mirrors the primary cache's persistent-cache enable flag; when off,
    /// `load` always misses and `store` is a no-op.
    pub enabled: bool,
    pub fast_math: bool,
    /// Target micro-architecture string (e.g. `sm_86`).
    pub target_cpu: String,
    /// Target attribute string (e.g. `+ptx78`).
    pub target_features: String,
}

/// Persistent cache for lowered assembly text, keyed on the textual module
/// plus every flag that affects the next lowering stage.
///
/// The store is read at construction and written back by [`Self::flush`]
/// (also attempted on drop), both under the directory lock. Payload files
/// are write-once, one per key.
pub struct AsmCache {
    config: AsmCacheConfig,
    dir: PathBuf,
    data: CacheStoreData,
    dirty: bool,
}

impl AsmCache {
    /// `dir` is the assembly-cache subdirectory under the offline cache
    /// root (see [`crate::ASM_CACHE_SUBDIR`]).
    pub fn new(dir: impl Into<PathBuf>, config: AsmCacheConfig) -> Self {
        let dir = dir.into();
        let mut data = CacheStoreData::empty();
        if config.enabled {
            let metadata_path = dir.join(METADATA_FILENAME);
            if metadata_path.exists() {
                let lock_path = dir.join(METADATA_LOCK_FILENAME);
                match CacheLockFile::try_acquire(&lock_path) {
                    Ok(Some(_lock)) => match load_store(&metadata_path) {
                        Ok(loaded) => data = loaded,
                        Err(reason) => {
                            tracing::debug!(
                                target = "kiln.cache",
                                path = %metadata_path.display(),
                                ?reason,
                                "assembly cache store unusable; starting empty"
                            );
                        }
                    },
                    Ok(None) => warn_lock_busy(&lock_path, &dir, "assembly cache load"),
                    Err(err) => {
                        tracing::debug!(
                            target = "kiln.cache",
                            error = %err,
                            "failed to create assembly cache lock; starting empty"
                        );
                    }
                }
            }
        }
        Self {
            config,
            dir,
            data,
            dirty: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_key(&self, module_text: &str, max_regs: u32) -> String {
        asm_cache_key(
            module_text,
            max_regs,
            self.config.fast_math,
            &self.config.target_cpu,
            &self.config.target_features,
        )
    }

    /// Look up previously lowered assembly for `module_text`.
    pub fn load(&mut self, module_text: &str, max_regs: u32) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let key = self.cache_key(module_text, max_regs);
        let path = self.dir.join(ASM_FILE_RULE.artifact_filename(&key));
        let bytes = read_file_limited(&path)?;
        let Ok(asm) = String::from_utf8(bytes) else {
            remove_file_best_effort(&path, "asm_cache.invalid_utf8");
            return None;
        };

        if let Some(entry) = self.data.entries.get_mut(&key) {
            entry.last_used_at_millis = now_millis();
            self.dirty = true;
        }
        tracing::debug!(target = "kiln.cache", key = %key, "assembly cache hit");
        Some(asm)
    }

    /// Persist lowered assembly and record its entry.
    pub fn store(&mut self, module_text: &str, max_regs: u32, asm: &str) -> Result<(), CacheError> {
        if !self.config.enabled {
            return Ok(());
        }
        let key = self.cache_key(module_text, max_regs);
        let path = self.dir.join(ASM_FILE_RULE.artifact_filename(&key));
        atomic_write(&path, asm.as_bytes())?;

        let now = now_millis();
        let size = asm.len() as u64;
        let previous = self.data.entries.insert(
            key.clone(),
            CacheEntryMeta {
                cache_key: key,
                size_bytes: size,
                created_at_millis: now,
                last_used_at_millis: now,
                cache_mode: CacheMode::MemoryAndDisk,
            },
        );
        self.data.total_size_bytes = self
            .data
            .total_size_bytes
            .saturating_sub(previous.map_or(0, |p| p.size_bytes))
            .saturating_add(size);
        self.dirty = true;
        Ok(())
    }

    /// Write the store back under the directory lock, merging over whatever
    /// another process flushed in the meantime. Busy lock ⇒ logged no-op;
    /// the store stays dirty and the next flush retries.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if !self.config.enabled || !self.dirty {
            return Ok(());
        }
        if self.data.entries.is_empty() {
            self.dirty = false;
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)?;
        let metadata_path = self.dir.join(METADATA_FILENAME);
        let lock_path = self.dir.join(METADATA_LOCK_FILENAME);
        let Some(_lock) = CacheLockFile::try_acquire(&lock_path)? else {
            warn_lock_busy(&lock_path, &self.dir, "assembly cache flush");
            return Ok(());
        };

        let mut merged = match load_store(&metadata_path) {
            Ok(data) => data,
            Err(_) => CacheStoreData::empty(),
        };
        for (key, entry) in std::mem::take(&mut self.data.entries) {
            merged.entries.insert(key, entry);
        }
        merged.version = kiln_core::VERSION_TUPLE;
        merged.total_size_bytes = merged
            .entries
            .values()
            .fold(0_u64, |acc, entry| acc.saturating_add(entry.size_bytes));

        save_store(&merged, &metadata_path)?;
        save_store_debug(&merged, &self.dir.join(METADATA_DEBUG_FILENAME))?;
        self.data = merged;
        self.dirty = false;
        Ok(())
    }

    /// Run an offline cache cleaning pass over this cache's directory.
    pub fn clean(
        &self,
        policy: CleanPolicy,
        max_total_bytes: u64,
        cleaning_fraction: f64,
    ) -> Result<(), CacheError> {
        clean_cache_dir(
            &self.dir,
            &ASM_FILE_RULE,
            policy,
            max_total_bytes,
            cleaning_fraction,
        )
    }
}

impl Drop for AsmCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::debug!(
                target = "kiln.cache",
                dir = %self.dir.display(),
                error = %err,
                "failed to flush assembly cache metadata on drop"
            );
        }
    }
}
