use crate::error::CacheError;
use crate::lock::{warn_lock_busy, CacheLockFile};
use crate::metadata::{
    load_store, save_store, save_store_debug, CacheEntryMeta, StoreLoadError, METADATA_DEBUG_FILENAME,
    METADATA_FILENAME, METADATA_LOCK_FILENAME,
};
use crate::util::remove_file_best_effort;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

/// Bitmask of active cleaning triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanPolicy(u8);

impl CleanPolicy {
    pub const NEVER: CleanPolicy = CleanPolicy(0);
    /// Discard the whole store (metadata, sidecar and artifact files) when
    /// its version or structure is stale.
    pub const PURGE_ON_VERSION_MISMATCH: CleanPolicy = CleanPolicy(0b001);
    pub const EVICT_LRU: CleanPolicy = CleanPolicy(0b010);
    pub const EVICT_FIFO: CleanPolicy = CleanPolicy(0b100);

    /// Version purge only. The size cap is not enforced without an evict
    /// bit set.
    pub const VERSION_PURGE: CleanPolicy = Self::PURGE_ON_VERSION_MISMATCH;
    pub const LRU: CleanPolicy =
        CleanPolicy(Self::PURGE_ON_VERSION_MISMATCH.0 | Self::EVICT_LRU.0);
    pub const FIFO: CleanPolicy =
        CleanPolicy(Self::PURGE_ON_VERSION_MISMATCH.0 | Self::EVICT_FIFO.0);

    pub fn contains(self, other: CleanPolicy) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Parse a policy name from configuration. Unknown names fall back to
    /// `NEVER`.
    pub fn from_name(name: &str) -> CleanPolicy {
        match name {
            "never" => Self::NEVER,
            "version" => Self::VERSION_PURGE,
            "lru" => Self::LRU,
            "fifo" => Self::FIFO,
            other => {
                tracing::warn!(
                    target = "kiln.cache",
                    policy = other,
                    "unknown cache cleaning policy; falling back to `never`"
                );
                Self::NEVER
            }
        }
    }
}

impl std::ops::BitOr for CleanPolicy {
    type Output = CleanPolicy;

    fn bitor(self, rhs: CleanPolicy) -> CleanPolicy {
        CleanPolicy(self.0 | rhs.0)
    }
}

/// Naming rule tying a store to the artifact files it owns inside its
/// directory.
#[derive(Clone, Copy, Debug)]
pub struct CacheFileRule {
    pub artifact_ext: &'static str,
}

impl CacheFileRule {
    pub fn artifact_filename(&self, cache_key: &str) -> String {
        format!("{cache_key}.{}", self.artifact_ext)
    }

    fn is_artifact_file(&self, name: &str) -> bool {
        Path::new(name).extension().and_then(|ext| ext.to_str()) == Some(self.artifact_ext)
    }
}

enum EvictOrder {
    LastUsed,
    Created,
}

impl EvictOrder {
    fn stamp(&self, entry: &CacheEntryMeta) -> u64 {
        match self {
            EvictOrder::LastUsed => entry.last_used_at_millis,
            EvictOrder::Created => entry.created_at_millis,
        }
    }
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    stamp: u64,
    key: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One offline-cache cleaning pass over `dir`.
///
/// Implemented once and reused by every cache directory; only the
/// [`CacheFileRule`] differs between them. A busy lock, an absent store or
/// an unreadable directory all degrade to a logged no-op; nothing here may
/// take the host process down.
pub fn clean_cache_dir(
    dir: &Path,
    rule: &CacheFileRule,
    policy: CleanPolicy,
    max_total_bytes: u64,
    cleaning_fraction: f64,
) -> Result<(), CacheError> {
    if policy.is_never() || !dir.exists() {
        return Ok(());
    }
    if !(cleaning_fraction > 0.0 && cleaning_fraction <= 1.0) {
        tracing::warn!(
            target = "kiln.cache",
            cleaning_fraction,
            "cleaning fraction must be in (0, 1]; skipping clean"
        );
        return Ok(());
    }

    let metadata_path = dir.join(METADATA_FILENAME);
    let debug_path = dir.join(METADATA_DEBUG_FILENAME);
    let lock_path = dir.join(METADATA_LOCK_FILENAME);

    let mut evicted_files: Vec<PathBuf> = Vec::new();

    {
        let Some(_lock) = CacheLockFile::try_acquire(&lock_path)? else {
            warn_lock_busy(&lock_path, dir, "offline cache cleaning");
            return Ok(());
        };

        let mut data = match load_store(&metadata_path) {
            Ok(data) => data,
            Err(StoreLoadError::NotFound) => return Ok(()),
            Err(StoreLoadError::Corrupted) | Err(StoreLoadError::VersionMismatch) => {
                if policy.contains(CleanPolicy::PURGE_ON_VERSION_MISMATCH) {
                    tracing::debug!(
                        target = "kiln.cache",
                        dir = %dir.display(),
                        "purging stale offline cache directory"
                    );
                    if remove_file_best_effort(&metadata_path, "cleaner.purge_metadata") {
                        remove_file_best_effort(&debug_path, "cleaner.purge_sidecar");
                        remove_artifact_files(dir, rule);
                    }
                }
                return Ok(());
            }
        };

        let evict_count = (cleaning_fraction * data.entries.len() as f64) as usize;
        if data.total_size_bytes < max_total_bytes || evict_count == 0 {
            return Ok(());
        }

        let order = if policy.contains(CleanPolicy::EVICT_LRU) {
            EvictOrder::LastUsed
        } else if policy.contains(CleanPolicy::EVICT_FIFO) {
            EvictOrder::Created
        } else {
            // Over the size cap with no evict bit set: nothing is selected.
            // The cap is only enforced under LRU/FIFO.
            return Ok(());
        };

        // Bounded max-heap keeping the `evict_count` oldest entries, without
        // sorting the whole map.
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(evict_count + 1);
        for (key, entry) in &data.entries {
            let stamp = order.stamp(entry);
            if heap.len() == evict_count {
                if heap.peek().is_some_and(|top| stamp < top.stamp) {
                    heap.pop();
                } else {
                    continue;
                }
            }
            heap.push(HeapEntry {
                stamp,
                key: key.clone(),
            });
        }

        for selected in heap {
            if let Some(entry) = data.entries.remove(&selected.key) {
                data.total_size_bytes = data.total_size_bytes.saturating_sub(entry.size_bytes);
                evicted_files.push(dir.join(rule.artifact_filename(&entry.cache_key)));
            }
        }

        if data.entries.is_empty() {
            // Nothing left worth a store file.
            remove_file_best_effort(&metadata_path, "cleaner.empty_metadata");
            remove_file_best_effort(&debug_path, "cleaner.empty_sidecar");
        } else {
            save_store(&data, &metadata_path)?;
            save_store_debug(&data, &debug_path)?;
        }
    }

    // Artifact payloads are deleted outside the lock; a reader racing a
    // deletion observes a miss and recomputes, which is always safe.
    for path in evicted_files {
        remove_file_best_effort(&path, "cleaner.evicted_artifact");
    }
    Ok(())
}

fn remove_artifact_files(dir: &Path, rule: &CacheFileRule) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(
                target = "kiln.cache",
                dir = %dir.display(),
                error = %err,
                "failed to scan cache directory while purging"
            );
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if rule.is_artifact_file(name) {
            remove_file_best_effort(&entry.path(), "cleaner.purged_artifact");
        }
    }
}
