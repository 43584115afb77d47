use crate::artifact::CompiledArtifact;
use crate::cache_dir::KERNEL_CACHE_SUBDIR;
use crate::cleaner::{clean_cache_dir, CacheFileRule, CleanPolicy};
use crate::compiler::KernelCompiler;
use crate::error::CacheError;
use crate::key::kernel_cache_key;
use crate::lock::{warn_lock_busy, CacheLockFile};
use crate::metadata::{
    load_store, save_store, save_store_debug, CacheEntryMeta, CacheMode, CacheStoreData,
    StoreLoadError, METADATA_DEBUG_FILENAME, METADATA_FILENAME, METADATA_LOCK_FILENAME,
};
use crate::util::{atomic_write, now_millis};
use kiln_core::{Arch, CompileConfig, DeviceCapabilityConfig, KernelDef};
use std::collections::btree_map::Entry as BTreeEntry;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// File extension for persisted kernel artifacts.
pub const KERNEL_ARTIFACT_EXT: &str = "kc";

const KERNEL_FILE_RULE: CacheFileRule = CacheFileRule {
    artifact_ext: KERNEL_ARTIFACT_EXT,
};

/// Result of a launch-path cache query.
#[derive(Debug)]
pub struct LoadOutcome {
    pub artifact: CompiledArtifact,
    /// Diagnostics only; callers must not branch on it.
    pub cache_hit: bool,
}

struct CachedKernel {
    meta: CacheEntryMeta,
    artifact: Option<CompiledArtifact>,
}

pub struct ManagerConfig {
    /// Root of the shared offline cache; the manager owns the
    /// [`KERNEL_CACHE_SUBDIR`] directory beneath it.
    pub offline_cache_path: PathBuf,
    pub compiler: Box<dyn KernelCompiler>,
}

/// Composes key derivation, the metadata store, the file lock and the
/// cleaner into the load-or-compile / dump / clean surface used by the
/// kernel launch path.
///
/// A single instance is driven by one logical caller thread at a time;
/// cross-process safety comes from the file lock around every metadata
/// read-modify-write, not from internal synchronization.
pub struct KernelCacheManager {
    compiler: Box<dyn KernelCompiler>,
    cache_dir: PathBuf,
    /// Entries produced by this process since the last successful flush.
    caching_kernels: HashMap<String, CachedKernel>,
    /// View of the on-disk store, read once at construction and refreshed
    /// by every successful `dump()`. Artifacts load lazily from per-key
    /// files.
    disk_entries: BTreeMap<String, CachedKernel>,
    /// Keys whose `last_used_at` was bumped without a new artifact.
    bumped: HashMap<String, u64>,
}

impl KernelCacheManager {
    pub fn new(config: ManagerConfig) -> Self {
        let cache_dir = config.offline_cache_path.join(KERNEL_CACHE_SUBDIR);
        tracing::debug!(
            target = "kiln.cache",
            dir = %cache_dir.display(),
            "creating kernel cache manager"
        );

        let mut disk_entries = BTreeMap::new();
        let metadata_path = cache_dir.join(METADATA_FILENAME);
        if metadata_path.exists() {
            let lock_path = cache_dir.join(METADATA_LOCK_FILENAME);
            match CacheLockFile::try_acquire(&lock_path) {
                Ok(Some(_lock)) => match load_store(&metadata_path) {
                    Ok(data) => {
                        for (key, mut meta) in data.entries {
                            meta.cache_mode = CacheMode::MemoryAndDisk;
                            disk_entries.insert(
                                key,
                                CachedKernel {
                                    meta,
                                    artifact: None,
                                },
                            );
                        }
                    }
                    Err(err) => {
                        tracing::debug!(
                            target = "kiln.cache",
                            path = %metadata_path.display(),
                            reason = ?err,
                            "offline cache store unusable; starting with an empty view"
                        );
                    }
                },
                Ok(None) => warn_lock_busy(&lock_path, &cache_dir, "offline cache load"),
                Err(err) => {
                    tracing::debug!(
                        target = "kiln.cache",
                        error = %err,
                        "failed to create cache lock; starting with an empty view"
                    );
                }
            }
        }

        Self {
            compiler: config.compiler,
            cache_dir,
            caching_kernels: HashMap::new(),
            disk_entries,
            bumped: HashMap::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Load from memory, load from disk, or compile and cache in memory.
    pub fn load_or_compile(
        &mut self,
        config: &CompileConfig,
        caps: &DeviceCapabilityConfig,
        kernel: &KernelDef,
    ) -> Result<LoadOutcome, CacheError> {
        let cache_mode = cache_mode_for(config, kernel.ir_is_ast());
        let kernel_key = kernel
            .cache_key_or_init(|| kernel_cache_key(config, caps, kernel))
            .to_string();

        if let Some(artifact) =
            self.try_load_cached(kernel.name(), &kernel_key, config.arch, cache_mode)
        {
            return Ok(LoadOutcome {
                artifact,
                cache_hit: true,
            });
        }

        let artifact = self.compile_and_cache(&kernel_key, cache_mode, config, caps, kernel)?;
        Ok(LoadOutcome {
            artifact,
            cache_hit: false,
        })
    }

    /// Flush the memory tier into the shared on-disk store.
    ///
    /// Idempotent and safe to call any number of times, including zero. A
    /// busy lock turns the whole call into a logged no-op: the memory tier
    /// is kept for a later flush rather than risking a torn store.
    pub fn dump(&mut self) -> Result<(), CacheError> {
        if self.caching_kernels.is_empty() && self.bumped.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            target = "kiln.cache",
            kernels = self.caching_kernels.len(),
            "flushing cached kernels to disk"
        );

        std::fs::create_dir_all(&self.cache_dir)?;
        let metadata_path = self.cache_dir.join(METADATA_FILENAME);
        let lock_path = self.cache_dir.join(METADATA_LOCK_FILENAME);
        let Some(_lock) = CacheLockFile::try_acquire(&lock_path)? else {
            warn_lock_busy(&lock_path, &self.cache_dir, "offline cache flush");
            return Ok(());
        };

        // Re-read the store: other processes may have flushed since this
        // manager was constructed.
        let mut data = match load_store(&metadata_path) {
            Ok(data) => data,
            Err(StoreLoadError::NotFound) => CacheStoreData::empty(),
            Err(reason @ (StoreLoadError::Corrupted | StoreLoadError::VersionMismatch)) => {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %metadata_path.display(),
                    ?reason,
                    "discarding unusable offline cache store"
                );
                CacheStoreData::empty()
            }
        };

        // Timestamp bumps for entries this process only re-used.
        for (key, last_used) in self.bumped.drain() {
            if let Some(entry) = data.entries.get_mut(&key) {
                entry.last_used_at_millis = last_used;
            }
        }

        // New entries from this run. Insert-if-absent: if a concurrent
        // writer got there first, its copy (and artifact file) wins.
        let mut new_artifacts: HashMap<String, CompiledArtifact> = HashMap::new();
        for (key, kernel) in self.caching_kernels.drain() {
            if kernel.meta.cache_mode != CacheMode::MemoryAndDisk {
                continue;
            }
            if let BTreeEntry::Vacant(slot) = data.entries.entry(key.clone()) {
                slot.insert(kernel.meta);
                if let Some(artifact) = kernel.artifact {
                    new_artifacts.insert(key, artifact);
                }
            }
        }

        // One write-once file per new artifact; sizes become authoritative
        // here.
        for (key, artifact) in &new_artifacts {
            let path = self.artifact_path(key);
            match write_artifact_file(&path, artifact) {
                Ok(size) => {
                    if let Some(entry) = data.entries.get_mut(key) {
                        entry.size_bytes = size;
                        data.total_size_bytes = data.total_size_bytes.saturating_add(size);
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        target = "kiln.cache",
                        key = %key,
                        error = %err,
                        "failed to persist cached artifact"
                    );
                }
            }
        }

        if !data.entries.is_empty() {
            save_store(&data, &metadata_path)?;
            save_store_debug(&data, &self.cache_dir.join(METADATA_DEBUG_FILENAME))?;
        }

        // The merged store becomes the new disk-tier view, keeping the
        // artifacts this process already holds in memory.
        let mut disk_entries = BTreeMap::new();
        for (key, mut meta) in data.entries {
            meta.cache_mode = CacheMode::MemoryAndDisk;
            let artifact = new_artifacts.remove(&key).or_else(|| {
                self.disk_entries
                    .get_mut(&key)
                    .and_then(|entry| entry.artifact.take())
            });
            disk_entries.insert(key, CachedKernel { meta, artifact });
        }
        self.disk_entries = disk_entries;
        Ok(())
    }

    /// Run an offline cache cleaning pass over this manager's directory.
    pub fn clean_offline_cache(
        &self,
        policy: CleanPolicy,
        max_total_bytes: u64,
        cleaning_fraction: f64,
    ) -> Result<(), CacheError> {
        clean_cache_dir(
            &self.cache_dir,
            &KERNEL_FILE_RULE,
            policy,
            max_total_bytes,
            cleaning_fraction,
        )
    }

    /// Cleaning pass driven by the policy triple carried in the compile
    /// config.
    pub fn clean_offline_cache_from_config(
        &self,
        config: &CompileConfig,
    ) -> Result<(), CacheError> {
        self.clean_offline_cache(
            CleanPolicy::from_name(&config.offline_cache_cleaning_policy),
            config.offline_cache_max_size_bytes,
            config.offline_cache_cleaning_factor,
        )
    }

    /// Record an externally produced artifact under a caller-supplied,
    /// already-trusted checksum, bypassing key derivation.
    pub fn store_fast_cache(
        &mut self,
        checksum: &str,
        kernel: &KernelDef,
        config: &CompileConfig,
        artifact: &CompiledArtifact,
    ) {
        let cache_mode = cache_mode_for(config, kernel.ir_is_ast());
        tracing::debug!(
            target = "kiln.cache",
            kernel = kernel.name(),
            key = checksum,
            "storing fast-cache artifact"
        );
        let now = now_millis();
        let meta = CacheEntryMeta {
            cache_key: checksum.to_string(),
            size_bytes: 0,
            created_at_millis: now,
            last_used_at_millis: now,
            cache_mode,
        };
        self.caching_kernels.insert(
            checksum.to_string(),
            CachedKernel {
                meta,
                artifact: Some(artifact.clone()),
            },
        );
    }

    /// Fast-cache counterpart of the load half of [`Self::load_or_compile`].
    pub fn load_fast_cache(
        &mut self,
        checksum: &str,
        kernel_name: &str,
        config: &CompileConfig,
    ) -> Option<CompiledArtifact> {
        let cache_mode = cache_mode_for(config, true);
        self.try_load_cached(kernel_name, checksum, config.arch, cache_mode)
    }

    fn try_load_cached(
        &mut self,
        kernel_name: &str,
        kernel_key: &str,
        arch: Arch,
        cache_mode: CacheMode,
    ) -> Option<CompiledArtifact> {
        if let Some(cached) = self.caching_kernels.get(kernel_key) {
            tracing::debug!(
                target = "kiln.cache",
                kernel = kernel_name,
                key = kernel_key,
                "kernel served from the in-memory tier"
            );
            return cached.artifact.clone();
        }

        if cache_mode != CacheMode::MemoryAndDisk {
            return None;
        }
        let artifact_path = self.cache_dir.join(KERNEL_FILE_RULE.artifact_filename(kernel_key));
        let entry = self.disk_entries.get_mut(kernel_key)?;
        if let Some(artifact) = &entry.artifact {
            tracing::debug!(
                target = "kiln.cache",
                kernel = kernel_name,
                key = kernel_key,
                "kernel served from the offline cache"
            );
            return Some(artifact.clone());
        }

        let loaded = load_artifact_file(&artifact_path, arch)?;
        entry.meta.last_used_at_millis = now_millis();
        self.bumped
            .insert(kernel_key.to_string(), entry.meta.last_used_at_millis);
        tracing::debug!(
            target = "kiln.cache",
            kernel = kernel_name,
            key = kernel_key,
            "kernel served from the offline cache"
        );
        let out = loaded.clone();
        entry.artifact = Some(loaded);
        Some(out)
    }

    fn compile_and_cache(
        &mut self,
        kernel_key: &str,
        cache_mode: CacheMode,
        config: &CompileConfig,
        caps: &DeviceCapabilityConfig,
        kernel: &KernelDef,
    ) -> Result<CompiledArtifact, CacheError> {
        debug_assert!(!self.caching_kernels.contains_key(kernel_key));
        tracing::debug!(
            target = "kiln.cache",
            kernel = kernel.name(),
            key = kernel_key,
            "compiling kernel"
        );

        let ir = self.compiler.lower(config, kernel)?;
        let artifact = self.compiler.codegen(config, caps, kernel, &ir)?;
        if let Err(err) = artifact.check() {
            // A compiler handing back a broken artifact is a codegen bug;
            // surface it loudly instead of caching or retrying.
            tracing::error!(
                target = "kiln.cache",
                kernel = kernel.name(),
                error = %err,
                "freshly compiled artifact failed its structural check"
            );
            return Err(CacheError::BrokenCompilerOutput {
                kernel: kernel.name().to_string(),
            });
        }

        let now = now_millis();
        let meta = CacheEntryMeta {
            cache_key: kernel_key.to_string(),
            // Populated by `dump()` once the artifact file exists.
            size_bytes: 0,
            created_at_millis: now,
            last_used_at_millis: now,
            cache_mode,
        };
        let out = artifact.clone();
        self.caching_kernels.insert(
            kernel_key.to_string(),
            CachedKernel {
                meta,
                artifact: Some(artifact),
            },
        );
        Ok(out)
    }

    fn artifact_path(&self, kernel_key: &str) -> PathBuf {
        self.cache_dir
            .join(KERNEL_FILE_RULE.artifact_filename(kernel_key))
    }
}

fn cache_mode_for(config: &CompileConfig, kernel_ir_is_ast: bool) -> CacheMode {
    // Pre-lowered kernels have no content-derived key; persisting them
    // across runs could serve a stale artifact for a changed definition.
    if config.offline_cache && kernel_ir_is_ast {
        CacheMode::MemoryAndDisk
    } else {
        CacheMode::MemoryOnly
    }
}

fn load_artifact_file(path: &Path, arch: Arch) -> Option<CompiledArtifact> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to open cached artifact file"
                );
            }
            return None;
        }
    };
    let mut reader = BufReader::new(file);
    let artifact = match CompiledArtifact::deserialize(&mut reader, arch) {
        Ok(artifact) => artifact,
        Err(err) => {
            tracing::debug!(
                target = "kiln.cache",
                path = %path.display(),
                error = %err,
                "failed to decode cached artifact"
            );
            return None;
        }
    };
    if let Err(err) = artifact.check() {
        tracing::debug!(
            target = "kiln.cache",
            path = %path.display(),
            error = %err,
            "cached artifact failed its structural check"
        );
        return None;
    }
    Some(artifact)
}

fn write_artifact_file(path: &Path, artifact: &CompiledArtifact) -> Result<u64, CacheError> {
    let mut bytes = Vec::new();
    artifact.serialize(&mut bytes)?;
    atomic_write(path, &bytes)?;
    Ok(bytes.len() as u64)
}
