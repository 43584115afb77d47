//! Offline compilation-artifact cache for the Kiln kernel runtime.
//!
//! Compiling a kernel to a backend-specific executable form is expensive, so
//! results are memoized by a content fingerprint of (kernel IR, compiler
//! configuration, device capabilities, target backend) and persisted across
//! process runs in a shared directory. The cache guarantees
//! at-most-one-compile-per-key within a process, survives concurrent OS
//! processes sharing one directory, bounds total size under configurable
//! eviction policies, and treats stale/corrupt/foreign-version state as a
//! miss — while staying agnostic to what the cached bytes mean.
//!
//! ## On-disk layout (inventory)
//!
//! Per cache root (default `~/.kiln/cache`, override via `KILN_CACHE_DIR`):
//! - `kernels/` — owned by [`KernelCacheManager`]:
//!   - `metadata.bin`: versioned [`CacheStoreData`] (bincode; version tuple
//!     first so readers can reject foreign stores from the prefix)
//!   - `metadata.json`: human-readable debug sidecar
//!   - `metadata.lock`: cooperative marker-file lock
//!   - `<cache_key>.kc`: one write-once [`CompiledArtifact`] per key
//! - `asm/` — owned by [`AsmCache`], same fixed names plus
//!   `<cache_key>.asm` text payloads
//!
//! Cross-process safety comes solely from the marker-file lock around each
//! metadata read-modify-write; artifact files are write-once and never need
//! locking to read.

mod artifact;
mod asm_cache;
mod cache_dir;
mod cleaner;
mod compiler;
mod error;
mod key;
mod lock;
mod manager;
mod mangle;
mod metadata;
mod util;

pub use artifact::{ArtifactPayload, CompiledArtifact, EntryPoint, LlvmArtifact, SpirvArtifact};
pub use asm_cache::{AsmCache, AsmCacheConfig, ASM_ARTIFACT_EXT};
pub use cache_dir::{CacheConfig, ASM_CACHE_SUBDIR, KERNEL_CACHE_SUBDIR};
pub use cleaner::{clean_cache_dir, CacheFileRule, CleanPolicy};
pub use compiler::KernelCompiler;
pub use error::{CacheError, CompileError};
pub use key::{asm_cache_key, kernel_cache_key, CACHE_KEY_LEN};
pub use lock::CacheLockFile;
pub use mangle::{demangle_kernel_name, mangle_kernel_name};
pub use manager::{KernelCacheManager, LoadOutcome, ManagerConfig, KERNEL_ARTIFACT_EXT};
pub use metadata::{
    load_store, save_store, save_store_debug, CacheEntryMeta, CacheMode, CacheStoreData,
    StoreLoadError, METADATA_DEBUG_FILENAME, METADATA_FILENAME, METADATA_LOCK_FILENAME,
};
pub use util::{now_millis, BINCODE_PAYLOAD_LIMIT_BYTES};
