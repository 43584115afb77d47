use crate::error::CacheError;
use crate::util::{atomic_write, bincode_deserialize, bincode_options_limited, bincode_serialize, read_file_limited};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

/// Fixed file names shared by every cache directory.
pub const METADATA_FILENAME: &str = "metadata.bin";
pub const METADATA_DEBUG_FILENAME: &str = "metadata.json";
pub const METADATA_LOCK_FILENAME: &str = "metadata.lock";

/// Whether an artifact lives only in this process or also on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    MemoryOnly,
    MemoryAndDisk,
}

/// Per-entry bookkeeping for one cached artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub cache_key: String,
    /// Authoritative only once the artifact file has been persisted.
    pub size_bytes: u64,
    pub created_at_millis: u64,
    pub last_used_at_millis: u64,
    /// Memory-tier attribute; presence on disk already implies
    /// `MemoryAndDisk`, so it is not serialized.
    #[serde(skip)]
    pub cache_mode: CacheMode,
}

/// Versioned index of every cache key known to one cache directory.
///
/// `version` stays the first field so readers can reject a foreign-version
/// store from the 6-byte prefix without parsing the rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStoreData {
    pub version: (u16, u16, u16),
    /// Best-effort sum of entry sizes, finalized at persistence time.
    pub total_size_bytes: u64,
    pub entries: BTreeMap<String, CacheEntryMeta>,
}

impl CacheStoreData {
    pub fn empty() -> Self {
        Self {
            version: kiln_core::VERSION_TUPLE,
            total_size_bytes: 0,
            entries: BTreeMap::new(),
        }
    }
}

impl Default for CacheStoreData {
    fn default() -> Self {
        Self::empty()
    }
}

/// Why a store on disk could not be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreLoadError {
    NotFound,
    Corrupted,
    VersionMismatch,
}

/// Load and validate the store at `path`.
///
/// The version prefix is checked before the rest of the file is parsed; a
/// foreign-version store is reported without decoding its entry map.
pub fn load_store(path: &Path) -> Result<CacheStoreData, StoreLoadError> {
    if !path.exists() {
        return Err(StoreLoadError::NotFound);
    }
    let bytes = match read_file_limited(path) {
        Some(bytes) => bytes,
        None => return Err(StoreLoadError::Corrupted),
    };

    let mut cursor = Cursor::new(bytes.as_slice());
    let version: (u16, u16, u16) = match bincode_options_limited().deserialize_from(&mut cursor) {
        Ok(version) => version,
        Err(_) => return Err(StoreLoadError::Corrupted),
    };
    if version != kiln_core::VERSION_TUPLE {
        tracing::debug!(
            target = "kiln.cache",
            path = %path.display(),
            found = ?version,
            expected = ?kiln_core::VERSION_TUPLE,
            "offline cache store has a foreign version"
        );
        return Err(StoreLoadError::VersionMismatch);
    }

    bincode_deserialize(&bytes).map_err(|_| StoreLoadError::Corrupted)
}

pub fn save_store(data: &CacheStoreData, path: &Path) -> Result<(), CacheError> {
    let bytes = bincode_serialize(data)?;
    atomic_write(path, &bytes)
}

/// Human-readable sidecar for debugging; written alongside the binary store
/// and never read back.
pub fn save_store_debug(data: &CacheStoreData, path: &Path) -> Result<(), CacheError> {
    let json = serde_json::to_vec(data)?;
    atomic_write(path, &json)
}
