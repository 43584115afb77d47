use kiln_core::Arch;

/// Errors produced by cache management and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact arch not matched: expected {expected}, found {found}")]
    ArchNotMatched { expected: Arch, found: Arch },

    #[error("unknown arch tag {tag:#04x} in artifact header")]
    UnknownArchTag { tag: u8 },

    #[error("compiled artifact is broken: {reason}")]
    ArtifactBroken { reason: String },

    /// The external compiler handed back an artifact that fails its own
    /// structural check. A codegen bug, not a cache condition, and never
    /// retried.
    #[error("compiler produced a broken artifact for kernel `{kernel}`")]
    BrokenCompilerOutput { kernel: String },

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// External kernel-compiler failure, propagated unchanged to launch-path
/// callers.
#[derive(Debug, thiserror::Error)]
#[error("kernel compilation failed: {message}")]
pub struct CompileError {
    message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
