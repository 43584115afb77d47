use crate::error::CacheError;
use crate::util::{bincode_options, bincode_options_limited};
use bincode::Options;
use kiln_core::{Arch, BackendFamily};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// An entry point exposed by a compiled kernel payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub name: String,
    /// Launch hints recorded by the code generator.
    pub grid_dim: u32,
    pub block_dim: u32,
}

/// Textual-module payload produced by LLVM-family backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlvmArtifact {
    pub module_text: String,
    /// Names of the functions defined in `module_text`.
    pub functions: Vec<String>,
    pub entry_points: Vec<EntryPoint>,
}

/// Binary word-stream payload produced by SPIR-V-family backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpirvArtifact {
    pub words: Vec<u32>,
    pub entry_points: Vec<EntryPoint>,
}

/// Backend-specific payload. A closed sum: decode dispatches on the arch tag
/// exactly once, and no backend gets its own artifact type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactPayload {
    Llvm(LlvmArtifact),
    Spirv(SpirvArtifact),
}

/// An opaque compiled kernel, tagged with its target backend.
///
/// `clone()` is a deep copy; callers never share mutable state with the
/// cache's copy of an artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledArtifact {
    arch: Arch,
    payload: ArtifactPayload,
}

impl CompiledArtifact {
    pub fn new(arch: Arch, payload: ArtifactPayload) -> Self {
        Self { arch, payload }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn payload(&self) -> &ArtifactPayload {
        &self.payload
    }

    /// Serialize as a one-byte arch tag followed by the bincode payload.
    pub fn serialize(&self, sink: &mut impl Write) -> Result<(), CacheError> {
        sink.write_all(&[self.arch.tag()])?;
        bincode_options().serialize_into(sink, &self.payload)?;
        Ok(())
    }

    /// Read an artifact back, failing fast on an arch tag that does not
    /// match `expected` before any payload decoding happens.
    pub fn deserialize(source: &mut impl Read, expected: Arch) -> Result<Self, CacheError> {
        let mut tag = [0_u8; 1];
        source.read_exact(&mut tag)?;
        let arch = Arch::from_tag(tag[0]).ok_or(CacheError::UnknownArchTag { tag: tag[0] })?;
        if arch != expected {
            return Err(CacheError::ArchNotMatched {
                expected,
                found: arch,
            });
        }
        let payload: ArtifactPayload = bincode_options_limited().deserialize_from(source)?;
        Ok(Self { arch, payload })
    }

    /// Structural self-check.
    ///
    /// The payload family must match the arch, and every declared entry
    /// point must resolve inside the payload. A failed check on the read
    /// path is equivalent to absence; on the compile path it is a loud
    /// compiler bug.
    pub fn check(&self) -> Result<(), CacheError> {
        match (&self.payload, self.arch.family()) {
            (ArtifactPayload::Llvm(module), BackendFamily::Llvm) => {
                if module.module_text.is_empty() {
                    return Err(broken("module text is empty"));
                }
                for entry in &module.entry_points {
                    if !module.functions.iter().any(|f| f == &entry.name) {
                        return Err(broken(format!(
                            "entry point `{}` does not resolve to a function",
                            entry.name
                        )));
                    }
                }
                Ok(())
            }
            (ArtifactPayload::Spirv(blob), BackendFamily::Spirv) => {
                if blob.words.first() != Some(&SPIRV_MAGIC) {
                    return Err(broken("word stream does not start with the SPIR-V magic"));
                }
                for entry in &blob.entry_points {
                    if entry.name.is_empty() {
                        return Err(broken("entry point with an empty name"));
                    }
                }
                Ok(())
            }
            _ => Err(broken(format!(
                "payload family does not match arch {}",
                self.arch
            ))),
        }
    }
}

fn broken(reason: impl Into<String>) -> CacheError {
    CacheError::ArtifactBroken {
        reason: reason.into(),
    }
}
