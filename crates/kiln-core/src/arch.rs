use serde::{Deserialize, Serialize};
use std::fmt;

/// Target backend for compiled kernel artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X64,
    Arm64,
    Cuda,
    Vulkan,
    Metal,
    Dx12,
}

/// Which serialized payload family a backend produces.
///
/// Artifact decoding dispatches on this exactly once; individual backends do
/// not get their own artifact types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendFamily {
    /// Textual module + side metadata (CPU and CUDA backends).
    Llvm,
    /// Binary word stream (Vulkan/Metal/DX12 backends).
    Spirv,
}

impl Arch {
    /// Stable tag byte written at the head of serialized artifacts.
    pub fn tag(self) -> u8 {
        match self {
            Arch::X64 => 0,
            Arch::Arm64 => 1,
            Arch::Cuda => 2,
            Arch::Vulkan => 3,
            Arch::Metal => 4,
            Arch::Dx12 => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Arch> {
        Some(match tag {
            0 => Arch::X64,
            1 => Arch::Arm64,
            2 => Arch::Cuda,
            3 => Arch::Vulkan,
            4 => Arch::Metal,
            5 => Arch::Dx12,
            _ => return None,
        })
    }

    pub fn family(self) -> BackendFamily {
        match self {
            Arch::X64 | Arch::Arm64 | Arch::Cuda => BackendFamily::Llvm,
            Arch::Vulkan | Arch::Metal | Arch::Dx12 => BackendFamily::Spirv,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
            Arch::Cuda => "cuda",
            Arch::Vulkan => "vulkan",
            Arch::Metal => "metal",
            Arch::Dx12 => "dx12",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
