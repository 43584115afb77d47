use crate::artifact::CompiledArtifact;
use crate::error::CompileError;
use kiln_core::{CompileConfig, DeviceCapabilityConfig, IrModule, KernelDef};

/// The external kernel compiler, invoked by the cache only on a confirmed
/// miss.
///
/// Compilation is deterministic: identical inputs fail identically, so a
/// failed compile is never retried by the cache.
pub trait KernelCompiler {
    /// Lower a kernel definition to backend-neutral IR.
    fn lower(&self, config: &CompileConfig, kernel: &KernelDef) -> Result<IrModule, CompileError>;

    /// Generate the backend-specific artifact from lowered IR.
    fn codegen(
        &self,
        config: &CompileConfig,
        caps: &DeviceCapabilityConfig,
        kernel: &KernelDef,
        ir: &IrModule,
    ) -> Result<CompiledArtifact, CompileError>;
}
