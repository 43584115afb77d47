use crate::IrModule;
use std::sync::OnceLock;

/// How a kernel body was supplied.
#[derive(Debug)]
pub enum KernelIr {
    /// Source-derived AST form; content-addressable, so compiled artifacts
    /// may be persisted across runs.
    Ast(IrModule),
    /// Pre-lowered IR injected by the caller. Its only identity is the
    /// kernel name, which is stable but not content-derived.
    Lowered(IrModule),
}

/// A kernel definition as seen by the compilation cache.
#[derive(Debug)]
pub struct KernelDef {
    name: String,
    ir: KernelIr,
    cache_key: OnceLock<String>,
}

impl KernelDef {
    pub fn new(name: impl Into<String>, ir: KernelIr) -> Self {
        Self {
            name: name.into(),
            ir,
            cache_key: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ir(&self) -> &IrModule {
        match &self.ir {
            KernelIr::Ast(module) | KernelIr::Lowered(module) => module,
        }
    }

    pub fn ir_is_ast(&self) -> bool {
        matches!(self.ir, KernelIr::Ast(_))
    }

    /// Cache key memoized for the lifetime of this definition; derived on
    /// first use.
    pub fn cache_key_or_init(&self, derive: impl FnOnce() -> String) -> &str {
        self.cache_key.get_or_init(derive)
    }
}
