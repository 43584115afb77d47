use kiln_core::{CompileConfig, DeviceCapabilityConfig, KernelDef};
use sha2::{Digest, Sha256};

/// Length of a derived cache key: one prefix letter plus 64 hex digits.
///
/// Keys double as file stems and backend symbol fragments, so the prefix
/// letter keeps them from starting with a digit.
pub const CACHE_KEY_LEN: usize = 65;

const KERNEL_KEY_PREFIX: char = 'k';
const ASM_KEY_PREFIX: char = 'a';

/// Incremental hasher writing tagged, length-delimited fields so adjacent
/// fields can never alias under concatenation.
struct KeyHasher {
    hasher: Sha256,
}

impl KeyHasher {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn field(&mut self, tag: &str, bytes: &[u8]) {
        self.hasher.update(tag.as_bytes());
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    fn finish(self, prefix: char) -> String {
        let mut key = hex::encode(self.hasher.finalize());
        key.insert(0, prefix);
        key
    }
}

/// Derive the cache key for a kernel.
///
/// Source-derived kernels are keyed by content: the config subset that
/// affects generated bytes, the device capability set in sorted order, and a
/// structural traversal of the IR. Pre-lowered kernels are keyed by their
/// caller-assigned name; that key is stable but not content-derived, which
/// is why such kernels are never persisted to disk.
pub fn kernel_cache_key(
    config: &CompileConfig,
    caps: &DeviceCapabilityConfig,
    kernel: &KernelDef,
) -> String {
    if !kernel.ir_is_ast() {
        return kernel.name().to_string();
    }

    let mut hasher = KeyHasher::new();
    hasher.field("arch", config.arch.as_str().as_bytes());
    hasher.field("opt_level", &[config.opt_level]);
    hasher.field("fast_math", &[config.fast_math as u8]);
    hasher.field("debug", &[config.debug as u8]);
    for (name, value) in caps.iter() {
        hasher.field("cap", name.as_bytes());
        hasher.field("cap_value", &value.to_le_bytes());
    }
    let mut ir_bytes = Vec::new();
    kernel.ir().write_structural_bytes(&mut ir_bytes);
    hasher.field("ir", &ir_bytes);
    hasher.finish(KERNEL_KEY_PREFIX)
}

/// Key for the secondary assembly-text cache: the textual module plus every
/// flag that affects the next lowering stage.
pub fn asm_cache_key(
    module_text: &str,
    max_regs: u32,
    fast_math: bool,
    target_cpu: &str,
    target_features: &str,
) -> String {
    let mut hasher = KeyHasher::new();
    hasher.field("module", module_text.as_bytes());
    hasher.field("max_regs", &max_regs.to_le_bytes());
    hasher.field("fast_math", &[fast_math as u8]);
    hasher.field("target_cpu", target_cpu.as_bytes());
    hasher.field("target_features", target_features.as_bytes());
    hasher.finish(ASM_KEY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{IrFunc, IrInst, IrModule, IrOp, KernelIr};

    fn sample_ir(imm: i64) -> IrModule {
        IrModule {
            funcs: vec![IrFunc {
                name: "scale".to_string(),
                params: 2,
                body: vec![
                    IrInst {
                        op: IrOp::Const,
                        operands: vec![],
                        imm: Some(imm),
                    },
                    IrInst {
                        op: IrOp::Mul,
                        operands: vec![0, 1],
                        imm: None,
                    },
                    IrInst {
                        op: IrOp::Ret,
                        operands: vec![2],
                        imm: None,
                    },
                ],
            }],
        }
    }

    fn ast_kernel(imm: i64) -> KernelDef {
        KernelDef::new("scale", KernelIr::Ast(sample_ir(imm)))
    }

    #[test]
    fn keys_are_deterministic() {
        let config = CompileConfig::default();
        let mut caps = DeviceCapabilityConfig::new();
        caps.set("shared_mem_kb", 48);
        caps.set("warp_size", 32);

        let first = kernel_cache_key(&config, &caps, &ast_kernel(7));
        let second = kernel_cache_key(&config, &caps, &ast_kernel(7));
        assert_eq!(first, second);
        assert_eq!(first.len(), CACHE_KEY_LEN);
        assert!(first.starts_with('k'));
    }

    #[test]
    fn keys_are_sensitive_to_config_and_ir() {
        let caps = DeviceCapabilityConfig::new();
        let base = CompileConfig::default();
        let mut fast = base.clone();
        fast.fast_math = true;
        let mut cuda = base.clone();
        cuda.arch = kiln_core::Arch::Cuda;

        let key_base = kernel_cache_key(&base, &caps, &ast_kernel(7));
        let key_fast = kernel_cache_key(&fast, &caps, &ast_kernel(7));
        let key_cuda = kernel_cache_key(&cuda, &caps, &ast_kernel(7));
        let key_other_ir = kernel_cache_key(&base, &caps, &ast_kernel(8));

        assert_ne!(key_base, key_fast);
        assert_ne!(key_base, key_cuda);
        assert_ne!(key_base, key_other_ir);
        assert_ne!(key_fast, key_other_ir);
    }

    #[test]
    fn keys_are_sensitive_to_device_caps() {
        let config = CompileConfig::default();
        let empty = DeviceCapabilityConfig::new();
        let mut caps = DeviceCapabilityConfig::new();
        caps.set("warp_size", 32);

        assert_ne!(
            kernel_cache_key(&config, &empty, &ast_kernel(7)),
            kernel_cache_key(&config, &caps, &ast_kernel(7))
        );
    }

    #[test]
    fn lowered_kernels_use_their_name() {
        let config = CompileConfig::default();
        let caps = DeviceCapabilityConfig::new();
        let kernel = KernelDef::new("injected_kernel", KernelIr::Lowered(sample_ir(7)));
        assert_eq!(
            kernel_cache_key(&config, &caps, &kernel),
            "injected_kernel"
        );
    }

    #[test]
    fn asm_keys_are_sensitive_to_lowering_flags() {
        let base = asm_cache_key("module m", 64, false, "sm_86", "+ptx78");
        assert_eq!(base, asm_cache_key("module m", 64, false, "sm_86", "+ptx78"));
        assert_eq!(base.len(), CACHE_KEY_LEN);
        assert!(base.starts_with('a'));

        assert_ne!(base, asm_cache_key("module m", 64, true, "sm_86", "+ptx78"));
        assert_ne!(base, asm_cache_key("module m", 32, false, "sm_86", "+ptx78"));
        assert_ne!(base, asm_cache_key("module m", 64, false, "sm_90", "+ptx78"));
        assert_ne!(base, asm_cache_key("module m", 64, false, "sm_86", "+ptx80"));
        assert_ne!(base, asm_cache_key("module n", 64, false, "sm_86", "+ptx78"));
    }
}
