use kiln_cache::{
    load_store, save_store, ArtifactPayload, CacheError, CompileError, CompiledArtifact,
    EntryPoint, KernelCacheManager, KernelCompiler, LlvmArtifact, ManagerConfig,
    KERNEL_ARTIFACT_EXT, KERNEL_CACHE_SUBDIR, METADATA_FILENAME, METADATA_LOCK_FILENAME,
};
use kiln_core::{
    Arch, CompileConfig, DeviceCapabilityConfig, IrFunc, IrInst, IrModule, IrOp, KernelDef,
    KernelIr,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingCompiler {
    codegen_calls: Arc<AtomicUsize>,
}

impl KernelCompiler for CountingCompiler {
    fn lower(&self, _config: &CompileConfig, kernel: &KernelDef) -> Result<IrModule, CompileError> {
        Ok(kernel.ir().clone())
    }

    fn codegen(
        &self,
        config: &CompileConfig,
        _caps: &DeviceCapabilityConfig,
        kernel: &KernelDef,
        _ir: &IrModule,
    ) -> Result<CompiledArtifact, CompileError> {
        self.codegen_calls.fetch_add(1, Ordering::SeqCst);
        Ok(test_artifact(config.arch, kernel.name()))
    }
}

struct FailingCompiler;

impl KernelCompiler for FailingCompiler {
    fn lower(&self, _config: &CompileConfig, _kernel: &KernelDef) -> Result<IrModule, CompileError> {
        Err(CompileError::new("unsupported reduction pattern"))
    }

    fn codegen(
        &self,
        _config: &CompileConfig,
        _caps: &DeviceCapabilityConfig,
        _kernel: &KernelDef,
        _ir: &IrModule,
    ) -> Result<CompiledArtifact, CompileError> {
        unreachable!("lowering already failed")
    }
}

fn test_artifact(arch: Arch, name: &str) -> CompiledArtifact {
    CompiledArtifact::new(
        arch,
        ArtifactPayload::Llvm(LlvmArtifact {
            module_text: format!("define void @{name}() {{ ret }}"),
            functions: vec![name.to_string()],
            entry_points: vec![EntryPoint {
                name: name.to_string(),
                grid_dim: 128,
                block_dim: 64,
            }],
        }),
    )
}

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

fn ast_kernel(name: &str, imm: i64) -> KernelDef {
    KernelDef::new(name, KernelIr::Ast(sample_ir(imm)))
}

fn manager(root: &Path, calls: &Arc<AtomicUsize>) -> KernelCacheManager {
    KernelCacheManager::new(ManagerConfig {
        offline_cache_path: root.to_path_buf(),
        compiler: Box::new(CountingCompiler {
            codegen_calls: Arc::clone(calls),
        }),
    })
}

fn kernels_dir(root: &Path) -> PathBuf {
    root.join(KERNEL_CACHE_SUBDIR)
}

fn serialized(artifact: &CompiledArtifact) -> Vec<u8> {
    let mut bytes = Vec::new();
    artifact.serialize(&mut bytes).unwrap();
    bytes
}

#[test]
fn second_identical_launch_hits_the_memory_tier() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut manager = manager(tmp.path(), &calls);
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    let first = manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    let second = manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    first.artifact.check().unwrap();
    second.artifact.check().unwrap();
    assert_eq!(serialized(&first.artifact), serialized(&second.artifact));
}

#[test]
fn artifacts_persist_across_manager_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    let mut first = manager(tmp.path(), &calls);
    let compiled_one = first
        .load_or_compile(&config, &caps, &ast_kernel("scale", 1))
        .unwrap();
    first.dump().unwrap();
    drop(first);

    let mut second = manager(tmp.path(), &calls);
    let hit_one = second
        .load_or_compile(&config, &caps, &ast_kernel("scale", 1))
        .unwrap();
    assert!(hit_one.cache_hit);
    assert_eq!(serialized(&hit_one.artifact), serialized(&compiled_one.artifact));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let compiled_two = second
        .load_or_compile(&config, &caps, &ast_kernel("offset", 2))
        .unwrap();
    assert!(!compiled_two.cache_hit);
    second.dump().unwrap();
    drop(second);

    let mut third = manager(tmp.path(), &calls);
    assert!(third
        .load_or_compile(&config, &caps, &ast_kernel("scale", 1))
        .unwrap()
        .cache_hit);
    assert!(third
        .load_or_compile(&config, &caps, &ast_kernel("offset", 2))
        .unwrap()
        .cache_hit);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn hits_survive_a_dump_within_one_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut manager = manager(tmp.path(), &calls);
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    manager.dump().unwrap();

    let after = manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    assert!(after.cache_hit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn store_totals_match_artifact_files_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut manager = manager(tmp.path(), &calls);
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    for (name, imm) in [("scale", 1), ("offset", 2), ("reduce_sum", 3)] {
        manager
            .load_or_compile(&config, &caps, &ast_kernel(name, imm))
            .unwrap();
    }
    manager.dump().unwrap();

    let dir = kernels_dir(tmp.path());
    let store = load_store(&dir.join(METADATA_FILENAME)).unwrap();
    assert_eq!(store.entries.len(), 3);

    let mut on_disk_total = 0_u64;
    for entry in std::fs::read_dir(&dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(KERNEL_ARTIFACT_EXT) {
            on_disk_total += entry.metadata().unwrap().len();
        }
    }
    assert_eq!(store.total_size_bytes, on_disk_total);
    for entry in store.entries.values() {
        assert!(entry.size_bytes > 0);
        let artifact_file = dir.join(format!("{}.{KERNEL_ARTIFACT_EXT}", entry.cache_key));
        assert_eq!(entry.size_bytes, artifact_file.metadata().unwrap().len());
    }
}

#[test]
fn disabled_offline_cache_never_touches_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut manager = manager(tmp.path(), &calls);
    let mut config = CompileConfig::default();
    config.offline_cache = false;
    let caps = DeviceCapabilityConfig::new();

    manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    manager.dump().unwrap();

    assert!(!kernels_dir(tmp.path()).join(METADATA_FILENAME).exists());
}

#[test]
fn pre_lowered_kernels_stay_memory_only() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    let mut first = manager(tmp.path(), &calls);
    let kernel = KernelDef::new("injected", KernelIr::Lowered(sample_ir(7)));
    let outcome = first.load_or_compile(&config, &caps, &kernel).unwrap();
    assert!(!outcome.cache_hit);
    // The memory tier still serves repeats within the run.
    assert!(first.load_or_compile(&config, &caps, &kernel).unwrap().cache_hit);
    first.dump().unwrap();
    drop(first);

    assert!(!kernels_dir(tmp.path()).join(METADATA_FILENAME).exists());

    // A fresh process has to recompile: the name-derived key was never
    // eligible for persistence.
    let mut second = manager(tmp.path(), &calls);
    let kernel = KernelDef::new("injected", KernelIr::Lowered(sample_ir(7)));
    assert!(!second.load_or_compile(&config, &caps, &kernel).unwrap().cache_hit);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn busy_lock_turns_dump_into_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut manager = manager(tmp.path(), &calls);
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();

    let dir = kernels_dir(tmp.path());
    std::fs::create_dir_all(&dir).unwrap();
    let marker = dir.join(METADATA_LOCK_FILENAME);
    std::fs::write(&marker, b"").unwrap();

    manager.dump().unwrap();
    assert!(!dir.join(METADATA_FILENAME).exists());

    // The memory tier was kept; the next flush persists it.
    std::fs::remove_file(&marker).unwrap();
    manager.dump().unwrap();
    assert!(dir.join(METADATA_FILENAME).exists());
    let store = load_store(&dir.join(METADATA_FILENAME)).unwrap();
    assert_eq!(store.entries.len(), 1);
}

#[test]
fn compiler_errors_propagate_and_are_never_retried_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = KernelCacheManager::new(ManagerConfig {
        offline_cache_path: tmp.path().to_path_buf(),
        compiler: Box::new(FailingCompiler),
    });
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    let err = manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap_err();
    assert!(matches!(err, CacheError::Compile(_)));

    // Identical inputs fail identically; nothing was cached.
    let err = manager
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap_err();
    assert!(matches!(err, CacheError::Compile(_)));
}

#[test]
fn corrupt_artifact_files_degrade_to_recompilation() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    let mut first = manager(tmp.path(), &calls);
    first
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    first.dump().unwrap();
    drop(first);

    let dir = kernels_dir(tmp.path());
    for entry in std::fs::read_dir(&dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) == Some(KERNEL_ARTIFACT_EXT) {
            std::fs::write(&path, b"\x00garbage").unwrap();
        }
    }

    let mut second = manager(tmp.path(), &calls);
    let outcome = second
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    assert!(!outcome.cache_hit);
    outcome.artifact.check().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn foreign_version_stores_are_never_served() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CompileConfig::default();
    let caps = DeviceCapabilityConfig::new();

    let mut first = manager(tmp.path(), &calls);
    first
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    first.dump().unwrap();
    drop(first);

    let metadata_path = kernels_dir(tmp.path()).join(METADATA_FILENAME);
    let mut store = load_store(&metadata_path).unwrap();
    store.version = (9, 9, 9);
    save_store(&store, &metadata_path).unwrap();

    let mut second = manager(tmp.path(), &calls);
    let outcome = second
        .load_or_compile(&config, &caps, &ast_kernel("scale", 7))
        .unwrap();
    assert!(!outcome.cache_hit);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn config_driven_clean_evicts_down_to_the_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut manager = manager(tmp.path(), &calls);
    let mut config = CompileConfig::default();
    config.offline_cache_max_size_bytes = 1;
    config.offline_cache_cleaning_factor = 1.0;
    let caps = DeviceCapabilityConfig::new();

    for (name, imm) in [("scale", 1), ("offset", 2)] {
        manager
            .load_or_compile(&config, &caps, &ast_kernel(name, imm))
            .unwrap();
    }
    manager.dump().unwrap();

    manager.clean_offline_cache_from_config(&config).unwrap();

    // Everything was evicted, so the store files are gone too.
    let dir = kernels_dir(tmp.path());
    assert!(!dir.join(METADATA_FILENAME).exists());
    let leftover = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.path().extension().and_then(|e| e.to_str()) == Some(KERNEL_ARTIFACT_EXT)
        })
        .count();
    assert_eq!(leftover, 0);
}

#[test]
fn fast_cache_round_trips_through_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CompileConfig::default();
    let checksum = "c0ffee5eed".to_string();

    let mut first = manager(tmp.path(), &calls);
    let kernel = ast_kernel("scale", 7);
    let artifact = test_artifact(config.arch, "scale");
    first.store_fast_cache(&checksum, &kernel, &config, &artifact);

    let loaded = first.load_fast_cache(&checksum, "scale", &config).unwrap();
    assert_eq!(serialized(&loaded), serialized(&artifact));

    first.dump().unwrap();
    drop(first);

    let mut second = manager(tmp.path(), &calls);
    let loaded = second.load_fast_cache(&checksum, "scale", &config).unwrap();
    assert_eq!(serialized(&loaded), serialized(&artifact));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
