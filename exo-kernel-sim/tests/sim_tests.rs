//! Behaviour of the simulated kernel that the paging policies depend on

use exo_api::{
    EnvStatus, Exofork, MemoryLayout, Mmu, PAGE_SIZE, PageTableView, PteFlags, SysError, Syscalls,
    Upcall, VirtAddr,
};
use exo_kernel_sim::{SimConfig, SimKernel};

const VA: VirtAddr = VirtAddr::new(0x0080_0000);

#[test]
fn test_exofork_creates_suspended_empty_child() {
    let kernel = SimKernel::default();
    let parent = kernel.spawn().unwrap();

    let Exofork::Parent(child) = kernel.exofork(parent).unwrap() else {
        panic!("simulator always returns to the parent");
    };
    assert_ne!(child, parent);
    assert_eq!(kernel.env_status(child), Some(EnvStatus::NotRunnable));
    assert_eq!(kernel.parent_of(child), Some(parent));
    assert_eq!(kernel.mapping_count(child), 0);
    assert_eq!(kernel.pgfault_upcall(child), None);
}

#[test]
fn test_cross_env_map_shares_frame() {
    let kernel = SimKernel::default();
    let parent = kernel.spawn().unwrap();
    let Exofork::Parent(child) = kernel.exofork(parent).unwrap() else {
        unreachable!()
    };

    kernel.page_alloc(parent, VA, PteFlags::PUW).unwrap();
    kernel.store(parent, VA, b"shared").unwrap();
    kernel.page_map(parent, VA, child, VA, PteFlags::PU_COW).unwrap();

    assert!(kernel.same_frame(parent, VA, child, VA));
    assert_eq!(kernel.frame_refs(parent, VA), 2);

    let mut buf = [0u8; 6];
    kernel.load(child, VA, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");
    assert!(kernel.store(child, VA, b"x").is_err());

    kernel.env_destroy(child).unwrap();
    assert_eq!(kernel.frame_refs(parent, VA), 1);
}

#[test]
fn test_frame_limit_reports_no_mem() {
    let kernel = SimKernel::new(SimConfig {
        max_frames: Some(2),
        ..SimConfig::default()
    });
    let env = kernel.spawn().unwrap();
    kernel.page_alloc(env, VA, PteFlags::PUW).unwrap();
    assert_eq!(
        kernel.page_alloc(env, VA.add(PAGE_SIZE), PteFlags::PUW),
        Err(SysError::NoMem)
    );

    kernel.set_frame_limit(None);
    kernel.page_alloc(env, VA.add(PAGE_SIZE), PteFlags::PUW).unwrap();
}

#[test]
fn test_spawn_rejects_overlapping_layout() {
    let kernel = SimKernel::new(SimConfig {
        layout: MemoryLayout::default().with_disk_window(0x1000_0000, 0xF000_0000),
        ..SimConfig::default()
    });
    assert_eq!(kernel.spawn(), Err(SysError::Inval));
    assert_eq!(kernel.frames_in_use(), 0);
}

#[test]
fn test_env_limit_reports_no_free_env() {
    let kernel = SimKernel::new(SimConfig {
        max_envs: 2,
        ..SimConfig::default()
    });
    let env = kernel.spawn().unwrap();
    kernel.exofork(env).unwrap();
    assert_eq!(kernel.exofork(env), Err(SysError::NoFreeEnv));
}

#[test]
fn test_status_and_upcall_updates() {
    let kernel = SimKernel::default();
    let env = kernel.spawn().unwrap();

    assert_eq!(kernel.env_set_status(env, EnvStatus::Free), Err(SysError::Inval));
    kernel.env_set_status(env, EnvStatus::NotRunnable).unwrap();
    assert_eq!(kernel.env_status(env), Some(EnvStatus::NotRunnable));

    let upcall = Upcall(VirtAddr::new(0x0080_0020));
    kernel.env_set_pgfault_upcall(env, upcall).unwrap();
    assert_eq!(kernel.pgfault_upcall(env), Some(upcall));

    kernel.env_destroy(env).unwrap();
    assert_eq!(kernel.env_set_pgfault_upcall(env, upcall), Err(SysError::BadEnv));
}

#[test]
fn test_accessed_bit_can_be_aged() {
    let kernel = SimKernel::default();
    let env = kernel.spawn().unwrap();
    kernel.page_alloc(env, VA, PteFlags::PUW).unwrap();

    kernel.load(env, VA, &mut [0u8; 1]).unwrap();
    assert!(kernel.pte(env, VA).is_accessed());
    kernel.clear_accessed(env, VA.add(12));
    assert!(!kernel.pte(env, VA).is_accessed());
}
