//! fork/sfork isolation and sharing against the simulated kernel

use std::sync::Arc;

use exo_kernel_sim::{SimConfig, SimKernel};
use exo_memory_management::{
    CowFaultHandler, Env, EnvId, EnvStatus, Error, Forked, MemoryLayout, PAGE_SIZE, PteFlags, SysError,
    Syscalls, VirtAddr, duppage, fork, sfork,
};
use proptest::prelude::*;

const DATA: VirtAddr = VirtAddr::new(0x0080_0000);

fn parent_with(kernel: SimKernel, pages: usize) -> Env<SimKernel> {
    let kernel = Arc::new(kernel);
    let id = kernel.spawn().unwrap();
    let env = Env::new(kernel, id, MemoryLayout::default());
    for i in 0..pages {
        let va = DATA.add(i * PAGE_SIZE);
        env.kernel().page_alloc(id, va, PteFlags::PUW).unwrap();
        env.write_u32(va, 0x100 + i as u32).unwrap();
    }
    env
}

fn fork_parent(env: &mut Env<SimKernel>) -> Env<SimKernel> {
    match fork(env).unwrap() {
        Forked::Parent(child) => env.inherit(child),
        Forked::Child => panic!("simulated exofork returns to the parent"),
    }
}

fn sfork_parent(env: &mut Env<SimKernel>) -> Env<SimKernel> {
    match sfork(env).unwrap() {
        Forked::Parent(child) => env.inherit(child),
        Forked::Child => panic!("simulated exofork returns to the parent"),
    }
}

#[test]
fn test_fork_shares_writable_pages_copy_on_write() {
    let mut parent = parent_with(SimKernel::default(), 2);
    let child = fork_parent(&mut parent);
    let kernel = Arc::clone(parent.kernel());

    for va in [DATA, DATA.add(PAGE_SIZE), parent.layout().user_stack()] {
        assert_eq!(parent.pte(va), PteFlags::PU_COW);
        assert_eq!(child.pte(va), PteFlags::PU_COW);
        assert!(kernel.same_frame(parent.id(), va, child.id(), va));
    }

    assert_eq!(kernel.env_status(child.id()), Some(EnvStatus::Runnable));
    assert_eq!(kernel.pgfault_upcall(child.id()), Some(child.layout().upcall()));
    let xstack = parent.layout().exception_stack();
    assert_eq!(child.pte(xstack), PteFlags::PUW);
    assert!(!kernel.same_frame(parent.id(), xstack, child.id(), xstack));
}

#[test]
fn test_parent_write_after_fork_is_private() {
    let mut parent = parent_with(SimKernel::default(), 1);
    let child = fork_parent(&mut parent);

    parent.write_u32(DATA, 0xAAAA).unwrap();
    assert_eq!(child.read_u32(DATA).unwrap(), 0x100);
    assert_eq!(parent.read_u32(DATA).unwrap(), 0xAAAA);

    let kernel = parent.kernel();
    assert_eq!(parent.pte(DATA) & PteFlags::SYSCALL, PteFlags::PUW);
    assert!(!kernel.same_frame(parent.id(), DATA, child.id(), DATA));
    assert_eq!(kernel.frame_refs(child.id(), DATA), 1);
    assert!(!parent.is_mapped(parent.layout().pftemp()));
}

#[test]
fn test_child_write_after_fork_is_private() {
    let mut parent = parent_with(SimKernel::default(), 1);
    let child = fork_parent(&mut parent);

    child.write_u32(DATA.add(8), 0xBBBB).unwrap();
    assert_eq!(parent.read_u32(DATA.add(8)).unwrap(), 0);
    assert_eq!(child.read_u32(DATA).unwrap(), 0x100);
}

#[test]
fn test_read_only_pages_are_shared_verbatim() {
    let mut parent = parent_with(SimKernel::default(), 0);
    let id = parent.id();
    parent.kernel().page_alloc(id, DATA, PteFlags::PU).unwrap();
    let child = fork_parent(&mut parent);

    assert_eq!(parent.pte(DATA) & PteFlags::SYSCALL, PteFlags::PU);
    assert_eq!(child.pte(DATA) & PteFlags::SYSCALL, PteFlags::PU);
    assert!(parent.kernel().same_frame(id, DATA, child.id(), DATA));
}

#[test]
fn test_grandchild_sees_pre_fork_content() {
    let mut parent = parent_with(SimKernel::default(), 1);
    let mut child = fork_parent(&mut parent);
    child.write_u32(DATA, 0x200).unwrap();
    let grandchild = fork_parent(&mut child);

    parent.write_u32(DATA, 0x300).unwrap();
    child.write_u32(DATA, 0x400).unwrap();
    assert_eq!(grandchild.read_u32(DATA).unwrap(), 0x200);
    assert_eq!(parent.read_u32(DATA).unwrap(), 0x300);
}

#[test]
fn test_sfork_shares_memory_but_not_stack() {
    let mut parent = parent_with(SimKernel::default(), 1);
    let child = sfork_parent(&mut parent);
    let stack = parent.layout().user_stack();
    let kernel = Arc::clone(parent.kernel());

    assert_eq!(kernel.env_status(child.id()), Some(EnvStatus::Runnable));
    assert_eq!(kernel.pgfault_upcall(child.id()), Some(child.layout().upcall()));
    let xstack = parent.layout().exception_stack();
    assert_eq!(child.pte(xstack), PteFlags::PUW);
    assert!(!kernel.same_frame(parent.id(), xstack, child.id(), xstack));

    assert!(kernel.same_frame(parent.id(), DATA, child.id(), DATA));
    assert_eq!(parent.pte(stack), PteFlags::PU_COW);
    assert_eq!(child.pte(stack), PteFlags::PU_COW);

    assert_eq!(child.pte(DATA) & PteFlags::SYSCALL, PteFlags::PUW);
    child.write_u32(DATA, 0xCAFE).unwrap();
    assert_eq!(parent.read_u32(DATA).unwrap(), 0xCAFE);
    parent.write_u32(DATA.add(4), 0xF00D).unwrap();
    assert_eq!(child.read_u32(DATA.add(4)).unwrap(), 0xF00D);

    parent.write_u32(stack, 1).unwrap();
    child.write_u32(stack, 2).unwrap();
    assert_eq!(parent.read_u32(stack).unwrap(), 1);
    assert_eq!(child.read_u32(stack).unwrap(), 2);
}

#[test]
fn test_duppage_of_absent_page_is_noop() {
    let mut parent = parent_with(SimKernel::default(), 0);
    let child = fork_parent(&mut parent);
    let before = parent.kernel().mapping_count(child.id());

    let pn = DATA.add(16 * PAGE_SIZE).page_number();
    assert_eq!(duppage(&parent, child.id(), pn), Ok(()));
    assert_eq!(parent.kernel().mapping_count(child.id()), before);
}

#[test]
fn test_read_fault_under_cow_handler_is_fatal() {
    let mut parent = parent_with(SimKernel::default(), 0);
    let _child = fork_parent(&mut parent);

    let err = parent.read(DATA, &mut [0u8; 4]).unwrap_err();
    assert!(matches!(err.root_cause(), Error::NotWriteFault { .. }));
    assert!(!parent.is_alive());
}

#[test]
fn test_write_to_plain_read_only_page_is_fatal() {
    let parent = parent_with(SimKernel::default(), 0);
    parent.set_pgfault_handler(Arc::new(CowFaultHandler)).unwrap();
    parent
        .kernel()
        .page_alloc(parent.id(), DATA, PteFlags::PU)
        .unwrap();

    let err = parent.write(DATA, &[1]).unwrap_err();
    assert_eq!(err.root_cause(), &Error::NotCopyOnWrite(DATA));
}

#[test]
fn test_exofork_exhaustion_leaves_parent_running() {
    let mut parent = parent_with(
        SimKernel::new(SimConfig {
            max_envs: 1,
            ..SimConfig::default()
        }),
        1,
    );
    assert_eq!(
        fork(&mut parent),
        Err(Error::Syscall { op: "sys_exofork", err: SysError::NoFreeEnv })
    );
    assert!(parent.is_alive());
    parent.write_u32(DATA, 7).unwrap();
}

#[test]
fn test_failed_fork_destroys_child_and_parent() {
    let mut parent = parent_with(SimKernel::default(), 2);
    parent.set_pgfault_handler(Arc::new(CowFaultHandler)).unwrap();
    let kernel = Arc::clone(parent.kernel());
    kernel.set_frame_limit(Some(kernel.frames_in_use()));

    let err = fork(&mut parent).unwrap_err();
    assert_eq!(
        err.root_cause(),
        &Error::Syscall { op: "sys_page_alloc", err: SysError::NoMem }
    );
    assert_eq!(kernel.env_status(parent.id()), Some(EnvStatus::Free));
    let child = EnvId(parent.id().0 + 1);
    assert_eq!(kernel.parent_of(child), Some(parent.id()));
    assert_eq!(kernel.env_status(child), Some(EnvStatus::Free));
    assert_eq!(kernel.frames_in_use(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_fork_isolates_writes(
        writes in proptest::collection::vec((any::<bool>(), 0usize..4, any::<u32>()), 1..24)
    ) {
        let mut parent = parent_with(SimKernel::default(), 4);
        let child = fork_parent(&mut parent);
        let mut model = [[0x100u32, 0x101, 0x102, 0x103]; 2];

        for (in_child, page, value) in writes {
            let (env, side) = if in_child { (&child, 1) } else { (&parent, 0) };
            env.write_u32(DATA.add(page * PAGE_SIZE), value).unwrap();
            model[side][page] = value;

            for page in 0..4 {
                let va = DATA.add(page * PAGE_SIZE);
                prop_assert_eq!(parent.read_u32(va).unwrap(), model[0][page]);
                prop_assert_eq!(child.read_u32(va).unwrap(), model[1][page]);
            }
        }
    }
}
