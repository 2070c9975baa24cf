//! Copy-on-write fork
//!
//! `fork` gives the child a view of every page below the exception stack.
//! Writable pages are shared read-only with the COW bit set on both sides and
//! privatized by [`CowFaultHandler`] on the first write. `sfork` shares memory
//! outright and only gives the user stack copy-on-write treatment.

use alloc::sync::Arc;
use alloc::vec;

use exo_api::{
    Access, EnvId, EnvStatus, Error, Exofork, Kernel, PAGE_SIZE, PteFlags, Result, SysResult,
    SyscallContext, VirtAddr,
};

use crate::env::{Env, PgfaultHandler, UTrapframe};

/// Which side of a fork the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// In the parent; carries the new child
    Parent(EnvId),
    /// In the child
    Child,
}

/// Privatizes copy-on-write pages on write faults
#[derive(Debug, Default, Clone, Copy)]
pub struct CowFaultHandler;

impl<K: Kernel> PgfaultHandler<K> for CowFaultHandler {
    fn handle(&self, env: &Env<K>, utf: &UTrapframe) -> Result<()> {
        let addr = utf.fault_va.page_round_down();
        if utf.err.access() != Access::Write {
            return Err(Error::NotWriteFault {
                va: utf.fault_va,
                err: utf.err,
            });
        }
        let pte = env.pte(addr);
        if !pte.is_present() || !pte.is_cow() {
            return Err(Error::NotCopyOnWrite(utf.fault_va));
        }

        let (kernel, id) = (env.kernel(), env.id());
        let tmp = env.layout().pftemp();
        kernel
            .page_alloc(id, tmp, PteFlags::PUW)
            .context("sys_page_alloc")?;
        let mut page = vec![0u8; PAGE_SIZE];
        env.read(addr, &mut page)?;
        env.write(tmp, &page)?;
        kernel
            .page_map(id, tmp, id, addr, PteFlags::PUW)
            .context("sys_page_map")?;
        kernel.page_unmap(id, tmp).context("sys_page_unmap")?;
        mm_trace!("[{}] privatized {}", id, addr);
        Ok(())
    }
}

/// Give `child` a view of page `pn` of `env`.
///
/// Writable and copy-on-write pages become copy-on-write in both address
/// spaces (child first, so the parent's frame is never left writable while
/// shared). Read-only pages are shared as they are. Absent pages are skipped.
pub fn duppage<K: Kernel>(env: &Env<K>, child: EnvId, pn: usize) -> SysResult<()> {
    let va = VirtAddr::from_page_number(pn);
    let pte = env.pte(va);
    if !pte.is_present() {
        return Ok(());
    }
    let (kernel, id) = (env.kernel(), env.id());
    if pte.is_writable() || pte.is_cow() {
        kernel.page_map(id, va, child, va, PteFlags::PU_COW)?;
        kernel.page_map(id, va, id, va, PteFlags::PU_COW)?;
    } else {
        kernel.page_map(id, va, child, va, PteFlags::PU)?;
    }
    Ok(())
}

/// Duplicate the address space copy-on-write.
///
/// Running out of environments or memory in `exofork` is reported without
/// terminating the caller. Any later failure destroys the half-built child
/// and terminates the caller.
pub fn fork<K: Kernel>(env: &mut Env<K>) -> Result<Forked> {
    duplicate(env, Sharing::CopyOnWrite)
}

/// Duplicate the address space sharing memory, except for the stacks.
pub fn sfork<K: Kernel>(env: &mut Env<K>) -> Result<Forked> {
    duplicate(env, Sharing::Memory)
}

#[derive(Clone, Copy)]
enum Sharing {
    CopyOnWrite,
    Memory,
}

fn duplicate<K: Kernel>(env: &mut Env<K>, sharing: Sharing) -> Result<Forked> {
    env.set_pgfault_handler(Arc::new(CowFaultHandler))?;

    let child = match env.kernel().exofork(env.id()) {
        Ok(Exofork::Child(me)) => {
            env.id = me;
            return Ok(Forked::Child);
        }
        Ok(Exofork::Parent(child)) => child,
        Err(err) if err.is_exhaustion() => {
            mm_warn!("[{}] sys_exofork: {}", env.id(), err);
            return Err(Error::Syscall { op: "sys_exofork", err });
        }
        Err(err) => return Err(env.terminate(Error::Syscall { op: "sys_exofork", err })),
    };

    if let Err(err) = populate(env, child, sharing) {
        if let Err(_destroy) = env.kernel().env_destroy(child) {
            mm_warn!("[{}] destroying child {}: {}", env.id(), child, _destroy);
        }
        return Err(env.terminate(err));
    }
    mm_debug!("[{}] forked child {}", env.id(), child);
    Ok(Forked::Parent(child))
}

fn populate<K: Kernel>(env: &Env<K>, child: EnvId, sharing: Sharing) -> Result<()> {
    let layout = env.layout();
    let (kernel, id) = (env.kernel(), env.id());
    let xstack = layout.exception_stack();
    let ustack = layout.user_stack();

    for (va, pte) in env.present_pages(VirtAddr::new(0)..xstack) {
        match sharing {
            Sharing::Memory if va != ustack => kernel
                .page_map(id, va, child, va, pte.syscall_perm())
                .context("sys_page_map")?,
            _ => duppage(env, child, va.page_number()).context("duppage")?,
        }
    }

    kernel
        .page_alloc(child, xstack, PteFlags::PUW)
        .context("sys_page_alloc")?;
    kernel
        .env_set_pgfault_upcall(child, layout.upcall())
        .context("sys_env_set_pgfault_upcall")?;
    kernel
        .env_set_status(child, EnvStatus::Runnable)
        .context("sys_env_set_status")
}
