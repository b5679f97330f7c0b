//! SEGV Handling Infrastructure
//!
//! Guarded pages fault when touched; the handler installed here runs on a
//! dedicated alternate stack, records the faulting address, and redirects the
//! interrupted context to [`rollback_entry`] by rewriting the saved
//! instruction pointer. Everything heavier than that (restoring memory,
//! arming watchpoints) happens in `rollback_entry`, which executes as
//! ordinary code on the faulting thread, guarded by a mutex that is disjoint
//! from the rendezvous mutex: an allocator caller may hold the rendezvous
//! mutex at the instant the fault arrives.
//!
//! The handler body itself is async-signal-safe: it only stores an atomic
//! and mutates the saved register frame.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::log;

/// Size of the alternate signal stack.
const SIGNAL_STACK_SIZE: usize = 64 * 1024;

/// Whether the SEGV handler has been installed.
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Address of the most recent fault, 0 if none.
static FAULT_ADDRESS: AtomicUsize = AtomicUsize::new(0);

/// Continuation invoked after a fault-driven rollback (a supervisor's
/// re-execution entry). Stored as a raw fn address; 0 if unset.
static ROLLBACK_CONTINUATION: AtomicUsize = AtomicUsize::new(0);

/// Mutex serializing fault-driven rollback. Deliberately distinct from the
/// rendezvous mutex, which the interrupted thread may already hold.
static HANDLER_MUTEX: Mutex<()> = Mutex::new(());

/// Acquire the handler mutex.
pub fn handler_lock() -> MutexGuard<'static, ()> {
    HANDLER_MUTEX.lock()
}

/// Address of the most recent SEGV, if any fault has occurred.
pub fn last_fault_address() -> Option<usize> {
    match FAULT_ADDRESS.load(Ordering::Acquire) {
        0 => None,
        addr => Some(addr),
    }
}

/// Register the continuation run after a fault-driven rollback. It must not
/// return; it is expected to transfer control back into the re-executed
/// epoch.
pub fn set_rollback_continuation(f: extern "C" fn()) {
    ROLLBACK_CONTINUATION.store(f as usize, Ordering::Release);
}

/// The landing point the handler redirects faulting threads to. Runs as
/// normal code on the faulting thread's stack frame.
pub extern "C" fn rollback_entry() {
    let _guard = handler_lock();
    let addr = FAULT_ADDRESS.load(Ordering::Acquire);
    log::entry(log::LogLevel::Error, "segmentation fault, rolling back epoch")
        .field_addr("addr", addr)
        .emit();

    if let Some(runtime) = crate::global() {
        runtime.segv_rollback();
    }

    let continuation = ROLLBACK_CONTINUATION.load(Ordering::Acquire);
    if continuation != 0 {
        // Safety: the address was stored from an `extern "C" fn()` in
        // set_rollback_continuation.
        let f: extern "C" fn() = unsafe { std::mem::transmute(continuation) };
        f();
    }
    // Without a continuation there is nothing to resume into.
    log::error("no rollback continuation registered, aborting");
    std::process::abort();
}

/// Install the SEGV handler on an alternate stack. Returns false if it was
/// already installed.
#[cfg(target_os = "linux")]
pub fn install_segv_handler() -> bool {
    use nix::libc;
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    // The handler must not run on the faulted thread's (possibly smashed)
    // stack.
    let stack = Box::leak(vec![0u8; SIGNAL_STACK_SIZE].into_boxed_slice());
    let alt = libc::stack_t {
        ss_sp: stack.as_mut_ptr() as *mut libc::c_void,
        ss_flags: 0,
        ss_size: SIGNAL_STACK_SIZE,
    };
    // Safety: the stack buffer is leaked and stays valid for the process
    // lifetime.
    unsafe {
        libc::sigaltstack(&alt, std::ptr::null_mut());
    }

    let action = SigAction::new(
        SigHandler::SigAction(segv_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK | SaFlags::SA_RESTART | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    // Safety: segv_handler is async-signal-safe per the module contract.
    match unsafe { signal::sigaction(Signal::SIGSEGV, &action) } {
        Ok(_) => {
            log::debug("SEGV handler installed");
            true
        }
        Err(err) => {
            log::error(format!("failed to install SEGV handler: {}", err));
            HANDLER_INSTALLED.store(false, Ordering::SeqCst);
            false
        }
    }
}

/// Stub for platforms without the context-redirect machinery.
#[cfg(not(target_os = "linux"))]
pub fn install_segv_handler() -> bool {
    false
}

/// The raw SEGV handler: record the address, redirect the saved context.
#[cfg(target_os = "linux")]
extern "C" fn segv_handler(
    _signum: nix::libc::c_int,
    info: *mut nix::libc::siginfo_t,
    context: *mut nix::libc::c_void,
) {
    // Safety: the kernel hands a valid siginfo and ucontext to SA_SIGINFO
    // handlers.
    unsafe {
        let addr = (*info).si_addr() as usize;
        FAULT_ADDRESS.store(addr, Ordering::Release);
        redirect_context(
            context as *mut nix::libc::ucontext_t,
            rollback_entry as usize,
        );
    }
}

/// Rewrite the saved instruction pointer of an interrupted context so that
/// returning from the handler resumes at `target` instead of the faulting
/// instruction. This is the single point where the non-local transfer out of
/// a fault happens.
///
/// # Safety
///
/// `context` must be the `ucontext_t` passed to a signal handler for the
/// current thread; `target` must be the address of an `extern "C" fn()`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn redirect_context(context: *mut nix::libc::ucontext_t, target: usize) {
    use nix::libc;
    (*context).uc_mcontext.gregs[libc::REG_RIP as usize] = target as libc::greg_t;
}

/// Rewrite the saved instruction pointer of an interrupted context.
///
/// # Safety
///
/// Same contract as the x86_64 variant.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn redirect_context(context: *mut nix::libc::ucontext_t, target: usize) {
    (*context).uc_mcontext.pc = target as nix::libc::c_ulonglong;
}

/// Fallback: no context rewrite available; the fault stays fatal.
#[cfg(all(target_os = "linux", not(any(target_arch = "x86_64", target_arch = "aarch64"))))]
unsafe fn redirect_context(_context: *mut nix::libc::ucontext_t, _target: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_fault_recorded_initially() {
        // The fault slot starts empty in a process that has not faulted.
        // (Other tests never trigger SEGV, so this stays stable.)
        assert_eq!(last_fault_address(), None);
    }

    #[test]
    fn test_handler_lock_is_reacquirable() {
        {
            let _guard = handler_lock();
        }
        let _guard = handler_lock();
    }

    extern "C" fn noop_continuation() {}

    #[test]
    fn test_continuation_registration() {
        set_rollback_continuation(noop_continuation);
        assert_eq!(
            ROLLBACK_CONTINUATION.load(Ordering::Acquire),
            noop_continuation as usize
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_install_is_idempotent() {
        let first = install_segv_handler();
        let second = install_segv_handler();
        // Whichever test installed it first, the second call declines.
        let _ = first;
        assert!(!second);
    }
}
