//! Fault-handler installation.
//!
//! The guarded allocator turns overflow and use-after-free accesses into
//! protection faults: SIGSEGV on Linux, SIGBUS on macOS. The handler body
//! lives in the boundary layer (it needs the engine to diagnose the
//! address); this module only owns the `sigaction` plumbing and the
//! access-violation sub-code predicate.

/// `SA_SIGINFO`-style handler signature.
pub type FaultHandler =
    unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

#[cfg(target_os = "linux")]
const FAULT_SIGNAL: libc::c_int = libc::SIGSEGV;
#[cfg(target_os = "macos")]
const FAULT_SIGNAL: libc::c_int = libc::SIGBUS;

/// `si_code` value for "invalid permissions for mapped object" on SIGSEGV.
/// Not exported by the `libc` crate for Linux targets; value is fixed by
/// the platform ABI (see `bits/siginfo-consts.h`).
#[cfg(target_os = "linux")]
const SEGV_ACCERR: libc::c_int = 2;

/// Install `handler` for the platform's protection-fault signal.
///
/// Only called when guarded mode is enabled; a run without guard pages
/// must leave the target program's own fault handling untouched.
pub fn install_fault_handler(handler: FaultHandler) {
    // SAFETY: sigaction with a zeroed mask and a valid handler pointer.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = handler as usize;
        libc::sigaction(FAULT_SIGNAL, &action, std::ptr::null_mut());
    }
}

/// True when the fault's sub-code means "access permission violation",
/// i.e. one of our protected pages rather than an unmapped address.
#[must_use]
pub fn is_access_violation(signal: libc::c_int, info: &libc::siginfo_t) -> bool {
    if signal != FAULT_SIGNAL {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        info.si_code == SEGV_ACCERR
    }
    #[cfg(target_os = "macos")]
    {
        info.si_code == libc::BUS_ADRERR
    }
}
