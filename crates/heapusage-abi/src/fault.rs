//! Fault-handler body.
//!
//! Installed (by init, through `heapusage_guard::fault`) only when the
//! fenced allocator is active. On an access-permission fault the handler
//! diagnoses the faulting address against live and quarantined metadata,
//! appends the diagnostic to the report, and terminates the process.
//! File I/O and backtracing are deliberate here: `bypass` is set first,
//! and the process does not survive the handler.

use std::ffi::c_void;

use heapusage_core::filter::{EventClass, is_interesting};

use crate::{engine, symbolize};

/// SIGSEGV/SIGBUS handler. Never returns after a diagnosed fault.
///
/// # Safety
///
/// Signal-handler contract: `info` is the kernel-provided siginfo.
pub unsafe extern "C" fn fault_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut c_void,
) {
    // Nested allocator use (symbolization, file I/O) must be invisible.
    engine::set_bypass(true);

    let Some(engine) = engine::get() else {
        engine::set_bypass(false);
        return;
    };
    if info.is_null() {
        engine::set_bypass(false);
        return;
    }
    // SAFETY: the kernel hands a valid siginfo to SA_SIGINFO handlers.
    let info = unsafe { &*info };
    if !heapusage_guard::fault::is_access_violation(signal, info) {
        engine::set_bypass(false);
        return;
    }

    #[cfg(target_os = "linux")]
    // SAFETY: si_addr is valid for SEGV_ACCERR faults.
    let addr = unsafe { info.si_addr() } as usize;
    #[cfg(target_os = "macos")]
    let addr = info.si_addr as usize;

    // SAFETY: the process is terminating; the unsynchronized walk cannot
    // race a resumed backtrace.
    let stack = unsafe { symbolize::capture_stack_unsynchronized() };
    if !is_interesting(&stack, EventClass::Fault, engine.resolver()) {
        engine::set_bypass(false);
        return;
    }

    engine.report_invalid_access(addr, &stack);

    // SAFETY: terminate with failure status; no resumption is attempted.
    unsafe { libc::_exit(1) };
}
