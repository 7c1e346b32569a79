//! Library constructor and destructor.
//!
//! The constructor runs before the target's `main`: it freezes the
//! configuration, opens the report output, builds the engine (with the
//! bypass flag forced while the gate is created, so its own allocation is
//! not self-recorded), arms the fault handler and the optional on-demand
//! signal, strips the preload variables so child processes start clean,
//! and finally enables recording. The destructor disables recording and
//! writes the teardown summary.

use heapusage_core::Config;

use crate::{api, engine, fault};

unsafe extern "C" fn hu_init() {
    let config = Config::from_env();
    let signo = config.signo;
    let engine = engine::init(config);

    if engine.config().guarded() {
        heapusage_guard::fault::install_fault_handler(fault::fault_handler);
    }

    if signo != 0 {
        // SAFETY: installing a plain handler for the configured signal.
        unsafe { libc::signal(signo, report_signal as libc::sighandler_t) };
    }

    // Children must start uninstrumented.
    // SAFETY: nul-terminated literals.
    unsafe {
        libc::unsetenv(c"LD_PRELOAD".as_ptr());
        libc::unsetenv(c"DYLD_INSERT_LIBRARIES".as_ptr());
    }

    engine.set_recording(true);
}

unsafe extern "C" fn hu_fini() {
    if let Some(engine) = engine::get() {
        engine.teardown();
    }
}

extern "C" fn report_signal(_signal: libc::c_int) {
    api::hu_report();
}

#[cfg(target_os = "linux")]
mod ctor {
    #[used]
    #[unsafe(link_section = ".init_array")]
    static HU_INIT: unsafe extern "C" fn() = super::hu_init;

    #[used]
    #[unsafe(link_section = ".fini_array")]
    static HU_FINI: unsafe extern "C" fn() = super::hu_fini;
}

#[cfg(target_os = "macos")]
mod ctor {
    #[used]
    #[unsafe(link_section = "__DATA,__mod_init_func")]
    static HU_INIT: unsafe extern "C" fn() = super::hu_init;

    #[used]
    #[unsafe(link_section = "__DATA,__mod_term_func")]
    static HU_FINI: unsafe extern "C" fn() = super::hu_fini;
}
