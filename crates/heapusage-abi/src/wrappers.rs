//! Allocator wrappers.
//!
//! Two interception variants feed the same engine. On Linux the exported
//! symbols shadow glibc's and delegate to the `__libc_*` family; on macOS
//! `*_wrap` functions are bound through `__DATA,__interpose` records and
//! the plain symbols remain the real allocator.
//!
//! Gating protocol, in order, for every intercepted call:
//! 1. `bypass` set, or engine not yet initialized: underlying operation,
//!    no event.
//! 2. Acquire the reentrant gate, bump the call depth.
//! 3. Depth above one means self-reentry: underlying operation, no event.
//! 4. Dispatch (fenced when guarded mode is on and the operation is
//!    eligible), then emit a single event per logical operation.

#[cfg(target_os = "linux")]
pub use linux::*;
#[cfg(target_os = "macos")]
pub use macos::*;

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::c_void;

    use crate::{engine, sys};

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::malloc(size) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.malloc(size) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::malloc(size) },
        }
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::free(ptr) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.free(ptr) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::free(ptr) },
        }
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::calloc(nmemb, size) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.calloc(nmemb, size) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::calloc(nmemb, size) },
        }
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::realloc(ptr, size) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.realloc(ptr, size) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::realloc(ptr, size) },
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::ffi::c_void;

    use crate::{engine, sys};

    type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
    type FreeFn = unsafe extern "C" fn(*mut c_void);
    type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
    type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
    type MallocSizeFn = unsafe extern "C" fn(*const c_void) -> usize;

    /// dyld interposition record: dyld rebinds `orig` to `new` in every
    /// image except this one.
    #[repr(C)]
    struct Interpose<T> {
        new: T,
        orig: T,
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc_wrap(size: usize) -> *mut c_void {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::malloc(size) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.malloc(size) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::malloc(size) },
        }
    }

    #[used]
    #[unsafe(link_section = "__DATA,__interpose")]
    static INTERPOSE_MALLOC: Interpose<MallocFn> = Interpose {
        new: malloc_wrap,
        orig: libc::malloc,
    };

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn free_wrap(ptr: *mut c_void) {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::free(ptr) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.free(ptr) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::free(ptr) },
        }
    }

    #[used]
    #[unsafe(link_section = "__DATA,__interpose")]
    static INTERPOSE_FREE: Interpose<FreeFn> = Interpose {
        new: free_wrap,
        orig: libc::free,
    };

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn calloc_wrap(nmemb: usize, size: usize) -> *mut c_void {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::calloc(nmemb, size) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.calloc(nmemb, size) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::calloc(nmemb, size) },
        }
    }

    #[used]
    #[unsafe(link_section = "__DATA,__interpose")]
    static INTERPOSE_CALLOC: Interpose<CallocFn> = Interpose {
        new: calloc_wrap,
        orig: libc::calloc,
    };

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn realloc_wrap(ptr: *mut c_void, size: usize) -> *mut c_void {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::realloc(ptr, size) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.realloc(ptr, size) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::realloc(ptr, size) },
        }
    }

    #[used]
    #[unsafe(link_section = "__DATA,__interpose")]
    static INTERPOSE_REALLOC: Interpose<ReallocFn> = Interpose {
        new: realloc_wrap,
        orig: libc::realloc,
    };

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn valloc_wrap(size: usize) -> *mut c_void {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::valloc(size) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body.
            Some(engine) => unsafe { engine.valloc(size) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::valloc(size) },
        }
    }

    #[used]
    #[unsafe(link_section = "__DATA,__interpose")]
    static INTERPOSE_VALLOC: Interpose<MallocFn> = Interpose {
        new: valloc_wrap,
        orig: libc::valloc,
    };

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc_size_wrap(ptr: *const c_void) -> usize {
        if engine::bypass() {
            // SAFETY: passthrough while instrumentation is off.
            return unsafe { sys::malloc_size(ptr) };
        }
        match engine::get() {
            // SAFETY: gated wrapper body, no event.
            Some(engine) => unsafe { engine.malloc_size(ptr) },
            // SAFETY: engine not yet initialized.
            None => unsafe { sys::malloc_size(ptr) },
        }
    }

    #[used]
    #[unsafe(link_section = "__DATA,__interpose")]
    static INTERPOSE_MALLOC_SIZE: Interpose<MallocSizeFn> = Interpose {
        new: malloc_size_wrap,
        orig: libc::malloc_size,
    };
}
