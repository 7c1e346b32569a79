//! Underlying allocator bindings.
//!
//! Inside the preload library a plain `malloc` call binds back to our own
//! exported wrapper, so the real allocator has to be named explicitly:
//! glibc exports the `__libc_*` family for exactly this purpose. On macOS
//! the dyld interpose mechanism rebinds every image except the interposer
//! itself, so the ordinary `libc` symbols already are the real thing.

use std::ffi::c_void;

use heapusage_guard::Underlying;

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn __libc_malloc(size: usize) -> *mut c_void;
    fn __libc_free(ptr: *mut c_void);
    fn __libc_calloc(nmemb: usize, size: usize) -> *mut c_void;
    fn __libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
}

#[cfg(target_os = "linux")]
pub unsafe fn malloc(size: usize) -> *mut c_void {
    // SAFETY: forwarded C malloc contract.
    unsafe { __libc_malloc(size) }
}

#[cfg(target_os = "linux")]
pub unsafe fn free(ptr: *mut c_void) {
    // SAFETY: forwarded C free contract.
    unsafe { __libc_free(ptr) }
}

#[cfg(target_os = "linux")]
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: forwarded C calloc contract.
    unsafe { __libc_calloc(nmemb, size) }
}

#[cfg(target_os = "linux")]
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: forwarded C realloc contract.
    unsafe { __libc_realloc(ptr, size) }
}

/// Underlying entry points for the fenced allocator.
#[cfg(target_os = "linux")]
#[must_use]
pub fn underlying() -> Underlying {
    Underlying {
        malloc: __libc_malloc,
        free: __libc_free,
    }
}

#[cfg(target_os = "macos")]
pub unsafe fn malloc(size: usize) -> *mut c_void {
    // SAFETY: forwarded C malloc contract.
    unsafe { libc::malloc(size) }
}

#[cfg(target_os = "macos")]
pub unsafe fn free(ptr: *mut c_void) {
    // SAFETY: forwarded C free contract.
    unsafe { libc::free(ptr) }
}

#[cfg(target_os = "macos")]
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: forwarded C calloc contract.
    unsafe { libc::calloc(nmemb, size) }
}

#[cfg(target_os = "macos")]
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: forwarded C realloc contract.
    unsafe { libc::realloc(ptr, size) }
}

#[cfg(target_os = "macos")]
pub unsafe fn valloc(size: usize) -> *mut c_void {
    // SAFETY: forwarded C valloc contract.
    unsafe { libc::valloc(size) }
}

#[cfg(target_os = "macos")]
pub unsafe fn malloc_size(ptr: *const c_void) -> usize {
    // SAFETY: forwarded malloc_size contract.
    unsafe { libc::malloc_size(ptr) }
}

#[cfg(target_os = "macos")]
#[must_use]
pub fn underlying() -> Underlying {
    Underlying {
        malloc: libc::malloc,
        free: libc::free,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underlying_round_trip() {
        // SAFETY: plain allocator usage.
        unsafe {
            let ptr = malloc(64);
            assert!(!ptr.is_null());
            std::ptr::write_bytes(ptr.cast::<u8>(), 0x11, 64);
            let grown = realloc(ptr, 128);
            assert!(!grown.is_null());
            free(grown);

            let zeroed = calloc(4, 16);
            assert!(!zeroed.is_null());
            let bytes = std::slice::from_raw_parts(zeroed.cast::<u8>(), 64);
            assert!(bytes.iter().all(|&b| b == 0));
            free(zeroed);
        }
    }
}
