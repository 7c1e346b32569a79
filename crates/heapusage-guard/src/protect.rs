//! Page-protection shell around `mprotect`.
//!
//! Every guarded allocation and quarantine transition is a protection
//! change, and Linux accounts each split mapping against
//! `vm.max_map_count`. The shell keeps a cumulative change counter so a
//! failing `mprotect` near that ceiling produces actionable operator
//! instructions instead of a silently degraded detector.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

static PROTECT_CALLS: AtomicU64 = AtomicU64::new(0);

/// System page size.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// Total physical memory in bytes, best effort.
#[must_use]
pub fn physical_memory() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages > 0 {
        pages as usize * page_size()
    } else {
        0
    }
}

/// Mark `[addr, addr + len)` no-access.
///
/// # Safety
///
/// `addr` must be page-aligned and the range must belong to a single
/// mapping owned by the caller.
pub unsafe fn protect_none(addr: usize, len: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { protect(addr, len, libc::PROT_NONE) };
}

/// Restore read/write access to `[addr, addr + len)`.
///
/// # Safety
///
/// Same contract as [`protect_none`].
pub unsafe fn protect_rw(addr: usize, len: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { protect(addr, len, libc::PROT_READ | libc::PROT_WRITE) };
}

unsafe fn protect(addr: usize, len: usize, prot: libc::c_int) {
    let count = PROTECT_CALLS.fetch_add(1, Ordering::Relaxed) + 1;

    // SAFETY: caller guarantees a page-aligned range within one owned mapping.
    let rv = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
    if rv != 0 {
        eprintln!(
            "heapusage error: mprotect(0x{addr:x}, {len}, {prot}) failed: {}",
            io::Error::last_os_error()
        );
        check_map_budget(count);
    }
}

/// Convert the kernel's silent mapping ceiling into a loud one: once more
/// than half of `vm.max_map_count` has gone to protection changes, tell
/// the operator how to raise it and terminate.
#[cfg(target_os = "linux")]
fn check_map_budget(count: u64) {
    use std::sync::OnceLock;

    static MAX_MAP_COUNT: OnceLock<u64> = OnceLock::new();
    let max = *MAX_MAP_COUNT.get_or_init(|| {
        std::fs::read_to_string("/proc/sys/vm/max_map_count")
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    });

    if max != 0 && count > max / 2 {
        eprintln!("max_map_count={max} mprotect_count={count}, try increasing max_map_count, ex:");
        eprintln!("sudo sh -c \"echo {} > /proc/sys/vm/max_map_count\"", 2 * max);
        std::process::exit(1);
    }
}

#[cfg(not(target_os = "linux"))]
fn check_map_budget(_count: u64) {}
