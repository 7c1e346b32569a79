//! The fenced allocator.
//!
//! Eligible allocations come from `posix_memalign` at page alignment,
//! sized up to whole pages plus (with overflow detection) one trailing
//! fence page marked no-access. The user pointer is placed so the rounded
//! user range ends exactly at the fence. Frees either release the region
//! immediately or park it fully protected in the quarantine queue.
//!
//! State is a single `parking_lot::Mutex`; the interception shell already
//! serializes wrapper calls, so this lock only guards against the fault
//! handler and on-demand report paths.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use heapusage_core::{SIZE_MULTIPLE, round_up};

use crate::protect;

/// Share of physical RAM the quarantine may hold, in percent.
const QUARANTINE_RAM_PERCENT: usize = 10;

/// Underlying allocator entry points.
///
/// Function pointers rather than direct `libc` calls: inside a preload
/// library the plain symbols resolve back to our own wrappers, so the
/// boundary layer passes in the real thing (`__libc_malloc` family on
/// Linux).
#[derive(Clone, Copy)]
pub struct Underlying {
    pub malloc: unsafe extern "C" fn(usize) -> *mut libc::c_void,
    pub free: unsafe extern "C" fn(*mut libc::c_void),
}

/// Detection knobs for the fenced allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceOptions {
    /// Trailing fence page, faults on overflow.
    pub overflow: bool,
    /// Protected quarantine of freed blocks, faults on use-after-free.
    pub useafterfree: bool,
    /// Allocations strictly smaller than this fall through.
    pub minsize: usize,
    /// Quarantine byte cap override; defaults to 10% of physical RAM.
    pub quarantine_max: Option<usize>,
}

/// Placement of one fenced allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceInfo {
    pub user_ptr: usize,
    pub user_size: usize,
    pub sys_ptr: usize,
    pub sys_size: usize,
}

/// Outcome of a fenced realloc.
pub enum FenceRealloc {
    /// Handled here; `evicted` names quarantine entries released in the
    /// process (stale freed records for the caller to drop).
    Done {
        ptr: *mut libc::c_void,
        evicted: Vec<usize>,
    },
    /// The pointer is not a fenced allocation; the caller must use the
    /// underlying `realloc`.
    Fallback,
}

struct FenceState {
    /// Every address ever handed out by the fence.
    user_addrs: HashSet<usize>,
    /// Addresses currently sitting in freed state.
    free_addrs: HashSet<usize>,
    /// Live fenced allocations.
    active: HashMap<usize, FenceInfo>,
    /// Freed, still-protected blocks, oldest first.
    quarantine: VecDeque<FenceInfo>,
    quarantine_bytes: usize,
}

/// Page-fenced allocator with a bounded free-quarantine.
pub struct FenceAllocator {
    state: Mutex<FenceState>,
    underlying: Underlying,
    overflow: bool,
    useafterfree: bool,
    minsize: usize,
    page_size: usize,
    quarantine_max: usize,
}

impl FenceAllocator {
    #[must_use]
    pub fn new(options: FenceOptions, underlying: Underlying) -> Self {
        let quarantine_max = options
            .quarantine_max
            .unwrap_or_else(|| protect::physical_memory() * QUARANTINE_RAM_PERCENT / 100);
        Self {
            state: Mutex::new(FenceState {
                user_addrs: HashSet::new(),
                free_addrs: HashSet::new(),
                active: HashMap::new(),
                quarantine: VecDeque::new(),
                quarantine_bytes: 0,
            }),
            underlying,
            overflow: options.overflow,
            useafterfree: options.useafterfree,
            minsize: options.minsize,
            page_size: protect::page_size(),
            quarantine_max,
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Placement record for a live fenced allocation.
    #[must_use]
    pub fn info(&self, user_ptr: usize) -> Option<FenceInfo> {
        self.state.lock().active.get(&user_ptr).copied()
    }

    /// Allocate `user_size` bytes behind a fence.
    ///
    /// Trivial and sub-minsize requests fall through to the underlying
    /// allocator. Underlying failure in the fenced path is assertion-class:
    /// a guarded run that cannot obtain pages has no useful way to continue.
    ///
    /// # Safety
    ///
    /// Same contract as C `malloc`; the returned pointer must be released
    /// through [`FenceAllocator::free`].
    pub unsafe fn malloc(&self, user_size: usize) -> *mut libc::c_void {
        if user_size == 0 || user_size < self.minsize {
            // SAFETY: plain underlying allocation.
            return unsafe { (self.underlying.malloc)(user_size) };
        }

        let rounded = round_up(user_size, SIZE_MULTIPLE);
        let sys_size =
            round_up(rounded, self.page_size) + if self.overflow { self.page_size } else { 0 };

        let mut sys_ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: valid out-pointer, page_size is a power of two.
        let rv = unsafe { libc::posix_memalign(&mut sys_ptr, self.page_size, sys_size) };
        assert!(
            rv == 0 && !sys_ptr.is_null(),
            "heapusage: posix_memalign(align={}, size={sys_size}) failed ({rv})",
            self.page_size
        );

        let sys_addr = sys_ptr as usize;
        let user_ptr = if self.overflow {
            let fence = sys_addr + sys_size - self.page_size;
            // SAFETY: the fence page is the tail of the mapping just obtained.
            unsafe { protect::protect_none(fence, self.page_size) };
            fence - rounded
        } else {
            // Use-after-free detection without overflow detection still
            // needs page alignment so the whole block can be protected on free.
            sys_addr
        };

        let mut state = self.state.lock();
        state.active.insert(
            user_ptr,
            FenceInfo {
                user_ptr,
                user_size,
                sys_ptr: sys_addr,
                sys_size,
            },
        );
        state.user_addrs.insert(user_ptr);
        state.free_addrs.remove(&user_ptr);

        user_ptr as *mut libc::c_void
    }

    /// Release a pointer.
    ///
    /// Unknown pointers (allocated before guarded mode engaged, or via a
    /// fall-through) go to the underlying `free`. A fenced address with no
    /// active record is a double free: nothing is released here, the event
    /// path reports it. Returns the user addresses of quarantine entries
    /// evicted to keep the queue under its byte cap; their freed records
    /// are stale and must be dropped by the caller.
    ///
    /// # Safety
    ///
    /// Same contract as C `free`.
    pub unsafe fn free(&self, user_ptr: *mut libc::c_void) -> Vec<usize> {
        if user_ptr.is_null() {
            return Vec::new();
        }
        let addr = user_ptr as usize;

        let mut state = self.state.lock();
        if !state.user_addrs.contains(&addr) {
            drop(state);
            // SAFETY: pointer belongs to the underlying allocator.
            unsafe { (self.underlying.free)(user_ptr) };
            return Vec::new();
        }

        let Some(info) = state.active.remove(&addr) else {
            // Double free of a fenced address; reported on the event path.
            return Vec::new();
        };
        state.free_addrs.insert(addr);

        if self.useafterfree {
            // SAFETY: whole region is one mapping owned by the fence.
            unsafe { protect::protect_none(info.sys_ptr, info.sys_size) };
            state.quarantine.push_back(info);
            state.quarantine_bytes += info.sys_size;
            self.drain_quarantine(&mut state)
        } else {
            // SAFETY: as above; undo the fence before handing the region back.
            unsafe { protect::protect_rw(info.sys_ptr, info.sys_size) };
            // SAFETY: sys_ptr came from posix_memalign.
            unsafe { (self.underlying.free)(info.sys_ptr as *mut libc::c_void) };
            Vec::new()
        }
    }

    /// Zeroed array allocation. The caller has already excluded zero
    /// counts and sizes; a multiplication overflow yields null like the
    /// underlying `calloc` would.
    ///
    /// # Safety
    ///
    /// Same contract as C `calloc`.
    pub unsafe fn calloc(&self, count: usize, size: usize) -> *mut libc::c_void {
        let Some(total) = count.checked_mul(size) else {
            return std::ptr::null_mut();
        };

        // SAFETY: forwarded malloc contract.
        let ptr = unsafe { self.malloc(total) };
        if !ptr.is_null() {
            // SAFETY: ptr is valid for `total` bytes.
            unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, total) };
        }
        ptr
    }

    /// Resize a fenced allocation by moving it behind a fresh fence.
    ///
    /// # Safety
    ///
    /// Same contract as C `realloc`.
    pub unsafe fn realloc(&self, user_ptr: *mut libc::c_void, new_size: usize) -> FenceRealloc {
        if user_ptr.is_null() {
            // SAFETY: forwarded malloc contract.
            let ptr = unsafe { self.malloc(new_size) };
            return FenceRealloc::Done {
                ptr,
                evicted: Vec::new(),
            };
        }

        if new_size == 0 {
            // SAFETY: forwarded free contract.
            let evicted = unsafe { self.free(user_ptr) };
            return FenceRealloc::Done {
                ptr: std::ptr::null_mut(),
                evicted,
            };
        }

        let Some(old) = self.info(user_ptr as usize) else {
            return FenceRealloc::Fallback;
        };

        // SAFETY: forwarded malloc contract.
        let new_ptr = unsafe { self.malloc(new_size) };
        if !new_ptr.is_null() {
            let copy_size = new_size.min(old.user_size);
            // SAFETY: both regions are live and at least copy_size long;
            // a fresh fence allocation never aliases the old block.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    user_ptr.cast::<u8>(),
                    new_ptr.cast::<u8>(),
                    copy_size,
                );
            }
        }
        // SAFETY: forwarded free contract.
        let evicted = unsafe { self.free(user_ptr) };
        FenceRealloc::Done {
            ptr: new_ptr,
            evicted,
        }
    }

    /// Usable size of a fenced allocation: the rounded user range.
    #[must_use]
    pub fn usable_size(&self, user_ptr: usize) -> Option<usize> {
        self.info(user_ptr)
            .map(|info| round_up(info.user_size, SIZE_MULTIPLE))
    }

    fn drain_quarantine(&self, state: &mut FenceState) -> Vec<usize> {
        let mut evicted = Vec::new();
        while state.quarantine_bytes > self.quarantine_max {
            let Some(info) = state.quarantine.pop_front() else {
                break;
            };
            state.quarantine_bytes -= info.sys_size;
            // SAFETY: quarantined regions are whole owned mappings.
            unsafe { protect::protect_rw(info.sys_ptr, info.sys_size) };
            // SAFETY: sys_ptr came from posix_memalign.
            unsafe { (self.underlying.free)(info.sys_ptr as *mut libc::c_void) };
            evicted.push(info.user_ptr);
        }
        evicted
    }

    /// Quarantined placements, oldest first. Diagnostic accessor.
    pub fn quarantined(&self) -> Vec<FenceInfo> {
        self.state.lock().quarantine.iter().copied().collect()
    }

    #[must_use]
    pub fn quarantine_bytes(&self) -> usize {
        self.state.lock().quarantine_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(options: FenceOptions) -> FenceAllocator {
        FenceAllocator::new(
            options,
            Underlying {
                malloc: libc::malloc,
                free: libc::free,
            },
        )
    }

    #[test]
    fn fence_sits_right_after_rounded_user_range() {
        let fence = allocator(FenceOptions {
            overflow: true,
            ..FenceOptions::default()
        });
        let page = fence.page_size();

        // SAFETY: test-owned allocation, released below.
        let ptr = unsafe { fence.malloc(100) };
        assert!(!ptr.is_null());
        let info = fence.info(ptr as usize).expect("fenced allocation");

        let rounded = round_up(100, SIZE_MULTIPLE);
        assert_eq!(info.user_size, 100);
        assert_eq!(info.user_ptr + rounded, info.sys_ptr + info.sys_size - page);
        assert_eq!(info.sys_ptr % page, 0);

        // The whole rounded range is writable.
        // SAFETY: within the unprotected user range.
        unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0x5a, rounded) };

        // SAFETY: releasing the test allocation.
        let evicted = unsafe { fence.free(ptr) };
        assert!(evicted.is_empty());
        assert!(fence.info(ptr as usize).is_none());
    }

    #[test]
    fn without_overflow_user_pointer_is_page_aligned() {
        let fence = allocator(FenceOptions {
            useafterfree: true,
            quarantine_max: Some(usize::MAX),
            ..FenceOptions::default()
        });

        // SAFETY: test-owned allocation, quarantined below.
        let ptr = unsafe { fence.malloc(64) };
        let info = fence.info(ptr as usize).unwrap();
        assert_eq!(info.user_ptr, info.sys_ptr);
        assert_eq!(info.user_ptr % fence.page_size(), 0);

        // SAFETY: releasing into quarantine.
        unsafe { fence.free(ptr) };
        assert_eq!(fence.quarantined().len(), 1);
    }

    #[test]
    fn trivial_and_small_requests_fall_through() {
        let fence = allocator(FenceOptions {
            overflow: true,
            minsize: 64,
            ..FenceOptions::default()
        });

        // SAFETY: underlying allocation, released below.
        let small = unsafe { fence.malloc(8) };
        assert!(!small.is_null());
        assert!(fence.info(small as usize).is_none());
        // Unknown to the fence, routed to the underlying free.
        // SAFETY: small came from the underlying allocator.
        unsafe { fence.free(small) };

        // SAFETY: null free is a no-op.
        assert!(unsafe { fence.free(std::ptr::null_mut()) }.is_empty());
    }

    #[test]
    fn quarantine_evicts_oldest_first_under_byte_cap() {
        let fence = allocator(FenceOptions {
            useafterfree: true,
            quarantine_max: Some(0),
            ..FenceOptions::default()
        });

        // SAFETY: test-owned allocations, freed below.
        let first = unsafe { fence.malloc(32) };
        let second = unsafe { fence.malloc(32) };

        // A zero cap forces immediate eviction of whatever was queued.
        // SAFETY: releasing test allocations.
        let evicted = unsafe { fence.free(first) };
        assert_eq!(evicted, vec![first as usize]);
        let evicted = unsafe { fence.free(second) };
        assert_eq!(evicted, vec![second as usize]);
        assert_eq!(fence.quarantine_bytes(), 0);
    }

    #[test]
    fn quarantine_holds_until_cap_is_exceeded() {
        let fence = allocator(FenceOptions {
            useafterfree: true,
            quarantine_max: Some(3 * protect::page_size()),
            ..FenceOptions::default()
        });
        // Each freed block occupies one page (no overflow fence).
        // SAFETY: test-owned allocations.
        let a = unsafe { fence.malloc(16) };
        let b = unsafe { fence.malloc(16) };
        let c = unsafe { fence.malloc(16) };
        let d = unsafe { fence.malloc(16) };

        // SAFETY: releasing test allocations into quarantine.
        unsafe {
            assert!(fence.free(a).is_empty());
            assert!(fence.free(b).is_empty());
            assert!(fence.free(c).is_empty());
            // Fourth free pushes the sum past the cap; the oldest goes.
            assert_eq!(fence.free(d), vec![a as usize]);
        }
        assert_eq!(fence.quarantined().len(), 3);
    }

    #[test]
    fn double_free_of_fenced_address_releases_nothing() {
        let fence = allocator(FenceOptions {
            overflow: true,
            ..FenceOptions::default()
        });
        // SAFETY: test-owned allocation.
        let ptr = unsafe { fence.malloc(32) };
        // SAFETY: first free releases, second must be inert.
        unsafe {
            fence.free(ptr);
            assert!(fence.free(ptr).is_empty());
        }
    }

    #[test]
    fn calloc_zero_fills_the_user_range() {
        let fence = allocator(FenceOptions {
            overflow: true,
            ..FenceOptions::default()
        });
        // SAFETY: test-owned allocation, released below.
        let ptr = unsafe { fence.calloc(4, 8) };
        assert!(!ptr.is_null());
        // SAFETY: 32 bytes are within the user range.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: releasing the test allocation.
        unsafe { fence.free(ptr) };

        // SAFETY: overflowing multiplication must yield null.
        assert!(unsafe { fence.calloc(usize::MAX, 2) }.is_null());
    }

    #[test]
    fn realloc_moves_to_a_fresh_fence_and_copies() {
        let fence = allocator(FenceOptions {
            overflow: true,
            ..FenceOptions::default()
        });
        // SAFETY: test-owned allocation.
        let old = unsafe { fence.malloc(32) };
        // SAFETY: within the user range.
        unsafe { std::ptr::write_bytes(old.cast::<u8>(), 0x7b, 32) };

        // SAFETY: realloc of a fenced pointer.
        let new = match unsafe { fence.realloc(old, 64) } {
            FenceRealloc::Done { ptr, .. } => ptr,
            FenceRealloc::Fallback => panic!("fenced pointer must not fall back"),
        };
        assert!(!new.is_null());
        assert_ne!(new, old);
        assert!(fence.info(old as usize).is_none());

        // SAFETY: first 32 bytes were copied from the old block.
        let bytes = unsafe { std::slice::from_raw_parts(new.cast::<u8>(), 32) };
        assert!(bytes.iter().all(|&b| b == 0x7b));
        // SAFETY: releasing the test allocation.
        unsafe { fence.free(new) };
    }

    #[test]
    fn realloc_of_foreign_pointer_falls_back() {
        let fence = allocator(FenceOptions {
            overflow: true,
            ..FenceOptions::default()
        });
        // SAFETY: plain underlying allocation.
        let foreign = unsafe { libc::malloc(16) };
        // SAFETY: foreign pointer is not fence-owned.
        assert!(matches!(
            unsafe { fence.realloc(foreign, 32) },
            FenceRealloc::Fallback
        ));
        // SAFETY: releasing the underlying allocation.
        unsafe { libc::free(foreign) };
    }

    #[test]
    fn usable_size_reports_the_rounded_range() {
        let fence = allocator(FenceOptions {
            overflow: true,
            ..FenceOptions::default()
        });
        // SAFETY: test-owned allocation, released below.
        let ptr = unsafe { fence.malloc(8) };
        assert_eq!(fence.usable_size(ptr as usize), Some(SIZE_MULTIPLE));
        assert_eq!(fence.usable_size(0xdead_0000), None);
        // SAFETY: releasing the test allocation.
        unsafe { fence.free(ptr) };
    }
}
