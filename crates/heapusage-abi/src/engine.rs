//! Process-wide instrumentation engine.
//!
//! One engine exists per instrumented process. It owns the reentrant
//! gate that serializes wrapper invocations, the call-depth counter that
//! detects self-reentry, the allocation tracker, the optional fenced
//! allocator, and the symbol resolver. The engine is created by the
//! library constructor and reached through [`get`]; until that happens
//! every wrapper takes the bypass path, which also covers allocations
//! performed before initialization completes.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use heapusage_core::filter::{EventClass, is_interesting};
use heapusage_core::report::{self, ReportWriter};
use heapusage_core::tracker::FreeOutcome;
use heapusage_core::{AllocRecord, CallStack, Config, Counters, ReportError, Tracker};
use heapusage_guard::{FenceAllocator, FenceOptions, FenceRealloc};

use crate::symbolize::{self, LibcResolver};
use crate::sys;

/// Disables wrapper bookkeeping entirely while set. Used by the fault
/// handler and the on-demand report path, and readable before the engine
/// exists.
static BYPASS: AtomicBool = AtomicBool::new(false);

static ENGINE: OnceLock<Engine> = OnceLock::new();

#[must_use]
pub fn bypass() -> bool {
    BYPASS.load(Ordering::Relaxed)
}

pub fn set_bypass(on: bool) {
    BYPASS.store(on, Ordering::Relaxed);
}

/// The process engine, once initialized.
#[must_use]
pub fn get() -> Option<&'static Engine> {
    ENGINE.get()
}

/// Create the process engine. The gate's own allocation runs with
/// `bypass` forced so it is not self-recorded.
pub fn init(config: Config) -> &'static Engine {
    set_bypass(true);
    let engine = ENGINE.get_or_init(|| Engine::new(config));
    set_bypass(false);
    engine
}

/// Scoped occupancy of the gate; drops decrement the depth counter.
pub struct Gate<'a> {
    depth: ReentrantMutexGuard<'a, Cell<usize>>,
}

impl Gate<'_> {
    /// True when the current operation re-entered the wrappers (e.g.
    /// symbolization or report I/O called `malloc` itself).
    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.depth.get() > 1
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

pub struct Engine {
    config: Config,
    pid: u32,
    gate: ReentrantMutex<Cell<usize>>,
    recording: AtomicBool,
    tracker: Mutex<Tracker>,
    fence: Option<FenceAllocator>,
    symbols: LibcResolver,
}

impl Engine {
    /// Build the engine and open the report output (truncate, header
    /// line with the process id). A missing or unopenable output path
    /// is a single stderr line; the run continues without file output.
    pub fn new(config: Config) -> Self {
        let pid = std::process::id();

        match &config.file {
            Some(path) => {
                if let Err(err) = report::create_output(path, pid) {
                    eprintln!(
                        "heapusage error: unable to open output file ({}) for writing: {err}",
                        path.display()
                    );
                }
            }
            None => eprintln!("heapusage error: no output file specified"),
        }

        let fence = config.guarded().then(|| {
            FenceAllocator::new(
                FenceOptions {
                    overflow: config.overflow,
                    useafterfree: config.useafterfree,
                    minsize: config.minsize,
                    quarantine_max: None,
                },
                sys::underlying(),
            )
        });

        Self {
            pid,
            gate: ReentrantMutex::new(Cell::new(0)),
            recording: AtomicBool::new(false),
            tracker: Mutex::new(Tracker::new(config.minsize, config.keep_freed())),
            fence,
            symbols: LibcResolver::new(),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn fence(&self) -> Option<&FenceAllocator> {
        self.fence.as_ref()
    }

    #[must_use]
    pub const fn resolver(&self) -> &LibcResolver {
        &self.symbols
    }

    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Relaxed);
    }

    fn recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn counters(&self) -> Counters {
        *self.tracker.lock().counters()
    }

    /// Acquire the gate and bump the call depth.
    fn enter(&self) -> Gate<'_> {
        let depth = self.gate.lock();
        depth.set(depth.get() + 1);
        Gate { depth }
    }

    // -----------------------------------------------------------------
    // Wrapper bodies
    // -----------------------------------------------------------------

    /// # Safety
    ///
    /// C `malloc` contract.
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        let gate = self.enter();
        if gate.is_recursive() {
            // SAFETY: passthrough on self-reentry.
            return unsafe { sys::malloc(size) };
        }

        let ptr = match &self.fence {
            // SAFETY: fenced allocation owns the returned pointer.
            Some(fence) => unsafe { fence.malloc(size) },
            // SAFETY: plain underlying allocation.
            None => unsafe { sys::malloc(size) },
        };
        self.log_malloc(ptr, size);
        ptr
    }

    /// # Safety
    ///
    /// C `free` contract.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        let gate = self.enter();
        if gate.is_recursive() {
            // SAFETY: passthrough on self-reentry.
            return unsafe { sys::free(ptr) };
        }

        match &self.fence {
            Some(fence) => {
                // SAFETY: fenced release; unknown pointers are routed to
                // the underlying free inside.
                let evicted = unsafe { fence.free(ptr) };
                self.drop_stale(&evicted);
            }
            // SAFETY: plain underlying release.
            None => unsafe { sys::free(ptr) },
        }
        self.log_free(ptr);
    }

    /// # Safety
    ///
    /// C `calloc` contract.
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        let gate = self.enter();
        if gate.is_recursive() {
            // SAFETY: passthrough on self-reentry.
            return unsafe { sys::calloc(nmemb, size) };
        }

        let ptr = match &self.fence {
            // SAFETY: fenced zeroed allocation.
            Some(fence) if nmemb != 0 && size != 0 => unsafe { fence.calloc(nmemb, size) },
            // SAFETY: plain underlying allocation.
            _ => unsafe { sys::calloc(nmemb, size) },
        };
        self.log_malloc(ptr, nmemb.wrapping_mul(size));
        ptr
    }

    /// # Safety
    ///
    /// C `realloc` contract.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let gate = self.enter();
        if gate.is_recursive() {
            // SAFETY: passthrough on self-reentry.
            return unsafe { sys::realloc(ptr, size) };
        }

        let new_ptr = match &self.fence {
            // SAFETY: fenced resize handles null/zero/foreign inputs.
            Some(fence) => match unsafe { fence.realloc(ptr, size) } {
                FenceRealloc::Done { ptr, evicted } => {
                    self.drop_stale(&evicted);
                    ptr
                }
                // SAFETY: foreign pointer, underlying realloc.
                FenceRealloc::Fallback => unsafe { sys::realloc(ptr, size) },
            },
            // SAFETY: plain underlying realloc.
            None => unsafe { sys::realloc(ptr, size) },
        };

        if !ptr.is_null() {
            self.log_free(ptr);
        }
        if size != 0 {
            self.log_malloc(new_ptr, size);
        }
        new_ptr
    }

    /// # Safety
    ///
    /// C `valloc` contract. The page-alignment contract conflicts with
    /// the fence layout, so this always dispatches to the underlying
    /// allocator; the event is still recorded.
    #[cfg(target_os = "macos")]
    pub unsafe fn valloc(&self, size: usize) -> *mut c_void {
        let gate = self.enter();
        if gate.is_recursive() {
            // SAFETY: passthrough on self-reentry.
            return unsafe { sys::valloc(size) };
        }

        // SAFETY: plain underlying allocation.
        let ptr = unsafe { sys::valloc(size) };
        self.log_malloc(ptr, size);
        ptr
    }

    /// # Safety
    ///
    /// `ptr` is null or a heap pointer. macOS `malloc_size` contract.
    #[cfg(target_os = "macos")]
    pub unsafe fn malloc_size(&self, ptr: *const c_void) -> usize {
        let gate = self.enter();
        if gate.is_recursive() {
            // SAFETY: passthrough on self-reentry.
            return unsafe { sys::malloc_size(ptr) };
        }

        match &self.fence {
            Some(fence) => fence
                .usable_size(ptr as usize)
                // SAFETY: not a fenced pointer, ask the underlying allocator.
                .unwrap_or_else(|| unsafe { sys::malloc_size(ptr) }),
            // SAFETY: plain underlying query.
            None => unsafe { sys::malloc_size(ptr) },
        }
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    /// Record a MALLOC event. Null results are not events.
    pub fn log_malloc(&self, ptr: *mut c_void, size: usize) {
        if ptr.is_null() || !self.recording() {
            return;
        }
        let stack = symbolize::capture_stack();
        self.tracker.lock().on_malloc(ptr as usize, size, stack);
    }

    /// Record a FREE event and diagnose invalid deallocations.
    pub fn log_free(&self, ptr: *mut c_void) {
        if ptr.is_null() || !self.recording() {
            return;
        }

        let free_stack = self.config.keep_freed().then(symbolize::capture_stack);
        let outcome = self.tracker.lock().on_free(ptr as usize, free_stack);

        if !self.config.doublefree {
            return;
        }
        if let FreeOutcome::DoubleFree(record) = outcome {
            let current = free_stack.unwrap_or_else(symbolize::capture_stack);
            self.report_invalid_free(ptr as usize, &current, &record);
        }
    }

    /// Drop freed-table entries whose blocks left the quarantine: once a
    /// block is back with the underlying allocator it can no longer fault
    /// and its record would only misclassify future faults.
    pub fn drop_stale(&self, evicted: &[usize]) {
        if evicted.is_empty() {
            return;
        }
        let mut tracker = self.tracker.lock();
        for &addr in evicted {
            tracker.remove_freed(addr);
        }
    }

    // -----------------------------------------------------------------
    // Reports
    // -----------------------------------------------------------------

    fn report_invalid_free(&self, addr: usize, current: &CallStack, record: &AllocRecord) {
        if !is_interesting(current, EventClass::Dealloc, &self.symbols) {
            return;
        }
        let Some(path) = &self.config.file else {
            return;
        };
        let Ok(mut file) = report::open_append(path) else {
            return;
        };
        let writer = ReportWriter::new(self.pid, self.config.nosyms, &self.symbols);
        let _ = writer.invalid_deallocation(&mut file, addr, current, Some(record));
    }

    /// Fault diagnostic: "Invalid memory access" plus the classification
    /// of `addr` against live and quarantined metadata.
    pub fn report_invalid_access(&self, addr: usize, current: &CallStack) {
        let Some(path) = &self.config.file else {
            return;
        };
        let Ok(mut file) = report::open_append(path) else {
            return;
        };

        let page_size = self
            .fence
            .as_ref()
            .map_or_else(heapusage_guard::protect::page_size, FenceAllocator::page_size);
        let tracker = self.tracker.lock();
        let class = tracker.classify_fault(addr, page_size);
        let writer = ReportWriter::new(self.pid, self.config.nosyms, &self.symbols);
        let _ = writer.invalid_access(&mut file, addr, current, class.as_ref());
    }

    fn write_summary(&self) -> Result<(), ReportError> {
        let path = self.config.file.as_ref().ok_or(ReportError::NoOutputPath)?;
        let mut file = report::open_append(path)?;
        let tracker = self.tracker.lock();
        let writer = ReportWriter::new(self.pid, self.config.nosyms, &self.symbols);
        writer.summary(&mut file, &tracker, self.config.leak, self.config.minsize)?;
        Ok(())
    }

    /// Teardown entry point: recording off, then the final summary.
    pub fn teardown(&self) {
        self.set_recording(false);
        let _ = self.write_summary();
    }

    /// On-demand entry point: bypass and recording are toggled around
    /// the dump so the reporter's own allocations are invisible.
    pub fn on_demand_report(&self) {
        set_bypass(true);
        self.set_recording(false);
        let _ = self.write_summary();
        self.set_recording(true);
        set_bypass(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_log(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("heapusage_{tag}_{}.log", std::process::id()))
    }

    fn test_engine(tag: &str, mutate: impl FnOnce(&mut Config)) -> (Engine, PathBuf) {
        let path = temp_log(tag);
        let mut config = Config {
            file: Some(path.clone()),
            ..Config::default()
        };
        mutate(&mut config);
        let engine = Engine::new(config);
        engine.set_recording(true);
        (engine, path)
    }

    #[test]
    fn malloc_free_round_trip_updates_counters() {
        let (engine, path) = test_engine("roundtrip", |_| {});
        // SAFETY: engine-owned allocation, freed below.
        let ptr = unsafe { engine.malloc(100) };
        assert!(!ptr.is_null());
        assert_eq!(engine.counters().total_allocs, 1);
        assert_eq!(engine.counters().current_bytes, 100);

        // SAFETY: releasing the engine allocation.
        unsafe { engine.free(ptr) };
        assert_eq!(engine.counters().total_frees, 1);
        assert_eq!(engine.counters().current_bytes, 0);
        assert_eq!(engine.counters().peak_bytes, 100);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn recursive_entry_is_invisible() {
        let (engine, path) = test_engine("recursion", |_| {});

        let _outer = engine.enter();
        let before = engine.counters();
        // SAFETY: passthrough allocation (depth 2), freed below.
        let ptr = unsafe { engine.malloc(64) };
        assert!(!ptr.is_null());
        assert_eq!(engine.counters(), before);
        // SAFETY: passthrough release.
        unsafe { engine.free(ptr) };
        assert_eq!(engine.counters(), before);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn realloc_emits_free_then_malloc() {
        let (engine, path) = test_engine("realloc", |_| {});
        // SAFETY: engine-owned allocation.
        let ptr = unsafe { engine.malloc(32) };
        // SAFETY: resizing the engine allocation.
        let grown = unsafe { engine.realloc(ptr, 64) };
        assert!(!grown.is_null());

        let counters = engine.counters();
        assert_eq!(counters.total_allocs, 2);
        assert_eq!(counters.total_frees, 1);
        assert_eq!(counters.current_bytes, 64);
        assert_eq!(counters.total_alloc_bytes, 96);

        // SAFETY: releasing the resized allocation.
        unsafe { engine.free(grown) };
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn calloc_records_the_product() {
        let (engine, path) = test_engine("calloc", |_| {});
        // SAFETY: engine-owned allocation, freed below.
        let ptr = unsafe { engine.calloc(4, 25) };
        assert!(!ptr.is_null());
        assert_eq!(engine.counters().total_alloc_bytes, 100);
        // SAFETY: releasing the engine allocation.
        unsafe { engine.free(ptr) };
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn on_demand_then_teardown_writes_two_summaries() {
        let (engine, path) = test_engine("ondemand", |config| config.leak = true);

        // SAFETY: engine-owned allocations, intentionally leaked.
        let first = unsafe { engine.malloc(1111) };
        assert!(!first.is_null());
        engine.on_demand_report();
        // SAFETY: as above.
        let second = unsafe { engine.malloc(2222) };
        assert!(!second.is_null());
        engine.teardown();

        let text = std::fs::read_to_string(&path).unwrap();
        let pid = std::process::id();
        assert!(text.starts_with(&format!(
            "=={pid}== Heapusage - https://github.com/d99kris/heapusage\n"
        )));
        assert_eq!(text.matches("HEAP SUMMARY:").count(), 2);
        assert!(text.contains("in use at exit: 1111 bytes in 1 blocks"));
        assert!(text.contains("in use at exit: 3333 bytes in 2 blocks"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn reporting_does_not_move_the_counters() {
        let (engine, path) = test_engine("invisible_report", |config| {
            config.leak = true;
            // Symbolized output: the resolver allocates per resolution.
            config.nosyms = false;
        });

        // SAFETY: engine-owned allocations, intentionally leaked.
        unsafe {
            engine.malloc(500);
            engine.malloc(700);
        }
        let before = engine.counters();
        engine.on_demand_report();
        engine.on_demand_report();
        assert_eq!(engine.counters(), before);

        // Back-to-back reports with no intervening allocator activity
        // are byte-identical.
        let text = std::fs::read_to_string(&path).unwrap();
        let header = format!("=={}== HEAP SUMMARY:", std::process::id());
        let sections: Vec<usize> = text
            .match_indices(&header)
            .map(|(index, _)| index)
            .collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(text[sections[0]..sections[1]], text[sections[1]..]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn double_free_is_diagnosed_in_the_report_file() {
        let (engine, path) = test_engine("doublefree", |config| {
            config.doublefree = true;
            // Quarantine the first free so the second one is inert instead
            // of reaching the underlying allocator twice.
            config.useafterfree = true;
        });

        // SAFETY: fenced allocation.
        let ptr = unsafe { engine.malloc(5555) };
        // SAFETY: first free quarantines, second is the bug under test.
        unsafe {
            engine.free(ptr);
            engine.free(ptr);
        }

        let counters = engine.counters();
        assert_eq!(counters.total_frees, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("Invalid deallocation at:").count(), 1);
        assert!(text.contains("is a block of size 5555 free'd at:"));
        assert!(text.contains("Block was alloc'd at:"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn guarded_engine_routes_through_the_fence() {
        let (engine, path) = test_engine("guarded", |config| {
            config.overflow = true;
            config.doublefree = true;
        });

        // SAFETY: fenced allocation, freed below.
        let ptr = unsafe { engine.malloc(100) };
        let fence = engine.fence().expect("guarded mode");
        assert!(fence.info(ptr as usize).is_some());
        assert_eq!(engine.counters().total_allocs, 1);

        // SAFETY: releasing the fenced allocation.
        unsafe { engine.free(ptr) };
        assert!(fence.info(ptr as usize).is_none());
        assert_eq!(engine.counters().current_bytes, 0);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn sub_minsize_requests_bypass_fence_and_tracker() {
        let (engine, path) = test_engine("minsize", |config| {
            config.overflow = true;
            config.minsize = 64;
        });

        // SAFETY: falls through to the underlying allocator, freed below.
        let ptr = unsafe { engine.malloc(8) };
        assert!(!ptr.is_null());
        assert!(engine.fence().unwrap().info(ptr as usize).is_none());
        assert_eq!(engine.counters().total_allocs, 0);

        // SAFETY: unknown to the fence, routed to the underlying free.
        unsafe { engine.free(ptr) };
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn fault_classification_reaches_the_report() {
        let (engine, path) = test_engine("fault_report", |config| {
            config.overflow = true;
            config.useafterfree = true;
        });

        // SAFETY: fenced allocation, left live so the fault classifies
        // against the live table.
        let ptr = unsafe { engine.malloc(8) } as usize;
        let rounded = heapusage_core::round_up(8, heapusage_core::SIZE_MULTIPLE);

        let stack = symbolize::capture_stack();
        engine.report_invalid_access(ptr + rounded, &stack);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Invalid memory access at:"));
        assert!(text.contains(&format!(
            "is 0 bytes after a block of size {rounded} alloc'd at:"
        )));

        let _ = std::fs::remove_file(path);
    }
}
