//! Report generator.
//!
//! Produces the `==PID==`-prefixed heap report: summary counters, leaked
//! blocks grouped by allocation call stack and emitted largest first,
//! and the diagnostic blocks for invalid deallocations and invalid
//! memory accesses. Everything writes through `std::io::Write`; the file
//! itself is only ever opened in truncate mode at init and append mode
//! thereafter.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::error::ReportError;
use crate::filter::{EventClass, is_interesting};
use crate::resolve::FrameResolver;
use crate::stack::CallStack;
use crate::tracker::{AllocRecord, FaultClass, Tracker};

/// Aggregate of live blocks sharing one allocation call stack.
#[derive(Debug, Clone)]
pub struct LeakGroup {
    pub size: u64,
    pub count: u64,
    pub stack: CallStack,
}

/// Group live allocations by call stack, largest aggregate first.
///
/// Ties are broken arbitrarily.
#[must_use]
pub fn group_leaks(live: &BTreeMap<usize, AllocRecord>) -> Vec<LeakGroup> {
    let mut by_stack: HashMap<CallStack, LeakGroup> = HashMap::new();
    for record in live.values() {
        by_stack
            .entry(record.alloc_stack)
            .and_modify(|group| {
                group.size += record.size as u64;
                group.count += 1;
            })
            .or_insert(LeakGroup {
                size: record.size as u64,
                count: 1,
                stack: record.alloc_stack,
            });
    }

    let mut groups: Vec<LeakGroup> = by_stack.into_values().collect();
    groups.sort_by(|a, b| b.size.cmp(&a.size));
    groups
}

/// Open the output file fresh and write the header block.
pub fn create_output(path: &Path, pid: u32) -> Result<(), ReportError> {
    let mut file = File::create(path)?;
    writeln!(file, "=={pid}== Heapusage - https://github.com/d99kris/heapusage")?;
    writeln!(file, "=={pid}== ")?;
    Ok(())
}

/// Open the output file for appending one report batch.
pub fn open_append(path: &Path) -> Result<File, ReportError> {
    Ok(OpenOptions::new().append(true).open(path)?)
}

fn fmt_addr(addr: usize) -> String {
    if cfg!(target_pointer_width = "32") {
        format!("0x{addr:08x}")
    } else {
        format!("0x{addr:016x}")
    }
}

/// Formats report blocks for one process.
pub struct ReportWriter<'a> {
    pid: u32,
    nosyms: bool,
    resolver: &'a dyn FrameResolver,
}

impl<'a> ReportWriter<'a> {
    #[must_use]
    pub fn new(pid: u32, nosyms: bool, resolver: &'a dyn FrameResolver) -> Self {
        Self {
            pid,
            nosyms,
            resolver,
        }
    }

    /// Heap summary plus, when `leak` is set, the per-site leak details.
    ///
    /// The LEAK SUMMARY block is always written; only the detail blocks
    /// are gated. Groups below `minsize` are cut off (the list is sorted,
    /// so the cutoff ends the iteration), and detail blocks must pass the
    /// interesting-source filter.
    pub fn summary<W: Write>(
        &self,
        w: &mut W,
        tracker: &Tracker,
        leak: bool,
        minsize: usize,
    ) -> io::Result<()> {
        let pid = self.pid;
        let counters = tracker.counters();
        let lost_bytes = counters.current_bytes;
        let lost_blocks = tracker.live_blocks();

        writeln!(w, "=={pid}== HEAP SUMMARY:")?;
        writeln!(
            w,
            "=={pid}==     in use at exit: {lost_bytes} bytes in {lost_blocks} blocks"
        )?;
        writeln!(
            w,
            "=={pid}==   total heap usage: {} allocs, {} frees, {} bytes allocated",
            counters.total_allocs, counters.total_frees, counters.total_alloc_bytes
        )?;
        writeln!(
            w,
            "=={pid}==    peak heap usage: {} bytes allocated",
            counters.peak_bytes
        )?;
        writeln!(w, "=={pid}== ")?;

        if leak {
            for group in group_leaks(tracker.live()) {
                if group.size < minsize as u64 {
                    break;
                }
                if !is_interesting(&group.stack, EventClass::Alloc, self.resolver) {
                    continue;
                }
                writeln!(
                    w,
                    "=={pid}== {} bytes in {} block(s) are lost, originally allocated at:",
                    group.size, group.count
                )?;
                self.callstack(w, &group.stack)?;
                writeln!(w, "=={pid}== ")?;
            }
        }

        writeln!(w, "=={pid}== LEAK SUMMARY:")?;
        writeln!(
            w,
            "=={pid}==    definitely lost: {lost_bytes} bytes in {lost_blocks} blocks"
        )?;
        writeln!(w, "=={pid}== ")?;
        Ok(())
    }

    /// Diagnostic block for a free of a pointer that is not live.
    ///
    /// With a retained freed record the block names where the pointer was
    /// previously freed and originally allocated; without one (never
    /// allocated) only the current stack is shown.
    pub fn invalid_deallocation<W: Write>(
        &self,
        w: &mut W,
        addr: usize,
        current: &CallStack,
        prior: Option<&AllocRecord>,
    ) -> io::Result<()> {
        let pid = self.pid;
        writeln!(w, "=={pid}== Invalid deallocation at:")?;
        self.callstack(w, current)?;

        if let Some(record) = prior {
            writeln!(
                w,
                "=={pid}==  Address {} is a block of size {} free'd at:",
                fmt_addr(addr),
                record.size
            )?;
            if let Some(free_stack) = &record.free_stack {
                self.callstack(w, free_stack)?;
            }
            writeln!(w, "=={pid}==  Block was alloc'd at:")?;
            self.callstack(w, &record.alloc_stack)?;
        }

        writeln!(w, "=={pid}== ")?;
        Ok(())
    }

    /// Diagnostic block for a protection fault, with the classification
    /// of the faulting address when one was found.
    pub fn invalid_access<W: Write>(
        &self,
        w: &mut W,
        addr: usize,
        current: &CallStack,
        class: Option<&FaultClass>,
    ) -> io::Result<()> {
        let pid = self.pid;
        writeln!(w, "=={pid}== Invalid memory access at:")?;
        self.callstack(w, current)?;

        match class {
            Some(FaultClass::AfterLive {
                offset,
                size,
                alloc_stack,
            }) => {
                writeln!(
                    w,
                    "=={pid}==  Address {} is {offset} bytes after a block of size {size} alloc'd at:",
                    fmt_addr(addr)
                )?;
                self.callstack(w, alloc_stack)?;
            }
            Some(FaultClass::AfterFreed {
                offset,
                size,
                free_stack,
                alloc_stack,
            }) => {
                writeln!(
                    w,
                    "=={pid}==  Address {} is {offset} bytes after a block of size {size} free'd at:",
                    fmt_addr(addr)
                )?;
                if let Some(free_stack) = free_stack {
                    self.callstack(w, free_stack)?;
                }
                writeln!(w, "=={pid}==  Block was alloc'd at:")?;
                self.callstack(w, alloc_stack)?;
            }
            Some(FaultClass::InsideFreed {
                offset,
                size,
                free_stack,
                alloc_stack,
            }) => {
                writeln!(
                    w,
                    "=={pid}==  Address {} is {offset} bytes inside a block of size {size} free'd at:",
                    fmt_addr(addr)
                )?;
                if let Some(free_stack) = free_stack {
                    self.callstack(w, free_stack)?;
                }
                writeln!(w, "=={pid}==  Block was alloc'd at:")?;
                self.callstack(w, alloc_stack)?;
            }
            None => {}
        }

        writeln!(w, "=={pid}== ")?;
        Ok(())
    }

    /// One `at 0x...` line per frame, slot 0 elided.
    fn callstack<W: Write>(&self, w: &mut W, stack: &CallStack) -> io::Result<()> {
        let pid = self.pid;
        if stack.is_empty() {
            writeln!(
                w,
                "=={pid}==    error: backtrace() returned empty callstack"
            )?;
            return Ok(());
        }

        for &addr in stack.caller_frames() {
            write!(w, "=={pid}==    at {}", fmt_addr(addr))?;
            if self.nosyms {
                writeln!(w)?;
            } else {
                let symbol = self.resolver.symbol(addr).unwrap_or_default();
                writeln!(w, ": {symbol}")?;
            }
        }
        Ok(())
    }
}
