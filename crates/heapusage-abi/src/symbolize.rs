//! Call-stack capture and frame resolution.
//!
//! Capture is a bounded walk over `backtrace` frames; slot 0 is the
//! wrapper itself and is elided by consumers. Resolution combines
//! `backtrace` (demangled symbol names) with `dladdr` (symbol base for
//! the `+ offset` suffix, owning object file for the interesting-source
//! filter), both cached per address.

use std::collections::HashMap;
use std::ffi::{CStr, c_void};

use parking_lot::Mutex;

use heapusage_core::{CallStack, FrameResolver};

/// Capture the current call stack, bounded to the tracker depth.
#[must_use]
pub fn capture_stack() -> CallStack {
    let mut stack = CallStack::empty();
    backtrace::trace(|frame| stack.push(frame.ip() as usize));
    stack
}

/// Capture without taking the `backtrace` global lock.
///
/// # Safety
///
/// Only for contexts where that lock may already be held or must not be
/// taken, i.e. the fault handler of a process about to terminate.
#[must_use]
pub unsafe fn capture_stack_unsynchronized() -> CallStack {
    let mut stack = CallStack::empty();
    // SAFETY: forwarded caller contract.
    unsafe { backtrace::trace_unsynchronized(|frame| stack.push(frame.ip() as usize)) };
    stack
}

/// `dladdr`/`backtrace`-backed [`FrameResolver`] with per-address caches.
pub struct LibcResolver {
    symbols: Mutex<HashMap<usize, Option<String>>>,
    objects: Mutex<HashMap<usize, Option<String>>>,
}

impl LibcResolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            symbols: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LibcResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameResolver for LibcResolver {
    fn symbol(&self, addr: usize) -> Option<String> {
        if let Some(cached) = self.symbols.lock().get(&addr) {
            return cached.clone();
        }
        let resolved = resolve_symbol(addr);
        self.symbols.lock().insert(addr, resolved.clone());
        resolved
    }

    fn object_basename(&self, addr: usize) -> Option<String> {
        if let Some(cached) = self.objects.lock().get(&addr) {
            return cached.clone();
        }
        let resolved = resolve_object_basename(addr);
        self.objects.lock().insert(addr, resolved.clone());
        resolved
    }
}

fn dladdr(addr: usize) -> Option<libc::Dl_info> {
    // SAFETY: zeroed Dl_info is a valid out-parameter.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr reads the address value only.
    let found = unsafe { libc::dladdr(addr as *const c_void, &mut info) };
    (found != 0).then_some(info)
}

fn resolve_symbol(addr: usize) -> Option<String> {
    let mut name: Option<String> = None;
    // SAFETY: resolution of an instruction address captured in-process.
    unsafe {
        backtrace::resolve_unsynchronized(addr as *mut c_void, |symbol| {
            if name.is_none() {
                name = symbol.name().map(|n| n.to_string());
            }
        });
    }

    let info = dladdr(addr);
    if name.is_none() {
        let sname = info.as_ref().map(|i| i.dli_sname)?;
        if sname.is_null() {
            return None;
        }
        // SAFETY: dladdr returned a valid nul-terminated symbol name.
        name = Some(unsafe { CStr::from_ptr(sname) }.to_string_lossy().into_owned());
    }

    let name = name?;
    match info {
        Some(i) if !i.dli_saddr.is_null() => {
            let offset = addr.saturating_sub(i.dli_saddr as usize);
            Some(format!("{name} + {offset}"))
        }
        _ => Some(name),
    }
}

fn resolve_object_basename(addr: usize) -> Option<String> {
    let info = dladdr(addr)?;
    if info.dli_fname.is_null() {
        return None;
    }
    // SAFETY: dladdr returned a valid nul-terminated file name.
    let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
    let basename = path.rsplit('/').next().unwrap_or_default();
    Some(basename.to_string())
}
