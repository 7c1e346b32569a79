//! # heapusage-abi
//!
//! The preload boundary of heapusage. This crate produces the `cdylib`
//! that is injected into an unmodified target process (`LD_PRELOAD` on
//! Linux, `DYLD_INSERT_LIBRARIES` on macOS) and exposes wrappers with the
//! exact signatures of the C allocation family.
//!
//! # Architecture
//!
//! ```text
//! target calls malloc -> wrapper (this crate) -> gate (bypass/recursion)
//!     -> fenced allocator (guarded mode) or underlying allocator
//!     -> event into heapusage-core tracker
//! ```
//!
//! Every wrapper invocation is serialized by one process-wide reentrant
//! lock; self-reentry (symbolization or report I/O allocating) is detected
//! by a call-depth counter and falls straight through to the underlying
//! allocator without recording.

pub mod api;
pub mod engine;
pub mod fault;
pub mod symbolize;
pub mod sys;

// Gated behind cfg(not(test)) because these modules export #[no_mangle]
// allocator symbols (malloc, free, ...) that would shadow the system
// allocator in the test binary, and constructors that would instrument
// the test harness itself.
#[cfg(not(test))]
mod init;
#[cfg(not(test))]
pub mod wrappers;
