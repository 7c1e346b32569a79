//! # heapusage-guard
//!
//! Page-fenced guarded allocator. Every eligible allocation is placed at
//! the end of a page-aligned region so that the byte immediately past the
//! rounded user range falls into a trailing no-access fence page:
//!
//! ```text
//!       <------------- N pages -------------> <--- 1 page --->
//!      | - - - - - - - - - ------------------|----------------|
//!      |   (pad to page)   | user allocation | fence page     |
//!      | - - - - - - - - - ------------------|----------------|
//!      ^                   ^
//!   sys_ptr             user_ptr
//! ```
//!
//! Freed blocks are optionally held in a fully-protected FIFO quarantine
//! (capped at 10% of physical RAM) so that use-after-free accesses keep
//! faulting until the block is finally evicted back to the underlying
//! allocator.
//!
//! The crate has no knowledge of the interception layer: the underlying
//! allocator comes in as function pointers, and the fault handler body is
//! installed via [`fault::install_fault_handler`] with a caller-supplied
//! function.

pub mod fault;
pub mod fence;
pub mod protect;

pub use fence::{FenceAllocator, FenceInfo, FenceOptions, FenceRealloc, Underlying};
