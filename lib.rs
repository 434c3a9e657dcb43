//! kslab — a SMP-scalable, self-hosting SLAB object cache allocator.
//!
//! Bootstrap order: supply a [`core::mm::frame::FrameSource`] to
//! [`core::mm::registry::bootstrap`], then call
//! [`core::mm::kalloc::init`] to build the power-of-two size classes.
//! From there, `Cache::create`/`Cache::alloc`/`Cache::free` build
//! object caches of your own, and [`kalloc`]/[`kfree`] (or the
//! `global` feature's [`GlobalAlloc`] front-end) serve general-purpose
//! requests.
//!
//! This crate never allocates through its own global allocator while
//! implementing itself — every internal list is intrusive and every
//! fixed-size buffer is sized at compile time — so it is safe to
//! install as `#[global_allocator]` in the kernel it serves.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod core;
pub mod utils;

pub use crate::core::mm::cache::{AllocFlags, Cache, CacheFlags, CacheStats, CacheTuning};
pub use crate::core::mm::frame::{BitmapFrameSource, FrameDescriptor, FrameError, FrameFlags, FrameRegion, FrameSource};
pub use crate::core::mm::kalloc::{kalloc, kfree};
pub use crate::core::mm::registry;
pub use crate::core::mm::SlabError;
pub use crate::core::Error;

/// Crate version, as reported by `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(feature = "global")]
mod global_alloc {
    use alloc::alloc::{GlobalAlloc, Layout};
    use core::ptr::NonNull;

    use crate::core::mm::cache::AllocFlags;
    use crate::core::mm::kalloc::{kalloc, kfree};

    /// Routes `Box`/`Vec`/`String` and friends through the size-class
    /// caches. Requires [`crate::core::mm::registry::bootstrap`] and
    /// [`crate::core::mm::kalloc::init`] to have already run; any
    /// allocation attempted before that returns null, same as running
    /// out of memory.
    pub struct SlabGlobalAlloc;

    unsafe impl GlobalAlloc for SlabGlobalAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let size = layout.size().max(layout.align());
            match kalloc(size, AllocFlags::empty()) {
                Some(ptr) => ptr.as_ptr(),
                None => core::ptr::null_mut(),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            if let Some(ptr) = NonNull::new(ptr) {
                unsafe { kfree(ptr) };
            }
        }
    }

    #[global_allocator]
    static ALLOCATOR: SlabGlobalAlloc = SlabGlobalAlloc;
}
