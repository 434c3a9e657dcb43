//! The frame allocator contract and a bitmap-backed reference
//! implementation.
//!
//! The physical frame allocator itself is an external collaborator:
//! `kslab` only needs `2^order`-page regions, a way to give them back,
//! and one writable slot per frame to store the owning slab's address
//! (§4.1's frame-to-slab reverse mapping). [`BitmapFrameSource`] is a
//! complete, if simple, implementation of that contract driven entirely
//! off caller-supplied storage, so it never allocates through `alloc`
//! itself — doing so would recurse into this crate once it is
//! installed as the global allocator.

use core::cell::Cell;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::core::mm::slab::Slab;
use crate::core::sync::SpinLock;
use crate::utils::Bitmap;

bitflags! {
    /// Flags accepted by [`FrameSource::alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Caller is in a context that must not sleep or otherwise
        /// block; the allocator must fail fast rather than wait.
        const ATOMIC = 1 << 0;
        /// Do not invoke the reclaim callback on failure before giving
        /// up. Set on allocations made *by* the reclaim path itself
        /// (the magazine cache) to avoid recursive reclaim.
        const NO_RECLAIM = 1 << 1;
        /// Require a kernel-addressable (directly mapped) region.
        const KA = 1 << 2;
    }
}

/// Failure reasons for [`FrameSource::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No contiguous region of the requested order is available.
    OutOfMemory,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::OutOfMemory => write!(f, "out of physical frames"),
        }
    }
}

/// A `2^order`-page, physically contiguous region handed back by
/// [`FrameSource::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRegion {
    pub addr: usize,
    pub order: u32,
}

impl FrameRegion {
    pub fn len(&self) -> usize {
        PAGE_SIZE << self.order
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Per-frame metadata. The only field the slab subsystem needs is one
/// pointer-sized back-pointer slot, reserved for the owning [`Slab`]
/// (§9, "Reverse mapping" — a typed accessor, not a `*mut ()`).
pub struct FrameDescriptor {
    slab_owner: Cell<Option<NonNull<Slab>>>,
}

// SAFETY: access is always mediated by the cache lock that owns the
// slab this frame belongs to, or happens before the slab is published
// to other CPUs (see `slab::slab_space_alloc`).
unsafe impl Sync for FrameDescriptor {}

impl FrameDescriptor {
    pub const fn new() -> Self {
        Self {
            slab_owner: Cell::new(None),
        }
    }

    /// The slab that owns the frame this descriptor describes, if any.
    pub fn slab_owner(&self) -> Option<NonNull<Slab>> {
        self.slab_owner.get()
    }

    /// Sets the owning slab. Called once by `slab_space_alloc` when the
    /// frames are first carved into a slab, and cleared by
    /// `slab_space_free` when they are returned.
    pub fn set_slab_owner(&self, owner: Option<NonNull<Slab>>) {
        self.slab_owner.set(owner);
    }
}

impl Default for FrameDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// The frame allocator contract the cache layer is built against.
///
/// A real kernel's physical frame allocator (zones, buddy system,
/// NUMA placement) sits behind this trait; `kslab` only ever calls
/// these three methods.
pub trait FrameSource: Send + Sync {
    /// Allocates `2^order` physically contiguous, page-aligned frames.
    fn alloc(&self, order: u32, flags: FrameFlags) -> Result<FrameRegion, FrameError>;

    /// Releases a region previously returned by `alloc` with the same
    /// `order`.
    fn free(&self, addr: usize, order: u32);

    /// Looks up the frame descriptor covering `addr` (any address
    /// within the frame, not necessarily its start).
    fn descriptor(&self, addr: usize) -> &FrameDescriptor;
}

/// A [`FrameSource`] backed by a first-fit bitmap over a flat run of
/// frames, plus a parallel array of [`FrameDescriptor`]s. Storage for
/// both is supplied by the caller at construction so this type never
/// allocates on its own behalf.
pub struct BitmapFrameSource {
    base: usize,
    frame_count: usize,
    bitmap: SpinLock<Bitmap>,
    descriptors: *const FrameDescriptor,
}

// SAFETY: `descriptors` points at caller-supplied storage that is kept
// alive for the lifetime of the `BitmapFrameSource`, and `FrameDescriptor`
// is itself `Sync`.
unsafe impl Send for BitmapFrameSource {}
unsafe impl Sync for BitmapFrameSource {}

impl BitmapFrameSource {
    /// Builds a frame source over `frame_count` frames starting at
    /// physical address `base`.
    ///
    /// # Safety
    /// - `bitmap_storage` must be valid for `(frame_count + 63) / 64`
    ///   `u64` words and live at least as long as `self`.
    /// - `descriptor_storage` must be valid for exactly `frame_count`
    ///   `FrameDescriptor`s, already initialised (e.g. via
    ///   `FrameDescriptor::default`), and live at least as long as `self`.
    /// - `base` must be page-aligned and the `frame_count * PAGE_SIZE`
    ///   bytes starting there must be otherwise unused memory.
    pub unsafe fn new(
        base: usize,
        frame_count: usize,
        bitmap_storage: *mut u64,
        descriptor_storage: *const FrameDescriptor,
    ) -> Self {
        let bitmap = unsafe { Bitmap::new(bitmap_storage, frame_count) };
        Self {
            base,
            frame_count,
            bitmap: SpinLock::new(bitmap),
            descriptors: descriptor_storage,
        }
    }

    fn frame_index(&self, addr: usize) -> usize {
        (addr - self.base) / PAGE_SIZE
    }
}

impl FrameSource for BitmapFrameSource {
    fn alloc(&self, order: u32, flags: FrameFlags) -> Result<FrameRegion, FrameError> {
        let run = 1usize << order;
        let mut bitmap = self.bitmap.lock();
        let mut start = None;
        let mut i = 0;
        while i + run <= self.frame_count {
            if (0..run).all(|off| !bitmap.test(i + off)) {
                start = Some(i);
                break;
            }
            i += 1;
        }
        let Some(start) = start else {
            log::trace!(
                "BitmapFrameSource: order {order} unsatisfiable (flags {flags:?})"
            );
            return Err(FrameError::OutOfMemory);
        };
        for off in 0..run {
            bitmap.set_bit(start + off);
        }
        Ok(FrameRegion {
            addr: self.base + start * PAGE_SIZE,
            order,
        })
    }

    fn free(&self, addr: usize, order: u32) {
        let run = 1usize << order;
        let start = self.frame_index(addr);
        let mut bitmap = self.bitmap.lock();
        for off in 0..run {
            bitmap.clear_bit(start + off);
        }
    }

    fn descriptor(&self, addr: usize) -> &FrameDescriptor {
        let index = self.frame_index(crate::config::align_down(addr, PAGE_SIZE));
        debug_assert!(index < self.frame_count, "address outside frame source range");
        // SAFETY: `descriptors` was constructed with `frame_count` valid
        // entries and outlives `self` per the constructor's contract.
        unsafe { &*self.descriptors.add(index) }
    }
}
