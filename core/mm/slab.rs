//! A single slab: one contiguous `2^order`-page region carved into
//! `objects_per_slab` fixed-size objects, plus an embedded free list.
//!
//! Object liveness is tracked by the free list alone: a free object's
//! first machine word holds the index of the next free object (`u32`,
//! `objects_per_slab` meaning "end of list"); a live object's storage
//! is never read by the slab itself. This is exactly the union the
//! source's `*(int*)obj = next` trick stands in for, made explicit so
//! nothing ever reads a live object as a free-list node (§9, "Free
//! list embedded in free objects").

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::core::mm::cache::Cache;
use crate::utils::list::{Link, Linked};

/// One free slot's node, overlaid on the first word of a free object's
/// storage. Never constructed over a live object.
#[repr(C)]
union FreeNode {
    next: u32,
    // Forces the union to reserve at least a pointer's worth of space
    // even for tiny objects, matching the natural alignment objects
    // are guaranteed to have (spec.md §3: "at least one machine-word").
    _align: MaybeUninit<usize>,
}

/// Metadata for one slab. Placed either **inside** (at the tail of its
/// own data region) or **outside** (allocated from a dedicated
/// descriptor cache) — see `cache::slab_space_alloc`.
pub struct Slab {
    link: Link<Slab>,
    cache: NonNull<Cache>,
    /// Address of the first object.
    start: usize,
    /// Number of free objects remaining.
    available: usize,
    /// Index of the free list's head; equals `objects_per_slab` when
    /// the free list is empty (i.e. the slab is full).
    next_available: u32,
}

// SAFETY: a `Slab` is only ever touched while its parent cache's lock
// (or, during construction/destruction, no lock at all with exclusive
// ownership) is held; see the module-level lock-drop discipline in
// `cache.rs`.
unsafe impl Send for Slab {}

unsafe impl Linked for Slab {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link<Self> {
        &mut self.link
    }
}

impl Slab {
    /// The on-disk size of a slab descriptor — needed by the cache
    /// sizing algorithm (§4.6) to decide inside vs. outside placement
    /// and to carve out room for an inside descriptor.
    pub const SIZE: usize = core::mem::size_of::<Slab>();

    /// Initializes a new slab descriptor in place at `at`, covering
    /// `objects` objects of `obj_size` bytes starting at `start`.
    ///
    /// # Safety
    /// `at` must be valid for a `Slab` write and `start..start +
    /// objects * obj_size` must be live, writable memory that nothing
    /// else observes yet.
    pub unsafe fn init(
        at: *mut Slab,
        cache: NonNull<Cache>,
        start: usize,
        objects: usize,
        obj_size: usize,
    ) {
        unsafe {
            at.write(Slab {
                link: Link::new(),
                cache,
                start,
                available: objects,
                next_available: 0,
            });
            for i in 0..objects {
                let node = (start + i * obj_size) as *mut FreeNode;
                let next = if i + 1 == objects { objects as u32 } else { (i + 1) as u32 };
                node.write(FreeNode { next });
            }
        }
    }

    pub fn cache(&self) -> NonNull<Cache> {
        self.cache
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Whether `obj` falls within this slab's object region.
    pub fn contains(&self, obj: NonNull<u8>, objects_per_slab: usize, obj_size: usize) -> bool {
        let addr = obj.as_ptr() as usize;
        addr >= self.start && addr < self.start + objects_per_slab * obj_size
    }

    /// Pops the head of the embedded free list. Caller must have
    /// already checked `available > 0`.
    ///
    /// # Safety
    /// `obj_size` must match the size this slab was initialized with.
    pub unsafe fn pop_free(&mut self, obj_size: usize) -> NonNull<u8> {
        debug_assert!(self.available > 0);
        let index = self.next_available;
        let addr = self.start + index as usize * obj_size;
        let node = unsafe { &*(addr as *const FreeNode) };
        self.next_available = unsafe { node.next };
        self.available -= 1;
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Pushes `obj` back onto the embedded free list.
    ///
    /// # Safety
    /// `obj` must currently be a live object allocated from this slab,
    /// and `obj_size` must match the size this slab was initialized
    /// with.
    pub unsafe fn push_free(&mut self, obj: NonNull<u8>, obj_size: usize) {
        let index = ((obj.as_ptr() as usize) - self.start) / obj_size;
        unsafe {
            (obj.as_ptr() as *mut FreeNode).write(FreeNode {
                next: self.next_available,
            });
        }
        self.next_available = index as u32;
        self.available += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn fake_cache() -> NonNull<Cache> {
        NonNull::<Cache>::dangling()
    }

    #[test]
    fn free_list_is_lifo_within_a_slab() {
        const OBJ_SIZE: usize = 16;
        const OBJECTS: usize = 4;
        let mut storage = [MaybeUninit::<u8>::uninit(); OBJ_SIZE * OBJECTS];
        let mut slab_storage = MaybeUninit::<Slab>::uninit();
        let start = storage.as_mut_ptr() as usize;
        unsafe {
            Slab::init(slab_storage.as_mut_ptr(), fake_cache(), start, OBJECTS, OBJ_SIZE);
        }
        let slab = unsafe { slab_storage.assume_init_mut() };
        assert_eq!(slab.available(), OBJECTS);

        let a = unsafe { slab.pop_free(OBJ_SIZE) };
        let b = unsafe { slab.pop_free(OBJ_SIZE) };
        assert_eq!(slab.available(), OBJECTS - 2);
        assert_ne!(a, b);

        unsafe { slab.push_free(b, OBJ_SIZE) };
        let b2 = unsafe { slab.pop_free(OBJ_SIZE) };
        assert_eq!(b, b2, "LIFO: the most recently freed object is handed out next");
    }

    #[test]
    fn contains_checks_object_range() {
        const OBJ_SIZE: usize = 8;
        const OBJECTS: usize = 2;
        let mut storage = [MaybeUninit::<u8>::uninit(); OBJ_SIZE * OBJECTS];
        let mut slab_storage = MaybeUninit::<Slab>::uninit();
        let start = storage.as_mut_ptr() as usize;
        unsafe {
            Slab::init(slab_storage.as_mut_ptr(), fake_cache(), start, OBJECTS, OBJ_SIZE);
        }
        let slab = unsafe { slab_storage.assume_init_mut() };
        let inside = NonNull::new(start as *mut u8).unwrap();
        let outside = NonNull::new((start + OBJ_SIZE * OBJECTS + 64) as *mut u8).unwrap();
        assert!(slab.contains(inside, OBJECTS, OBJ_SIZE));
        assert!(!slab.contains(outside, OBJECTS, OBJ_SIZE));
    }
}
