//! `kalloc`/`kfree`: a power-of-two size-class front-end over the
//! cache layer (§4.9), the same role `malloc-8` .. `malloc-128K`
//! serve in the source. Every request is rounded up to the smallest
//! class that fits and handed to that class's cache; `kfree` recovers
//! the owning cache through the frame back-pointer, so the caller
//! never has to remember which class an allocation came from.

use core::ptr::NonNull;

use crate::config::{MALLOC_MAX_SHIFT, MALLOC_MIN_SHIFT, MALLOC_NUM_CLASSES, MIN_ALIGN};
use crate::core::mm::cache::{AllocFlags, CacheFlags, CacheRef};
use crate::core::mm::registry;
use crate::core::mm::SlabError;
use crate::core::sync::SpinLock;

static MALLOC_CACHES: SpinLock<[Option<CacheRef>; MALLOC_NUM_CLASSES]> =
    SpinLock::new([None; MALLOC_NUM_CLASSES]);

fn class_name(shift: u32) -> &'static str {
    match shift {
        3 => "malloc-8",
        4 => "malloc-16",
        5 => "malloc-32",
        6 => "malloc-64",
        7 => "malloc-128",
        8 => "malloc-256",
        9 => "malloc-512",
        10 => "malloc-1K",
        11 => "malloc-2K",
        12 => "malloc-4K",
        13 => "malloc-8K",
        14 => "malloc-16K",
        15 => "malloc-32K",
        16 => "malloc-64K",
        17 => "malloc-128K",
        _ => "malloc-?",
    }
}

fn shift_for_size(size: usize) -> Option<u32> {
    let size = size.max(1);
    let shift = usize::BITS - (size - 1).leading_zeros().min(usize::BITS - 1);
    let shift = shift.max(MALLOC_MIN_SHIFT);
    (shift <= MALLOC_MAX_SHIFT).then_some(shift)
}

/// Builds the `MALLOC_NUM_CLASSES` size-class caches. Must run after
/// [`registry::bootstrap`].
pub fn init() -> Result<(), SlabError> {
    let mut caches = MALLOC_CACHES.lock();
    for shift in MALLOC_MIN_SHIFT..=MALLOC_MAX_SHIFT {
        let size = 1usize << shift;
        let cache = registry::create(
            class_name(shift),
            size,
            MIN_ALIGN,
            None,
            None,
            CacheFlags::empty(),
            None,
        )?;
        caches[(shift - MALLOC_MIN_SHIFT) as usize] = Some(CacheRef(cache));
    }
    Ok(())
}

/// Allocates at least `size` bytes, or returns `None` if `size`
/// exceeds the largest class or every class-appropriate cache is out
/// of frames (§4.8's null-on-failure contract — `kalloc` never
/// panics for an oversized or OOM request).
pub fn kalloc(size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
    let shift = shift_for_size(size)?;
    let cache = MALLOC_CACHES.lock()[(shift - MALLOC_MIN_SHIFT) as usize]?.0;
    unsafe { cache.as_ref() }.alloc(flags)
}

/// Frees an allocation obtained from [`kalloc`].
///
/// # Safety
/// `ptr` must have been returned by [`kalloc`] and not already freed.
pub unsafe fn kfree(ptr: NonNull<u8>) {
    let frame_source = registry::frame_source().expect("kfree before kalloc::init");
    let owning_slab = frame_source
        .descriptor(ptr.as_ptr() as usize)
        .slab_owner()
        .expect("kfree: address has no owning slab");
    let cache = unsafe { owning_slab.as_ref() }.cache();
    unsafe { cache.as_ref() }.free(ptr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mm::registry::ensure_bootstrapped_for_tests;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_ready() {
        ensure_bootstrapped_for_tests();
        INIT.call_once(|| {
            init().unwrap();
        });
    }

    #[test]
    fn rounds_up_to_the_enclosing_class() {
        crate::arch::cpu::set_test_cpu_id(20);
        ensure_ready();
        let p = kalloc(10, AllocFlags::empty()).unwrap();
        unsafe { kfree(p) };
    }

    #[test]
    fn oversized_request_returns_none() {
        crate::arch::cpu::set_test_cpu_id(21);
        ensure_ready();
        assert!(kalloc((1 << MALLOC_MAX_SHIFT) + 1, AllocFlags::empty()).is_none());
    }

    #[test]
    fn many_small_allocations_round_trip() {
        crate::arch::cpu::set_test_cpu_id(22);
        ensure_ready();
        let mut ptrs = alloc::vec::Vec::new();
        for i in 0..256 {
            ptrs.push(kalloc(16 + (i % 5) * 8, AllocFlags::empty()).unwrap());
        }
        for p in ptrs {
            unsafe { kfree(p) };
        }
    }
}
