//! The global cache registry: bootstrap sequence, cache
//! creation/destruction, and the reclaim driver that walks every live
//! cache (§4.7, §9 "Bootstrap ordering").
//!
//! Three caches exist before any user cache can: a `no_magazine`
//! cache for [`Magazine`] storage, a `no_magazine` cache for [`Cache`]
//! descriptors themselves (so creating a cache doesn't recurse into
//! the cache it's creating), and a magazine-enabled cache for
//! outside-placed [`Slab`] descriptors. All three are force-inside so
//! none of them depend on a descriptor cache that doesn't exist yet.

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::core::mm::cache::{Cache, CacheFlags, CacheRef, CacheTuning, Ctor, Dtor};
use crate::core::mm::frame::FrameSource;
use crate::core::mm::magazine::Magazine;
use crate::core::mm::slab::Slab;
use crate::core::mm::SlabError;
use crate::core::sync::SpinLock;
use crate::utils::list::IntrusiveList;

static FRAME_SOURCE: SpinLock<Option<&'static dyn FrameSource>> = SpinLock::new(None);

/// Every live cache, bootstrap caches included. The outermost lock in
/// the ordering hierarchy (§4.7): acquired only to splice a cache in
/// or out of the list, never held across a per-cache operation.
static CACHES: SpinLock<IntrusiveList<Cache>> = SpinLock::new(IntrusiveList::new());

static MAGAZINE_CACHE_STORAGE: SpinLock<MaybeUninit<Cache>> = SpinLock::new(MaybeUninit::uninit());
static CACHE_CACHE_STORAGE: SpinLock<MaybeUninit<Cache>> = SpinLock::new(MaybeUninit::uninit());
static SLAB_CACHE_STORAGE: SpinLock<MaybeUninit<Cache>> = SpinLock::new(MaybeUninit::uninit());

static MAGAZINE_CACHE: SpinLock<Option<CacheRef>> = SpinLock::new(None);
static CACHE_CACHE: SpinLock<Option<CacheRef>> = SpinLock::new(None);
static SLAB_CACHE: SpinLock<Option<CacheRef>> = SpinLock::new(None);

pub(crate) fn frame_source() -> Result<&'static dyn FrameSource, SlabError> {
    FRAME_SOURCE.lock().ok_or(SlabError::NotInitialized)
}

/// Brings the registry up: records the frame source every cache will
/// draw frames from, then builds the three bootstrap caches in place
/// in static storage (never freed, never moved). Must be called
/// exactly once before any other `registry`/`cache`/`kalloc` entry
/// point.
pub fn bootstrap(frame_source: &'static dyn FrameSource) -> Result<(), SlabError> {
    let mut fs = FRAME_SOURCE.lock();
    if fs.is_some() {
        return Err(SlabError::AlreadyInitialized);
    }
    *fs = Some(frame_source);
    drop(fs);

    let magazine_cache = Cache::new(
        "magazine",
        core::mem::size_of::<Magazine>(),
        core::mem::align_of::<Magazine>(),
        None,
        None,
        CacheFlags::NO_MAGAZINE | CacheFlags::FORCE_INSIDE,
        None,
        frame_source,
        None,
        None,
    );
    let magazine_ptr = unsafe {
        let mut guard = MAGAZINE_CACHE_STORAGE.lock();
        let ptr = guard.as_mut_ptr();
        ptr.write(magazine_cache);
        NonNull::new_unchecked(ptr)
    };

    let cache_cache = Cache::new(
        "cache_t",
        core::mem::size_of::<Cache>(),
        core::mem::align_of::<Cache>(),
        None,
        None,
        CacheFlags::NO_MAGAZINE | CacheFlags::FORCE_INSIDE,
        None,
        frame_source,
        None,
        None,
    );
    let cache_cache_ptr = unsafe {
        let mut guard = CACHE_CACHE_STORAGE.lock();
        let ptr = guard.as_mut_ptr();
        ptr.write(cache_cache);
        NonNull::new_unchecked(ptr)
    };

    let slab_cache = Cache::new(
        "slab_t",
        core::mem::size_of::<Slab>(),
        core::mem::align_of::<Slab>(),
        None,
        None,
        CacheFlags::FORCE_INSIDE,
        None,
        frame_source,
        Some(magazine_ptr),
        None,
    );
    let slab_cache_ptr = unsafe {
        let mut guard = SLAB_CACHE_STORAGE.lock();
        let ptr = guard.as_mut_ptr();
        ptr.write(slab_cache);
        NonNull::new_unchecked(ptr)
    };

    *MAGAZINE_CACHE.lock() = Some(CacheRef(magazine_ptr));
    *CACHE_CACHE.lock() = Some(CacheRef(cache_cache_ptr));
    *SLAB_CACHE.lock() = Some(CacheRef(slab_cache_ptr));

    let mut caches = CACHES.lock();
    unsafe {
        caches.push_back(magazine_ptr);
        caches.push_back(cache_cache_ptr);
        caches.push_back(slab_cache_ptr);
    }

    Ok(())
}

/// Creates a new, independently reclaimable object cache. The
/// returned pointer is stable for the cache's lifetime (its
/// descriptor lives in the cache-descriptor cache, not on the
/// caller's stack).
#[allow(clippy::too_many_arguments)]
pub fn create(
    name: &'static str,
    size: usize,
    align: usize,
    ctor: Option<Ctor>,
    dtor: Option<Dtor>,
    flags: CacheFlags,
    tuning: Option<CacheTuning>,
) -> Result<NonNull<Cache>, SlabError> {
    if size == 0 {
        return Err(SlabError::InvalidSize);
    }
    let frame_source = frame_source()?;

    let cache_cache = CACHE_CACHE.lock().ok_or(SlabError::NotInitialized)?.0;
    let magazine_cache = if flags.contains(CacheFlags::NO_MAGAZINE) {
        None
    } else {
        Some(MAGAZINE_CACHE.lock().ok_or(SlabError::NotInitialized)?.0)
    };
    let outside_cache = if flags.contains(CacheFlags::FORCE_INSIDE) {
        None
    } else {
        Some(SLAB_CACHE.lock().ok_or(SlabError::NotInitialized)?.0)
    };

    let raw = unsafe { cache_cache.as_ref() }
        .alloc(crate::core::mm::cache::AllocFlags::empty())
        .ok_or(SlabError::NotInitialized)?;
    let cache_ptr = raw.cast::<Cache>();

    let cache = Cache::new(
        name,
        size,
        align,
        ctor,
        dtor,
        flags,
        tuning,
        frame_source,
        magazine_cache,
        outside_cache,
    );
    unsafe { cache_ptr.as_ptr().write(cache) };

    unsafe { CACHES.lock().push_back(cache_ptr) };
    Ok(cache_ptr)
}

/// Destroys a cache created with [`create`]. Fatal (via
/// [`Cache::assert_empty_for_destroy`]) if the cache still has
/// outstanding allocations after an aggressive reclaim — matching the
/// source's "destroying a cache with live objects is a programmer
/// error" contract (§4.8).
///
/// # Safety
/// `cache` must have been returned by [`create`] and not already
/// destroyed.
pub unsafe fn destroy(cache: NonNull<Cache>) {
    unsafe { cache.as_ref() }.reclaim(true);
    unsafe { cache.as_ref() }.assert_empty_for_destroy();

    unsafe { CACHES.lock().unlink(cache) };

    let cache_cache = CACHE_CACHE.lock().expect("registry not initialized").0;
    unsafe { cache_cache.as_ref() }.free(cache.cast::<u8>());
}

/// Walks every registered cache, reclaiming unused slabs. Returns the
/// total number of frames released. Called periodically by whatever
/// drives reclaim in this kernel (a low-memory notification, a timer,
/// or an explicit operator request — see §4.7 and §6).
pub fn reclaim_all(aggressive: bool) -> usize {
    let caches = CACHES.lock();
    let mut freed = 0usize;
    for cache in unsafe { caches.iter() } {
        freed += unsafe { cache.as_ref() }.reclaim(aggressive);
    }
    freed
}

/// Invokes `f` once per registered cache, in registration order. Used
/// to build the operator-facing stats table (§6).
pub fn for_each(mut f: impl FnMut(&Cache)) {
    let caches = CACHES.lock();
    for cache in unsafe { caches.iter() } {
        f(unsafe { cache.as_ref() });
    }
}

/// Idempotent bootstrap for the test binary, where many `#[test]`
/// functions across modules share one process and therefore one copy
/// of the registry's statics. Real callers use [`bootstrap`] directly
/// and are expected to call it exactly once.
#[cfg(test)]
pub(crate) fn ensure_bootstrapped_for_tests() {
    use crate::core::mm::frame::test_support::make_frame_source;

    static DONE: SpinLock<bool> = SpinLock::new(false);
    let mut done = DONE.lock();
    if *done {
        return;
    }
    let frame_source: &'static dyn FrameSource =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(make_frame_source(1 << 16)));
    bootstrap(frame_source).expect("one-time test bootstrap");
    *done = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mm::cache::AllocFlags;

    #[test]
    fn create_alloc_free_and_destroy_a_cache() {
        crate::arch::cpu::set_test_cpu_id(10);
        ensure_bootstrapped_for_tests();

        let cache = create("widgets", 40, 8, None, None, CacheFlags::empty(), None).unwrap();

        let obj = unsafe { cache.as_ref() }.alloc(AllocFlags::empty()).unwrap();
        unsafe { cache.as_ref() }.free(obj);
        unsafe { destroy(cache) };
    }

    /// Regression for a cache sized so exactly one object fits per
    /// slab (true of `malloc-4K` .. `malloc-128K`, see
    /// `kalloc::class_name`): the slab's only object going from
    /// allocated to free makes it *both* full->partial and
    /// partial->fully-free in the same `free` call. Both transitions
    /// must fire, so the frame is released immediately rather than
    /// the slab lingering forever on the partial list (§8.3, §8
    /// "boundary behaviours").
    #[test]
    fn single_object_slabs_release_their_frame_on_free() {
        crate::arch::cpu::set_test_cpu_id(12);
        ensure_bootstrapped_for_tests();

        let cache = create(
            "big-objects",
            crate::config::PAGE_SIZE,
            crate::config::MIN_ALIGN,
            None,
            None,
            CacheFlags::empty(),
            None,
        )
        .unwrap();
        assert_eq!(
            unsafe { cache.as_ref() }.objects_per_slab(),
            1,
            "this test only exercises the objects_per_slab == 1 edge case"
        );

        let obj = unsafe { cache.as_ref() }.alloc(AllocFlags::empty()).unwrap();
        assert_eq!(unsafe { cache.as_ref() }.allocated_slabs(), 1);

        unsafe { cache.as_ref() }.free(obj);
        assert_eq!(
            unsafe { cache.as_ref() }.allocated_slabs(),
            0,
            "single-object slab must release its frame immediately on free, not wait on the partial list"
        );

        unsafe { destroy(cache) };
    }

    /// S5: bootstrap from nothing, then allocate once from each
    /// size-class cache `kalloc::init` builds on top of the registry.
    /// Nothing here should recurse infinitely or deadlock — the
    /// magazine cache and cache-descriptor cache are `no_magazine`
    /// precisely to keep that from happening (§9).
    #[test]
    fn self_hosting_init_covers_every_malloc_class() {
        use crate::core::mm::kalloc;

        crate::arch::cpu::set_test_cpu_id(11);
        ensure_bootstrapped_for_tests();
        kalloc::init().unwrap();

        for shift in crate::config::MALLOC_MIN_SHIFT..=crate::config::MALLOC_MAX_SHIFT {
            let size = 1usize << shift;
            let p = kalloc::kalloc(size, AllocFlags::empty())
                .unwrap_or_else(|| panic!("malloc class for size {size} failed to allocate"));
            unsafe { kalloc::kfree(p) };
        }
    }

    /// S3: 4 simulated CPUs hammering one shared cache concurrently.
    /// Each (host) thread pins a distinct synthetic CPU id so the
    /// per-CPU magazine layer actually fans out across separate
    /// `PerCpuSlot`s instead of serializing on one. Expected: no lost
    /// objects, outstanding count returns to zero.
    #[test]
    fn smp_sharing_under_concurrent_alloc_free() {
        ensure_bootstrapped_for_tests();
        let cache = create("smp-widgets", 64, 8, None, None, CacheFlags::empty(), None).unwrap();
        let cache_addr = cache.as_ptr() as usize;

        const CPUS: usize = 4;
        const ITERS: usize = 10_000;

        let handles: alloc::vec::Vec<_> = (0..CPUS)
            .map(|cpu_id| {
                std::thread::spawn(move || {
                    crate::arch::cpu::set_test_cpu_id(100 + cpu_id);
                    let cache = unsafe { &*(cache_addr as *const Cache) };
                    for i in 0..ITERS {
                        let obj = cache.alloc(AllocFlags::empty()).unwrap();
                        if i % 3 == 0 {
                            // Occasionally hold a second object before
                            // freeing both, so frees don't always
                            // mirror allocs in strict LIFO order.
                            let obj2 = cache.alloc(AllocFlags::empty()).unwrap();
                            cache.free(obj);
                            cache.free(obj2);
                        } else {
                            cache.free(obj);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(unsafe { cache.as_ref() }.allocated_objects(), 0);
        unsafe { destroy(cache) };
    }
}
