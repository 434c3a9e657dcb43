//! Compile-time tunables for the allocator.
//!
//! These used to be unexposed macros in the original implementation
//! (`SLAB_MAX_BADNESS`, `SLAB_MAG_SIZE`, the malloc size-class range).
//! Centralizing them here makes each one a documented, overridable
//! constant instead of a magic number buried in the algorithm.

/// Size of a physical page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Maximum number of CPUs the allocator has per-CPU state for.
///
/// The source treats CPU topology as static for the lifetime of the
/// system; this crate preserves that assumption. A CPU whose id is
/// taken from a per-CPU slot while offlined for hotplug/suspend is not
/// handled specially, matching the original (see DESIGN.md).
pub const MAX_CPUS: usize = 64;

/// Numerator/denominator of the maximum tolerated "badness" (wasted
/// space in a slab) as a fraction of slab size. The source compares
/// against an undocumented macro; `1/8` matches the fraction used by
/// contemporary Solaris/Linux-derived slab allocators of the same era
/// and keeps the growth loop in `cache::sizing` terminating quickly.
pub const MAX_BADNESS_NUMERATOR: usize = 1;
pub const MAX_BADNESS_DENOMINATOR: usize = 8;

/// Default capacity of one per-CPU magazine.
pub const MAGAZINE_SIZE: usize = 16;

/// `kalloc`/`kfree` size classes run from `2^MALLOC_MIN_SHIFT` to
/// `2^MALLOC_MAX_SHIFT` bytes, matching `generic/src/mm/slab.c`'s
/// `malloc-8` .. `malloc-128K` table (15 classes).
pub const MALLOC_MIN_SHIFT: u32 = 3;
pub const MALLOC_MAX_SHIFT: u32 = 17;
pub const MALLOC_NUM_CLASSES: usize = (MALLOC_MAX_SHIFT - MALLOC_MIN_SHIFT + 1) as usize;

/// Minimum object alignment: at least one machine word, so the
/// embedded free-list index always fits without clobbering adjacent
/// objects.
pub const MIN_ALIGN: usize = core::mem::size_of::<usize>();

pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
