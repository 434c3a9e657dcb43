//! Magazines: bounded LIFO stacks of cached object pointers, and the
//! per-CPU pop/push algorithms built on top of a `current`/`last` pair
//! (§4.4).
//!
//! A single magazine would thrash at the size boundary — an allocator
//! alternating one alloc and one free right at capacity would touch
//! the cache's shared magazine list on every call. The second ("last")
//! magazine buffers that transition.

use core::ptr::NonNull;

use crate::config::MAGAZINE_SIZE;
use crate::core::sync::SpinLock;
use crate::utils::list::{Link, Linked};

/// A bounded LIFO stack of cached object pointers. Magazines are
/// themselves allocated from a dedicated, `no_magazine` magazine
/// cache (breaking the obvious recursion).
pub struct Magazine {
    link: Link<Magazine>,
    size: usize,
    busy: usize,
    objs: [Option<NonNull<u8>>; MAGAZINE_SIZE],
}

// SAFETY: a `Magazine`'s contents are only touched while the owning
// per-CPU slot lock or cache lock is held.
unsafe impl Send for Magazine {}

unsafe impl Linked for Magazine {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link<Self> {
        &mut self.link
    }
}

impl Magazine {
    /// Initializes a new, empty magazine in place at `at` with room
    /// for `capacity` objects (`capacity` must be `<= MAGAZINE_SIZE`;
    /// a `CacheTuning` override can shrink it below the compile-time
    /// default, never grow it, since the backing array is fixed-size).
    pub fn init(at: *mut Magazine, capacity: usize) {
        debug_assert!(capacity > 0 && capacity <= MAGAZINE_SIZE);
        unsafe {
            at.write(Magazine {
                link: Link::new(),
                size: capacity,
                busy: 0,
                objs: [None; MAGAZINE_SIZE],
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.busy == 0
    }

    pub fn is_full(&self) -> bool {
        self.busy == self.size
    }

    pub fn busy(&self) -> usize {
        self.busy
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.busy == 0 {
            return None;
        }
        self.busy -= 1;
        self.objs[self.busy].take()
    }

    fn push(&mut self, obj: NonNull<u8>) -> bool {
        if self.busy == self.size {
            return false;
        }
        self.objs[self.busy] = Some(obj);
        self.busy += 1;
        true
    }

    /// Drains every object still held, calling `sink` for each. Used
    /// by reclaim to return a magazine's contents to its slabs before
    /// destroying it.
    pub fn drain(&mut self, mut sink: impl FnMut(NonNull<u8>)) {
        while let Some(obj) = self.pop() {
            sink(obj);
        }
    }
}

/// Per-`(cache, CPU)` state: a lock plus the `current`/`last` pair.
/// Either slot may be empty (no magazine installed yet).
pub struct PerCpuSlot {
    state: SpinLock<PerCpuState>,
}

struct PerCpuState {
    current: Option<NonNull<Magazine>>,
    last: Option<NonNull<Magazine>>,
}

// SAFETY: all access goes through `state`'s spinlock.
unsafe impl Send for PerCpuSlot {}
unsafe impl Sync for PerCpuSlot {}

impl PerCpuSlot {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(PerCpuState {
                current: None,
                last: None,
            }),
        }
    }

    /// Pop (alloc from magazine), §4.4. `take_shared` is called with
    /// the cache lock dropped inside this slot's lock window to detach
    /// the head of the cache's shared full-magazine list, if any;
    /// `free_to_magazine_cache` returns a drained, empty magazine.
    pub fn pop(
        &self,
        take_shared: impl FnOnce() -> Option<NonNull<Magazine>>,
        free_to_magazine_cache: impl FnOnce(NonNull<Magazine>),
    ) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();

        if let Some(mut current) = state.current {
            if let Some(obj) = unsafe { current.as_mut() }.pop() {
                return Some(obj);
            }
        }

        if let Some(last) = state.last {
            if unsafe { last.as_ref() }.busy() > 0 {
                let s = &mut *state;
                core::mem::swap(&mut s.current, &mut s.last);
                let mut current = state.current.unwrap();
                return unsafe { current.as_mut() }.pop();
            }
        }

        let Some(full) = take_shared() else {
            return None;
        };

        if let Some(old_last) = state.last {
            free_to_magazine_cache(old_last);
        }
        state.last = state.current;
        state.current = Some(full);

        unsafe { state.current.unwrap().as_mut() }.pop()
    }

    /// Push (free to magazine), §4.4. `alloc_empty` must allocate a
    /// fresh, empty magazine with `ATOMIC | NO_RECLAIM` semantics (the
    /// caller enforces that via the flags it passes to the magazine
    /// cache); `push_shared` parks a full magazine on the cache's
    /// shared list.
    ///
    /// Returns `false` if no empty magazine could be obtained, in
    /// which case the caller must fall back to freeing `obj` directly
    /// to its slab.
    pub fn push(
        &self,
        obj: NonNull<u8>,
        alloc_empty: impl FnOnce() -> Option<NonNull<Magazine>>,
        push_shared: impl FnOnce(NonNull<Magazine>),
    ) -> bool {
        let mut state = self.state.lock();

        if let Some(mut current) = state.current {
            if unsafe { current.as_mut() }.push(obj) {
                return true;
            }
        }

        if let Some(last) = state.last {
            if unsafe { last.as_ref() }.busy() < unsafe { last.as_ref() }.size {
                let s = &mut *state;
                core::mem::swap(&mut s.current, &mut s.last);
                return unsafe { state.current.unwrap().as_mut() }.push(obj);
            }
        }

        let Some(mut fresh) = alloc_empty() else {
            return false;
        };

        if let Some(old_last) = state.last {
            push_shared(old_last);
        }
        state.last = state.current;
        state.current = Some(fresh);
        unsafe { fresh.as_mut() }.push(obj);
        true
    }
}

impl PerCpuSlot {
    /// Removes and returns both magazines, leaving the slot empty.
    /// Used by aggressive reclaim (§4.7) to drain per-CPU state.
    pub fn take_all(&self) -> (Option<NonNull<Magazine>>, Option<NonNull<Magazine>>) {
        let mut state = self.state.lock();
        (state.current.take(), state.last.take())
    }
}

impl Default for PerCpuSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn new_magazine() -> NonNull<Magazine> {
        let storage = alloc::boxed::Box::leak(alloc::boxed::Box::new(MaybeUninit::<Magazine>::uninit()));
        Magazine::init(storage.as_mut_ptr(), MAGAZINE_SIZE);
        unsafe { NonNull::new_unchecked(storage.as_mut_ptr()) }
    }

    fn fake_obj(tag: usize) -> NonNull<u8> {
        NonNull::new(tag as *mut u8).unwrap()
    }

    #[test]
    fn push_then_pop_is_lifo() {
        let slot = PerCpuSlot::new();
        let a = fake_obj(0x1000);
        let b = fake_obj(0x2000);
        assert!(slot.push(a, || Some(new_magazine()), |_| unreachable!()));
        assert!(slot.push(b, || Some(new_magazine()), |_| unreachable!()));
        assert_eq!(slot.pop(|| None, |_| {}), Some(b));
        assert_eq!(slot.pop(|| None, |_| {}), Some(a));
        assert_eq!(slot.pop(|| None, |_| {}), None);
    }

    #[test]
    fn overflow_parks_last_on_shared_list() {
        let slot = PerCpuSlot::new();
        let parked = core::cell::Cell::new(false);
        for i in 0..MAGAZINE_SIZE + 1 {
            slot.push(
                fake_obj(0x1000 + i),
                || Some(new_magazine()),
                |_mag| parked.set(true),
            );
        }
        // Filling `current`, then overflowing into a second magazine
        // should not yet have pushed anything onto the shared list
        // (only the *old last*, which started empty, is pushed).
        assert!(!parked.get());
    }

    #[test]
    fn underflow_pulls_from_shared_list() {
        let slot = PerCpuSlot::new();
        let shared = new_magazine();
        unsafe { shared.as_ptr().as_mut().unwrap() }.push(fake_obj(0x3000));
        let obj = slot.pop(|| Some(shared), |_| unreachable!());
        assert_eq!(obj, Some(fake_obj(0x3000)));
    }
}
