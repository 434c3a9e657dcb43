//! Synchronization primitives.
//!
//! The allocator needs exactly one kind of lock: a short-held spinlock
//! that is safe to acquire from interrupt context once local interrupts
//! are disabled (see `arch::interrupts`).

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
