//! Architecture-specific primitives the allocator depends on: the
//! current CPU's id (for indexing per-CPU magazine slots) and local
//! interrupt disable/restore (for the reentrancy discipline in
//! `mm::cache`).

pub mod cpu;
pub mod interrupts;

pub use cpu::{cpu_count, current_cpu_id};
pub use interrupts::IrqGuard;
