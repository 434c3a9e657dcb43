//! CPU identification.
//!
//! The allocator indexes per-CPU magazine slots by `current_cpu_id()`,
//! so this only needs to be stable and dense per boot, not globally
//! unique or meaningful beyond that.

#[cfg(any(test, target_arch = "aarch64", target_arch = "riscv64"))]
use crate::config::MAX_CPUS;

/// Returns the id of the CPU this code is currently running on.
///
/// In `#[cfg(test)]` builds (hosted, no real per-CPU register state)
/// this reads a thread-local set by the test harness so that
/// multi-threaded tests can exercise the per-CPU magazine paths; see
/// `mm::cache::tests`.
pub fn current_cpu_id() -> usize {
    #[cfg(test)]
    {
        TEST_CPU_ID.with(|id| id.get())
    }

    #[cfg(not(test))]
    {
        #[cfg(target_arch = "aarch64")]
        {
            let mpidr: u64;
            unsafe {
                core::arch::asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack));
            }
            (mpidr & 0xFF) as usize % MAX_CPUS
        }

        #[cfg(target_arch = "riscv64")]
        {
            riscv::register::mhartid::read() % MAX_CPUS
        }

        #[cfg(target_arch = "x86_64")]
        {
            // A production build would read the LAPIC id; until then a
            // single-CPU fallback keeps the allocator correct (just
            // without SMP fan-out).
            0
        }

        #[cfg(not(any(
            target_arch = "aarch64",
            target_arch = "riscv64",
            target_arch = "x86_64"
        )))]
        {
            0
        }
    }
}

/// Total number of CPUs the system was booted with. Treated as static
/// for the allocator's lifetime (see DESIGN.md on CPU hotplug).
pub fn cpu_count() -> usize {
    #[cfg(test)]
    {
        MAX_CPUS
    }

    #[cfg(not(test))]
    {
        1
    }
}

#[cfg(test)]
std::thread_local! {
    static TEST_CPU_ID: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

/// Test-only helper: pin the calling (host) thread to a synthetic CPU
/// id so SMP scenarios (spec.md S3) can be exercised with real OS
/// threads against the per-CPU magazine slots.
#[cfg(test)]
pub fn set_test_cpu_id(id: usize) {
    TEST_CPU_ID.with(|cell| cell.set(id));
}
