//! Local interrupt disable/restore.
//!
//! `Cache::alloc`/`Cache::free` disable local interrupts before touching
//! per-CPU magazine state: an interrupt handler on the same CPU could
//! otherwise reenter the allocator and deadlock on a spinlock the
//! interrupted thread already holds (spec.md §4.5).

/// RAII guard that restores the saved interrupt-enable state on drop.
#[must_use = "interrupts are re-enabled when the guard is dropped"]
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    /// Disables local interrupts, returning a guard that restores the
    /// prior state when dropped.
    pub fn disable() -> Self {
        let was_enabled = local_disable();
        Self { was_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            local_enable();
        }
    }
}

/// Disables local interrupts and returns whether they were enabled
/// beforehand.
fn local_disable() -> bool {
    #[cfg(test)]
    {
        // Hosted tests have no interrupt controller; nothing to do,
        // and nothing was "enabled" to restore.
        false
    }

    #[cfg(not(test))]
    {
        #[cfg(target_arch = "x86_64")]
        {
            let flags: u64;
            unsafe {
                core::arch::asm!("pushfq; pop {}; cli", out(reg) flags, options(nomem));
            }
            flags & (1 << 9) != 0
        }

        #[cfg(target_arch = "aarch64")]
        {
            let daif: u64;
            unsafe {
                core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
                core::arch::asm!("msr daifset, #2", options(nomem, nostack));
            }
            daif & (1 << 7) == 0
        }

        #[cfg(target_arch = "riscv64")]
        {
            let was_enabled: usize;
            unsafe {
                core::arch::asm!("csrrci {}, sstatus, 0x2", out(reg) was_enabled, options(nomem, nostack));
            }
            was_enabled & 0x2 != 0
        }

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "riscv64"
        )))]
        {
            false
        }
    }
}

/// Re-enables local interrupts unconditionally.
fn local_enable() {
    #[cfg(not(test))]
    {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }

        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
        }

        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("csrsi sstatus, 0x2", options(nomem, nostack));
        }
    }
}
