//! RISC-V primitives the loader needs: page rounding and the two fence
//! forms the fence discipline (spec.md §5/§9) requires. Everything here
//! is a thin, testable wrapper; the actual `fence`/`fence.i` instructions
//! only run on target, gated the same way the teacher gates CSR access.

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(sz: usize) -> usize {
    sz & !(PGSIZE - 1)
}

/// Full read-write fence. Required around every `QUEUE_NOTIFY` write and
/// every poll of `used.idx` (spec.md §4.5/§9), and the `core::sync::atomic`
/// fence alone is not sufficient on its own for MMIO ordering against a
/// device, so this wraps the architectural `fence` instruction directly.
#[cfg(target_arch = "riscv64")]
#[inline(always)]
pub fn fence_rw() {
    unsafe { core::arch::asm!("fence rw, rw") };
}

#[cfg(not(target_arch = "riscv64"))]
#[inline(always)]
pub fn fence_rw() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Instruction fence. Issued exactly once, immediately before the jump to
/// the kernel (spec.md §9). Delegates to the `riscv` crate's wrapper
/// rather than hand-rolling the instruction, the same crate the teacher
/// leans on for CSR/asm primitives.
#[cfg(target_arch = "riscv64")]
#[inline(always)]
pub fn fence_i() {
    riscv::asm::fence_i();
}

#[cfg(not(target_arch = "riscv64"))]
#[inline(always)]
pub fn fence_i() {}
