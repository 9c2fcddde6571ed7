//! Static physical memory layout table (C3). Generalizes the single
//! `memlayout::VIRTIO0`-style constant the teacher's kernel kept into the
//! full zone table spec.md §4.3 requires: named, permission-tagged,
//! non-overlapping physical regions, validated before any allocator or
//! DMA buffer is used.

use bitflags::bitflags;

use crate::error::ErrorCode;

pub const DRAM_BASE: u64 = 0x8000_0000;
pub const DRAM_SIZE: u64 = 128 * 1024 * 1024;
pub const DRAM_END: u64 = DRAM_BASE + DRAM_SIZE;

bitflags! {
    /// Advisory, pre-MMU protection tag. Nothing enforces this until a
    /// kernel activates the MMU; it is metadata carried across the
    /// hand-off, not a hardware mechanism.
    pub struct Protection: u8 {
        const R = 0b001;
        const W = 0b010;
        const X = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub name: &'static str,
    pub base: u64,
    pub size: u64,
    pub prot: Protection,
}

impl Zone {
    pub const fn new(name: &'static str, base: u64, size: u64, prot: Protection) -> Self {
        Self {
            name,
            base,
            size,
            prot,
        }
    }

    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

pub const KERNEL_ZONE: Zone = Zone::new("kernel", 0x8000_0000, 0x3_0000, Protection::all());
pub const STAGE2_ZONE: Zone = Zone::new(
    "stage2",
    0x8003_0000,
    0x1_0000,
    Protection::from_bits_truncate(Protection::R.bits() | Protection::X.bits()),
);
pub const BOOTINFO_ZONE: Zone = Zone::new(
    "bootinfo",
    0x8004_0000,
    0x1_0000,
    Protection::from_bits_truncate(Protection::R.bits() | Protection::W.bits()),
);
pub const VIRTIO_DMA_ZONE: Zone = Zone::new(
    "virtio_dma",
    0x8005_0000,
    0x1_0000,
    Protection::from_bits_truncate(Protection::R.bits() | Protection::W.bits()),
);
pub const SCRATCH_ZONE: Zone = Zone::new(
    "scratch",
    0x8006_0000,
    0x1_0000,
    Protection::from_bits_truncate(Protection::R.bits() | Protection::W.bits()),
);

pub const ZONES: [Zone; 5] = [
    KERNEL_ZONE,
    STAGE2_ZONE,
    BOOTINFO_ZONE,
    VIRTIO_DMA_ZONE,
    SCRATCH_ZONE,
];

/// Checks pairwise non-overlap and DRAM containment for every zone in
/// `zones`. Pure and idempotent (spec.md §8).
pub fn validate(zones: &[Zone]) -> Result<(), ErrorCode> {
    for z in zones {
        if z.base < DRAM_BASE || z.end() > DRAM_END {
            return Err(ErrorCode::MemoryOutOfBounds);
        }
    }
    for i in 0..zones.len() {
        for j in (i + 1)..zones.len() {
            let (a, b) = (&zones[i], &zones[j]);
            let disjoint = a.end() <= b.base || b.end() <= a.base;
            if !disjoint {
                return Err(ErrorCode::MemoryOverlap);
            }
        }
    }
    Ok(())
}

/// `check(addr, prot)`: placeholder pre-MMU enforcement. Returns `true`
/// outside every recorded zone (nothing claims that address, so nothing
/// to violate), `false` if `addr` falls in a zone whose recorded
/// protection does not permit `prot` (spec.md §4.3).
pub fn check(zones: &[Zone], addr: u64, prot: Protection) -> bool {
    for z in zones {
        if z.contains(addr) {
            return z.prot.contains(prot);
        }
    }
    true
}

#[cfg(target_os = "none")]
pub fn print(zones: &[Zone]) {
    use crate::println;

    println!("memory layout:");
    for z in zones {
        println!(
            "  {:<10} {:#010x}-{:#010x} ({:#x} bytes) {:?}",
            z.name,
            z.base,
            z.end(),
            z.size,
            z.prot
        );
    }
    for i in 1..zones.len() {
        let gap = zones[i].base as i64 - zones[i - 1].end() as i64;
        if gap > 0 {
            println!("  gap after {}: {:#x} bytes", zones[i - 1].name, gap);
        }
    }
}
