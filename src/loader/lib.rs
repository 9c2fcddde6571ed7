#![cfg_attr(not(test), no_std)]

//! Second-stage RISC-V boot loader library. Pure logic modules (error
//! taxonomy, memory layout table, bump allocator, ELF parsing,
//! hardware descriptor, device description builder, boot info record)
//! stay host-testable; only the modules that actually touch MMIO or
//! CSRs are gated to `target_os = "none"`, the same split the teacher
//! draws between its `#[cfg(target_os = "none")]` hardware modules and
//! its always-built pure ones (`fs`, `stat`).

#[cfg(target_os = "none")]
#[macro_use]
pub mod trace;
#[cfg(not(target_os = "none"))]
pub mod trace;

#[cfg(target_os = "none")]
pub mod entry;

pub mod bootinfo;
pub mod bump;
pub mod devdesc;
pub mod elf;
pub mod error;
pub mod hardware;
pub mod memlayout;
pub mod riscv;
pub mod virtio;

#[cfg(target_os = "none")]
pub mod boot;
