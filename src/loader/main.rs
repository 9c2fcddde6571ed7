#![no_std]
#![no_main]

//! Binary entry point. All orchestration lives in the library's
//! `boot`/`entry` modules; this crate only needs to link them in so
//! `_entry` (placed at `.entry` by `stage2.ld`) resolves.

use stage2_boot as _;
