//! Error ledger (C4). A closed, numeric, grouped error taxonomy plus a
//! fixed-size counter table and pluggable per-code handlers, grounded in
//! the teacher's closed numbered-enum idiom (`sysctbl::SysCallNum`) and
//! its "trace then loop" panic path (`printf.rs`).
//!
//! No allocator exists below C2 at the point most of these errors can
//! occur, so handlers are plain function pointers in a fixed table, not
//! `Box<dyn Fn>`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,

    InvalidParam = 1,
    OutOfMemory = 2,
    Timeout = 3,
    NotFound = 4,
    PermissionDenied = 5,

    HardwareFault = 11,
    DeviceNotReady = 12,
    DeviceTimeout = 13,
    DeviceError = 14,
    InvalidDevice = 15,

    VirtioInitFailed = 21,
    VirtioQueueFull = 22,
    VirtioBadResponse = 23,
    VirtioDeviceError = 24,

    ElfInvalidMagic = 31,
    ElfInvalidClass = 32,
    ElfInvalidEndian = 33,
    ElfNoSegments = 34,
    ElfLoadFailed = 35,
    // Not in spec.md §7's taxonomy table, but required by §8's boundary
    // behaviors (e_phnum == 0 or 17 must report `ElfInvalidPhnum`);
    // numbered within the elf group's reserved 31-40 range. See
    // DESIGN.md "Open Question decisions".
    ElfInvalidPhnum = 36,

    MemoryOverlap = 41,
    MemoryOutOfBounds = 42,
    MemoryProtection = 43,
    MemoryAlignment = 44,

    DiskReadFailed = 51,
    DiskWriteFailed = 52,
    DiskBadSector = 53,
    DiskNotReady = 54,

    BootInvalidStage = 61,
    BootKernelInvalid = 62,
    BootMemoryConflict = 63,
    BootDeviceTreeFailed = 64,

    SystemHalt = 71,
    CriticalFailure = 72,
}

impl ErrorCode {
    pub const fn is_hardware_class(self) -> bool {
        (self as u32) >= 11 && (self as u32) <= 20
    }

    pub const fn is_disk_class(self) -> bool {
        (self as u32) >= 51 && (self as u32) <= 60
    }

    /// Index into a dense counter table. One more than the highest
    /// assigned discriminant above.
    const fn index(self) -> usize {
        self as u32 as usize
    }
}

const TABLE_LEN: usize = 73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Retry,
    Fallback,
    Abort,
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: &'static str,
    pub function: &'static str,
    pub line: u32,
    pub context: [u64; 4],
}

/// Default handler: hardware-class codes retry, the two system codes
/// abort, everything else just continues (spec.md §4.4).
fn generic_handler(code: ErrorCode) -> Action {
    if code.is_hardware_class() {
        Action::Retry
    } else if matches!(code, ErrorCode::SystemHalt | ErrorCode::CriticalFailure) {
        Action::Abort
    } else {
        Action::Continue
    }
}

/// Disk handler: retries the first two occurrences of a given disk-class
/// code, then aborts (spec.md §4.4).
fn disk_handler(count_after_increment: u32) -> Action {
    if count_after_increment <= 2 {
        Action::Retry
    } else {
        Action::Abort
    }
}

pub struct Ledger {
    counters: [u32; TABLE_LEN],
    total: u32,
}

impl Ledger {
    pub const fn new() -> Self {
        Self {
            counters: [0; TABLE_LEN],
            total: 0,
        }
    }

    pub fn count_of(&self, code: ErrorCode) -> u32 {
        self.counters[code.index()]
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Records one occurrence of `code` at the given call site, dispatches
    /// to the appropriate handler, and returns the resulting action.
    /// Each distinct call site reports once (spec.md §7).
    pub fn report(
        &mut self,
        code: ErrorCode,
        message: &'static str,
        function: &'static str,
        line: u32,
        context: [u64; 4],
    ) -> Action {
        self.counters[code.index()] += 1;
        self.total += 1;
        let count = self.counters[code.index()];

        let record = ErrorRecord {
            code,
            message,
            function,
            line,
            context,
        };
        self.trace_record(&record);

        if code.is_disk_class() {
            disk_handler(count)
        } else {
            generic_handler(code)
        }
    }

    #[cfg(target_os = "none")]
    fn trace_record(&self, record: &ErrorRecord) {
        use crate::println;
        println!(
            "[error] {:?} ({}) at {}:{}",
            record.code, record.message, record.function, record.line
        );
        if record.context != [0; 4] {
            println!("  context: {:#x?}", record.context);
        }
    }

    #[cfg(not(target_os = "none"))]
    fn trace_record(&self, _record: &ErrorRecord) {}

    #[cfg(target_os = "none")]
    pub fn print_summary(&self) {
        use crate::println;
        println!("error ledger: {} total", self.total);
        for code in [
            ErrorCode::InvalidParam,
            ErrorCode::OutOfMemory,
            ErrorCode::Timeout,
            ErrorCode::NotFound,
            ErrorCode::PermissionDenied,
            ErrorCode::HardwareFault,
            ErrorCode::DeviceNotReady,
            ErrorCode::DeviceTimeout,
            ErrorCode::DeviceError,
            ErrorCode::InvalidDevice,
            ErrorCode::VirtioInitFailed,
            ErrorCode::VirtioQueueFull,
            ErrorCode::VirtioBadResponse,
            ErrorCode::VirtioDeviceError,
            ErrorCode::ElfInvalidMagic,
            ErrorCode::ElfInvalidClass,
            ErrorCode::ElfInvalidEndian,
            ErrorCode::ElfNoSegments,
            ErrorCode::ElfLoadFailed,
            ErrorCode::ElfInvalidPhnum,
            ErrorCode::MemoryOverlap,
            ErrorCode::MemoryOutOfBounds,
            ErrorCode::MemoryProtection,
            ErrorCode::MemoryAlignment,
            ErrorCode::DiskReadFailed,
            ErrorCode::DiskWriteFailed,
            ErrorCode::DiskBadSector,
            ErrorCode::DiskNotReady,
            ErrorCode::BootInvalidStage,
            ErrorCode::BootKernelInvalid,
            ErrorCode::BootMemoryConflict,
            ErrorCode::BootDeviceTreeFailed,
            ErrorCode::SystemHalt,
            ErrorCode::CriticalFailure,
        ] {
            let n = self.count_of(code);
            if n > 0 {
                println!("  {:?}: {}", code, n);
            }
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_units: u32,
    pub exponential_backoff: bool,
}

/// Busy-waits `units` iterations. On target this is real spin time; on
/// host it's just a counted loop so tests stay fast and deterministic.
fn busy_wait(units: u32) {
    let mut x: u32 = 0;
    for _ in 0..units {
        x = x.wrapping_add(1);
        core::hint::black_box(&mut x);
    }
}

/// Retries `op` up to `cfg.max_attempts` times, busy-waiting between
/// attempts with optional exponential backoff (spec.md §4.4). Returns
/// `0` on success, `-1` if attempts are exhausted.
pub fn retry_operation(cfg: &RetryConfig, mut op: impl FnMut() -> bool) -> i32 {
    let mut delay = cfg.delay_units;
    for attempt in 0..cfg.max_attempts {
        if op() {
            return 0;
        }
        if attempt + 1 < cfg.max_attempts {
            busy_wait(delay);
            if cfg.exponential_backoff {
                delay = delay.saturating_mul(2);
            }
        }
    }
    -1
}
