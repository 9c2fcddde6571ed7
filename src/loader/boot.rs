//! Boot orchestration: ties C3 (memory layout) -> C7 (hardware) ->
//! C5 (virtio init/read) -> C6 (ELF load) -> C8 (device description)
//! -> C9 (boot info + jump) together in the order spec.md §2's data
//! flow diagram lists, tracing progress at each phase the way the
//! teacher's `main.rs` narrates its own init sequence
//! ("kernel is booting", one line per subsystem).

use crate::bootinfo::BootInfoBuilder;
use crate::devdesc::DeviceDescBuilder;
use crate::elf;
use crate::error::{ErrorCode, Ledger};
use crate::hardware;
use crate::memlayout::{self, BOOTINFO_ZONE, KERNEL_ZONE, SCRATCH_ZONE, VIRTIO_DMA_ZONE, ZONES};
use crate::println;
use crate::virtio::{Disk, MmioTransport, VirtioBlkReq, VirtqAvail, VirtqDesc, VirtqUsed};

const FS_BASE_SECTOR: u64 = 2048;
const FS_SECTOR_COUNT: u64 = 4096;
const KERNEL_IMAGE_SECTOR_COUNT: u64 = 128;

static mut LEDGER: Ledger = Ledger::new();

#[allow(static_mut_refs)]
fn fail(code: ErrorCode, message: &'static str, function: &'static str, line: u32) -> ! {
    unsafe {
        LEDGER.report(code, message, function, line, [0; 4]);
        LEDGER.print_summary();
    }
    println!("boot failed: {:?} ({})", code, message);
    loop {
        core::hint::spin_loop();
    }
}

pub fn start(hart_id: u64) -> ! {
    println!();
    println!("rv-stage2-boot starting on hart {}", hart_id);
    println!();

    if let Err(e) = memlayout::validate(&ZONES) {
        fail(e, "zone table invalid", "start", line!());
    }
    memlayout::print(&ZONES);

    let hw = hardware::detect();
    if let Err(e) = hardware::validate(&hw) {
        fail(e, "hardware descriptor invalid", "start", line!());
    }
    println!("platform: {:?}, {} hart(s)", hw.platform, hw.cpu_count);

    let transport = MmioTransport::new(hw.virtio_base as usize);
    let mut disk = match Disk::init(
        transport,
        VIRTIO_DMA_ZONE.base,
        VIRTIO_DMA_ZONE.base + 0x1000,
        VIRTIO_DMA_ZONE.base + 0x2000,
    ) {
        Ok(d) => d,
        Err(e) => fail(e, "virtio init failed", "start", line!()),
    };
    println!("virtio-blk ready");

    // Ring storage occupies the first three pages of the DMA zone;
    // request/status scratch for each transfer sits just past it,
    // well clear of the 512-byte data buffer that follows.
    let descs = (VIRTIO_DMA_ZONE.base) as *mut [VirtqDesc; 8];
    let avail = (VIRTIO_DMA_ZONE.base + 0x1000) as *mut VirtqAvail;
    let used = (VIRTIO_DMA_ZONE.base + 0x2000) as *mut VirtqUsed;
    let req_addr = VIRTIO_DMA_ZONE.base + 0x3000;
    let buf_addr = VIRTIO_DMA_ZONE.base + 0x3100;
    let status_addr = VIRTIO_DMA_ZONE.base + 0x3300;

    // The kernel ELF image is staged in the scratch zone rather than on
    // the stack (the stage2 stack is 16KiB, the image can run to tens
    // of KiB); the zone is sized to hold exactly this many sectors.
    let kernel_image_base = SCRATCH_ZONE.base;
    let kernel_image_len = (KERNEL_IMAGE_SECTOR_COUNT * 512) as usize;
    if kernel_image_len as u64 > SCRATCH_ZONE.size {
        fail(
            ErrorCode::OutOfMemory,
            "kernel image larger than scratch zone",
            "start",
            line!(),
        );
    }

    for i in 0..KERNEL_IMAGE_SECTOR_COUNT {
        let req = req_addr as *mut VirtioBlkReq;
        let status = status_addr as *mut u8;
        let buf = (kernel_image_base + i * 512) as *mut u8;

        // SAFETY: `req`/`status`/`buf`/`descs`/`avail`/`used` all point
        // into the statically reserved scratch/DMA zones and nothing
        // else touches them concurrently on this single hart.
        let result = unsafe {
            disk.read_sync(
                FS_BASE_SECTOR + i,
                512,
                &mut *descs,
                &mut *avail,
                &mut *used,
                &mut *req,
                &mut *status,
                req_addr,
                buf as u64,
                status_addr,
                |d, _used_ring| {
                    d.ack_interrupt();
                },
            )
        };
        if let Err(e) = result {
            fail(e, "kernel image read failed", "start", line!());
        }
    }
    println!("kernel image read: {} sectors", KERNEL_IMAGE_SECTOR_COUNT);

    // SAFETY: the loop above just filled exactly `kernel_image_len`
    // bytes starting at `kernel_image_base` within `SCRATCH_ZONE`.
    let kernel_image =
        unsafe { core::slice::from_raw_parts(kernel_image_base as *const u8, kernel_image_len) };

    // Pass 1: compute the plan and reject it before touching memory if
    // it would land outside the reserved kernel zone.
    let planned = match elf::plan_segments(kernel_image) {
        Ok(p) => p,
        Err(e) => fail(e, "elf plan failed", "start", line!()),
    };
    if planned.load_base < KERNEL_ZONE.base || planned.load_base + planned.load_size > KERNEL_ZONE.end()
    {
        fail(
            ErrorCode::BootMemoryConflict,
            "kernel image outside kernel zone",
            "start",
            line!(),
        );
    }

    // Pass 2: materialize, now that the plan is known to be in-bounds.
    let plan = match elf::load_segments(
        kernel_image,
        |addr, bytes| unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        },
        |addr, len| unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0, len as usize);
        },
    ) {
        Ok(p) => p,
        Err(e) => fail(e, "elf load failed", "start", line!()),
    };
    println!("kernel loaded at {:#x}, entry {:#x}", plan.load_base, plan.entry_point);

    let mut devdesc_buf = [0u8; 1024];
    let mut builder = DeviceDescBuilder::new(&mut devdesc_buf);
    let _ = builder.add_memory(hw.memory_base, hw.memory_size);
    for cpu in 0..hw.cpu_count {
        let _ = builder.add_cpu(cpu);
    }
    let _ = builder.add_uart(hw.uart_base, hw.uart_irq);
    let _ = builder.add_virtio(hw.virtio_base, hw.virtio_irq);
    if let Err(e) = builder.finalize() {
        fail(e, "device description empty", "start", line!());
    }
    println!("device description built: {} bytes", builder.binary_size());

    let mut info = BootInfoBuilder::new();
    if let Err(e) = info.init(&hw) {
        fail(e, "bootinfo init failed", "start", line!());
    }
    if let Err(e) = info.setup_kernel_params(&plan) {
        fail(e, "bootinfo kernel params failed", "start", line!());
    }
    if let Err(e) = info.setup_device_tree(BOOTINFO_ZONE.base + 0x100, builder.binary_size() as u64) {
        fail(e, "bootinfo device tree failed", "start", line!());
    }
    if let Err(e) = info.setup_filesystem(FS_BASE_SECTOR, FS_SECTOR_COUNT) {
        fail(e, "bootinfo filesystem failed", "start", line!());
    }
    let record = match info.finalize() {
        Ok(r) => r,
        Err(e) => fail(e, "bootinfo finalize failed", "start", line!()),
    };

    let record_addr = BOOTINFO_ZONE.base;
    // SAFETY: `record_addr` addresses the reserved BOOTINFO_ZONE, which
    // nothing else writes to before the jump below.
    unsafe {
        core::ptr::write(record_addr as *mut _, record);
    }
    println!("boot info finalized, jumping to kernel");

    unsafe { crate::bootinfo::jump(hart_id, record_addr, plan.entry_point) }
}
