//! Host-test / non-x86-build stand-in for [`super::Arch`]. Records calls
//! instead of touching real hardware so the rest of the kernel can be unit
//! tested with `cargo test` off target.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{Arch, PhysFrameAddr};

pub struct FakeArch;

static CURRENT_DIR: AtomicU32 = AtomicU32::new(0);
static FAULT_ADDR: AtomicU32 = AtomicU32::new(0);
static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);
static LAST_FLUSHED_VADDR: AtomicU32 = AtomicU32::new(0);
static FLUSH_COUNT: AtomicU32 = AtomicU32::new(0);

impl FakeArch {
    pub fn set_fault_address(addr: u32) {
        FAULT_ADDR.store(addr, Ordering::SeqCst);
    }

    /// Last address passed to `flush_tlb_entry`, for tests that assert a
    /// mapping change actually triggered a flush.
    pub fn last_flushed_vaddr() -> u32 {
        LAST_FLUSHED_VADDR.load(Ordering::SeqCst)
    }

    pub fn flush_count() -> u32 {
        FLUSH_COUNT.load(Ordering::SeqCst)
    }
}

impl Arch for FakeArch {
    unsafe fn load_page_directory(dir_phys: PhysFrameAddr) {
        CURRENT_DIR.store(dir_phys, Ordering::SeqCst);
    }

    unsafe fn current_page_directory() -> PhysFrameAddr {
        CURRENT_DIR.load(Ordering::SeqCst)
    }

    unsafe fn flush_tlb_entry(vaddr: u32) {
        LAST_FLUSHED_VADDR.store(vaddr, Ordering::SeqCst);
        FLUSH_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn read_fault_address() -> u32 {
        FAULT_ADDR.load(Ordering::SeqCst)
    }

    unsafe fn disable_interrupts() -> bool {
        INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst)
    }

    unsafe fn restore_interrupts(was_enabled: bool) {
        INTERRUPTS_ENABLED.store(was_enabled, Ordering::SeqCst);
    }

    unsafe fn halt() {}
}
