//! Memory management: the physical frame allocator (component A) and the
//! virtual memory manager (component B), plus the kernel-global state both
//! are reached through.

pub mod frame_allocator;
pub mod phys;
pub mod vmm;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::KResult;
use crate::platform::BootInfo;
use frame_allocator::FrameAllocator;
use phys::LinearOffsetMemory;
use vmm::AddressSpace;

lazy_static! {
    pub static ref PHYS_MEMORY: Mutex<LinearOffsetMemory> = Mutex::new(LinearOffsetMemory::new());
}

/// Global physical frame allocator. `None` until [`init`] runs.
pub static FRAME_ALLOCATOR: Mutex<Option<FrameAllocator>> = Mutex::new(None);

/// The kernel's master address space, shared by reference into every user
/// address space's upper quarter. `None` until [`init`] runs.
pub static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Initializes the frame allocator and kernel address space from the boot
/// collaborator's memory map, and leaves paging disabled (the phys-to-virt
/// offset stays zero, per §4.2, until [`enable_paging`] is called).
///
/// `bitmap_storage` must be a `'static` slice sized for at least
/// `boot_info.memory_size / PAGE_SIZE / 32` words.
///
/// # Safety
/// Must be called exactly once, before any other memory-management
/// operation, with a `boot_info` describing the real installed RAM.
pub unsafe fn init(boot_info: &BootInfo, bitmap_storage: &'static mut [u32]) -> KResult<()> {
    let frame_count = boot_info.memory_size as usize / PAGE_SIZE;
    let mut frames = FrameAllocator::new(bitmap_storage, frame_count);
    for range in boot_info.usable_ranges {
        frames.mark_region_free(range.base as usize, range.length as usize);
    }
    let (bitmap_base, bitmap_len) = boot_info.bitmap_region;
    frames.mark_region_used(bitmap_base as usize, bitmap_len as usize);

    let mut mem = PHYS_MEMORY.lock();
    let kernel_space = vmm::create_kernel_address_space(&mut *mem, &mut frames)?;

    *FRAME_ALLOCATOR.lock() = Some(frames);
    *KERNEL_SPACE.lock() = Some(kernel_space);
    Ok(())
}

/// Sets the fixed phys-to-virt offset and switches to the kernel address
/// space, turning paging on from the VMM's point of view. The CR0 write
/// that actually enables paging hardware-side is the boot collaborator's
/// job; this only updates the bookkeeping this crate's [`phys::PhysMemory`]
/// impl relies on afterwards.
///
/// # Safety
/// Must be called after the caller has enabled paging in hardware with the
/// kernel address space's directory installed as the root, and `offset`
/// must be the true linear offset between a frame's physical address and
/// its kernel-virtual alias.
pub unsafe fn enable_paging<A: crate::arch::Arch>(offset: u32) {
    PHYS_MEMORY.lock().set_offset(offset);
    let kernel_space = KERNEL_SPACE.lock().expect("memory::init must run first");
    unsafe {
        vmm::switch_address_space::<A>(&kernel_space);
    }
}
