//! Narrow boundary around the handful of privileged instructions the core
//! issues directly. GDT/IDT/PIC construction stays with the boot
//! collaborator; this module only wraps CR3/TLB/CR2/halt/interrupt-enable
//! primitives.

#[cfg(all(not(test), target_arch = "x86"))]
mod x86;
#[cfg(all(not(test), target_arch = "x86"))]
pub use x86::X86;

#[cfg(any(test, not(target_arch = "x86")))]
mod fake;
#[cfg(any(test, not(target_arch = "x86")))]
pub use fake::FakeArch as X86;

/// Physical address of a page directory, as written into the paging root
/// register.
pub type PhysFrameAddr = u32;

/// The privileged operations the rest of the kernel needs from the CPU.
/// Implemented once for real hardware ([`x86::X86`]) and once as a no-op
/// recorder for host tests ([`fake::FakeArch`]).
pub trait Arch {
    /// Install `dir_phys` as the current page-table root (write CR3).
    ///
    /// # Safety
    /// `dir_phys` must be the physical address of a valid, fully populated
    /// page directory, aligned to [`crate::config::PAGE_SIZE`].
    unsafe fn load_page_directory(dir_phys: PhysFrameAddr);

    /// Read the page-table root currently installed (CR3).
    unsafe fn current_page_directory() -> PhysFrameAddr;

    /// Invalidate a single TLB entry for `vaddr`.
    ///
    /// # Safety
    /// Must only be called with interrupts disabled or from a context where
    /// a stale translation cannot be observed by another task.
    unsafe fn flush_tlb_entry(vaddr: u32);

    /// Read the faulting address left in CR2 by the last page fault.
    ///
    /// # Safety
    /// Only meaningful immediately after a page-fault trap.
    unsafe fn read_fault_address() -> u32;

    /// Disable maskable interrupts, returning whether they were enabled.
    ///
    /// # Safety
    /// Caller must pair with [`Arch::restore_interrupts`] to avoid leaving
    /// interrupts permanently disabled.
    unsafe fn disable_interrupts() -> bool;

    /// Restore the interrupt flag to the state `was_enabled` describes.
    ///
    /// # Safety
    /// Must only be used to restore a flag previously captured by
    /// [`Arch::disable_interrupts`].
    unsafe fn restore_interrupts(was_enabled: bool);

    /// Halt the CPU until the next interrupt.
    ///
    /// # Safety
    /// Must only be called with a valid IDT installed.
    unsafe fn halt();
}
