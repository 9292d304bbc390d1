//! The hooks the boot collaborator implements so this crate never touches
//! GDT/IDT/PIC construction, a concrete console device, or a filesystem
//! directly. Everything here is a narrow trait or plain data the core calls
//! into or is handed, matching §1's boundary between this core and the boot
//! trampoline / user-mode servers.

use spin::Mutex;

/// A contiguous range of physical memory the early memory map reports as
/// usable RAM, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct UsableRange {
    pub base: u32,
    pub length: u32,
}

/// What the boot collaborator hands the core at init: the usable-RAM map and
/// the initrd blob containing the first user program.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    pub usable_ranges: &'a [UsableRange],
    /// Total installed RAM, in bytes, bounding the frame bitmap's size.
    pub memory_size: u32,
    /// Physical base and length of the bitmap storage region itself, so the
    /// frame allocator's own backing bits are marked permanently reserved.
    pub bitmap_region: (u32, u32),
    /// The initrd's `init` image, already mapped at a kernel-accessible
    /// virtual address.
    pub initrd: &'a [u8],
}

/// Publishes the next task's kernel-stack top to wherever the platform's
/// hardware task-switch state (e.g. a TSS `esp0` field) lives. The core
/// calls this on every context switch; it does not construct or own that
/// descriptor itself.
pub trait KernelStackPublisher: Send + Sync {
    fn set_kernel_stack_top(&self, esp0: u32);
}

/// The character device the `write`/`read` syscalls forward to. A user-mode
/// console server is the real implementation; tests and early boot may have
/// none installed, in which case reads return 0 bytes and writes are
/// accepted and discarded.
pub trait ConsoleIo: Send + Sync {
    fn write(&self, bytes: &[u8]) -> usize;
    fn read(&self, buf: &mut [u8]) -> usize;
}

struct NullConsole;

impl ConsoleIo for NullConsole {
    fn write(&self, bytes: &[u8]) -> usize {
        bytes.len()
    }
    fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }
}

static NULL_CONSOLE: NullConsole = NullConsole;
static CONSOLE: Mutex<&'static dyn ConsoleIo> = Mutex::new(&NULL_CONSOLE);
static STACK_PUBLISHER: Mutex<Option<&'static dyn KernelStackPublisher>> = Mutex::new(None);

/// Installs the console device. Before this is called, `write` accepts and
/// discards bytes and `read` always returns 0, matching §6's "no console
/// installed degrades to 0 bytes" contract.
pub fn set_console(console: &'static dyn ConsoleIo) {
    *CONSOLE.lock() = console;
}

pub fn console_write(bytes: &[u8]) -> usize {
    CONSOLE.lock().write(bytes)
}

pub fn console_read(buf: &mut [u8]) -> usize {
    CONSOLE.lock().read(buf)
}

/// Installs the kernel-stack publisher used by the scheduler's context
/// switch.
pub fn set_kernel_stack_publisher(publisher: &'static dyn KernelStackPublisher) {
    *STACK_PUBLISHER.lock() = Some(publisher);
}

/// Publishes `esp0` if a publisher has been installed; a no-op otherwise,
/// which is the expected state in host tests.
pub fn publish_kernel_stack_top(esp0: u32) {
    if let Some(p) = *STACK_PUBLISHER.lock() {
        p.set_kernel_stack_top(esp0);
    }
}
