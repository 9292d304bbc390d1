//! Compile-time knobs for the kernel core, collected in one place instead of
//! scattered through the subsystems that use them.

/// Size in bytes of one physical frame / virtual page.
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SHIFT: u32 = 12;

/// Virtual address at which the kernel region begins. Identical across every
/// address space; everything below this is private user space.
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;
pub const USER_SPACE_END: u32 = 0xBFFF_FFFF;

/// First directory index that belongs to the kernel (`KERNEL_VIRTUAL_BASE >> 22`).
pub const KERNEL_DIR_INDEX: usize = (KERNEL_VIRTUAL_BASE >> 22) as usize;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Fixed virtual address the first user stack page is mapped at, growing down.
pub const USER_STACK_TOP: u32 = 0xBFFF_F000;
pub const USER_STACK_PAGES: usize = 4;

/// Scheduler quantum, in timer ticks.
pub const TIME_SLICE_TICKS: u32 = 10;

/// Timer frequency the platform is expected to drive the tick interrupt at.
pub const TIMER_HZ: u32 = 100;

/// Maximum number of live tasks the arena can hold at once.
pub const MAX_TASKS: usize = 64;

/// Idle task's fixed id and priority.
pub const IDLE_TASK_ID: usize = 0;
pub const IDLE_TASK_PRIORITY: u8 = 0;

/// Maximum number of ports in the system-wide port table.
pub const MAX_PORTS: usize = 256;

/// Capacity of a single port's message queue.
pub const MSG_QUEUE_SIZE: usize = 16;

/// Maximum payload bytes carried by one message.
pub const MAX_MSG_SIZE: usize = 256;

/// Kernel stack size allocated per task.
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE;

/// Software interrupt vector used for the system-call ABI.
pub const SYSCALL_VECTOR: u8 = 128;

/// CPU exception vector for a page fault.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Interrupt vector the timer is wired to by the boot collaborator.
pub const TIMER_VECTOR: u8 = 32;

/// User code/data segment selectors (ring-3 RPL already folded in), the
/// same values mexOS's GDT layout uses. Constructing the GDT itself is the
/// boot collaborator's job; the core only needs the selector values to
/// build a trap frame.
pub const USER_CS: u32 = 0x1B;
pub const USER_DS: u32 = 0x23;
