//! The register frame the platform trap dispatcher builds on every
//! interrupt/exception/syscall and hands this crate a pointer to. Field
//! order follows the classic xv6-style i386 trap frame (general-purpose
//! registers pushed by a `pusha`-equivalent stub, then the CPU-pushed
//! `iret` frame) that the teacher's own `trapret.rs` cites as its model,
//! rewritten for 32-bit `iret` instead of `iretq`.

use static_assertions::const_assert_eq;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    // Pushed by the trap-entry stub, in `pusha` order.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32, // `pusha`'s ESP slot; not meaningful, never restored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // Trap bookkeeping the stub fills in.
    pub trap_number: u32,
    pub error_code: u32,

    // Pushed by the CPU itself on the interrupt/exception/syscall.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // Present only when the trap crossed a privilege level (ring 3 -> 0);
    // a kernel-mode trap's frame ends at `eflags`. The platform stub only
    // populates these for traps it knows originated in user mode
    // (syscalls, user-mode page faults).
    pub user_esp: u32,
    pub user_ss: u32,
}

const_assert_eq!(core::mem::size_of::<TrapFrame>(), 14 * 4);

impl TrapFrame {
    /// Builds the frame a brand new user task's first `iret` resumes from.
    pub fn new_user(entry_point: u32, user_stack: u32, user_cs: u32, user_ds: u32) -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            trap_number: 0,
            error_code: 0,
            eip: entry_point,
            cs: user_cs | 3,
            eflags: 0x200, // interrupts enabled
            user_esp: user_stack,
            user_ss: user_ds | 3,
        }
    }

    /// Syscall number, per SPEC_FULL.md §6: `eax` at trap entry.
    pub fn syscall_number(&self) -> u32 {
        self.eax
    }

    pub fn arg1(&self) -> u32 {
        self.ebx
    }

    pub fn arg2(&self) -> u32 {
        self.ecx
    }

    pub fn arg3(&self) -> u32 {
        self.edx
    }

    pub fn set_return_value(&mut self, value: i32) {
        self.eax = value as u32;
    }

    /// True if the saved `cs`'s RPL bits indicate this trap was taken from
    /// ring 3.
    pub fn from_user_mode(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}
