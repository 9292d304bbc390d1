//! The tail end of every trap: restores a [`TrapFrame`] and returns to the
//! privilege level it describes via `iret`. Rewritten from the teacher's
//! `process/trapret.rs` (itself "based on xv6's trapret") for 32-bit `iret`
//! instead of `iretq`, and for the `pusha`-compatible field order
//! [`TrapFrame`] uses.

use super::trapframe::TrapFrame;

/// Restores `*tf` and resumes execution there. Never returns.
///
/// # Safety
/// `tf` must point to a valid, fully populated [`TrapFrame`] at the top of
/// the current kernel stack, describing a privilege level and instruction
/// stream the caller intends to actually resume.
#[unsafe(naked)]
pub unsafe extern "C" fn trapret(tf: *const TrapFrame) -> ! {
    core::arch::naked_asm!(
        "mov eax, [esp + 4]", // cdecl argument: tf
        "mov esp, eax",
        "popa",               // edi, esi, ebp, (skip esp), ebx, edx, ecx, eax
        "add esp, 8",         // skip trap_number, error_code
        "iretd",
    );
}

/// The continuation a freshly `fork`ed or `exec`'d task's context switch
/// lands in: the task's trapframe pointer has been stashed in `esi` by
/// [`super::context::TaskContext::new_trap_return`]; jump straight to
/// [`trapret`] with it.
#[unsafe(naked)]
pub unsafe extern "C" fn trap_return_trampoline() -> ! {
    core::arch::naked_asm!("push esi", "call {trapret}", "ud2", trapret = sym trapret, );
}
