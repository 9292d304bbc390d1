//! Preemptive priority scheduler (component E): task creation/destruction,
//! `pick_next_task`, timer-driven preemption, and `fork`/`exec`/`wait`/
//! `exit`. Grounded in mexOS's `kernel/sched/sched.c`; replaces the teacher's
//! round-robin `VecDeque<Box<Process>>` queue with the fixed [`TaskArena`]
//! and an explicit priority scan, per SPEC_FULL.md §9's re-architecture note.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch::Arch;
use crate::config::{IDLE_TASK_ID, IDLE_TASK_PRIORITY, KERNEL_STACK_SIZE, PAGE_SIZE, TIME_SLICE_TICKS, USER_CS, USER_DS};
use crate::error::{KResult, KernelError};
use crate::memory::vmm::{self, AddressSpace};
use crate::memory::{FRAME_ALLOCATOR, KERNEL_SPACE, PHYS_MEMORY};
use crate::platform;

use super::context::TaskContext;
use super::elf;
use super::trapframe::TrapFrame;
use super::{BlockReason, Task, TaskArena, TaskId, TaskState};

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// The initrd's `init` image, handed down by the boot collaborator through
/// [`BootInfo`](crate::platform::BootInfo) and stashed here since it is the
/// only executable `exec` can load absent a filesystem.
static INITRD_IMAGE: Mutex<Option<&'static [u8]>> = Mutex::new(None);

pub fn set_initrd_image(image: &'static [u8]) {
    *INITRD_IMAGE.lock() = Some(image);
}

pub fn initrd_image() -> Option<&'static [u8]> {
    *INITRD_IMAGE.lock()
}

pub struct Scheduler {
    pub tasks: TaskArena,
    pub current: Option<TaskId>,
    pub tick_count: u64,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            tasks: TaskArena::new(),
            current: None,
            tick_count: 0,
        }
    }

    /// Highest-priority READY task, ties broken by lowest task id (the
    /// arena's natural iteration order).
    fn pick_next_task(&self) -> Option<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Ready)
            .max_by_key(|t| (t.priority, core::cmp::Reverse(t.id)))
            .map(|t| t.id)
    }
}

fn name_bytes(name: &str) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let bytes = name.as_bytes();
    let len = bytes.len().min(31);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// Allocates a [`KERNEL_STACK_SIZE`]-byte, page-aligned kernel stack from
/// the kernel heap and returns its top address (the value a fresh task's
/// `esp` starts at, since the stack grows down).
fn alloc_kernel_stack() -> KResult<u32> {
    let layout = Layout::from_size_align(KERNEL_STACK_SIZE, PAGE_SIZE).unwrap();
    let base = unsafe { alloc(layout) };
    if base.is_null() {
        return Err(KernelError::OutOfMemory);
    }
    Ok(base as u32 + KERNEL_STACK_SIZE as u32)
}

fn free_kernel_stack(top: u32) {
    let layout = Layout::from_size_align(KERNEL_STACK_SIZE, PAGE_SIZE).unwrap();
    let base = (top - KERNEL_STACK_SIZE as u32) as *mut u8;
    unsafe { dealloc(base, layout) };
}

/// Spawns the idle task (id [`IDLE_TASK_ID`], priority 0): a kernel-mode
/// task that halts in a loop, selected only when nothing else is READY.
/// Must be called once, before any other scheduler operation.
pub fn init(kernel_space: AddressSpace) -> KResult<TaskId> {
    let mut sched = SCHEDULER.lock();
    let id = sched.tasks.reserve_id().ok_or(KernelError::NoFreeTask)?;
    debug_assert_eq!(id, IDLE_TASK_ID);
    let stack_top = alloc_kernel_stack()?;
    let context = TaskContext::new_kernel(idle_loop as usize as u32, stack_top, kernel_space.directory_phys());
    sched.tasks.insert(Task {
        id,
        parent: None,
        state: TaskState::Ready,
        priority: IDLE_TASK_PRIORITY,
        time_slice: TIME_SLICE_TICKS,
        kernel_mode: true,
        kernel_stack_top: stack_top,
        user_stack_top: None,
        address_space: kernel_space,
        context,
        exit_code: 0,
        block_reason: None,
        name: name_bytes("idle"),
    });
    Ok(id)
}

extern "C" fn idle_loop() -> ! {
    loop {
        unsafe { crate::arch::X86::halt() };
    }
}

/// Creates a brand new kernel-mode task running `entry` in the kernel
/// address space, READY to be scheduled.
pub fn spawn_kernel_task(entry: extern "C" fn() -> !, priority: u8, name: &str) -> KResult<TaskId> {
    let mut sched = SCHEDULER.lock();
    let id = sched.tasks.reserve_id().ok_or(KernelError::NoFreeTask)?;
    let kernel_space = KERNEL_SPACE.lock().expect("memory::init must run first");
    let stack_top = alloc_kernel_stack()?;
    let context = TaskContext::new_kernel(entry as usize as u32, stack_top, kernel_space.directory_phys());
    sched.tasks.insert(Task {
        id,
        parent: None,
        state: TaskState::Ready,
        priority,
        time_slice: TIME_SLICE_TICKS,
        kernel_mode: true,
        kernel_stack_top: stack_top,
        user_stack_top: None,
        address_space: kernel_space,
        context,
        exit_code: 0,
        block_reason: None,
        name: name_bytes(name),
    });
    Ok(id)
}

/// Writes a [`TrapFrame`] for a user-mode entry at the top of `stack_top`'s
/// kernel stack and returns its address, the layout
/// [`trap_return_trampoline`](super::trapret::trap_return_trampoline) expects
/// to find on first dispatch.
fn write_initial_trapframe(stack_top: u32, entry: u32, user_stack: u32) -> u32 {
    let tf_addr = stack_top - core::mem::size_of::<TrapFrame>() as u32;
    let tf = TrapFrame::new_user(entry, user_stack, USER_CS, USER_DS);
    unsafe {
        (tf_addr as *mut TrapFrame).write(tf);
    }
    tf_addr
}

fn map_user_stack<A: Arch>(
    mem: &mut impl crate::memory::phys::PhysMemory,
    frames: &mut crate::memory::frame_allocator::FrameAllocator,
    space: &AddressSpace,
) -> KResult<u32> {
    use crate::config::{USER_STACK_PAGES, USER_STACK_TOP};
    use crate::memory::vmm::PageFlags;
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
    for i in 0..USER_STACK_PAGES {
        let vaddr = USER_STACK_TOP - (i as u32 + 1) * PAGE_SIZE as u32;
        vmm::alloc_page::<A>(mem, frames, space, vaddr, flags)?;
    }
    Ok(USER_STACK_TOP)
}

/// Creates the very first user task from a loaded initrd image: a fresh
/// address space, the image's `PT_LOAD` segments, a mapped user stack, and
/// a task record ready to be scheduled straight into user mode.
pub fn spawn_init_task<A: Arch>(image: &[u8], priority: u8, name: &str) -> KResult<TaskId> {
    let kernel_space = KERNEL_SPACE.lock().expect("memory::init must run first");
    let mut frames_guard = FRAME_ALLOCATOR.lock();
    let frames = frames_guard.as_mut().expect("memory::init must run first");
    let mut mem = PHYS_MEMORY.lock();

    let space = vmm::create_address_space(&mut *mem, frames, &kernel_space)?;
    let loaded = match elf::load_elf::<A>(&mut *mem, frames, &space, image) {
        Ok(l) => l,
        Err(e) => {
            vmm::destroy_address_space(&mut *mem, frames, &space);
            return Err(e);
        }
    };
    let _ = loaded.brk;
    let user_stack_top = match map_user_stack::<A>(&mut *mem, frames, &space) {
        Ok(t) => t,
        Err(e) => {
            vmm::destroy_address_space(&mut *mem, frames, &space);
            return Err(e);
        }
    };

    let mut sched = SCHEDULER.lock();
    let Some(id) = sched.tasks.reserve_id() else {
        drop(sched);
        vmm::destroy_address_space(&mut *mem, frames, &space);
        return Err(KernelError::NoFreeTask);
    };
    let kernel_stack_top = match alloc_kernel_stack() {
        Ok(t) => t,
        Err(e) => {
            sched.tasks.remove(id);
            drop(sched);
            vmm::destroy_address_space(&mut *mem, frames, &space);
            return Err(e);
        }
    };
    let tf_addr = write_initial_trapframe(kernel_stack_top, loaded.entry_point, user_stack_top);
    let context = TaskContext::new_trap_return(tf_addr, kernel_stack_top, space.directory_phys());

    sched.tasks.insert(Task {
        id,
        parent: None,
        state: TaskState::Ready,
        priority,
        time_slice: TIME_SLICE_TICKS,
        kernel_mode: false,
        kernel_stack_top,
        user_stack_top: Some(user_stack_top),
        address_space: space,
        context,
        exit_code: 0,
        block_reason: None,
        name: name_bytes(name),
    });
    Ok(id)
}

/// Saves the outgoing RUNNING task back to READY (unless it's already
/// terminal/blocked), selects the next one (falling back to the idle task),
/// and switches to it. The raw context pointers taken here stay valid after
/// the scheduler lock is dropped because the arena they point into is a
/// `'static` singleton that is never deallocated, only mutated under the
/// lock, which single-CPU/interrupts-disabled execution makes safe.
///
/// # Safety
/// Must be called with interrupts disabled, and not re-entrantly (a nested
/// call while one is already unwinding through a context switch corrupts
/// the outgoing task's saved context).
pub unsafe fn schedule<A: Arch>() {
    let (old_ctx, new_ctx, new_stack_top) = {
        let mut sched = SCHEDULER.lock();
        if let Some(cur_id) = sched.current {
            if let Some(cur) = sched.tasks.get_mut(cur_id) {
                if cur.state == TaskState::Running {
                    cur.state = TaskState::Ready;
                }
            }
        }
        let next_id = sched.pick_next_task().unwrap_or(IDLE_TASK_ID);
        let old_ctx: *mut TaskContext = match sched.current {
            Some(id) => sched
                .tasks
                .get_mut(id)
                .map(|t| &mut t.context as *mut TaskContext)
                .unwrap_or(core::ptr::null_mut()),
            None => core::ptr::null_mut(),
        };
        let next = sched.tasks.get_mut(next_id).expect("idle task always exists");
        next.state = TaskState::Running;
        next.time_slice = TIME_SLICE_TICKS;
        let new_ctx = &mut next.context as *mut TaskContext;
        let new_stack_top = next.kernel_stack_top;
        sched.current = Some(next_id);
        (old_ctx, new_ctx, new_stack_top)
    };
    platform::publish_kernel_stack_top(new_stack_top);
    unsafe {
        super::context::switch_context(old_ctx, new_ctx);
    }
}

pub fn current_task_id() -> Option<TaskId> {
    SCHEDULER.lock().current
}

/// Decrements the running task's time slice; returns `true` once it hits
/// zero, telling the caller (the platform's timer ISR) to invoke
/// [`schedule`].
pub fn timer_tick() -> bool {
    let mut sched = SCHEDULER.lock();
    sched.tick_count += 1;
    let Some(cur_id) = sched.current else { return false };
    let Some(cur) = sched.tasks.get_mut(cur_id) else { return false };
    if cur.time_slice > 0 {
        cur.time_slice -= 1;
    }
    cur.time_slice == 0
}

pub fn block_current(reason: BlockReason) {
    let mut sched = SCHEDULER.lock();
    let cur = sched.current.expect("block_current with no running task");
    let t = sched.tasks.get_mut(cur).expect("current task vanished");
    t.state = TaskState::Blocked;
    t.block_reason = Some(reason);
}

pub fn unblock(task_id: TaskId) {
    let mut sched = SCHEDULER.lock();
    if let Some(t) = sched.tasks.get_mut(task_id) {
        if t.state == TaskState::Blocked {
            t.state = TaskState::Ready;
            t.block_reason = None;
        }
    }
}

/// Duplicates `parent_id`'s address space and kernel stack (including the
/// trapframe the fork syscall trapped in through), so the child resumes at
/// the exact same point with `eax = 0`, while the parent's own `eax` is set
/// to the child's id by the syscall dispatcher.
pub fn fork(parent_id: TaskId, parent_trapframe: *const TrapFrame) -> KResult<TaskId> {
    let (parent_space, parent_priority, parent_kernel_stack_top, parent_user_stack, parent_name) = {
        let sched = SCHEDULER.lock();
        let p = sched.tasks.get(parent_id).ok_or(KernelError::NoSuchTask)?;
        (p.address_space, p.priority, p.kernel_stack_top, p.user_stack_top, p.name)
    };

    let kernel_space = KERNEL_SPACE.lock().expect("memory::init must run first");
    let child_space = {
        let mut frames_guard = FRAME_ALLOCATOR.lock();
        let frames = frames_guard.as_mut().expect("memory::init must run first");
        let mut mem = PHYS_MEMORY.lock();
        vmm::clone_address_space(&mut *mem, frames, &kernel_space, &parent_space)?
    };

    let child_stack_top = match alloc_kernel_stack() {
        Ok(t) => t,
        Err(e) => {
            let mut frames_guard = FRAME_ALLOCATOR.lock();
            let frames = frames_guard.as_mut().expect("memory::init must run first");
            let mut mem = PHYS_MEMORY.lock();
            vmm::destroy_address_space(&mut *mem, frames, &child_space);
            return Err(e);
        }
    };

    // Copy the parent's whole kernel stack so the child's trapframe lands
    // at the same offset from the top, then zero its eax so fork() returns
    // 0 in the child.
    let offset_from_top = parent_kernel_stack_top as usize - parent_trapframe as usize;
    unsafe {
        let src = (parent_kernel_stack_top as usize - KERNEL_STACK_SIZE) as *const u8;
        let dst = (child_stack_top as usize - KERNEL_STACK_SIZE) as *mut u8;
        core::ptr::copy_nonoverlapping(src, dst, KERNEL_STACK_SIZE);
    }
    let child_tf_addr = child_stack_top as usize - offset_from_top;
    unsafe {
        (*(child_tf_addr as *mut TrapFrame)).set_return_value(0);
    }

    let context = TaskContext::new_trap_return(child_tf_addr as u32, child_stack_top, child_space.directory_phys());

    let mut sched = SCHEDULER.lock();
    let Some(child_id) = sched.tasks.reserve_id() else {
        drop(sched);
        let mut frames_guard = FRAME_ALLOCATOR.lock();
        let frames = frames_guard.as_mut().expect("memory::init must run first");
        let mut mem = PHYS_MEMORY.lock();
        vmm::destroy_address_space(&mut *mem, frames, &child_space);
        free_kernel_stack(child_stack_top);
        return Err(KernelError::NoFreeTask);
    };
    sched.tasks.insert(Task {
        id: child_id,
        parent: Some(parent_id),
        state: TaskState::Ready,
        priority: parent_priority,
        time_slice: TIME_SLICE_TICKS,
        kernel_mode: false,
        kernel_stack_top: child_stack_top,
        user_stack_top: parent_user_stack,
        address_space: child_space,
        context,
        exit_code: 0,
        block_reason: None,
        name: parent_name,
    });
    Ok(child_id)
}

/// Replaces `task_id`'s address space and image with the one loaded from
/// `image`. On failure the task keeps its old address space untouched.
pub fn exec<A: Arch>(task_id: TaskId, image: &[u8]) -> KResult<()> {
    let kernel_space = KERNEL_SPACE.lock().expect("memory::init must run first");
    let mut frames_guard = FRAME_ALLOCATOR.lock();
    let frames = frames_guard.as_mut().expect("memory::init must run first");
    let mut mem = PHYS_MEMORY.lock();

    let new_space = vmm::create_address_space(&mut *mem, frames, &kernel_space)?;
    let loaded = match elf::load_elf::<A>(&mut *mem, frames, &new_space, image) {
        Ok(l) => l,
        Err(e) => {
            vmm::destroy_address_space(&mut *mem, frames, &new_space);
            return Err(e);
        }
    };
    let user_stack_top = match map_user_stack::<A>(&mut *mem, frames, &new_space) {
        Ok(t) => t,
        Err(e) => {
            vmm::destroy_address_space(&mut *mem, frames, &new_space);
            return Err(e);
        }
    };

    let mut sched = SCHEDULER.lock();
    let task = sched.tasks.get_mut(task_id).ok_or(KernelError::NoSuchTask)?;
    let old_space = task.address_space;
    let tf_addr = write_initial_trapframe(task.kernel_stack_top, loaded.entry_point, user_stack_top);
    task.address_space = new_space;
    task.user_stack_top = Some(user_stack_top);
    task.kernel_mode = false;
    task.context = TaskContext::new_trap_return(tf_addr, task.kernel_stack_top, new_space.directory_phys());
    drop(sched);

    if !old_space.is_kernel() {
        vmm::destroy_address_space(&mut *mem, frames, &old_space);
    }
    Ok(())
}

/// Blocks the caller until a child matching `pid_filter` (`< 0` for "any")
/// becomes a zombie, then reaps it and returns its id and exit code.
/// Returns [`KernelError::NoSuchTask`] immediately if the caller has no
/// matching child to wait for.
pub fn wait<A: Arch>(caller_id: TaskId, pid_filter: i32) -> KResult<(TaskId, i32)> {
    loop {
        {
            let mut sched = SCHEDULER.lock();
            let zombie_id = sched
                .tasks
                .iter()
                .find(|t| {
                    t.parent == Some(caller_id)
                        && t.state == TaskState::Zombie
                        && (pid_filter < 0 || t.id as i32 == pid_filter)
                })
                .map(|t| t.id);
            if let Some(zid) = zombie_id {
                let zombie = sched.tasks.remove(zid).expect("zombie vanished");
                return Ok((zid, zombie.exit_code));
            }
            let has_matching_child = sched
                .tasks
                .iter()
                .any(|t| t.parent == Some(caller_id) && (pid_filter < 0 || t.id as i32 == pid_filter));
            if !has_matching_child {
                return Err(KernelError::NoSuchTask);
            }
            let caller = sched.tasks.get_mut(caller_id).expect("wait caller vanished");
            caller.state = TaskState::Blocked;
            caller.block_reason = Some(BlockReason::WaitingForChild);
        }
        unsafe {
            schedule::<A>();
        }
    }
}

/// Terminates `task_id`: destroys its ports, frees its user address space,
/// reparents its live children to the idle task, wakes its parent if
/// blocked in `wait`, marks it a zombie, and reschedules. Never returns.
pub fn exit<A: Arch>(task_id: TaskId, code: i32) -> ! {
    let (space, parent, children): (AddressSpace, Option<TaskId>, Vec<TaskId>) = {
        let sched = SCHEDULER.lock();
        let t = sched.tasks.get(task_id).expect("exit of unknown task");
        let children = sched.tasks.children_of(task_id).map(|c| c.id).collect();
        (t.address_space, t.parent, children)
    };

    crate::ipc::destroy_ports_owned_by(task_id);

    if !space.is_kernel() {
        let mut frames_guard = FRAME_ALLOCATOR.lock();
        let frames = frames_guard.as_mut().expect("memory::init must run first");
        let mut mem = PHYS_MEMORY.lock();
        vmm::destroy_address_space(&mut *mem, frames, &space);
    }

    {
        let mut sched = SCHEDULER.lock();
        for child in children {
            if let Some(c) = sched.tasks.get_mut(child) {
                c.parent = Some(IDLE_TASK_ID);
            }
        }
        if let Some(t) = sched.tasks.get_mut(task_id) {
            t.state = TaskState::Zombie;
            t.exit_code = code;
            t.user_stack_top = None;
        }
        if let Some(pid) = parent {
            if let Some(p) = sched.tasks.get_mut(pid) {
                if p.state == TaskState::Blocked && p.block_reason == Some(BlockReason::WaitingForChild) {
                    p.state = TaskState::Ready;
                    p.block_reason = None;
                }
            }
        }
    }

    unsafe {
        schedule::<A>();
    }
    unreachable!("a zombie task is never selected to run again");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_task(id: TaskId, priority: u8, space: AddressSpace) -> Task {
        Task {
            id,
            parent: None,
            state: TaskState::Ready,
            priority,
            time_slice: TIME_SLICE_TICKS,
            kernel_mode: true,
            kernel_stack_top: 0,
            user_stack_top: None,
            address_space: space,
            context: TaskContext::empty(),
            exit_code: 0,
            block_reason: None,
            name: [0u8; 32],
        }
    }

    fn test_space() -> AddressSpace {
        use crate::memory::phys::fake::FakePhysMemory;
        use crate::memory::frame_allocator::FrameAllocator;
        extern crate alloc;
        use alloc::boxed::Box;
        use alloc::vec;
        let bitmap: &'static mut [u32] = Box::leak(vec![0u32; 8].into_boxed_slice());
        let mut frames = FrameAllocator::new(bitmap, 256);
        frames.mark_region_free(0, 256 * PAGE_SIZE);
        let mut mem = FakePhysMemory::new();
        vmm::create_kernel_address_space(&mut mem, &mut frames).unwrap()
    }

    #[test]
    fn pick_next_task_prefers_highest_priority_then_lowest_id() {
        let mut sched = Scheduler::new();
        let space = test_space();
        for (expect_id, priority) in [(0u8, 1u8), (1, 5), (2, 5), (3, 2)] {
            let reserved = sched.tasks.reserve_id().unwrap();
            assert_eq!(reserved as u8, expect_id);
            sched.tasks.insert(dummy_task(reserved, priority, space));
        }
        assert_eq!(sched.pick_next_task(), Some(1));
    }

    #[test]
    fn pick_next_task_ignores_non_ready_states() {
        let mut sched = Scheduler::new();
        let space = test_space();
        let a = sched.tasks.reserve_id().unwrap();
        sched.tasks.insert(dummy_task(a, 9, space));
        sched.tasks.get_mut(a).unwrap().state = TaskState::Blocked;
        assert_eq!(sched.pick_next_task(), None);
    }
}
