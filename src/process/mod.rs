//! Task table (component D): task records stored in a fixed arena, and the
//! 32-bit saved-register types a context switch moves between them.
//! Grounded in mexOS's `kernel/sched/sched.h`.

pub mod context;
pub mod elf;
pub mod scheduler;
pub mod trapframe;
pub mod trapret;

use crate::config::MAX_TASKS;
use crate::memory::vmm::AddressSpace;
use context::TaskContext;

pub type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Ready,
    Blocked,
    Zombie,
}

/// Why a task is [`TaskState::Blocked`], so the thing that eventually wakes
/// it knows which wait-queue to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Waiting in `wait()` for any/a specific child to become a zombie.
    WaitingForChild,
    /// Waiting in a blocking `send` for queue space.
    SendingTo(crate::ipc::PortId),
    /// Waiting in a blocking `recv` for a message.
    ReceivingFrom(crate::ipc::PortId),
}

pub struct Task {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub state: TaskState,
    pub priority: u8,
    pub time_slice: u32,
    pub kernel_mode: bool,
    pub kernel_stack_top: u32,
    pub user_stack_top: Option<u32>,
    pub address_space: AddressSpace,
    pub context: TaskContext,
    pub exit_code: i32,
    pub block_reason: Option<BlockReason>,
    pub name: [u8; 32],
}

impl Task {
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Fixed-capacity task storage, replacing the raw-next-pointer linked list
/// the teacher and the original source both use, with an arena addressed by
/// integer [`TaskId`] (the task's index), per SPEC_FULL.md §9's
/// re-architecture note.
pub struct TaskArena {
    slots: [Option<Task>; MAX_TASKS],
    reserved: [bool; MAX_TASKS],
    next_id_hint: TaskId,
}

impl TaskArena {
    pub const fn new() -> Self {
        const NONE: Option<Task> = None;
        Self {
            slots: [NONE; MAX_TASKS],
            reserved: [false; MAX_TASKS],
            next_id_hint: 0,
        }
    }

    /// Reserves the lowest vacant slot, returning its id. The slot counts as
    /// occupied from this point even before [`TaskArena::insert`] is
    /// called, so a second reservation never picks the same id.
    pub fn reserve_id(&mut self) -> Option<TaskId> {
        for offset in 0..MAX_TASKS {
            let id = (self.next_id_hint + offset) % MAX_TASKS;
            if !self.reserved[id] {
                self.reserved[id] = true;
                self.next_id_hint = (id + 1) % MAX_TASKS;
                return Some(id);
            }
        }
        None
    }

    /// Stores `task` at its own `id`, which must have been returned by a
    /// prior [`TaskArena::reserve_id`] call not yet consumed by an insert.
    pub fn insert(&mut self, task: Task) {
        debug_assert!(self.reserved[task.id]);
        self.slots[task.id] = Some(task);
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(id)?.as_mut()
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.reserved[id] = false;
        self.slots[id].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn children_of(&self, parent: TaskId) -> impl Iterator<Item = &Task> {
        self.iter().filter(move |t| t.parent == Some(parent))
    }
}

impl Default for TaskArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_id_picks_lowest_vacant_slot() {
        let mut arena = TaskArena::new();
        let a = arena.reserve_id().unwrap();
        assert_eq!(a, 0);
        let b = arena.reserve_id().unwrap();
        assert_eq!(b, 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut arena = TaskArena::new();
        for _ in 0..MAX_TASKS {
            arena.reserve_id().unwrap();
        }
        assert!(arena.reserve_id().is_none());
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut arena = TaskArena::new();
        let a = arena.reserve_id().unwrap();
        assert!(arena.remove(a).is_none()); // never inserted
        let b = arena.reserve_id().unwrap();
        assert_eq!(a, b);
    }
}
