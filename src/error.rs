//! Kernel-internal error type. Every fallible core operation returns a
//! [`KernelError`] rather than a bare sentinel integer; the syscall dispatcher
//! is the single place that flattens one down to the ABI's negative-integer
//! convention.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free physical frame was available.
    OutOfFrames,
    /// The kernel heap could not satisfy an allocation.
    OutOfMemory,
    /// A user pointer failed validation (unmapped, wrong permissions, or out
    /// of the user range).
    InvalidPointer,
    /// A syscall argument was malformed (bad syscall number, bad flags, ...).
    InvalidArgument,
    /// A port's message queue was full and the caller asked not to block.
    PortFull,
    /// A port's message queue was empty and the caller asked not to block.
    PortEmpty,
    /// Referenced an id that does not name a live port.
    NoSuchPort,
    /// Referenced an id that does not name a live task.
    NoSuchTask,
    /// The port table has no free slot.
    NoFreePort,
    /// The task arena has no free slot.
    NoFreeTask,
    /// The caller is not the port's owner and the operation requires it.
    NotOwner,
    /// An ELF image failed validation or could not be mapped.
    BadExecutable,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::OutOfFrames => "out of physical frames",
            KernelError::OutOfMemory => "kernel heap exhausted",
            KernelError::InvalidPointer => "invalid user pointer",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::PortFull => "port queue full",
            KernelError::PortEmpty => "port queue empty",
            KernelError::NoSuchPort => "no such port",
            KernelError::NoSuchTask => "no such task",
            KernelError::NoFreePort => "port table exhausted",
            KernelError::NoFreeTask => "task table exhausted",
            KernelError::NotOwner => "caller does not own this port",
            KernelError::BadExecutable => "malformed executable image",
        };
        f.write_str(s)
    }
}

pub type KResult<T> = Result<T, KernelError>;

/// Flattens a [`KernelError`] to the ABI's negative-integer convention.
/// `-2` is reserved for the two NONBLOCK back-pressure cases so user code
/// can distinguish a transient full/empty queue from a hard failure; every
/// other error collapses to `-1`.
impl KernelError {
    pub fn to_errno(self) -> i32 {
        match self {
            KernelError::PortFull | KernelError::PortEmpty => -2,
            _ => -1,
        }
    }
}
