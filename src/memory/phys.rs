//! [`PhysMemory`]: the trait boundary behind which the VMM's reads/writes of
//! page-directory and page-table frames happen. The real implementation
//! applies the fixed linear phys-to-virt offset described in §4.2 of
//! SPEC_FULL.md; a second, host-array-backed implementation lets the VMM's
//! algorithms be exercised by `cargo test` without paging ever being
//! enabled.

use crate::config::{ENTRIES_PER_TABLE, PAGE_SIZE};

/// One page directory's or page table's worth of raw entries.
pub type TableEntries = [u32; ENTRIES_PER_TABLE];

/// Access to physical memory at page-table granularity. Every method takes
/// a physical frame address (a multiple of [`PAGE_SIZE`]).
pub trait PhysMemory {
    fn read_table(&self, phys: u32) -> TableEntries;
    fn write_table(&mut self, phys: u32, entries: &TableEntries);
    fn zero_frame(&mut self, phys: u32);
    fn write_bytes(&mut self, phys: u32, offset: usize, bytes: &[u8]);
    fn read_bytes(&self, phys: u32, offset: usize, out: &mut [u8]);
}

/// Real hardware implementation: a single fixed linear offset between a
/// frame's physical address and its kernel-virtual alias, set once by
/// [`LinearOffsetMemory::set_offset`] when paging is enabled. Zero before
/// that, matching "identity until paging enabled."
pub struct LinearOffsetMemory {
    offset: u32,
}

impl LinearOffsetMemory {
    pub const fn new() -> Self {
        Self { offset: 0 }
    }

    /// Sets the fixed phys-to-virt offset. Called exactly once, by the
    /// routine that turns paging on.
    pub fn set_offset(&mut self, offset: u32) {
        self.offset = offset;
    }

    fn virt_of(&self, phys: u32) -> *mut u8 {
        (phys as usize + self.offset as usize) as *mut u8
    }
}

impl Default for LinearOffsetMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMemory for LinearOffsetMemory {
    fn read_table(&self, phys: u32) -> TableEntries {
        let mut out = [0u32; ENTRIES_PER_TABLE];
        let src = self.virt_of(phys) as *const u32;
        unsafe {
            core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), ENTRIES_PER_TABLE);
        }
        out
    }

    fn write_table(&mut self, phys: u32, entries: &TableEntries) {
        let dst = self.virt_of(phys) as *mut u32;
        unsafe {
            core::ptr::copy_nonoverlapping(entries.as_ptr(), dst, ENTRIES_PER_TABLE);
        }
    }

    fn zero_frame(&mut self, phys: u32) {
        let dst = self.virt_of(phys);
        unsafe {
            core::ptr::write_bytes(dst, 0, PAGE_SIZE);
        }
    }

    fn write_bytes(&mut self, phys: u32, offset: usize, bytes: &[u8]) {
        let dst = unsafe { self.virt_of(phys).add(offset) };
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    fn read_bytes(&self, phys: u32, offset: usize, out: &mut [u8]) {
        let src = unsafe { self.virt_of(phys).add(offset) };
        unsafe {
            core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }
}

#[cfg(any(test, feature = "test-fakes"))]
pub mod fake {
    use super::*;
    extern crate alloc;
    use alloc::collections::BTreeMap;
    use alloc::vec;
    use alloc::vec::Vec;

    /// Host-side fake modeling physical RAM as a map of frame address to a
    /// page-sized byte buffer, allocated lazily on first touch so a test
    /// doesn't need to pre-size a multi-megabyte array.
    #[derive(Default)]
    pub struct FakePhysMemory {
        frames: BTreeMap<u32, Vec<u8>>,
    }

    impl FakePhysMemory {
        pub fn new() -> Self {
            Self {
                frames: BTreeMap::new(),
            }
        }

        fn frame_mut(&mut self, phys: u32) -> &mut Vec<u8> {
            self.frames.entry(phys).or_insert_with(|| vec![0u8; PAGE_SIZE])
        }

        fn frame(&self, phys: u32) -> Vec<u8> {
            self.frames
                .get(&phys)
                .cloned()
                .unwrap_or_else(|| vec![0u8; PAGE_SIZE])
        }
    }

    impl PhysMemory for FakePhysMemory {
        fn read_table(&self, phys: u32) -> TableEntries {
            let bytes = self.frame(phys);
            let mut out = [0u32; ENTRIES_PER_TABLE];
            for (i, chunk) in bytes.chunks_exact(4).enumerate() {
                out[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            out
        }

        fn write_table(&mut self, phys: u32, entries: &TableEntries) {
            let buf = self.frame_mut(phys);
            for (i, &entry) in entries.iter().enumerate() {
                buf[i * 4..i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
            }
        }

        fn zero_frame(&mut self, phys: u32) {
            let buf = self.frame_mut(phys);
            buf.iter_mut().for_each(|b| *b = 0);
        }

        fn write_bytes(&mut self, phys: u32, offset: usize, bytes: &[u8]) {
            let buf = self.frame_mut(phys);
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        fn read_bytes(&self, phys: u32, offset: usize, out: &mut [u8]) {
            let buf = self.frame(phys);
            out.copy_from_slice(&buf[offset..offset + out.len()]);
        }
    }
}
