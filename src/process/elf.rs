//! ELF32 executable loader for `exec` (§4.3, §6). Validation rules are
//! grounded in mexOS's `kernel/core/elf.c` (`elf_validate`/`elf_load`); the
//! header/program-header parsing itself goes through the `xmas-elf` crate
//! rather than a hand-rolled reader, per the dependency-stack note in
//! DESIGN.md.

use xmas_elf::header::{Class, Data, HeaderPt2, Machine, Type};
use xmas_elf::program::{ProgramHeader, Type as SegmentType};
use xmas_elf::ElfFile;

use crate::arch::Arch;
use crate::config::{KERNEL_VIRTUAL_BASE, PAGE_SIZE};
use crate::error::{KResult, KernelError};
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::phys::PhysMemory;
use crate::memory::vmm::{self, AddressSpace, PageFlags};

pub struct LoadedImage {
    pub entry_point: u32,
    /// End of the highest loaded segment, page-aligned: the initial `brk`.
    pub brk: u32,
}

fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

fn page_align_up(addr: u32) -> u32 {
    page_align_down(addr + PAGE_SIZE as u32 - 1)
}

/// Validates and loads an ELF32/i386/ET_EXEC image's `PT_LOAD` segments into
/// `space`, zeroing each segment's BSS tail. Bytes come from an in-memory
/// initrd blob (not a filesystem — out of scope per §1). On any failure no
/// assumption is made about which pages were already mapped; the caller is
/// expected to destroy the partially built address space.
pub fn load_elf<A: Arch>(
    mem: &mut impl PhysMemory,
    frames: &mut FrameAllocator,
    space: &AddressSpace,
    data: &[u8],
) -> KResult<LoadedImage> {
    let elf = ElfFile::new(data).map_err(|_| KernelError::BadExecutable)?;

    if elf.header.pt1.magic != [0x7f, b'E', b'L', b'F'] {
        return Err(KernelError::BadExecutable);
    }
    if elf.header.pt1.class() != Class::ThirtyTwo {
        return Err(KernelError::BadExecutable);
    }
    if elf.header.pt1.data() != Data::LittleEndian {
        return Err(KernelError::BadExecutable);
    }
    let pt2 = match &elf.header.pt2 {
        HeaderPt2::Header32(h) => h,
        _ => return Err(KernelError::BadExecutable),
    };
    if pt2.type_.as_type() != Type::Executable {
        return Err(KernelError::BadExecutable);
    }
    if pt2.machine.as_machine() != Machine::X86 {
        return Err(KernelError::BadExecutable);
    }

    let mut brk: u32 = 0;

    for segment in elf.program_iter() {
        let ProgramHeader::Ph32(ph) = segment else {
            continue;
        };
        if ph.get_type() != Ok(SegmentType::Load) {
            continue;
        }
        if ph.mem_size == 0 {
            continue;
        }
        let vaddr = ph.virtual_addr;
        if vaddr >= KERNEL_VIRTUAL_BASE {
            return Err(KernelError::BadExecutable);
        }

        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if ph.flags.is_write() {
            flags |= PageFlags::WRITABLE;
        }

        let start_page = page_align_down(vaddr);
        let end_page = page_align_up(vaddr + ph.mem_size);
        let mut page = start_page;
        while page < end_page {
            if !vmm::is_mapped(mem, space, page) {
                vmm::alloc_page::<A>(mem, frames, space, page, flags)?;
            }
            page += PAGE_SIZE as u32;
        }

        let file_bytes = &data[ph.offset as usize..(ph.offset + ph.file_size) as usize];
        write_user_bytes(mem, space, vaddr, file_bytes)?;

        if ph.mem_size > ph.file_size {
            zero_user_bytes(mem, space, vaddr + ph.file_size, ph.mem_size - ph.file_size)?;
        }

        brk = brk.max(end_page);
    }

    Ok(LoadedImage {
        entry_point: pt2.entry_point,
        brk,
    })
}

/// Copies `bytes` into `space` starting at `vaddr`, which may span several
/// pages; each page's backing frame is looked up individually since pages
/// need not be physically contiguous.
fn write_user_bytes(
    mem: &mut impl PhysMemory,
    space: &AddressSpace,
    vaddr: u32,
    bytes: &[u8],
) -> KResult<()> {
    let mut written = 0usize;
    while written < bytes.len() {
        let cur = vaddr + written as u32;
        let page = page_align_down(cur);
        let in_page_offset = (cur - page) as usize;
        let chunk_len = (PAGE_SIZE - in_page_offset).min(bytes.len() - written);
        let frame = vmm::translate(mem, space, page).ok_or(KernelError::BadExecutable)?;
        mem.write_bytes(page_align_down(frame), in_page_offset, &bytes[written..written + chunk_len]);
        written += chunk_len;
    }
    Ok(())
}

fn zero_user_bytes(mem: &mut impl PhysMemory, space: &AddressSpace, vaddr: u32, len: u32) -> KResult<()> {
    let zeros = [0u8; PAGE_SIZE];
    let mut done = 0u32;
    while done < len {
        let cur = vaddr + done;
        let page = page_align_down(cur);
        let in_page_offset = (cur - page) as usize;
        let chunk_len = ((PAGE_SIZE - in_page_offset) as u32).min(len - done);
        let frame = vmm::translate(mem, space, page).ok_or(KernelError::BadExecutable)?;
        mem.write_bytes(page_align_down(frame), in_page_offset, &zeros[..chunk_len as usize]);
        done += chunk_len;
    }
    Ok(())
}
