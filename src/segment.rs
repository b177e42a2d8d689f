//! The memory image of an elf object and the code that builds it.
//!
//! Loading happens in two steps: one `PROT_NONE` reservation spanning
//! every `PT_LOAD` segment, then a fixed file mapping per segment placed
//! inside the reservation. Trailing zero-fill (`p_memsz > p_filesz`) is
//! written in place up to the next page boundary and backed by fresh
//! anonymous pages beyond it.

use crate::{
    Result,
    arch::Phdr,
    invalid_format, invalid_mem_map,
    mmap::{MapFlags, Mmap, ProtFlags},
    out_of_memory,
};
use core::ffi::c_void;
use core::fmt::Debug;
use core::ptr::NonNull;
use elf::abi::{PF_R, PF_W, PF_X, PT_LOAD};

#[inline]
pub(crate) fn roundup(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

#[inline]
pub(crate) fn rounddown(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// The memory image of an elf object.
///
/// The mapping is never torn down: once built it stays valid for the
/// rest of the process, so pointers handed out from it do not dangle
/// even after the handle that produced them is recycled.
pub(crate) struct ElfSegments {
    memory: NonNull<c_void>,
    /// The page-floored lowest `p_vaddr` of the image.
    offset: usize,
    len: usize,
    page_size: usize,
}

impl Debug for ElfSegments {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ElfSegments")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl ElfSegments {
    /// Describe an image that is already resident, e.g. one mapped by
    /// the platform loader. `memory` points at the ELF header.
    pub(crate) fn from_raw(
        memory: NonNull<c_void>,
        offset: usize,
        len: usize,
        page_size: usize,
    ) -> Self {
        ElfSegments {
            memory,
            offset,
            len,
            page_size,
        }
    }

    /// Convert `PF_*` segment permissions into mapping protection.
    #[inline]
    pub(crate) fn map_prot(prot: u32) -> ProtFlags {
        ProtFlags::from_bits_retain(((prot & PF_X) << 2 | prot & PF_W | (prot & PF_R) >> 2) as _)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// base = memory_addr - offset, so that `base() + p_vaddr` addresses
    /// into the image for any virtual address of the file.
    #[inline]
    pub(crate) fn base(&self) -> usize {
        unsafe { self.memory.as_ptr().cast::<u8>().sub(self.offset) as usize }
    }

    #[inline]
    pub(crate) fn get_ptr<T>(&self, offset: usize) -> *const T {
        debug_assert!(offset - self.offset < self.len);
        (self.base() + offset) as *const T
    }
}

/// Compute the page-floored lowest `PT_LOAD` address and the page-rounded
/// span of the whole image.
pub(crate) fn image_span(phdrs: &crate::phdrs::ElfPhdrs, page_size: usize) -> Result<(usize, usize)> {
    let mut min_vaddr = usize::MAX;
    let mut max_vaddr = 0;
    for phdr in phdrs.iter() {
        if phdr.p_type == PT_LOAD {
            let vaddr_start = phdr.p_vaddr as usize;
            let vaddr_end = vaddr_start
                .checked_add(phdr.p_memsz as usize)
                .ok_or_else(|| invalid_format("PT_LOAD segment wraps the address space"))?;
            if vaddr_start < min_vaddr {
                min_vaddr = vaddr_start;
            }
            if vaddr_end > max_vaddr {
                max_vaddr = vaddr_end;
            }
        }
    }
    if min_vaddr == usize::MAX {
        return Err(invalid_format("no PT_LOAD segment"));
    }
    let min_vaddr = rounddown(min_vaddr, page_size);
    // Rounding the end up can itself wrap for an image ending within a
    // page of the address-space top.
    let total_end = max_vaddr
        .checked_add(page_size - 1)
        .ok_or_else(|| invalid_format("PT_LOAD segment wraps the address space"))?
        & !(page_size - 1);
    Ok((min_vaddr, total_end - min_vaddr))
}

/// Reserve the image region and map every `PT_LOAD` segment into it.
pub(crate) fn load_segments<M: Mmap>(
    phdrs: &crate::phdrs::ElfPhdrs,
    fd: i32,
    page_size: usize,
) -> Result<ElfSegments> {
    let (min_vaddr, total_size) = image_span(phdrs, page_size)?;
    let memory = unsafe { M::mmap_reserve(total_size) }
        .map_err(|_| out_of_memory("failed to reserve address space for the image"))?;
    let segments = ElfSegments {
        memory,
        offset: min_vaddr,
        len: total_size,
        page_size,
    };
    #[cfg(feature = "log")]
    log::trace!(
        "[Reserve] address: 0x{:x}, length: {}, offset: 0x{:x}",
        memory.as_ptr() as usize,
        total_size,
        min_vaddr
    );
    for phdr in phdrs.iter() {
        if phdr.p_type == PT_LOAD {
            mmap_segment::<M>(&segments, phdr, fd)?;
        }
    }
    Ok(segments)
}

fn mmap_segment<M: Mmap>(segments: &ElfSegments, phdr: &Phdr, fd: i32) -> Result<()> {
    let page_size = segments.page_size;
    let prot = ElfSegments::map_prot(phdr.p_flags);
    let vaddr = phdr.p_vaddr as usize;
    let filesz = phdr.p_filesz as usize;
    let memsz = phdr.p_memsz as usize;
    let prog_addr = segments.base() + vaddr;
    // The segment start may sit inside a page; the mapping is widened to
    // the page boundary on both sides.
    let padding = vaddr & (page_size - 1);
    if filesz > 0 {
        let map_addr = prog_addr - padding;
        let map_len = roundup(filesz + padding, page_size);
        let map_offset = (phdr.p_offset as usize).checked_sub(padding).ok_or_else(|| {
            invalid_format("PT_LOAD file offset is smaller than its address page offset")
        })?;
        let ptr = unsafe {
            M::mmap(
                Some(map_addr),
                map_len,
                prot,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                fd,
                map_offset,
            )
        }
        .map_err(|_| invalid_mem_map("failed to map segment"))?;
        if ptr.as_ptr() as usize != map_addr {
            return Err(invalid_mem_map("segment was mapped at an unexpected address"));
        }
        #[cfg(feature = "log")]
        log::trace!(
            "[Mmap] address: 0x{:x}, length: {}, prot: {:?}, offset: 0x{:x}",
            map_addr,
            map_len,
            prot,
            map_offset
        );
    }
    if memsz > filesz {
        fill_zero::<M>(prog_addr + filesz, memsz - filesz, prot, page_size)?;
    }
    Ok(())
}

fn fill_zero<M: Mmap>(
    zero_start: usize,
    zero_size: usize,
    prot: ProtFlags,
    page_size: usize,
) -> Result<()> {
    // The fill always runs to the page boundary: past `p_memsz` the rest
    // of the page still holds stale file bytes.
    let zero_end = roundup(zero_start, page_size);
    let write_len = zero_end - zero_start;
    unsafe {
        (zero_start as *mut u8).write_bytes(0, write_len);
    }
    if write_len < zero_size {
        // The rest starts page-aligned; fresh anonymous pages come
        // zero-filled already.
        let zero_mmap_len = zero_size - write_len;
        unsafe {
            M::mmap_anonymous(
                zero_end,
                zero_mmap_len,
                prot,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
            )
        }
        .map_err(|_| invalid_mem_map("failed to map zero-fill pages"))?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Mmap] address: 0x{:x}, length: {}, prot: {:?}, zero-fill",
            zero_end,
            zero_mmap_len,
            prot
        );
    }
    Ok(())
}

/// A `PT_GNU_RELRO` range waiting to be made read-only.
pub(crate) struct ElfRelro {
    base: usize,
    vaddr: usize,
    len: usize,
    page_size: usize,
}

impl ElfRelro {
    pub(crate) fn new(phdr: &Phdr, base: usize, page_size: usize) -> ElfRelro {
        ElfRelro {
            base,
            vaddr: phdr.p_vaddr as usize,
            len: phdr.p_memsz as usize,
            page_size,
        }
    }

    #[inline]
    pub(crate) fn apply<M: Mmap>(&self) -> Result<()> {
        let addr = self
            .base
            .checked_add(self.vaddr)
            .ok_or_else(|| invalid_format("PT_GNU_RELRO segment wraps the address space"))?;
        let end = addr
            .checked_add(self.len)
            .and_then(|end| end.checked_add(self.page_size - 1))
            .ok_or_else(|| invalid_format("PT_GNU_RELRO segment wraps the address space"))?
            & !(self.page_size - 1);
        let start = rounddown(addr, self.page_size);
        let start_addr = unsafe { NonNull::new_unchecked(start as _) };
        unsafe {
            M::mprotect(start_addr, end - start, ProtFlags::PROT_READ)?;
        }
        #[cfg(feature = "log")]
        log::trace!("[Relro] address: 0x{:x}, length: {}", start, end - start);
        Ok(())
    }
}
