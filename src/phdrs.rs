//! Program header table access and structural checks.

use crate::{Result, arch::Phdr, ehdr::ElfHeader, invalid_format};
use elf::abi::{PT_INTERP, PT_LOAD, PT_PHDR, PT_SHLIB};

/// A non-owning view of the program header table.
///
/// The view respects `e_phentsize`, so it stays correct for files whose
/// entries are larger than `Elf64_Phdr`.
pub(crate) struct ElfPhdrs {
    ptr: *const u8,
    entsize: usize,
    num: usize,
}

impl ElfPhdrs {
    /// Locate the table inside the file view, checking that it lies
    /// entirely within the file.
    pub(crate) fn new(ehdr: &ElfHeader, data: &[u8]) -> Result<Option<ElfPhdrs>> {
        if ehdr.e_phoff() == 0 || ehdr.e_phnum() == 0 {
            return Ok(None);
        }
        let (start, end) = ehdr.phdr_range()?;
        if end > data.len() {
            return Err(invalid_format("program header table out of bounds"));
        }
        Ok(Some(ElfPhdrs {
            ptr: unsafe { data.as_ptr().add(start) },
            entsize: ehdr.e_phentsize(),
            num: ehdr.e_phnum(),
        }))
    }

    /// Build the view over headers living in an already mapped image.
    ///
    /// # Safety
    /// `ptr` must point to `num` readable entries of `entsize` bytes each.
    pub(crate) unsafe fn from_ptr(ptr: *const u8, entsize: usize, num: usize) -> ElfPhdrs {
        ElfPhdrs { ptr, entsize, num }
    }

    #[inline]
    pub(crate) fn get(&self, idx: usize) -> &Phdr {
        debug_assert!(idx < self.num);
        unsafe { &*self.ptr.add(idx * self.entsize).cast() }
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Phdr> {
        (0..self.num).map(|idx| self.get(idx))
    }

    #[inline]
    pub(crate) fn find(&self, p_type: u32) -> Option<&Phdr> {
        self.iter().find(|phdr| phdr.p_type == p_type)
    }

    /// Walk every entry and reject tables no loadable object can have.
    pub(crate) fn validate(&self) -> Result<()> {
        let mut interp = 0usize;
        let mut phdr_segs = 0usize;
        for phdr in self.iter() {
            match phdr.p_type {
                PT_LOAD => {
                    if phdr.p_filesz > phdr.p_memsz {
                        return Err(invalid_format(
                            "PT_LOAD file size is larger than its memory size",
                        ));
                    }
                }
                PT_INTERP => {
                    interp += 1;
                    if interp > 1 {
                        return Err(invalid_format("more than one PT_INTERP segment"));
                    }
                }
                PT_PHDR => {
                    phdr_segs += 1;
                    if phdr_segs > 1 {
                        return Err(invalid_format("more than one PT_PHDR segment"));
                    }
                }
                PT_SHLIB => {
                    return Err(invalid_format("PT_SHLIB segment is not allowed"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
