use crate::{
    Result,
    arch::{E_CLASS, EHDR_SIZE, EM_ARCH, Ehdr, PHDR_SIZE, SHDR_SIZE},
    invalid_format, not_supported,
};
use core::ops::Deref;
use elf::abi::{EI_CLASS, EI_DATA, EI_VERSION, ELFDATA2LSB, ELFMAGIC, ET_DYN, EV_CURRENT};

#[repr(transparent)]
pub struct ElfHeader {
    ehdr: Ehdr,
}

impl Clone for ElfHeader {
    fn clone(&self) -> Self {
        Self {
            ehdr: Ehdr {
                e_ident: self.e_ident,
                e_type: self.e_type,
                e_machine: self.e_machine,
                e_version: self.e_version,
                e_entry: self.e_entry,
                e_phoff: self.e_phoff,
                e_shoff: self.e_shoff,
                e_flags: self.e_flags,
                e_ehsize: self.e_ehsize,
                e_phentsize: self.e_phentsize,
                e_phnum: self.e_phnum,
                e_shentsize: self.e_shentsize,
                e_shnum: self.e_shnum,
                e_shstrndx: self.e_shstrndx,
            },
        }
    }
}

impl Deref for ElfHeader {
    type Target = Ehdr;

    fn deref(&self) -> &Self::Target {
        &self.ehdr
    }
}

impl ElfHeader {
    pub(crate) fn new(data: &[u8]) -> Result<&Self> {
        if data.len() < EHDR_SIZE {
            return Err(invalid_format("file is shorter than an ELF header"));
        }
        let ehdr: &ElfHeader = unsafe { &*(data.as_ptr().cast()) };
        Ok(ehdr)
    }

    /// Reinterpret the start of an already mapped image as the header.
    ///
    /// # Safety
    /// `ptr` must point to at least [`EHDR_SIZE`] readable bytes.
    pub(crate) unsafe fn from_ptr<'a>(ptr: *const u8) -> &'a Self {
        unsafe { &*(ptr.cast()) }
    }

    /// Check that the header describes a shared object this crate can load.
    ///
    /// Structural damage reports `InvalidFormat`, a well-formed header for
    /// another target reports `NotSupported`.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.e_ident[0..4] != ELFMAGIC {
            return Err(invalid_format("invalid ELF magic"));
        }
        if self.e_ident[EI_CLASS] != E_CLASS {
            return Err(not_supported("file class mismatch"));
        }
        if self.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(not_supported("data encoding mismatch"));
        }
        if self.e_ident[EI_VERSION] != EV_CURRENT {
            return Err(not_supported("invalid ELF version"));
        }
        if self.ehdr.e_type != ET_DYN {
            return Err(not_supported("not a shared object"));
        }
        if self.e_machine != EM_ARCH {
            return Err(not_supported("file arch mismatch"));
        }
        if (self.ehdr.e_ehsize as usize) < EHDR_SIZE {
            return Err(invalid_format("e_ehsize is smaller than the ELF header"));
        }
        if self.e_phoff() != 0 && self.e_phentsize() < PHDR_SIZE {
            return Err(invalid_format("e_phentsize is smaller than a program header"));
        }
        if self.e_shoff() != 0 && self.e_shentsize() < SHDR_SIZE {
            return Err(invalid_format("e_shentsize is smaller than a section header"));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn e_phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    #[inline]
    pub(crate) fn e_phentsize(&self) -> usize {
        self.ehdr.e_phentsize as usize
    }

    #[inline]
    pub(crate) fn e_phoff(&self) -> usize {
        self.ehdr.e_phoff as usize
    }

    #[inline]
    pub(crate) fn e_shoff(&self) -> usize {
        self.ehdr.e_shoff as usize
    }

    #[inline]
    pub(crate) fn e_shentsize(&self) -> usize {
        self.ehdr.e_shentsize as usize
    }

    #[inline]
    pub(crate) fn e_shnum(&self) -> usize {
        self.ehdr.e_shnum as usize
    }

    #[inline]
    pub(crate) fn e_shstrndx(&self) -> usize {
        self.ehdr.e_shstrndx as usize
    }

    #[inline]
    pub(crate) fn phdr_range(&self) -> Result<(usize, usize)> {
        let phdrs_size = self.e_phentsize() * self.e_phnum();
        let phdr_start = self.e_phoff();
        let phdr_end = phdr_start
            .checked_add(phdrs_size)
            .ok_or_else(|| invalid_format("program header table out of bounds"))?;
        Ok((phdr_start, phdr_end))
    }
}
