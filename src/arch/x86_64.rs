//! x86-64 definitions: raw ELF-64 record types, relocation constants and
//! thin accessor wrappers around the records this crate consumes.

use core::mem::size_of;
use elf::abi::*;

/// The ELF machine type accepted by this crate.
pub const EM_ARCH: u16 = EM_X86_64;
/// The ELF class accepted by this crate.
pub const E_CLASS: u8 = ELFCLASS64;

pub(crate) type Phdr = elf::segment::Elf64_Phdr;
pub(crate) type Shdr = elf::section::Elf64_Shdr;
pub(crate) type Dyn = elf::dynamic::Elf64_Dyn;
pub(crate) type Ehdr = elf::file::Elf64_Ehdr;
pub(crate) type Rela = elf::relocation::Elf64_Rela;
pub(crate) type Rel = elf::relocation::Elf64_Rel;
pub(crate) type Sym = elf::symbol::Elf64_Sym;

pub(crate) const REL_MASK: usize = 0xFFFFFFFF;
pub(crate) const REL_BIT: usize = 32;
pub(crate) const EHDR_SIZE: usize = size_of::<Ehdr>();
pub(crate) const PHDR_SIZE: usize = size_of::<Phdr>();
pub(crate) const SHDR_SIZE: usize = size_of::<Shdr>();

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_X86_64_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_X86_64_GLOB_DAT;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_X86_64_64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;

/// Map an x86-64 relocation type value to a human readable name.
pub fn rel_type_to_str(r_type: usize) -> &'static str {
    match r_type as u32 {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC32 => "R_X86_64_PC32",
        R_X86_64_GOT32 => "R_X86_64_GOT32",
        R_X86_64_PLT32 => "R_X86_64_PLT32",
        R_X86_64_COPY => "R_X86_64_COPY",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        R_X86_64_32 => "R_X86_64_32",
        R_X86_64_32S => "R_X86_64_32S",
        R_X86_64_IRELATIVE => "R_X86_64_IRELATIVE",
        _ => "UNKNOWN",
    }
}

/// A relocation entry with an explicit addend.
#[repr(transparent)]
pub(crate) struct ElfRela {
    rela: Rela,
}

impl ElfRela {
    #[inline]
    pub(crate) fn r_type(&self) -> usize {
        self.rela.r_info as usize & REL_MASK
    }

    #[inline]
    pub(crate) fn r_symbol(&self) -> usize {
        self.rela.r_info as usize >> REL_BIT
    }

    #[inline]
    pub(crate) fn r_offset(&self) -> usize {
        self.rela.r_offset as usize
    }

    #[inline]
    pub(crate) fn r_addend(&self) -> isize {
        self.rela.r_addend as isize
    }
}

/// A relocation entry whose addend is the word already stored at the
/// relocated location.
#[repr(transparent)]
pub(crate) struct ElfRel {
    rel: Rel,
}

impl ElfRel {
    #[inline]
    pub(crate) fn r_type(&self) -> usize {
        self.rel.r_info as usize & REL_MASK
    }

    #[inline]
    pub(crate) fn r_symbol(&self) -> usize {
        self.rel.r_info as usize >> REL_BIT
    }

    #[inline]
    pub(crate) fn r_offset(&self) -> usize {
        self.rel.r_offset as usize
    }
}

/// A symbol table entry.
#[repr(transparent)]
pub struct ElfSymbol {
    sym: Sym,
}

impl ElfSymbol {
    #[inline]
    pub fn st_value(&self) -> usize {
        self.sym.st_value as usize
    }

    #[inline]
    pub fn st_name(&self) -> usize {
        self.sym.st_name as usize
    }

    #[inline]
    pub fn st_shndx(&self) -> usize {
        self.sym.st_shndx as usize
    }

    #[inline]
    pub fn st_size(&self) -> usize {
        self.sym.st_size as usize
    }

    #[inline]
    pub fn is_undef(&self) -> bool {
        self.sym.st_shndx == SHN_UNDEF
    }
}
