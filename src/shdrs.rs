//! Section header table access, null entry checks and resolution of the
//! extended section count and name table index.

use crate::{Result, arch::Shdr, ehdr::ElfHeader, invalid_format};
use elf::abi::{SHN_UNDEF, SHN_XINDEX, SHT_NULL};

/// A non-owning view of the section header table.
///
/// Construction resolves the extended numbering scheme: when `e_shnum`
/// or `e_shstrndx` overflow their 16-bit fields, the real values are
/// carried in the `sh_size` and `sh_link` fields of section 0.
pub(crate) struct ElfShdrs {
    ptr: *const u8,
    entsize: usize,
    num: usize,
    shstrndx: usize,
}

impl ElfShdrs {
    pub(crate) fn new(ehdr: &ElfHeader, data: &[u8]) -> Result<Option<ElfShdrs>> {
        let off = ehdr.e_shoff();
        if off == 0 {
            return Ok(None);
        }
        let entsize = ehdr.e_shentsize();
        if off.checked_add(entsize).is_none_or(|end| end > data.len()) {
            return Err(invalid_format("section header table out of bounds"));
        }
        let null: &Shdr = unsafe { &*data.as_ptr().add(off).cast() };
        if null.sh_type != SHT_NULL {
            return Err(invalid_format("section 0 is not SHT_NULL"));
        }
        if null.sh_name != 0
            || null.sh_flags != 0
            || null.sh_addr != 0
            || null.sh_offset != 0
            || null.sh_info != 0
            || null.sh_addralign != 0
            || null.sh_entsize != 0
        {
            return Err(invalid_format("section 0 has a non-zero field"));
        }
        let num = if ehdr.e_shnum() == 0 {
            null.sh_size as usize
        } else {
            if null.sh_size != 0 {
                return Err(invalid_format("section 0 has a non-zero sh_size"));
            }
            ehdr.e_shnum()
        };
        if num == 0 {
            return Err(invalid_format("section header table has no entries"));
        }
        let shstrndx = if ehdr.e_shstrndx() == SHN_XINDEX as usize {
            null.sh_link as usize
        } else {
            if null.sh_link != 0 {
                return Err(invalid_format("section 0 has a non-zero sh_link"));
            }
            ehdr.e_shstrndx()
        };
        if num
            .checked_mul(entsize)
            .and_then(|size| off.checked_add(size))
            .is_none_or(|end| end > data.len())
        {
            return Err(invalid_format("section header table out of bounds"));
        }
        let shdrs = ElfShdrs {
            ptr: unsafe { data.as_ptr().add(off) },
            entsize,
            num,
            shstrndx,
        };
        if shstrndx != SHN_UNDEF as usize {
            if shstrndx >= num {
                return Err(invalid_format("section name table index out of range"));
            }
            let strtab = shdrs.get(shstrndx);
            if strtab
                .sh_offset
                .checked_add(strtab.sh_size)
                .is_none_or(|end| end > data.len() as u64)
            {
                return Err(invalid_format("section name table out of bounds"));
            }
        }
        Ok(Some(shdrs))
    }

    #[inline]
    pub(crate) fn get(&self, idx: usize) -> &Shdr {
        debug_assert!(idx < self.num);
        unsafe { &*self.ptr.add(idx * self.entsize).cast() }
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Shdr> {
        (0..self.num).map(|idx| self.get(idx))
    }
}
