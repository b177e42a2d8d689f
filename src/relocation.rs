//! Applying relocations to the mapped image.
//!
//! Two drivers feed the same apply loop. Freshly mapped files are
//! walked through the section header table (`SHT_RELA` / `SHT_REL`),
//! reading entries out of the file view and writing into the image.
//! Already resident images have no section table, so their entries come
//! from the arrays the dynamic section names (`DT_RELA`, `DT_REL`,
//! `DT_JMPREL`).

use crate::{
    Result,
    arch::{ElfRel, ElfRela, REL_GOT, REL_JUMP_SLOT, REL_NONE, REL_RELATIVE, REL_SYMBOLIC},
    dynamic::{ElfDynamic, RelocKind},
    invalid_format,
    shdrs::ElfShdrs,
    symbol::SymbolTable,
    unknown_format,
};
use elf::abi::{SHT_REL, SHT_RELA};

/*
    A Represents the addend used to compute the value of the relocatable field.
    B Represents the base address at which a shared object has been loaded into memory during execution.
    S Represents the value of the symbol whose index resides in the relocation entry.
*/

pub(crate) trait RelocEntry {
    fn r_offset(&self) -> usize;
    fn r_type(&self) -> usize;
    fn r_symbol(&self) -> usize;
    /// The addend; for implicit-addend entries this reads the word
    /// already stored at the relocated location.
    fn addend(&self, target: usize) -> isize;
}

impl RelocEntry for ElfRela {
    #[inline]
    fn r_offset(&self) -> usize {
        ElfRela::r_offset(self)
    }

    #[inline]
    fn r_type(&self) -> usize {
        ElfRela::r_type(self)
    }

    #[inline]
    fn r_symbol(&self) -> usize {
        ElfRela::r_symbol(self)
    }

    #[inline]
    fn addend(&self, _target: usize) -> isize {
        self.r_addend()
    }
}

impl RelocEntry for ElfRel {
    #[inline]
    fn r_offset(&self) -> usize {
        ElfRel::r_offset(self)
    }

    #[inline]
    fn r_type(&self) -> usize {
        ElfRel::r_type(self)
    }

    #[inline]
    fn r_symbol(&self) -> usize {
        ElfRel::r_symbol(self)
    }

    #[inline]
    fn addend(&self, target: usize) -> isize {
        unsafe { (target as *const usize).read() as isize }
    }
}

/// Apply a single entry. The full word at the target is rewritten
/// regardless of the relocation's nominal width.
fn apply_one<E: RelocEntry>(entry: &E, base: usize, symtab: &SymbolTable) {
    let r_type = entry.r_type();
    let target = base + entry.r_offset();
    let value = match r_type as u32 {
        // Marks a discarded entry; writing would clobber the word at
        // offset zero.
        REL_NONE => return,
        // B + A
        REL_RELATIVE => base.wrapping_add_signed(entry.addend(target)),
        // S
        REL_GOT | REL_JUMP_SLOT => {
            let sym = symtab.symbol(entry.r_symbol());
            base + sym.st_value()
        }
        // S + A
        REL_SYMBOLIC => {
            let sym = symtab.symbol(entry.r_symbol());
            (base + sym.st_value()).wrapping_add_signed(entry.addend(target))
        }
        _ => {
            #[cfg(feature = "log")]
            log::trace!(
                "[Relocate] unhandled type {} at offset 0x{:x}, storing zero",
                crate::arch::rel_type_to_str(r_type),
                entry.r_offset()
            );
            0
        }
    };
    unsafe { (target as *mut usize).write(value) };
}

/// Walk an array of `count * ent` bytes of relocation entries.
fn apply_array<E: RelocEntry>(
    ptr: *const u8,
    size: usize,
    ent: usize,
    base: usize,
    symtab: &SymbolTable,
) -> Result<()> {
    if ent < size_of::<E>() {
        return Err(unknown_format(
            "relocation entry size is smaller than its entry type",
        ));
    }
    let count = size / ent;
    #[cfg(feature = "log")]
    log::trace!(
        "[Relocate] array at 0x{:x}: {} entries of {} bytes",
        ptr as usize,
        count,
        ent
    );
    for idx in 0..count {
        let entry: &E = unsafe { &*ptr.add(idx * ent).cast() };
        apply_one(entry, base, symtab);
    }
    Ok(())
}

/// Apply every relocation section found in the section header table.
/// Entries are read from the file view; the targets they name live in
/// the image.
pub(crate) fn relocate_sections(
    shdrs: &ElfShdrs,
    data: &[u8],
    base: usize,
    symtab: &SymbolTable,
) -> Result<()> {
    for shdr in shdrs.iter() {
        let sh_type = shdr.sh_type;
        if sh_type != SHT_RELA && sh_type != SHT_REL {
            continue;
        }
        let offset = shdr.sh_offset as usize;
        let size = shdr.sh_size as usize;
        if offset.checked_add(size).is_none_or(|end| end > data.len()) {
            return Err(invalid_format("relocation section out of bounds"));
        }
        let ptr = unsafe { data.as_ptr().add(offset) };
        let ent = shdr.sh_entsize as usize;
        if sh_type == SHT_RELA {
            apply_array::<ElfRela>(ptr, size, ent, base, symtab)?;
        } else {
            apply_array::<ElfRel>(ptr, size, ent, base, symtab)?;
        }
    }
    Ok(())
}

/// Apply the relocation arrays the dynamic section names.
pub(crate) fn relocate_dynamic(
    dynamic: &ElfDynamic,
    base: usize,
    symtab: &SymbolTable,
) -> Result<()> {
    if let Some(array) = &dynamic.rela {
        apply_array::<ElfRela>(array.addr as *const u8, array.size, array.ent, base, symtab)?;
    }
    if let Some(array) = &dynamic.rel {
        apply_array::<ElfRel>(array.addr as *const u8, array.size, array.ent, base, symtab)?;
    }
    if let Some((kind, array)) = &dynamic.pltrel {
        match kind {
            RelocKind::Rela => {
                apply_array::<ElfRela>(array.addr as *const u8, array.size, array.ent, base, symtab)?
            }
            RelocKind::Rel => {
                apply_array::<ElfRel>(array.addr as *const u8, array.size, array.ent, base, symtab)?
            }
        }
    }
    Ok(())
}
