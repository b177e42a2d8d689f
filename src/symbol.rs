//! ELF symbol table handling.
//!
//! Bridges the raw symbol records of a loaded image and the name lookup
//! API. Strings and symbols returned from here borrow directly from the
//! image, which stays mapped for the life of the process.

use crate::{Result, arch::ElfSymbol, dynamic::ElfDynamic, hash::HashTable};
use core::ffi::CStr;

/// ELF string table wrapper.
pub(crate) struct ElfStringTable {
    /// Pointer to the raw string table data in memory
    data: *const u8,
    /// Table size in bytes, from `DT_STRSZ`
    len: usize,
}

impl ElfStringTable {
    pub(crate) const fn new(data: *const u8, len: usize) -> Self {
        ElfStringTable { data, len }
    }

    #[inline]
    pub(crate) fn get_cstr(&self, offset: usize) -> &'static CStr {
        debug_assert!(offset < self.len);
        unsafe {
            let start = self.data.add(offset).cast();
            CStr::from_ptr(start)
        }
    }

    #[inline]
    fn convert_cstr(s: &CStr) -> &str {
        unsafe { core::str::from_utf8_unchecked(s.to_bytes()) }
    }

    /// Get a string slice for the name starting at `offset`.
    #[inline]
    pub(crate) fn get_str(&self, offset: usize) -> &'static str {
        Self::convert_cstr(self.get_cstr(offset))
    }
}

/// Symbol table of a loaded image.
pub(crate) struct SymbolTable {
    /// Hash table for name lookup, if the image has one.
    hashtab: Option<HashTable>,

    /// Pointer to the first symbol entry.
    symtab: *const u8,

    /// Stride between entries, from `DT_SYMENT`.
    syment: usize,

    /// String table for symbol names.
    strtab: ElfStringTable,
}

impl SymbolTable {
    pub(crate) fn from_dynamic(dynamic: &ElfDynamic) -> Result<Self> {
        let hashtab = HashTable::from_dynamic(dynamic)?;
        let symtab = dynamic.symtab as *const u8;
        let strtab = ElfStringTable {
            data: dynamic.strtab.data,
            len: dynamic.strtab.len,
        };
        Ok(SymbolTable {
            hashtab,
            symtab,
            syment: dynamic.syment,
            strtab,
        })
    }

    pub(crate) fn strtab(&self) -> &ElfStringTable {
        &self.strtab
    }

    /// Get a symbol by its index, honouring the entry stride.
    #[inline]
    pub(crate) fn symbol(&self, idx: usize) -> &ElfSymbol {
        unsafe { &*self.symtab.add(idx * self.syment).cast() }
    }

    /// Look up a symbol through the hash table. `None` both for missing
    /// names and for images without any hash table.
    pub(crate) fn lookup(&self, name: &str) -> Option<&ElfSymbol> {
        self.hashtab.as_ref()?.lookup(self, name)
    }
}
