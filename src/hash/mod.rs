//! Symbol hash table lookup.
//!
//! An image can carry a GNU-style table (`.gnu.hash`), the traditional
//! SysV table (`.hash`), or both. When both are present the GNU table is
//! preferred. Without either table name lookups cannot be served at all.

use crate::{Result, arch::ElfSymbol, dynamic::ElfDynamic, symbol::SymbolTable};
use gnu::ElfGnuHash;
use sysv::ElfHash;

mod gnu;
mod sysv;

pub(crate) trait ElfHashTable {
    fn hash(name: &[u8]) -> u64;
    fn lookup<'sym>(&self, table: &'sym SymbolTable, name: &str) -> Option<&'sym ElfSymbol>;
}

pub(crate) enum HashTable {
    /// .gnu.hash
    Gnu(ElfGnuHash),
    /// .hash
    Elf(ElfHash),
}

impl HashTable {
    /// Pick the table the image provides, favouring the GNU one.
    pub(crate) fn from_dynamic(dynamic: &ElfDynamic) -> Result<Option<HashTable>> {
        if let Some(addr) = dynamic.gnu_hash {
            return Ok(Some(HashTable::Gnu(ElfGnuHash::parse(addr as *const u8)?)));
        }
        if let Some(addr) = dynamic.hash {
            return Ok(Some(HashTable::Elf(ElfHash::parse(addr as *const u8)?)));
        }
        Ok(None)
    }

    pub(crate) fn lookup<'sym>(
        &self,
        table: &'sym SymbolTable,
        name: &str,
    ) -> Option<&'sym ElfSymbol> {
        match self {
            HashTable::Gnu(hashtab) => hashtab.lookup(table, name),
            HashTable::Elf(hashtab) => hashtab.lookup(table, name),
        }
    }
}
