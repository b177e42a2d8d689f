//! Traditional SysV ELF hash table implementation.
//!
//! Slower than the GNU table but still emitted by linkers and required
//! for objects that carry only `DT_HASH`.

use crate::{Result, arch::ElfSymbol, hash::ElfHashTable, invalid_format, symbol::SymbolTable};

#[repr(C)]
struct ElfHashHeader {
    /// Number of bucket entries in the hash table
    nbucket: u32,

    /// Number of chain entries, one per symbol table entry
    nchain: u32,
}

pub(crate) struct ElfHash {
    header: ElfHashHeader,
    buckets: *const u32,
    chains: *const u32,
}

impl ElfHash {
    #[inline]
    pub(crate) fn parse(ptr: *const u8) -> Result<ElfHash> {
        const HEADER_SIZE: usize = size_of::<ElfHashHeader>();
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(unsafe { core::slice::from_raw_parts(ptr, HEADER_SIZE) });
        let header: ElfHashHeader = unsafe { core::mem::transmute(bytes) };
        // Lookup indexes buckets modulo this count.
        if header.nbucket == 0 {
            return Err(invalid_format("SysV hash table has no buckets"));
        }
        let bucket_size = header.nbucket as usize * size_of::<u32>();

        let buckets = unsafe { ptr.add(HEADER_SIZE) };
        let chains = unsafe { buckets.add(bucket_size) };
        Ok(ElfHash {
            header,
            buckets: buckets.cast(),
            chains: chains.cast(),
        })
    }
}

impl ElfHashTable for ElfHash {
    #[inline]
    fn hash(name: &[u8]) -> u64 {
        let mut hash = 0u32;
        #[allow(unused_assignments)]
        let mut g = 0u32;

        for byte in name {
            hash = (hash << 4) + u32::from(*byte);
            g = hash & 0xf0000000;
            if g != 0 {
                hash ^= g >> 24;
            }
            hash &= !g;
        }
        hash as u64
    }

    fn lookup<'sym>(&self, table: &'sym SymbolTable, name: &str) -> Option<&'sym ElfSymbol> {
        let hash = Self::hash(name.as_bytes()) as u32;
        let bucket_idx = (hash as usize) % self.header.nbucket as usize;
        let bucket_ptr = unsafe { self.buckets.add(bucket_idx) };
        let mut chain_idx = unsafe { bucket_ptr.read() as usize };

        loop {
            // Index 0 ends the chain; an index past the chain array means
            // the table is corrupt, stop rather than loop.
            if chain_idx == 0 || chain_idx >= self.header.nchain as usize {
                return None;
            }

            let cur_symbol = table.symbol(chain_idx);
            let sym_name = table.strtab().get_str(cur_symbol.st_name());
            if sym_name == name {
                return Some(cur_symbol);
            }

            let chain_ptr = unsafe { self.chains.add(chain_idx) };
            chain_idx = unsafe { chain_ptr.read() as usize };
        }
    }
}
