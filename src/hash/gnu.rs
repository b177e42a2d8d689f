use crate::{Result, arch::ElfSymbol, hash::ElfHashTable, invalid_format, symbol::SymbolTable};

#[repr(C)]
struct ElfGnuHeader {
    nbucket: u32,
    symbias: u32,
    nbloom: u32,
    nshift: u32,
}

pub(crate) struct ElfGnuHash {
    header: ElfGnuHeader,
    blooms: *const usize,
    buckets: *const u32,
    chains: *const u32,
}

impl ElfGnuHash {
    #[inline]
    pub(crate) fn parse(ptr: *const u8) -> Result<ElfGnuHash> {
        const HEADER_SIZE: usize = size_of::<ElfGnuHeader>();
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(unsafe { core::slice::from_raw_parts(ptr, HEADER_SIZE) });
        let header: ElfGnuHeader = unsafe { core::mem::transmute(bytes) };
        // Lookup indexes buckets modulo the count and masks the bloom
        // word index with `nbloom - 1`.
        if header.nbucket == 0 {
            return Err(invalid_format("GNU hash table has no buckets"));
        }
        if header.nbloom == 0 {
            return Err(invalid_format("GNU hash table has no bloom words"));
        }
        let bloom_size = header.nbloom as usize * size_of::<usize>();
        let bucket_size = header.nbucket as usize * size_of::<u32>();

        let blooms = unsafe { ptr.add(HEADER_SIZE) };
        let buckets = unsafe { blooms.add(bloom_size) };
        let chains = unsafe { buckets.add(bucket_size) };
        Ok(ElfGnuHash {
            header,
            blooms: blooms.cast(),
            buckets: buckets.cast(),
            chains: chains.cast(),
        })
    }
}

impl ElfHashTable for ElfGnuHash {
    #[inline]
    fn hash(name: &[u8]) -> u64 {
        let mut hash = 5381u32;
        for byte in name {
            hash = hash.wrapping_mul(33).wrapping_add(u32::from(*byte));
        }
        hash as u64
    }

    fn lookup<'sym>(&self, table: &'sym SymbolTable, name: &str) -> Option<&'sym ElfSymbol> {
        let hash = Self::hash(name.as_bytes()) as u32;
        let fofs = hash as usize / usize::BITS as usize;
        let fmask = 1usize << (hash % usize::BITS);
        let bloom_idx = fofs & (self.header.nbloom - 1) as usize;
        let filter = unsafe { self.blooms.add(bloom_idx).read() };
        if filter & fmask == 0 {
            return None;
        }
        let filter2 = filter >> ((hash >> self.header.nshift) as usize % usize::BITS as usize);
        if filter2 & 1 == 0 {
            return None;
        }
        let table_start_idx = self.header.symbias as usize;
        let chain_start_idx =
            unsafe { self.buckets.add((hash as usize) % self.header.nbucket as usize).read() }
                as usize;
        if chain_start_idx == 0 {
            return None;
        }
        let mut dynsym_idx = chain_start_idx;
        let mut cur_chain = unsafe { self.chains.add(dynsym_idx - table_start_idx) };
        loop {
            let chain_hash = unsafe { cur_chain.read() };
            // The low bit of a chain entry marks the end of its bucket,
            // so it is masked out of the comparison.
            if hash | 1 == chain_hash | 1 {
                let cur_symbol = table.symbol(dynsym_idx);
                let sym_name = table.strtab().get_str(cur_symbol.st_name());
                if sym_name == name {
                    return Some(cur_symbol);
                }
            }
            if chain_hash & 1 != 0 {
                break;
            }
            cur_chain = unsafe { cur_chain.add(1) };
            dynsym_idx += 1;
        }
        None
    }
}
