//! Hash table construction for the generated dynamic symbol table.
//!
//! Both flavours are built over the final dynsym order. The GNU table
//! additionally requires that order to group symbols by bucket, which
//! [`gnu_bucket`] exposes so the caller can sort before layout.

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};

/// Buckets in a generated `.hash` table.
pub(crate) const SYSV_NBUCKET: u32 = 3;
/// Buckets in a generated `.gnu.hash` table.
pub(crate) const GNU_NBUCKET: u32 = 2;
/// Bloom filter words, kept a power of two because lookups mask with
/// `nbloom - 1`.
pub(crate) const GNU_NBLOOM: u32 = 1;
/// Second bloom bit shift.
pub(crate) const GNU_SHIFT: u32 = 6;

/// The classic SysV ELF hash.
pub(crate) fn sysv_hash(name: &str) -> u32 {
    let mut hash = 0u32;
    for byte in name.bytes() {
        hash = (hash << 4).wrapping_add(u32::from(byte));
        let g = hash & 0xf000_0000;
        if g != 0 {
            hash ^= g >> 24;
        }
        hash &= !g;
    }
    hash
}

/// The GNU hash (djb2).
pub(crate) fn gnu_hash(name: &str) -> u32 {
    let mut hash = 5381u32;
    for byte in name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

pub(crate) fn gnu_bucket(name: &str) -> u32 {
    gnu_hash(name) % GNU_NBUCKET
}

/// Serialize a `.hash` section for `names`, the dynsym entries after the
/// initial null one. Chains are explicit, so any symbol order works.
pub(crate) fn build_sysv_table(names: &[String]) -> Result<Vec<u8>> {
    let nchain = names.len() as u32 + 1;
    let mut buckets = [0u32; SYSV_NBUCKET as usize];
    let mut chains = vec![0u32; nchain as usize];
    for (i, name) in names.iter().enumerate() {
        let sym_idx = i as u32 + 1;
        let bucket = (sysv_hash(name) % SYSV_NBUCKET) as usize;
        chains[sym_idx as usize] = buckets[bucket];
        buckets[bucket] = sym_idx;
    }

    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(SYSV_NBUCKET)?;
    buf.write_u32::<LittleEndian>(nchain)?;
    for bucket in buckets {
        buf.write_u32::<LittleEndian>(bucket)?;
    }
    for chain in chains {
        buf.write_u32::<LittleEndian>(chain)?;
    }
    Ok(buf)
}

/// Serialize a `.gnu.hash` section for `names`, which must already be
/// sorted by [`gnu_bucket`]. The symbol bias is 1: every entry after the
/// null symbol is hashed.
pub(crate) fn build_gnu_table(names: &[String]) -> Result<Vec<u8>> {
    let mut bloom = [0u64; GNU_NBLOOM as usize];
    let mut buckets = [0u32; GNU_NBUCKET as usize];
    let mut chains = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let hash = gnu_hash(name);
        let word = &mut bloom[(hash as usize / 64) & (GNU_NBLOOM - 1) as usize];
        *word |= 1u64 << (hash % 64);
        *word |= 1u64 << ((hash >> GNU_SHIFT) % 64);

        let bucket = gnu_bucket(name);
        let sym_idx = i as u32 + 1;
        if buckets[bucket as usize] == 0 {
            buckets[bucket as usize] = sym_idx;
        }
        let last_of_bucket = match names.get(i + 1) {
            Some(next) => gnu_bucket(next) != bucket,
            None => true,
        };
        chains.push((hash & !1) | u32::from(last_of_bucket));
    }

    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(GNU_NBUCKET)?;
    buf.write_u32::<LittleEndian>(1)?;
    buf.write_u32::<LittleEndian>(GNU_NBLOOM)?;
    buf.write_u32::<LittleEndian>(GNU_SHIFT)?;
    for word in bloom {
        buf.write_u64::<LittleEndian>(word)?;
    }
    for bucket in buckets {
        buf.write_u32::<LittleEndian>(bucket)?;
    }
    for chain in chains {
        buf.write_u32::<LittleEndian>(chain)?;
    }
    Ok(buf)
}
