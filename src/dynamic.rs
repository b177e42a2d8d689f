//! Parsing the `PT_DYNAMIC` segment.
use crate::{
    Result,
    arch::{Dyn, Rel, Rela, Sym},
    invalid_format,
    symbol::ElfStringTable,
    unknown_format,
};
use alloc::vec::Vec;
use core::{mem::transmute, num::NonZeroUsize, slice::from_raw_parts};
use elf::abi::*;

/// Which relocation record layout an array uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocKind {
    Rel,
    Rela,
}

/// One relocation array described by the dynamic section, with its
/// address already converted into the image.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RelocArray {
    pub(crate) addr: usize,
    pub(crate) size: usize,
    pub(crate) ent: usize,
}

/// The dynamic section as found in the file: raw virtual addresses that
/// have not been rebased yet.
pub(crate) struct ElfRawDynamic {
    /// DT_HASH
    hash_off: Option<NonZeroUsize>,
    /// DT_GNU_HASH
    gnu_hash_off: Option<NonZeroUsize>,
    /// DT_SYMTAB
    symtab_off: usize,
    /// DT_SYMENT
    syment: usize,
    /// DT_STRTAB
    strtab_off: usize,
    /// DT_STRSZ
    strsz: usize,
    /// DT_FLAGS
    flags: usize,
    /// DT_RELA / DT_RELASZ / DT_RELAENT
    rela_off: Option<NonZeroUsize>,
    rela_size: usize,
    rela_ent: usize,
    /// DT_REL / DT_RELSZ / DT_RELENT
    rel_off: Option<NonZeroUsize>,
    rel_size: usize,
    rel_ent: usize,
    /// DT_JMPREL / DT_PLTRELSZ / DT_PLTREL
    pltrel_off: Option<NonZeroUsize>,
    pltrel_size: usize,
    pltrel_form: usize,
    /// DT_INIT / DT_FINI
    init_off: Option<NonZeroUsize>,
    fini_off: Option<NonZeroUsize>,
    /// DT_INIT_ARRAY / DT_INIT_ARRAYSZ
    init_array_off: Option<NonZeroUsize>,
    init_array_size: usize,
    /// DT_FINI_ARRAY / DT_FINI_ARRAYSZ
    fini_array_off: Option<NonZeroUsize>,
    fini_array_size: usize,
    /// DT_SONAME
    soname_off: Option<NonZeroUsize>,
    /// DT_RPATH / DT_RUNPATH
    rpath_off: Option<NonZeroUsize>,
    runpath_off: Option<NonZeroUsize>,
    /// DT_NEEDED
    needed_libs: Vec<NonZeroUsize>,
}

impl ElfRawDynamic {
    /// Walk the entry list up to `DT_NULL`, keeping the tags this crate
    /// understands and skipping the rest.
    ///
    /// # Safety note
    /// `dynamic_ptr` points into the freshly mapped image; the caller
    /// guarantees the `PT_DYNAMIC` segment is resident.
    pub(crate) fn new(dynamic_ptr: *const Dyn) -> Result<ElfRawDynamic> {
        let mut hash_off = None;
        let mut gnu_hash_off = None;
        let mut symtab_off = 0;
        let mut syment = 0;
        let mut strtab_off = 0;
        let mut strsz = 0;
        let mut flags = 0;
        let mut rela_off = None;
        let mut rela_size = 0;
        let mut rela_ent = 0;
        let mut rel_off = None;
        let mut rel_size = 0;
        let mut rel_ent = 0;
        let mut pltrel_off = None;
        let mut pltrel_size = 0;
        let mut pltrel_form = 0;
        let mut init_off = None;
        let mut fini_off = None;
        let mut init_array_off = None;
        let mut init_array_size = 0;
        let mut fini_array_off = None;
        let mut fini_array_size = 0;
        let mut soname_off = None;
        let mut rpath_off = None;
        let mut runpath_off = None;
        let mut needed_libs = Vec::new();

        let mut cur_dyn_ptr = dynamic_ptr;
        let mut dynamic = unsafe { &*cur_dyn_ptr };

        unsafe {
            loop {
                match dynamic.d_tag {
                    DT_HASH => hash_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_GNU_HASH => gnu_hash_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_SYMTAB => symtab_off = dynamic.d_un as usize,
                    DT_SYMENT => syment = dynamic.d_un as usize,
                    DT_STRTAB => strtab_off = dynamic.d_un as usize,
                    DT_STRSZ => strsz = dynamic.d_un as usize,
                    DT_FLAGS => flags = dynamic.d_un as usize,
                    DT_RELA => rela_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELASZ => rela_size = dynamic.d_un as usize,
                    DT_RELAENT => rela_ent = dynamic.d_un as usize,
                    DT_REL => rel_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELSZ => rel_size = dynamic.d_un as usize,
                    DT_RELENT => rel_ent = dynamic.d_un as usize,
                    DT_JMPREL => pltrel_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_PLTRELSZ => pltrel_size = dynamic.d_un as usize,
                    DT_PLTREL => pltrel_form = dynamic.d_un as usize,
                    DT_INIT => init_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_FINI => fini_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_INIT_ARRAY => init_array_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_INIT_ARRAYSZ => init_array_size = dynamic.d_un as usize,
                    DT_FINI_ARRAY => fini_array_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_FINI_ARRAYSZ => fini_array_size = dynamic.d_un as usize,
                    DT_SONAME => soname_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RPATH => rpath_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RUNPATH => runpath_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_NEEDED => {
                        if let Some(off) = NonZeroUsize::new(dynamic.d_un as usize) {
                            needed_libs.push(off);
                        }
                    }
                    DT_NULL => break,
                    _ => {}
                }
                cur_dyn_ptr = cur_dyn_ptr.add(1);
                dynamic = &*cur_dyn_ptr;
            }
        }
        if symtab_off == 0 || strtab_off == 0 {
            return Err(invalid_format(
                "dynamic section has no DT_SYMTAB or DT_STRTAB",
            ));
        }
        Ok(ElfRawDynamic {
            hash_off,
            gnu_hash_off,
            symtab_off,
            syment,
            strtab_off,
            strsz,
            flags,
            rela_off,
            rela_size,
            rela_ent,
            rel_off,
            rel_size,
            rel_ent,
            pltrel_off,
            pltrel_size,
            pltrel_form,
            init_off,
            fini_off,
            init_array_off,
            init_array_size,
            fini_array_off,
            fini_array_size,
            soname_off,
            rpath_off,
            runpath_off,
            needed_libs,
        })
    }

    /// Map the raw virtual addresses to addresses in actual memory and
    /// resolve the strings the section refers to.
    pub(crate) fn finish(self, base: usize) -> Result<ElfDynamic> {
        let syment = normalize_ent(self.syment, size_of::<Sym>(), "DT_SYMENT")?;
        let rela = match self.rela_off {
            Some(off) => Some(RelocArray {
                addr: base + off.get(),
                size: self.rela_size,
                ent: normalize_ent(self.rela_ent, size_of::<Rela>(), "DT_RELAENT")?,
            }),
            None => None,
        };
        let rel = match self.rel_off {
            Some(off) => Some(RelocArray {
                addr: base + off.get(),
                size: self.rel_size,
                ent: normalize_ent(self.rel_ent, size_of::<Rel>(), "DT_RELENT")?,
            }),
            None => None,
        };
        let pltrel = match self.pltrel_off {
            Some(off) => {
                let (kind, ent) = match self.pltrel_form as i64 {
                    DT_RELA => (RelocKind::Rela, size_of::<Rela>()),
                    DT_REL => (RelocKind::Rel, size_of::<Rel>()),
                    _ => {
                        return Err(unknown_format(
                            "DT_PLTREL names neither DT_REL nor DT_RELA",
                        ));
                    }
                };
                Some((
                    kind,
                    RelocArray {
                        addr: base + off.get(),
                        size: self.pltrel_size,
                        ent,
                    },
                ))
            }
            None => None,
        };
        let init_fn = self
            .init_off
            .map(|off| unsafe { transmute::<usize, extern "C" fn()>(off.get() + base) });
        let init_array_fn = self.init_array_off.map(|off| {
            let ptr = off.get() + base;
            unsafe { from_raw_parts(ptr as _, self.init_array_size / size_of::<usize>()) }
        });
        let fini_fn = self
            .fini_off
            .map(|off| unsafe { transmute::<usize, extern "C" fn()>(off.get() + base) });
        let fini_array_fn = self.fini_array_off.map(|off| {
            let ptr = off.get() + base;
            unsafe { from_raw_parts(ptr as _, self.fini_array_size / size_of::<usize>()) }
        });
        let strtab = ElfStringTable::new((base + self.strtab_off) as *const u8, self.strsz);
        let soname = self.soname_off.map(|off| strtab.get_str(off.get()));
        let rpath = self.rpath_off.map(|off| strtab.get_str(off.get()));
        let runpath = self.runpath_off.map(|off| strtab.get_str(off.get()));
        let needed_libs = self
            .needed_libs
            .iter()
            .map(|off| strtab.get_str(off.get()))
            .collect();
        Ok(ElfDynamic {
            hash: self.hash_off.map(|off| off.get() + base),
            gnu_hash: self.gnu_hash_off.map(|off| off.get() + base),
            symtab: base + self.symtab_off,
            syment,
            strtab,
            flags: self.flags,
            rela,
            rel,
            pltrel,
            init_fn,
            init_array_fn,
            fini_fn,
            fini_array_fn,
            soname,
            rpath,
            runpath,
            needed_libs,
        })
    }
}

/// Entry sizes of zero fall back to the native record size; smaller
/// non-zero values cannot be walked.
fn normalize_ent(ent: usize, min: usize, tag: &'static str) -> Result<usize> {
    if ent == 0 {
        Ok(min)
    } else if ent < min {
        Err(unknown_format(alloc::format!(
            "{tag} is smaller than its entry type"
        )))
    } else {
        Ok(ent)
    }
}

/// The dynamic section after mapping to real addresses.
pub(crate) struct ElfDynamic {
    pub(crate) hash: Option<usize>,
    pub(crate) gnu_hash: Option<usize>,
    pub(crate) symtab: usize,
    pub(crate) syment: usize,
    pub(crate) strtab: ElfStringTable,
    pub(crate) flags: usize,
    pub(crate) rela: Option<RelocArray>,
    pub(crate) rel: Option<RelocArray>,
    pub(crate) pltrel: Option<(RelocKind, RelocArray)>,
    pub(crate) init_fn: Option<extern "C" fn()>,
    pub(crate) init_array_fn: Option<&'static [extern "C" fn()]>,
    pub(crate) fini_fn: Option<extern "C" fn()>,
    pub(crate) fini_array_fn: Option<&'static [extern "C" fn()]>,
    pub(crate) soname: Option<&'static str>,
    pub(crate) rpath: Option<&'static str>,
    pub(crate) runpath: Option<&'static str>,
    pub(crate) needed_libs: Vec<&'static str>,
}
