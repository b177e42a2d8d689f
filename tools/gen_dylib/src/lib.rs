//! Builder for small ET_DYN images used to exercise ELF loaders.
//!
//! Generated objects use a fixed layout where every virtual address equals
//! its file offset, which keeps the emitted records easy to verify by hand:
//!
//! - page 0 (read-execute): ELF header, program headers, hash tables,
//!   `.dynsym`, `.dynstr`, relocation records and `.text`
//! - page 1 (read-write): `.dynamic` followed by the GOT, optionally
//!   covered by a `PT_GNU_RELRO` segment
//! - page 2 (read-write): `.data`, init/fini arrays and trailing zero-fill
//!
//! The section header table and `.shstrtab` sit at the end of the file and
//! can be omitted entirely, or emitted with the extended `e_shnum` and
//! `e_shstrndx` encodings.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = DylibBuilder::new();
//! builder.soname("liba.so").add_func("answer", &[0xb8, 0x2a, 0, 0, 0, 0xc3]);
//! let slot = builder.add_reloc(R_X86_64_GLOB_DAT, Some("answer"), 0);
//! let built = builder.build()?;
//! built.write_to("target/liba.so")?;
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, WriteBytesExt};
use elf::abi::*;

mod hash;

const PAGE: u64 = 0x1000;
const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;
const REL_SIZE: u64 = 16;
const DYN_SIZE: u64 = 16;

/// Start of the read-write page holding `.dynamic` and the GOT.
const RW_VADDR: u64 = PAGE;
/// Start of the data page.
const DATA_VADDR: u64 = 2 * PAGE;
/// GOT slots reserved for the linker convention entries.
const GOT_RESERVED: u64 = 3;

/// Which symbol hash tables the image carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashStyle {
    None,
    Sysv,
    Gnu,
    Both,
}

impl HashStyle {
    fn has_sysv(self) -> bool {
        matches!(self, HashStyle::Sysv | HashStyle::Both)
    }

    fn has_gnu(self) -> bool {
        matches!(self, HashStyle::Gnu | HashStyle::Both)
    }
}

/// Which relocation record layout the image uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocForm {
    /// Records carry an explicit addend field.
    Rela,
    /// The addend lives at the relocated location itself.
    Rel,
}

struct FuncDesc {
    name: String,
    code: Vec<u8>,
}

struct DataDesc {
    name: String,
    bytes: Vec<u8>,
}

struct RelocDesc {
    r_type: u32,
    sym: Option<String>,
    addend: i64,
    /// Initial content of the targeted GOT slot. Only meaningful for the
    /// RELA form; the REL form stores the addend there instead.
    init: u64,
}

/// Describes one shared object to generate.
pub struct DylibBuilder {
    hash_style: HashStyle,
    reloc_form: RelocForm,
    relro: bool,
    sections: bool,
    extended_shdr: bool,
    soname: Option<String>,
    needed: Vec<String>,
    rpath: Option<String>,
    runpath: Option<String>,
    flags: Option<u64>,
    init_sym: Option<String>,
    fini_sym: Option<String>,
    init_array: Vec<String>,
    fini_array: Vec<String>,
    bss_size: u64,
    funcs: Vec<FuncDesc>,
    datas: Vec<DataDesc>,
    relocs: Vec<RelocDesc>,
}

impl Default for DylibBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DylibBuilder {
    pub fn new() -> Self {
        Self {
            hash_style: HashStyle::Both,
            reloc_form: RelocForm::Rela,
            relro: true,
            sections: true,
            extended_shdr: false,
            soname: None,
            needed: Vec::new(),
            rpath: None,
            runpath: None,
            flags: None,
            init_sym: None,
            fini_sym: None,
            init_array: Vec::new(),
            fini_array: Vec::new(),
            bss_size: 0,
            funcs: Vec::new(),
            datas: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub fn hash_style(&mut self, style: HashStyle) -> &mut Self {
        self.hash_style = style;
        self
    }

    pub fn reloc_form(&mut self, form: RelocForm) -> &mut Self {
        self.reloc_form = form;
        self
    }

    /// Whether to emit a `PT_GNU_RELRO` segment over the dynamic/GOT page.
    pub fn relro(&mut self, relro: bool) -> &mut Self {
        self.relro = relro;
        self
    }

    /// Whether to emit a section header table at all.
    pub fn sections(&mut self, sections: bool) -> &mut Self {
        self.sections = sections;
        self
    }

    /// Carry the section count and name table index in section 0 instead
    /// of the ELF header fields.
    pub fn extended_shdr(&mut self, extended: bool) -> &mut Self {
        self.extended_shdr = extended;
        self
    }

    pub fn soname(&mut self, name: &str) -> &mut Self {
        self.soname = Some(name.to_string());
        self
    }

    pub fn needed(&mut self, name: &str) -> &mut Self {
        self.needed.push(name.to_string());
        self
    }

    pub fn rpath(&mut self, path: &str) -> &mut Self {
        self.rpath = Some(path.to_string());
        self
    }

    pub fn runpath(&mut self, path: &str) -> &mut Self {
        self.runpath = Some(path.to_string());
        self
    }

    /// Value for a `DT_FLAGS` entry.
    pub fn flags(&mut self, flags: u64) -> &mut Self {
        self.flags = Some(flags);
        self
    }

    /// Point `DT_INIT` at a defined function symbol.
    pub fn init(&mut self, sym: &str) -> &mut Self {
        self.init_sym = Some(sym.to_string());
        self
    }

    /// Point `DT_FINI` at a defined function symbol.
    pub fn fini(&mut self, sym: &str) -> &mut Self {
        self.fini_sym = Some(sym.to_string());
        self
    }

    /// Emit a `DT_INIT_ARRAY` whose slots resolve to the named functions.
    /// Each slot gets a RELATIVE relocation, the way linkers emit them.
    pub fn init_array(&mut self, syms: &[&str]) -> &mut Self {
        self.init_array = syms.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn fini_array(&mut self, syms: &[&str]) -> &mut Self {
        self.fini_array = syms.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Trailing zero-fill after the data page (`p_memsz > p_filesz`).
    pub fn bss(&mut self, size: u64) -> &mut Self {
        self.bss_size = size;
        self
    }

    /// Define a global function symbol with the given machine code.
    pub fn add_func(&mut self, name: &str, code: &[u8]) -> &mut Self {
        self.funcs.push(FuncDesc {
            name: name.to_string(),
            code: code.to_vec(),
        });
        self
    }

    /// Define a global object symbol with the given bytes in `.data`.
    pub fn add_data(&mut self, name: &str, bytes: &[u8]) -> &mut Self {
        self.datas.push(DataDesc {
            name: name.to_string(),
            bytes: bytes.to_vec(),
        });
        self
    }

    /// Add a relocation targeting a fresh GOT slot and return the slot
    /// index for [`BuiltDylib::slot_vaddr`]. `R_X86_64_JUMP_SLOT` entries
    /// land in the PLT relocation array, everything else in `.rela.dyn`.
    pub fn add_reloc(&mut self, r_type: u32, sym: Option<&str>, addend: i64) -> usize {
        self.add_reloc_with_init(r_type, sym, addend, 0)
    }

    /// Like [`Self::add_reloc`], but with explicit initial slot content.
    /// Useful to tell "stored zero" apart from "never written".
    pub fn add_reloc_with_init(
        &mut self,
        r_type: u32,
        sym: Option<&str>,
        addend: i64,
        init: u64,
    ) -> usize {
        self.relocs.push(RelocDesc {
            r_type,
            sym: sym.map(|s| s.to_string()),
            addend,
            init,
        });
        self.relocs.len() - 1
    }

    /// Serialize the object.
    pub fn build(&self) -> Result<BuiltDylib> {
        let mut seen = HashSet::new();
        for name in self
            .funcs
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.datas.iter().map(|d| d.name.as_str()))
        {
            ensure!(seen.insert(name), "duplicate symbol '{name}'");
        }

        // Code and data blobs, with the offset of every definition.
        let mut text = Vec::new();
        let mut func_offs = HashMap::new();
        for func in &self.funcs {
            while text.len() % 16 != 0 {
                text.push(0x90);
            }
            func_offs.insert(func.name.as_str(), text.len() as u64);
            text.extend_from_slice(&func.code);
        }
        let mut data = Vec::new();
        let mut data_offs = HashMap::new();
        for item in &self.datas {
            while data.len() % 8 != 0 {
                data.push(0);
            }
            data_offs.insert(item.name.as_str(), data.len() as u64);
            data.extend_from_slice(&item.bytes);
        }
        while data.len() % 8 != 0 {
            data.push(0);
        }
        let init_array_off = data.len() as u64;
        data.resize(data.len() + self.init_array.len() * 8, 0);
        let fini_array_off = data.len() as u64;
        data.resize(data.len() + self.fini_array.len() * 8, 0);

        // Dynsym order. The GNU hash chains require symbols of one bucket
        // to be adjacent, so the table is sorted by bucket when present.
        let mut ordered: Vec<String> = self
            .funcs
            .iter()
            .map(|f| f.name.clone())
            .chain(self.datas.iter().map(|d| d.name.clone()))
            .collect();
        if self.hash_style.has_gnu() {
            ordered.sort_by_key(|name| hash::gnu_bucket(name));
        }
        let mut name_to_idx = HashMap::new();
        for (i, name) in ordered.iter().enumerate() {
            name_to_idx.insert(name.clone(), i as u64 + 1);
        }

        let mut dynstr = vec![0u8];
        let mut str_offs = HashMap::new();
        for name in &ordered {
            str_offs.insert(name.clone(), dynstr.len() as u64);
            dynstr.extend_from_slice(name.as_bytes());
            dynstr.push(0);
        }
        let mut add_str = |s: &str| {
            let off = dynstr.len() as u64;
            dynstr.extend_from_slice(s.as_bytes());
            dynstr.push(0);
            off
        };
        let soname_off = self.soname.as_deref().map(&mut add_str);
        let needed_offs: Vec<u64> = self.needed.iter().map(|n| add_str(n)).collect();
        let rpath_off = self.rpath.as_deref().map(&mut add_str);
        let runpath_off = self.runpath.as_deref().map(&mut add_str);

        let sysv_blob = self
            .hash_style
            .has_sysv()
            .then(|| hash::build_sysv_table(&ordered))
            .transpose()?;
        let gnu_blob = self
            .hash_style
            .has_gnu()
            .then(|| hash::build_gnu_table(&ordered))
            .transpose()?;

        // Record counts decide the relocation array sizes up front.
        let rec_size = match self.reloc_form {
            RelocForm::Rela => RELA_SIZE,
            RelocForm::Rel => REL_SIZE,
        };
        let array_relocs = (self.init_array.len() + self.fini_array.len()) as u64;
        let plt_count = self
            .relocs
            .iter()
            .filter(|r| r.r_type == R_X86_64_JUMP_SLOT)
            .count() as u64;
        let dyn_count = self.relocs.len() as u64 - plt_count + array_relocs;
        let rela_dyn_size = dyn_count * rec_size;
        let rela_plt_size = plt_count * rec_size;

        // Read-execute page layout.
        let phnum = 4 + u64::from(self.relro);
        let mut cur = EHDR_SIZE + phnum * PHDR_SIZE;
        let mut place = |size: u64, align: u64| {
            cur = align_up(cur, align);
            let off = cur;
            cur += size;
            off
        };
        let sysv_off = sysv_blob.as_ref().map(|b| place(b.len() as u64, 8));
        let gnu_off = gnu_blob.as_ref().map(|b| place(b.len() as u64, 8));
        let dynsym_off = place((ordered.len() as u64 + 1) * SYM_SIZE, 8);
        let dynstr_off = place(dynstr.len() as u64, 1);
        let rela_dyn_off = place(rela_dyn_size, 8);
        let rela_plt_off = place(rela_plt_size, 8);
        let text_off = place(text.len() as u64, 16);
        let rx_end = cur;
        ensure!(
            rx_end <= RW_VADDR,
            "object does not fit the read-only page: {rx_end:#x} bytes"
        );

        // Final symbol addresses.
        let mut symbols = BTreeMap::new();
        for func in &self.funcs {
            symbols.insert(func.name.clone(), text_off + func_offs[func.name.as_str()]);
        }
        for item in &self.datas {
            symbols.insert(item.name.clone(), DATA_VADDR + data_offs[item.name.as_str()]);
        }
        let resolve = |name: &str| -> Result<u64> {
            symbols
                .get(name)
                .copied()
                .with_context(|| format!("unknown symbol '{name}'"))
        };

        let (text_shndx, data_shndx) = if self.sections {
            let index = SectionIndexes::new(self, &text, &data, rela_dyn_size, rela_plt_size);
            (index.text.unwrap_or(SHN_ABS as u32) as u16, index.data.unwrap_or(SHN_ABS as u32) as u16)
        } else {
            (SHN_ABS, SHN_ABS)
        };

        let mut dynsym = vec![0u8; SYM_SIZE as usize];
        for name in &ordered {
            let is_func = func_offs.contains_key(name.as_str());
            let (shndx, size) = if is_func {
                let code_len = self.funcs.iter().find(|f| &f.name == name).unwrap().code.len();
                (text_shndx, code_len as u64)
            } else {
                let len = self.datas.iter().find(|d| &d.name == name).unwrap().bytes.len();
                (data_shndx, len as u64)
            };
            let info = if is_func {
                (STB_GLOBAL << 4) | STT_FUNC
            } else {
                (STB_GLOBAL << 4) | STT_OBJECT
            };
            Symbol {
                name: str_offs[name] as u32,
                info,
                other: 0,
                shndx,
                value: symbols[name],
                size,
            }
            .write(&mut dynsym)?;
        }

        // The dynamic entry count does not depend on the GOT address, so a
        // first pass with a placeholder fixes the section size.
        let init_vaddr = self.init_sym.as_deref().map(&resolve).transpose()?;
        let fini_vaddr = self.fini_sym.as_deref().map(&resolve).transpose()?;
        let init_array_range = (!self.init_array.is_empty())
            .then(|| (DATA_VADDR + init_array_off, self.init_array.len() as u64 * 8));
        let fini_array_range = (!self.fini_array.is_empty())
            .then(|| (DATA_VADDR + fini_array_off, self.fini_array.len() as u64 * 8));
        let mut addrs = DynAddrs {
            hash: sysv_off,
            gnu_hash: gnu_off,
            dynsym: dynsym_off,
            dynstr: dynstr_off,
            dynstr_len: dynstr.len() as u64,
            rela_dyn: (rela_dyn_off, rela_dyn_size),
            rela_plt: (rela_plt_off, rela_plt_size),
            got: 0,
            init: init_vaddr,
            fini: fini_vaddr,
            init_array: init_array_range,
            fini_array: fini_array_range,
            soname: soname_off,
            rpath: rpath_off,
            runpath: runpath_off,
            needed: &needed_offs,
        };
        let dyn_size = self.dyn_entries(&addrs).len() as u64 * DYN_SIZE;
        let got_off = align_up(RW_VADDR + dyn_size, 8);
        let got_size = (GOT_RESERVED + self.relocs.len() as u64) * 8;
        ensure!(
            got_off + got_size <= DATA_VADDR,
            "dynamic section and GOT do not fit the read-write page"
        );
        addrs.got = got_off;

        let slots: Vec<u64> = (0..self.relocs.len() as u64)
            .map(|i| got_off + (GOT_RESERVED + i) * 8)
            .collect();

        // Relocation records, RELATIVE entries first the way linkers sort
        // them. The REL form stores each addend at the target itself.
        let is_rela = self.reloc_form == RelocForm::Rela;
        let mut got = Vec::new();
        got.write_u64::<LittleEndian>(RW_VADDR)?;
        got.write_u64::<LittleEndian>(0)?;
        got.write_u64::<LittleEndian>(0)?;
        let mut dyn_recs = Vec::new();
        let mut plt_recs = Vec::new();
        let mut slot_inits = Vec::with_capacity(self.relocs.len());
        for (i, reloc) in self.relocs.iter().enumerate() {
            let sym_idx = match &reloc.sym {
                Some(name) => *name_to_idx
                    .get(name.as_str())
                    .with_context(|| format!("relocation references unknown symbol '{name}'"))?,
                None => 0,
            };
            let rec = RelocRecord {
                offset: slots[i],
                info: (sym_idx << 32) | u64::from(reloc.r_type),
                addend: reloc.addend,
            };
            if reloc.r_type == R_X86_64_JUMP_SLOT {
                plt_recs.push(rec);
            } else if reloc.r_type == R_X86_64_RELATIVE {
                dyn_recs.insert(0, rec);
            } else {
                dyn_recs.push(rec);
            }
            slot_inits.push(if is_rela { reloc.init } else { reloc.addend as u64 });
        }
        for init in slot_inits {
            got.write_u64::<LittleEndian>(init)?;
        }
        // The init and fini arrays sit back to back in the data blob, so
        // one running index covers both.
        for (i, name) in self.init_array.iter().chain(&self.fini_array).enumerate() {
            let target = resolve(name)?;
            let slot_vaddr = DATA_VADDR + init_array_off + i as u64 * 8;
            dyn_recs.insert(
                0,
                RelocRecord {
                    offset: slot_vaddr,
                    info: u64::from(R_X86_64_RELATIVE),
                    addend: target as i64,
                },
            );
            if !is_rela {
                let off = (init_array_off as usize) + i * 8;
                data[off..off + 8].copy_from_slice(&target.to_le_bytes());
            }
        }
        let mut rela_dyn = Vec::new();
        for rec in &dyn_recs {
            rec.write(&mut rela_dyn, is_rela)?;
        }
        let mut rela_plt = Vec::new();
        for rec in &plt_recs {
            rec.write(&mut rela_plt, is_rela)?;
        }

        let mut dynamic = Vec::new();
        for (tag, value) in self.dyn_entries(&addrs) {
            dynamic.write_i64::<LittleEndian>(tag)?;
            dynamic.write_u64::<LittleEndian>(value)?;
        }

        let data_filesz = data.len() as u64;
        let rw_filesz = if data_filesz > 0 {
            DATA_VADDR - RW_VADDR + data_filesz
        } else {
            PAGE
        };
        let rw_memsz = rw_filesz + self.bss_size;
        let bss_range = (self.bss_size > 0).then(|| (DATA_VADDR + data_filesz, self.bss_size));

        // Program headers.
        let mut phdrs = Vec::new();
        let mut phdr_offsets = Vec::new();
        let mut push_phdr = |p: ProgramHeader| {
            phdr_offsets.push((p.p_type, EHDR_SIZE + phdrs.len() as u64));
            p.write(&mut phdrs)
        };
        push_phdr(ProgramHeader {
            p_type: PT_PHDR,
            flags: PF_R,
            offset: EHDR_SIZE,
            vaddr: EHDR_SIZE,
            filesz: phnum * PHDR_SIZE,
            memsz: phnum * PHDR_SIZE,
            align: 8,
        })?;
        push_phdr(ProgramHeader {
            p_type: PT_LOAD,
            flags: PF_R | PF_X,
            offset: 0,
            vaddr: 0,
            filesz: rx_end,
            memsz: rx_end,
            align: PAGE,
        })?;
        push_phdr(ProgramHeader {
            p_type: PT_LOAD,
            flags: PF_R | PF_W,
            offset: RW_VADDR,
            vaddr: RW_VADDR,
            filesz: rw_filesz,
            memsz: rw_memsz,
            align: PAGE,
        })?;
        push_phdr(ProgramHeader {
            p_type: PT_DYNAMIC,
            flags: PF_R | PF_W,
            offset: RW_VADDR,
            vaddr: RW_VADDR,
            filesz: dynamic.len() as u64,
            memsz: dynamic.len() as u64,
            align: 8,
        })?;
        if self.relro {
            push_phdr(ProgramHeader {
                p_type: PT_GNU_RELRO,
                flags: PF_R,
                offset: RW_VADDR,
                vaddr: RW_VADDR,
                filesz: PAGE,
                memsz: PAGE,
                align: 1,
            })?;
        }

        // File tail: .shstrtab and the section header table.
        let tail = align_up((DATA_VADDR + data_filesz).max(got_off + got_size), 8);
        let mut shdrs = Vec::new();
        let mut shstr = Vec::new();
        let mut shoff = 0;
        let mut shnum = 0u32;
        let mut shstrndx = 0u32;
        if self.sections {
            let index = SectionIndexes::new(self, &text, &data, rela_dyn_size, rela_plt_size);
            shnum = index.count;
            shstrndx = index.shstrtab;
            shstr.push(0);
            let shstr_off = tail;
            let headers = self.section_headers(
                &index,
                &mut shstr,
                SectionPlacement {
                    sysv: sysv_off.map(|off| (off, sysv_blob.as_ref().unwrap().len() as u64)),
                    gnu: gnu_off.map(|off| (off, gnu_blob.as_ref().unwrap().len() as u64)),
                    dynsym: (dynsym_off, dynsym.len() as u64),
                    dynstr: (dynstr_off, dynstr.len() as u64),
                    rela_dyn: (rela_dyn_off, rela_dyn_size),
                    rela_plt: (rela_plt_off, rela_plt_size),
                    text: (text_off, text.len() as u64),
                    dynamic: (RW_VADDR, dynamic.len() as u64),
                    got: (got_off, got_size),
                    data: (DATA_VADDR, data_filesz),
                    shstr_off,
                },
            );
            shoff = align_up(shstr_off + shstr.len() as u64, 8);
            for header in headers {
                header.write(&mut shdrs)?;
            }
        }

        // ELF header.
        let mut ident = [0u8; 16];
        ident[0..4].copy_from_slice(&ELFMAGIC);
        ident[EI_CLASS] = ELFCLASS64;
        ident[EI_DATA] = ELFDATA2LSB;
        ident[EI_VERSION] = EV_CURRENT;
        ident[EI_OSABI] = ELFOSABI_SYSV;
        let (e_shnum, e_shstrndx) = if self.sections && self.extended_shdr {
            (0, SHN_XINDEX)
        } else {
            (shnum as u16, shstrndx as u16)
        };
        let mut ehdr = Vec::new();
        ehdr.extend_from_slice(&ident);
        ehdr.write_u16::<LittleEndian>(ET_DYN)?;
        ehdr.write_u16::<LittleEndian>(EM_X86_64)?;
        ehdr.write_u32::<LittleEndian>(EV_CURRENT as u32)?;
        ehdr.write_u64::<LittleEndian>(0)?;
        ehdr.write_u64::<LittleEndian>(EHDR_SIZE)?;
        ehdr.write_u64::<LittleEndian>(shoff)?;
        ehdr.write_u32::<LittleEndian>(0)?;
        ehdr.write_u16::<LittleEndian>(EHDR_SIZE as u16)?;
        ehdr.write_u16::<LittleEndian>(PHDR_SIZE as u16)?;
        ehdr.write_u16::<LittleEndian>(phnum as u16)?;
        ehdr.write_u16::<LittleEndian>(SHDR_SIZE as u16)?;
        ehdr.write_u16::<LittleEndian>(e_shnum)?;
        ehdr.write_u16::<LittleEndian>(e_shstrndx)?;

        // Assemble the file.
        let mut out = Vec::new();
        write_at(&mut out, 0, &ehdr);
        write_at(&mut out, EHDR_SIZE, &phdrs);
        if let (Some(off), Some(blob)) = (sysv_off, &sysv_blob) {
            write_at(&mut out, off, blob);
        }
        if let (Some(off), Some(blob)) = (gnu_off, &gnu_blob) {
            write_at(&mut out, off, blob);
        }
        write_at(&mut out, dynsym_off, &dynsym);
        write_at(&mut out, dynstr_off, &dynstr);
        write_at(&mut out, rela_dyn_off, &rela_dyn);
        write_at(&mut out, rela_plt_off, &rela_plt);
        write_at(&mut out, text_off, &text);
        write_at(&mut out, RW_VADDR, &dynamic);
        write_at(&mut out, got_off, &got);
        write_at(&mut out, DATA_VADDR, &data);
        if self.sections {
            write_at(&mut out, tail, &shstr);
            write_at(&mut out, shoff, &shdrs);
        }

        Ok(BuiltDylib {
            bytes: out,
            symbols,
            slots,
            got_vaddr: got_off,
            text_vaddr: text_off,
            data_vaddr: DATA_VADDR,
            dynamic_vaddr: RW_VADDR,
            shoff,
            phdr_offsets,
            relro_range: self.relro.then_some((RW_VADDR, PAGE)),
            bss_range,
            image_end: RW_VADDR + rw_memsz,
        })
    }

    fn dyn_entries(&self, a: &DynAddrs) -> Vec<(i64, u64)> {
        let mut entries = Vec::new();
        for off in a.needed {
            entries.push((DT_NEEDED, *off));
        }
        if let Some(off) = a.soname {
            entries.push((DT_SONAME, off));
        }
        if let Some(off) = a.rpath {
            entries.push((DT_RPATH, off));
        }
        if let Some(off) = a.runpath {
            entries.push((DT_RUNPATH, off));
        }
        if let Some(flags) = self.flags {
            entries.push((DT_FLAGS, flags));
        }
        if let Some(vaddr) = a.hash {
            entries.push((DT_HASH, vaddr));
        }
        if let Some(vaddr) = a.gnu_hash {
            entries.push((DT_GNU_HASH, vaddr));
        }
        entries.push((DT_STRTAB, a.dynstr));
        entries.push((DT_STRSZ, a.dynstr_len));
        entries.push((DT_SYMTAB, a.dynsym));
        entries.push((DT_SYMENT, SYM_SIZE));
        if let Some(vaddr) = a.init {
            entries.push((DT_INIT, vaddr));
        }
        if let Some(vaddr) = a.fini {
            entries.push((DT_FINI, vaddr));
        }
        if let Some((vaddr, size)) = a.init_array {
            entries.push((DT_INIT_ARRAY, vaddr));
            entries.push((DT_INIT_ARRAYSZ, size));
        }
        if let Some((vaddr, size)) = a.fini_array {
            entries.push((DT_FINI_ARRAY, vaddr));
            entries.push((DT_FINI_ARRAYSZ, size));
        }
        if a.rela_dyn.1 > 0 {
            match self.reloc_form {
                RelocForm::Rela => {
                    entries.push((DT_RELA, a.rela_dyn.0));
                    entries.push((DT_RELASZ, a.rela_dyn.1));
                    entries.push((DT_RELAENT, RELA_SIZE));
                }
                RelocForm::Rel => {
                    entries.push((DT_REL, a.rela_dyn.0));
                    entries.push((DT_RELSZ, a.rela_dyn.1));
                    entries.push((DT_RELENT, REL_SIZE));
                }
            }
        }
        if a.rela_plt.1 > 0 {
            entries.push((DT_JMPREL, a.rela_plt.0));
            entries.push((DT_PLTRELSZ, a.rela_plt.1));
            let form = match self.reloc_form {
                RelocForm::Rela => DT_RELA as u64,
                RelocForm::Rel => DT_REL as u64,
            };
            entries.push((DT_PLTREL, form));
        }
        entries.push((DT_PLTGOT, a.got));
        entries.push((DT_NULL, 0));
        entries
    }

    fn section_headers(
        &self,
        index: &SectionIndexes,
        shstr: &mut Vec<u8>,
        at: SectionPlacement,
    ) -> Vec<SectionHeader> {
        let is_rela = self.reloc_form == RelocForm::Rela;
        let (rel_type, rel_ent) = if is_rela {
            (SHT_RELA, RELA_SIZE)
        } else {
            (SHT_REL, REL_SIZE)
        };
        let mut headers = Vec::new();
        let mut null = SectionHeader::zeroed();
        if self.extended_shdr {
            null.size = index.count as u64;
            null.link = index.shstrtab;
        }
        headers.push(null);
        if let Some((off, size)) = at.sysv {
            headers.push(SectionHeader {
                name: add_name(shstr, ".hash"),
                sh_type: SHT_HASH,
                flags: SHF_ALLOC as u64,
                addr: off,
                offset: off,
                size,
                link: index.dynsym,
                info: 0,
                addralign: 8,
                entsize: 4,
            });
        }
        if let Some((off, size)) = at.gnu {
            headers.push(SectionHeader {
                name: add_name(shstr, ".gnu.hash"),
                sh_type: SHT_GNU_HASH,
                flags: SHF_ALLOC as u64,
                addr: off,
                offset: off,
                size,
                link: index.dynsym,
                info: 0,
                addralign: 8,
                entsize: 0,
            });
        }
        headers.push(SectionHeader {
            name: add_name(shstr, ".dynsym"),
            sh_type: SHT_DYNSYM,
            flags: SHF_ALLOC as u64,
            addr: at.dynsym.0,
            offset: at.dynsym.0,
            size: at.dynsym.1,
            link: index.dynstr,
            info: 1,
            addralign: 8,
            entsize: SYM_SIZE,
        });
        headers.push(SectionHeader {
            name: add_name(shstr, ".dynstr"),
            sh_type: SHT_STRTAB,
            flags: SHF_ALLOC as u64,
            addr: at.dynstr.0,
            offset: at.dynstr.0,
            size: at.dynstr.1,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });
        if at.rela_dyn.1 > 0 {
            headers.push(SectionHeader {
                name: add_name(shstr, if is_rela { ".rela.dyn" } else { ".rel.dyn" }),
                sh_type: rel_type,
                flags: SHF_ALLOC as u64,
                addr: at.rela_dyn.0,
                offset: at.rela_dyn.0,
                size: at.rela_dyn.1,
                link: index.dynsym,
                info: 0,
                addralign: 8,
                entsize: rel_ent,
            });
        }
        if at.rela_plt.1 > 0 {
            headers.push(SectionHeader {
                name: add_name(shstr, if is_rela { ".rela.plt" } else { ".rel.plt" }),
                sh_type: rel_type,
                flags: SHF_ALLOC as u64,
                addr: at.rela_plt.0,
                offset: at.rela_plt.0,
                size: at.rela_plt.1,
                link: index.dynsym,
                info: index.got,
                addralign: 8,
                entsize: rel_ent,
            });
        }
        if at.text.1 > 0 {
            headers.push(SectionHeader {
                name: add_name(shstr, ".text"),
                sh_type: SHT_PROGBITS,
                flags: (SHF_ALLOC | SHF_EXECINSTR) as u64,
                addr: at.text.0,
                offset: at.text.0,
                size: at.text.1,
                link: 0,
                info: 0,
                addralign: 16,
                entsize: 0,
            });
        }
        headers.push(SectionHeader {
            name: add_name(shstr, ".dynamic"),
            sh_type: SHT_DYNAMIC,
            flags: (SHF_ALLOC | SHF_WRITE) as u64,
            addr: at.dynamic.0,
            offset: at.dynamic.0,
            size: at.dynamic.1,
            link: index.dynstr,
            info: 0,
            addralign: 8,
            entsize: DYN_SIZE,
        });
        headers.push(SectionHeader {
            name: add_name(shstr, ".got"),
            sh_type: SHT_PROGBITS,
            flags: (SHF_ALLOC | SHF_WRITE) as u64,
            addr: at.got.0,
            offset: at.got.0,
            size: at.got.1,
            link: 0,
            info: 0,
            addralign: 8,
            entsize: 8,
        });
        if at.data.1 > 0 {
            headers.push(SectionHeader {
                name: add_name(shstr, ".data"),
                sh_type: SHT_PROGBITS,
                flags: (SHF_ALLOC | SHF_WRITE) as u64,
                addr: at.data.0,
                offset: at.data.0,
                size: at.data.1,
                link: 0,
                info: 0,
                addralign: 8,
                entsize: 0,
            });
        }
        headers.push(SectionHeader {
            name: add_name(shstr, ".shstrtab"),
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: at.shstr_off,
            size: 0,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });
        // The name table length is only known once every name is in.
        let last = headers.len() - 1;
        headers[last].size = shstr.len() as u64;
        headers
    }
}

/// Indexes the section header table will use, derived from the same
/// presence rules as the headers themselves.
struct SectionIndexes {
    dynsym: u32,
    dynstr: u32,
    text: Option<u32>,
    got: u32,
    data: Option<u32>,
    shstrtab: u32,
    count: u32,
}

impl SectionIndexes {
    fn new(
        builder: &DylibBuilder,
        text: &[u8],
        data: &[u8],
        rela_dyn_size: u64,
        rela_plt_size: u64,
    ) -> Self {
        let mut next = 1u32;
        let mut take = |present: bool| {
            if present {
                let idx = next;
                next += 1;
                Some(idx)
            } else {
                None
            }
        };
        take(builder.hash_style.has_sysv());
        take(builder.hash_style.has_gnu());
        let dynsym = take(true).unwrap();
        let dynstr = take(true).unwrap();
        take(rela_dyn_size > 0);
        take(rela_plt_size > 0);
        let text = take(!text.is_empty());
        take(true); // .dynamic
        let got = take(true).unwrap();
        let data = take(!data.is_empty());
        let shstrtab = take(true).unwrap();
        SectionIndexes {
            dynsym,
            dynstr,
            text,
            got,
            data,
            shstrtab,
            count: next,
        }
    }
}

struct SectionPlacement {
    sysv: Option<(u64, u64)>,
    gnu: Option<(u64, u64)>,
    dynsym: (u64, u64),
    dynstr: (u64, u64),
    rela_dyn: (u64, u64),
    rela_plt: (u64, u64),
    text: (u64, u64),
    dynamic: (u64, u64),
    got: (u64, u64),
    data: (u64, u64),
    shstr_off: u64,
}

struct DynAddrs<'a> {
    hash: Option<u64>,
    gnu_hash: Option<u64>,
    dynsym: u64,
    dynstr: u64,
    dynstr_len: u64,
    rela_dyn: (u64, u64),
    rela_plt: (u64, u64),
    got: u64,
    init: Option<u64>,
    fini: Option<u64>,
    init_array: Option<(u64, u64)>,
    fini_array: Option<(u64, u64)>,
    soname: Option<u64>,
    rpath: Option<u64>,
    runpath: Option<u64>,
    needed: &'a [u64],
}

/// A generated shared object together with the addresses tests assert on.
pub struct BuiltDylib {
    bytes: Vec<u8>,
    symbols: BTreeMap<String, u64>,
    slots: Vec<u64>,
    got_vaddr: u64,
    text_vaddr: u64,
    data_vaddr: u64,
    dynamic_vaddr: u64,
    shoff: u64,
    phdr_offsets: Vec<(u32, u64)>,
    relro_range: Option<(u64, u64)>,
    bss_range: Option<(u64, u64)>,
    image_end: u64,
}

impl BuiltDylib {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, &self.bytes)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Virtual address of a defined symbol.
    pub fn symbol_vaddr(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Virtual address of the GOT slot a relocation targets, by the index
    /// [`DylibBuilder::add_reloc`] returned.
    pub fn slot_vaddr(&self, idx: usize) -> u64 {
        self.slots[idx]
    }

    pub fn got_vaddr(&self) -> u64 {
        self.got_vaddr
    }

    pub fn text_vaddr(&self) -> u64 {
        self.text_vaddr
    }

    pub fn data_vaddr(&self) -> u64 {
        self.data_vaddr
    }

    pub fn dynamic_vaddr(&self) -> u64 {
        self.dynamic_vaddr
    }

    /// File offset of the section header table, zero when absent.
    pub fn shoff(&self) -> u64 {
        self.shoff
    }

    /// File offset of the first program header of the given type.
    pub fn phdr_offset(&self, p_type: u32) -> Option<u64> {
        self.phdr_offsets
            .iter()
            .find(|(t, _)| *t == p_type)
            .map(|(_, off)| *off)
    }

    /// `(vaddr, len)` covered by `PT_GNU_RELRO`, when emitted.
    pub fn relro_range(&self) -> Option<(u64, u64)> {
        self.relro_range
    }

    /// `(vaddr, len)` of the zero-fill tail, when any.
    pub fn bss_range(&self) -> Option<(u64, u64)> {
        self.bss_range
    }

    /// One past the highest virtual address of the image.
    pub fn image_end(&self) -> u64 {
        self.image_end
    }
}

struct Symbol {
    name: u32,
    info: u8,
    other: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

impl Symbol {
    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<LittleEndian>(self.name)?;
        buf.write_u8(self.info)?;
        buf.write_u8(self.other)?;
        buf.write_u16::<LittleEndian>(self.shndx)?;
        buf.write_u64::<LittleEndian>(self.value)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        Ok(())
    }
}

struct RelocRecord {
    offset: u64,
    info: u64,
    addend: i64,
}

impl RelocRecord {
    fn write(&self, buf: &mut Vec<u8>, is_rela: bool) -> Result<()> {
        buf.write_u64::<LittleEndian>(self.offset)?;
        buf.write_u64::<LittleEndian>(self.info)?;
        if is_rela {
            buf.write_i64::<LittleEndian>(self.addend)?;
        }
        Ok(())
    }
}

struct ProgramHeader {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ProgramHeader {
    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<LittleEndian>(self.p_type)?;
        buf.write_u32::<LittleEndian>(self.flags)?;
        buf.write_u64::<LittleEndian>(self.offset)?;
        buf.write_u64::<LittleEndian>(self.vaddr)?;
        buf.write_u64::<LittleEndian>(self.vaddr)?;
        buf.write_u64::<LittleEndian>(self.filesz)?;
        buf.write_u64::<LittleEndian>(self.memsz)?;
        buf.write_u64::<LittleEndian>(self.align)?;
        Ok(())
    }
}

struct SectionHeader {
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

impl SectionHeader {
    fn zeroed() -> Self {
        SectionHeader {
            name: 0,
            sh_type: SHT_NULL,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            addralign: 0,
            entsize: 0,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<LittleEndian>(self.name)?;
        buf.write_u32::<LittleEndian>(self.sh_type)?;
        buf.write_u64::<LittleEndian>(self.flags)?;
        buf.write_u64::<LittleEndian>(self.addr)?;
        buf.write_u64::<LittleEndian>(self.offset)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        buf.write_u32::<LittleEndian>(self.link)?;
        buf.write_u32::<LittleEndian>(self.info)?;
        buf.write_u64::<LittleEndian>(self.addralign)?;
        buf.write_u64::<LittleEndian>(self.entsize)?;
        Ok(())
    }
}

fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) / align * align
}

fn add_name(shstr: &mut Vec<u8>, name: &str) -> u32 {
    let off = shstr.len() as u32;
    shstr.extend_from_slice(name.as_bytes());
    shstr.push(0);
    off
}

fn write_at(buf: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let offset = offset as usize;
    if buf.len() < offset + data.len() {
        buf.resize(offset + data.len(), 0);
    }
    buf[offset..offset + data.len()].copy_from_slice(data);
}
