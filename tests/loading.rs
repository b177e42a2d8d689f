//! Loading happy paths: mapped segments, symbol lookup through both hash
//! flavours, dynamic metadata, plus the failure modes of damaged program
//! headers, hash headers and dynamic sections.

mod common;

use common::{ADD2, PAGE_SIZE, RET, RET42, patch_u32, patch_u64, write_bytes, write_fixture};
use elf_image::abi::{
    DT_DEBUG, DT_GNU_HASH, DT_HASH, DT_PLTREL, DT_SYMTAB, PT_GNU_RELRO, PT_LOAD,
    R_X86_64_JUMP_SLOT,
};
use elf_image::{ElfImage, Error};
use gen_dylib::{BuiltDylib, DylibBuilder, HashStyle};

const DF_BIND_NOW: u64 = 0x8;
// Offsets within one program header record.
const P_VADDR: u64 = 16;
const P_MEMSZ: u64 = 40;

#[test]
fn calls_functions() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libcalls.so")
        .add_func("answer", RET42)
        .add_func("add", ADD2);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("calls", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let base = image.base().unwrap();
    assert_eq!(base % PAGE_SIZE, 0);
    assert_eq!(image.image_size(), Some(0x2000));

    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    assert_eq!(answer(), 42);
    let add = unsafe { image.get::<extern "C" fn(i32, i32) -> i32>("add").unwrap() };
    assert_eq!(add(2, 3), 5);
    assert_eq!(add(-7, 7), 0);

    let addr = image.symbol_addr("answer").unwrap() as usize;
    assert_eq!(addr, base + built.symbol_vaddr("answer").unwrap() as usize);
}

#[test]
fn reads_data_symbol() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libdata.so")
        .add_data("counter", &0xfeed_beef_u64.to_le_bytes());
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("data", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let counter = image.symbol_addr("counter").unwrap() as *const u64;
    assert_eq!(unsafe { *counter }, 0xfeed_beef);
}

#[test]
fn reports_dynamic_metadata() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libmeta.so.1")
        .needed("libc.so.6")
        .needed("libm.so.6")
        .rpath("/opt/lib")
        .runpath("$ORIGIN/../lib")
        .flags(DF_BIND_NOW)
        .add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("meta", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    // Metadata is only available once the image is loaded.
    assert_eq!(image.soname(), None);
    image.load_program().unwrap();
    assert_eq!(image.soname(), Some("libmeta.so.1"));
    assert_eq!(image.needed_libs(), Some(&["libc.so.6", "libm.so.6"][..]));
    assert_eq!(image.rpath(), Some("/opt/lib"));
    assert_eq!(image.runpath(), Some("$ORIGIN/../lib"));
    assert_eq!(image.dt_flags(), Some(DF_BIND_NOW as usize));
}

#[test]
fn exposes_constructors() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libctors.so")
        .add_func("ctor", RET)
        .add_func("dtor", RET)
        .add_func("ctor0", RET)
        .add_func("ctor1", RET)
        .add_func("dtor0", RET)
        .init("ctor")
        .fini("dtor")
        .init_array(&["ctor0", "ctor1"])
        .fini_array(&["dtor0"]);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("ctors", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let base = image.base().unwrap();
    let vaddr = |name: &str| built.symbol_vaddr(name).unwrap() as usize;

    let init = image.init_fn().expect("no DT_INIT");
    assert_eq!(init as usize, base + vaddr("ctor"));
    init();
    let fini = image.fini_fn().expect("no DT_FINI");
    assert_eq!(fini as usize, base + vaddr("dtor"));

    // The array slots carry relative relocations; correct entries prove
    // they were applied.
    let ctors = image.init_array().expect("no DT_INIT_ARRAY");
    assert_eq!(ctors.len(), 2);
    assert_eq!(ctors[0] as usize, base + vaddr("ctor0"));
    assert_eq!(ctors[1] as usize, base + vaddr("ctor1"));
    for ctor in ctors {
        ctor();
    }
    let dtors = image.fini_array().expect("no DT_FINI_ARRAY");
    assert_eq!(dtors.len(), 1);
    assert_eq!(dtors[0] as usize, base + vaddr("dtor0"));
}

#[test]
fn zero_fills_bss() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libbss.so")
        .add_data("counter", &1u64.to_le_bytes())
        .bss(0x2100);
    let built = builder.build().expect("failed to build fixture");
    let (bss_vaddr, bss_len) = built.bss_range().expect("fixture has no zero fill");
    let path = write_fixture("bss", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let base = image.base().unwrap();
    let start = (base + bss_vaddr as usize) as *mut u8;
    unsafe {
        assert_eq!(*start, 0);
        assert_eq!(*start.add(bss_len as usize - 1), 0);
        // The zero fill belongs to a writable segment.
        *start = 7;
        assert_eq!(*start, 7);
    }
}

#[test]
fn zero_fill_reaches_page_boundary() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libtail.so")
        .add_data("counter", &1u64.to_le_bytes())
        .bss(0x10);
    let built = builder.build().expect("failed to build fixture");
    let (bss_vaddr, bss_len) = built.bss_range().expect("fixture has no zero fill");
    let page_end = (bss_vaddr as usize + bss_len as usize).next_multiple_of(PAGE_SIZE);
    // The file keeps its section name table right after the data bytes,
    // inside the page the zero fill ends in. Nonzero bytes there prove
    // the fixture exercises the tail.
    let file = built.bytes();
    let tail = &file[bss_vaddr as usize..file.len().min(page_end)];
    assert!(tail.iter().any(|byte| *byte != 0), "fixture tail is all zero");
    let path = write_fixture("page_tail", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let base = image.base().unwrap();
    let counter = image.symbol_addr("counter").unwrap() as *const u64;
    assert_eq!(unsafe { *counter }, 1);
    // Everything from the end of the file data to the page boundary must
    // read zero, not stale file bytes.
    for offset in bss_vaddr as usize..page_end {
        let byte = unsafe { *((base + offset) as *const u8) };
        assert_eq!(byte, 0, "stale byte at offset {offset:#x}");
    }
}

#[test]
fn absent_symbol_reports_not_found() {
    let mut builder = DylibBuilder::new();
    builder.soname("libabsent.so").add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("absent", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let err = image.symbol_addr("no_such_symbol").unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "unexpected error: {err}");
}

#[test]
fn object_without_hash_table_reports_not_found() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libnohash.so")
        .hash_style(HashStyle::None)
        .add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("nohash", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let err = image.symbol_addr("answer").unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "unexpected error: {err}");
}

#[test]
fn sysv_and_gnu_lookups_agree() {
    let names = ["alpha", "beta", "gamma", "delta", "answer"];
    let build = |style: HashStyle, file: &str| {
        let mut builder = DylibBuilder::new();
        builder.soname("libhash.so").hash_style(style);
        for name in names {
            builder.add_func(name, RET42);
        }
        let built = builder.build().expect("failed to build fixture");
        let path = write_fixture(file, &built);
        let mut image: ElfImage = ElfImage::new();
        image.open(&path, PAGE_SIZE).unwrap();
        image.load_program().unwrap();
        (built, image)
    };
    let (sysv_built, sysv) = build(HashStyle::Sysv, "hash_sysv");
    let (gnu_built, gnu) = build(HashStyle::Gnu, "hash_gnu");

    for name in names {
        let sysv_addr = sysv.symbol_addr(name).unwrap() as usize;
        let gnu_addr = gnu.symbol_addr(name).unwrap() as usize;
        let sysv_off = sysv_addr - sysv.base().unwrap();
        let gnu_off = gnu_addr - gnu.base().unwrap();
        assert_eq!(sysv_off, sysv_built.symbol_vaddr(name).unwrap() as usize);
        assert_eq!(gnu_off, gnu_built.symbol_vaddr(name).unwrap() as usize);
        assert_eq!(sysv_off, gnu_off, "placement differs for '{name}'");
    }
    assert!(matches!(
        sysv.symbol_addr("missing").unwrap_err(),
        Error::NotFound { .. }
    ));
    assert!(matches!(
        gnu.symbol_addr("missing").unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[test]
fn extended_header_object_loads() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libextload.so")
        .extended_shdr(true)
        .add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("extended_load", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    assert_eq!(answer(), 42);
}

#[test]
fn object_without_section_table_loads() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libnosect.so")
        .sections(false)
        .add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    assert_eq!(built.shoff(), 0);
    let path = write_fixture("nosect", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    assert_eq!(image.soname(), Some("libnosect.so"));
    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    assert_eq!(answer(), 42);
}

#[test]
fn pointers_survive_unload() {
    let mut builder = DylibBuilder::new();
    builder.soname("libsurvive.so").add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("survive", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    let raw = answer.into_raw();
    image.unload().unwrap();
    image.close().unwrap();
    // The mapping is never torn down, so the pointer stays callable.
    let resident: extern "C" fn() -> i32 = unsafe { std::mem::transmute(raw) };
    assert_eq!(resident(), 42);
}

#[test]
fn libloading_loads_generated_object() {
    let mut builder = DylibBuilder::new();
    builder.soname("libhosted.so").add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("hosted", &built);

    // The platform loader accepting the object keeps the generator honest.
    let lib = unsafe {
        let lib = libloading::os::unix::Library::open(
            Some(&path),
            libloading::os::unix::RTLD_LAZY,
        )
        .expect("platform loader rejected the object");
        libloading::Library::from(lib)
    };
    let answer: libloading::Symbol<extern "C" fn() -> i32> =
        unsafe { lib.get(b"answer").expect("symbol missing under dlopen") };
    assert_eq!(answer(), 42);
}

#[test]
fn object_crate_parses_generated_object() {
    use object::{Object, ObjectKind, ObjectSymbol};

    let mut builder = DylibBuilder::new();
    builder
        .soname("libparsed.so")
        .add_func("answer", RET42)
        .add_data("counter", &5u64.to_le_bytes());
    let built = builder.build().expect("failed to build fixture");

    let file = object::File::parse(built.bytes()).expect("object failed to parse");
    assert_eq!(file.kind(), ObjectKind::Dynamic);
    let answer = file
        .dynamic_symbols()
        .find(|sym| sym.name().map(|name| name == "answer").unwrap_or(false))
        .expect("answer missing from dynamic symbols");
    assert_eq!(answer.address(), built.symbol_vaddr("answer").unwrap());
}

#[test]
fn open_with_fd_loads() {
    use std::os::fd::IntoRawFd;

    let mut builder = DylibBuilder::new();
    builder.soname("libfd.so").add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("from_fd", &built);

    let fd = std::fs::File::open(&path).unwrap().into_raw_fd();
    let mut image: ElfImage = ElfImage::new();
    unsafe { image.open_with_fd(fd, PAGE_SIZE).unwrap() };
    image.load_program().unwrap();
    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    assert_eq!(answer(), 42);
}

#[cfg(target_os = "linux")]
#[test]
fn relro_page_is_read_only() {
    let mut builder = DylibBuilder::new();
    builder.soname("librelro.so").add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let (relro_vaddr, _) = built.relro_range().expect("fixture has no RELRO segment");
    let path = write_fixture("relro", &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let addr = image.base().unwrap() + relro_vaddr as usize;

    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    let mut found = false;
    for line in maps.lines() {
        let Some((range, rest)) = line.split_once(' ') else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let start = usize::from_str_radix(start, 16).unwrap();
        let end = usize::from_str_radix(end, 16).unwrap();
        if start <= addr && addr < end {
            assert!(rest.starts_with("r--"), "sealed page has wrong protection: {line}");
            found = true;
        }
    }
    assert!(found, "sealed page missing from /proc/self/maps");
}

/// Byte offset of the first dynamic entry carrying `tag`.
fn find_dyn_entry(bytes: &[u8], dynamic_off: u64, tag: i64) -> u64 {
    let mut off = dynamic_off as usize;
    loop {
        let entry_tag = i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        if entry_tag == tag {
            return off as u64;
        }
        assert_ne!(entry_tag, 0, "tag {tag} not found in dynamic section");
        off += 16;
    }
}

#[test]
fn rejects_dynamic_without_symtab() {
    let mut builder = DylibBuilder::new();
    builder.soname("libnosymtab.so").add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    let entry = find_dyn_entry(&bytes, built.dynamic_vaddr(), DT_SYMTAB);
    patch_u64(&mut bytes, entry, DT_DEBUG as u64);
    let path = write_bytes("nosymtab", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
    // The failed load leaves the image opened; closing it must work.
    image.close().unwrap();
}

#[test]
fn rejects_unknown_pltrel_value() {
    let mut builder = DylibBuilder::new();
    builder.soname("libbadplt.so").add_func("answer", RET42);
    builder.add_reloc(R_X86_64_JUMP_SLOT, Some("answer"), 0);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    let entry = find_dyn_entry(&bytes, built.dynamic_vaddr(), DT_PLTREL);
    patch_u64(&mut bytes, entry + 8, 99);
    let path = write_bytes("badplt", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::UnknownFormat { .. }), "unexpected error: {err}");
}

/// Damage a fresh fixture, open it, and collect the `load_program` error.
fn load_patched(name: &str, patch: impl FnOnce(&mut Vec<u8>, &BuiltDylib)) -> Error {
    let mut builder = DylibBuilder::new();
    builder.soname("libdamaged.so").add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    patch(&mut bytes, &built);
    let path = write_bytes(name, &bytes);
    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap_err()
}

#[test]
fn rejects_wrapping_load_segment() {
    // A memory size that carries the segment end past the top of the
    // address space.
    let err = load_patched("span_wrap", |bytes, built| {
        let load = built.phdr_offset(PT_LOAD).expect("no PT_LOAD header");
        patch_u64(bytes, load + P_VADDR, 0x1000);
        patch_u64(bytes, load + P_MEMSZ, u64::MAX);
    });
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}

#[test]
fn rejects_misaligned_load_segment() {
    // The address moves into its page while the file offset stays at
    // zero, leaving no room to widen the mapping back to the boundary.
    let err = load_patched("load_misaligned", |bytes, built| {
        let load = built.phdr_offset(PT_LOAD).expect("no PT_LOAD header");
        patch_u64(bytes, load + P_VADDR, 0x800);
    });
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}

#[test]
fn rejects_wrapping_relro_segment() {
    let err = load_patched("relro_wrap", |bytes, built| {
        let relro = built.phdr_offset(PT_GNU_RELRO).expect("no PT_GNU_RELRO header");
        patch_u64(bytes, relro + P_MEMSZ, u64::MAX);
    });
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}

/// The table address a dynamic entry points at, resolved to a file offset.
fn dyn_entry_target(bytes: &[u8], dynamic_off: u64, tag: i64) -> u64 {
    let entry = find_dyn_entry(bytes, dynamic_off, tag) as usize;
    u64::from_le_bytes(bytes[entry + 8..][..8].try_into().unwrap())
}

#[test]
fn rejects_zero_sysv_hash_buckets() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libzerobucket.so")
        .hash_style(HashStyle::Sysv)
        .add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    let table = dyn_entry_target(&bytes, built.dynamic_vaddr(), DT_HASH);
    patch_u32(&mut bytes, table, 0);
    let path = write_bytes("sysv_zero_bucket", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}

#[test]
fn rejects_zero_gnu_hash_buckets() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libzerognu.so")
        .hash_style(HashStyle::Gnu)
        .add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    let table = dyn_entry_target(&bytes, built.dynamic_vaddr(), DT_GNU_HASH);
    patch_u32(&mut bytes, table, 0);
    let path = write_bytes("gnu_zero_bucket", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}

#[test]
fn rejects_zero_gnu_bloom_words() {
    let mut builder = DylibBuilder::new();
    builder
        .soname("libzerobloom.so")
        .hash_style(HashStyle::Gnu)
        .add_func("answer", RET42);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    let table = dyn_entry_target(&bytes, built.dynamic_vaddr(), DT_GNU_HASH);
    // The bloom word count sits after nbucket and the symbol bias.
    patch_u32(&mut bytes, table + 8, 0);
    let path = write_bytes("gnu_zero_bloom", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}
