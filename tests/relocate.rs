//! Relocation semantics, checked by reading back the words the loader
//! wrote into GOT slots: the section-table driver used for fresh loads
//! and the dynamic-array driver used for resident images.

mod common;

use std::ffi::c_void;

use common::{PAGE_SIZE, RET42, patch_u64, read_slot, write_bytes, write_fixture};
use elf_image::abi::{
    R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT, R_X86_64_NONE, R_X86_64_PC32,
    R_X86_64_RELATIVE, SHT_RELA,
};
use elf_image::{ElfImage, Error};
use gen_dylib::{DylibBuilder, RelocForm};

/// The expected slot values are the same for both record forms: explicit
/// addends move into the file words under `RelocForm::Rel`, and the
/// loader reads them back from there.
fn check_relocations(form: RelocForm, file: &str) {
    let mut builder = DylibBuilder::new();
    builder.soname("libreloc.so").reloc_form(form);
    builder.add_func("answer", RET42);
    builder.add_data("value", &9u64.to_le_bytes());
    let rel = builder.add_reloc(R_X86_64_RELATIVE, None, 0x1500);
    let got = builder.add_reloc(R_X86_64_GLOB_DAT, Some("answer"), 0);
    let sym = builder.add_reloc(R_X86_64_64, Some("answer"), 7);
    let jmp = builder.add_reloc(R_X86_64_JUMP_SLOT, Some("answer"), 0);
    let none = builder.add_reloc_with_init(R_X86_64_NONE, None, 0x5a5a, 0x5a5a);
    let unknown = builder.add_reloc_with_init(R_X86_64_PC32, None, 0, 0xdead);
    let data_ref = builder.add_reloc(R_X86_64_64, Some("value"), 0);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture(file, &built);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    image.load_program().unwrap();
    let base = image.base().unwrap();
    let answer = image.symbol_addr("answer").unwrap() as u64;
    let value = image.symbol_addr("value").unwrap() as u64;

    let slot = |idx: usize| read_slot(base, built.slot_vaddr(idx));
    assert_eq!(slot(rel), (base + 0x1500) as u64, "relative");
    assert_eq!(slot(got), answer, "glob_dat");
    assert_eq!(slot(sym), answer + 7, "symbolic with addend");
    assert_eq!(slot(jmp), answer, "jump slot");
    // R_X86_64_NONE must be skipped without touching the word.
    assert_eq!(slot(none), 0x5a5a, "none left alone");
    // An unrecognized type stores zero rather than garbage.
    assert_eq!(slot(unknown), 0, "unknown zeroed");
    assert_eq!(slot(data_ref), value, "symbolic to data");
}

#[test]
fn applies_rela_relocations() {
    check_relocations(RelocForm::Rela, "rela_form");
}

#[test]
fn applies_rel_relocations() {
    check_relocations(RelocForm::Rel, "rel_form");
}

#[test]
fn adopts_resident_image() {
    let mut builder = DylibBuilder::new();
    // No section table: the fresh load maps the segments but has no
    // relocation sections to walk, leaving the image in the state a
    // bootstrap loader would hand over.
    builder
        .soname("libadopt.so")
        .sections(false)
        .relro(false)
        .add_func("answer", RET42);
    let rel = builder.add_reloc(R_X86_64_RELATIVE, None, 0x1500);
    let got = builder.add_reloc(R_X86_64_GLOB_DAT, Some("answer"), 0);
    let jmp = builder.add_reloc(R_X86_64_JUMP_SLOT, Some("answer"), 0);
    let none = builder.add_reloc_with_init(R_X86_64_NONE, None, 0x5a5a, 0x5a5a);
    let built = builder.build().expect("failed to build fixture");
    let path = write_fixture("adopt", &built);

    let mut first: ElfImage = ElfImage::new();
    first.open(&path, PAGE_SIZE).unwrap();
    first.load_program().unwrap();
    let base = first.base().unwrap();
    assert_eq!(read_slot(base, built.slot_vaddr(rel)), 0);
    assert_eq!(read_slot(base, built.slot_vaddr(got)), 0);
    assert_eq!(read_slot(base, built.slot_vaddr(none)), 0x5a5a);

    let mut adopted: ElfImage = ElfImage::new();
    unsafe {
        adopted
            .read_loaded_image(base as *mut c_void, PAGE_SIZE)
            .unwrap()
    };
    assert_eq!(adopted.base(), Some(base));
    assert_eq!(adopted.soname(), Some("libadopt.so"));

    let answer = adopted.symbol_addr("answer").unwrap() as u64;
    assert_eq!(read_slot(base, built.slot_vaddr(rel)), (base + 0x1500) as u64);
    assert_eq!(read_slot(base, built.slot_vaddr(got)), answer);
    assert_eq!(read_slot(base, built.slot_vaddr(jmp)), answer);
    assert_eq!(read_slot(base, built.slot_vaddr(none)), 0x5a5a);

    let call = unsafe { adopted.get::<extern "C" fn() -> i32>("answer").unwrap() };
    assert_eq!(call(), 42);
    adopted.unload().unwrap();
    adopted.close().unwrap();
}

#[test]
fn rejects_undersized_relocation_entries() {
    let mut builder = DylibBuilder::new();
    builder.soname("libent.so").add_func("answer", RET42);
    builder.add_reloc(R_X86_64_GLOB_DAT, Some("answer"), 0);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    // Section 5 of this fixture is .rela.dyn; the sh_type read keeps the
    // layout assumption honest.
    let shdr = built.shoff() + 5 * 64;
    let sh_type = u32::from_le_bytes(bytes[shdr as usize + 4..][..4].try_into().unwrap());
    assert_eq!(sh_type, SHT_RELA);
    patch_u64(&mut bytes, shdr + 56, 8);
    let path = write_bytes("small_ent", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::UnknownFormat { .. }), "unexpected error: {err}");
}

#[test]
fn rejects_relocation_section_out_of_bounds() {
    let mut builder = DylibBuilder::new();
    builder.soname("liboob.so").add_func("answer", RET42);
    builder.add_reloc(R_X86_64_GLOB_DAT, Some("answer"), 0);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    let shdr = built.shoff() + 5 * 64;
    let sh_type = u32::from_le_bytes(bytes[shdr as usize + 4..][..4].try_into().unwrap());
    assert_eq!(sh_type, SHT_RELA);
    patch_u64(&mut bytes, shdr + 24, 0x10_0000);
    let path = write_bytes("reloc_oob", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}

#[test]
fn rejects_wrapping_relocation_section() {
    // An sh_offset near the top of the range wraps once sh_size is added
    // and would land the bounds check back inside the file.
    let mut builder = DylibBuilder::new();
    builder.soname("libwrap.so").add_func("answer", RET42);
    builder.add_reloc(R_X86_64_GLOB_DAT, Some("answer"), 0);
    let built = builder.build().expect("failed to build fixture");
    let mut bytes = built.bytes().to_vec();
    let shdr = built.shoff() + 5 * 64;
    let sh_type = u32::from_le_bytes(bytes[shdr as usize + 4..][..4].try_into().unwrap());
    assert_eq!(sh_type, SHT_RELA);
    patch_u64(&mut bytes, shdr + 24, u64::MAX - 8);
    let path = write_bytes("reloc_wrap", &bytes);

    let mut image: ElfImage = ElfImage::new();
    image.open(&path, PAGE_SIZE).unwrap();
    let err = image.load_program().unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }), "unexpected error: {err}");
}
