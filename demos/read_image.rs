use elf_image::ElfImage;
use elf_image::abi::R_X86_64_GLOB_DAT;
use gen_dylib::DylibBuilder;

fn main() {
    unsafe { std::env::set_var("RUST_LOG", "trace") };
    env_logger::init();

    // An object without a section table, the shape a bootstrap stage
    // hands over: segments resident, relocations still unapplied.
    let mut builder = DylibBuilder::new();
    builder
        .soname("libresident.so")
        .sections(false)
        .relro(false)
        .add_func("answer", &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
    let slot = builder.add_reloc(R_X86_64_GLOB_DAT, Some("answer"), 0);
    let built = builder.build().unwrap();
    let mut path = std::env::temp_dir();
    path.push("libresident.so");
    built.write_to(&path).unwrap();

    let mut stage0: ElfImage = ElfImage::new();
    stage0.open(path.to_str().unwrap(), 0x1000).unwrap();
    stage0.load_program().unwrap();
    let base = stage0.base().unwrap();
    let got = (base + built.slot_vaddr(slot) as usize) as *const u64;
    println!("GOT slot before adoption: {:#x}", unsafe { *got });

    // Adopt the resident image; its relocations are applied in place.
    let mut image: ElfImage = ElfImage::new();
    unsafe {
        image
            .read_loaded_image(base as *mut core::ffi::c_void, 0x1000)
            .unwrap()
    };
    println!("GOT slot after adoption:  {:#x}", unsafe { *got });
    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    println!("answer() = {}", answer());
}
