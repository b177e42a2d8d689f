use elf_image::ElfImage;
use gen_dylib::DylibBuilder;

fn main() {
    unsafe { std::env::set_var("RUST_LOG", "trace") };
    env_logger::init();

    // Generate a small shared object: answer() returns 42.
    let mut builder = DylibBuilder::new();
    builder
        .soname("libdemo.so")
        .add_func("answer", &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
    let built = builder.build().unwrap();
    let mut path = std::env::temp_dir();
    path.push("libdemo.so");
    built.write_to(&path).unwrap();

    // Walk it through the whole lifecycle.
    let mut image: ElfImage = ElfImage::new();
    image.open(path.to_str().unwrap(), 0x1000).unwrap();
    image.load_program().unwrap();
    println!("loaded {} at {:#x}", image.soname().unwrap(), image.base().unwrap());
    let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
    println!("answer() = {}", answer());
    image.unload().unwrap();
    image.close().unwrap();
}
