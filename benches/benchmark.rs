use criterion::{Criterion, criterion_group, criterion_main};
use elf_image::ElfImage;
use gen_dylib::DylibBuilder;
use libloading::Library;

fn fixture() -> String {
    let mut builder = DylibBuilder::new();
    // a: lea eax, [rdi + rsi]; ret
    builder
        .soname("libbench.so")
        .add_func("a", &[0x8d, 0x04, 0x37, 0xc3]);
    let built = builder.build().expect("failed to build fixture");
    let mut path = std::env::temp_dir();
    path.push(format!("elf_image_bench_{}.so", std::process::id()));
    built.write_to(&path).expect("failed to write fixture");
    path.to_str().unwrap().to_string()
}

fn load_benchmark(c: &mut Criterion) {
    let path = fixture();
    c.bench_function("elf_image:open", |b| {
        b.iter(|| {
            let mut image: ElfImage = ElfImage::new();
            image.open(&path, 0x1000).unwrap();
            image.close().unwrap();
        });
    });
    // Every iteration leaves its mapping resident; that is the loading
    // contract.
    c.bench_function("elf_image:load", |b| {
        b.iter(|| {
            let mut image: ElfImage = ElfImage::new();
            image.open(&path, 0x1000).unwrap();
            image.load_program().unwrap();
            image.unload().unwrap();
            image.close().unwrap();
        });
    });
    c.bench_function("libloading:new", |b| {
        b.iter(|| {
            unsafe { Library::new(&path).unwrap() };
        })
    });
}

fn get_symbol_benchmark(c: &mut Criterion) {
    let path = fixture();
    let mut image: ElfImage = ElfImage::new();
    image.open(&path, 0x1000).unwrap();
    image.load_program().unwrap();
    let lib = unsafe { Library::new(&path).unwrap() };
    c.bench_function("elf_image:get", |b| {
        b.iter(|| unsafe { image.get::<fn(i32, i32) -> i32>("a").unwrap() })
    });
    c.bench_function("libloading:get", |b| {
        b.iter(|| {
            unsafe { lib.get::<fn(i32, i32) -> i32>("a".as_bytes()).unwrap() };
        })
    });
}

criterion_group!(benches, load_benchmark, get_symbol_benchmark);
criterion_main!(benches);
