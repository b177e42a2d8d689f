#![allow(dead_code)]

use std::path::PathBuf;

use gen_dylib::BuiltDylib;

/// Page size of every x86-64 Linux target these tests run on.
pub const PAGE_SIZE: usize = 0x1000;

/// mov eax, 42; ret
pub const RET42: &[u8] = &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
/// lea eax, [rdi + rsi]; ret
pub const ADD2: &[u8] = &[0x8d, 0x04, 0x37, 0xc3];
/// ret
pub const RET: &[u8] = &[0xc3];

pub fn fixture_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("elf_image_{}_{}.so", name, std::process::id()));
    path
}

/// Write a generated object under a unique name and return its path.
pub fn write_fixture(name: &str, built: &BuiltDylib) -> String {
    let path = fixture_path(name);
    built.write_to(&path).expect("failed to write fixture");
    path.to_str().expect("fixture path is not utf-8").to_string()
}

/// Write raw (usually mutated) object bytes and return the path.
pub fn write_bytes(name: &str, bytes: &[u8]) -> String {
    let path = fixture_path(name);
    std::fs::write(&path, bytes).expect("failed to write fixture");
    path.to_str().expect("fixture path is not utf-8").to_string()
}

pub fn patch_u8(bytes: &mut [u8], off: u64, val: u8) {
    bytes[off as usize] = val;
}

pub fn patch_u16(bytes: &mut [u8], off: u64, val: u16) {
    bytes[off as usize..off as usize + 2].copy_from_slice(&val.to_le_bytes());
}

pub fn patch_u32(bytes: &mut [u8], off: u64, val: u32) {
    bytes[off as usize..off as usize + 4].copy_from_slice(&val.to_le_bytes());
}

pub fn patch_u64(bytes: &mut [u8], off: u64, val: u64) {
    bytes[off as usize..off as usize + 8].copy_from_slice(&val.to_le_bytes());
}

/// Read the word a relocation wrote into the loaded image.
pub fn read_slot(base: usize, slot_vaddr: u64) -> u64 {
    unsafe { *((base + slot_vaddr as usize) as *const u64) }
}
