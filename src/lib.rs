//! # elf_image
//! A self-contained loader for ELF shared objects: it validates `ET_DYN`
//! binaries, maps their loadable segments with the right permissions,
//! resolves symbol names through the SysV or GNU hash table and applies
//! relocations, all without touching the platform dynamic linker.
//! ## Usage
//! [`ElfImage`] walks one object through open, load, symbol lookup and
//! close. Memory mapping goes through the [`mmap::Mmap`] trait, so hosted
//! processes and libc-free environments can share the same loader; see
//! the `demos/` directory for both a file-backed load and the adoption of
//! an already resident image.
#![no_std]
extern crate alloc;

#[cfg(not(all(target_arch = "x86_64", target_endian = "little")))]
compile_error!("unsupport arch");

pub mod arch;
mod dynamic;
mod ehdr;
mod error;
mod hash;
mod image;
pub mod mmap;
mod object;
mod phdrs;
mod relocation;
mod segment;
mod shdrs;
mod symbol;

pub use elf::abi;
pub use error::Error;
pub use image::{ElfImage, Symbol};

pub(crate) use error::{
    invalid_argument, invalid_format, invalid_mem_map, invalid_operation, not_found,
    not_supported, out_of_memory, unknown_error, unknown_format,
};

pub type Result<T> = core::result::Result<T, Error>;
