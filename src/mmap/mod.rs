//! Memory mapping operations used while building the image.
//!
//! The loader touches the address space in exactly four ways: mapping a
//! file for reading, reserving a region, placing fixed mappings inside
//! that region and changing protection afterwards. The [`Mmap`] trait
//! captures those four operations so that the platform backend can be
//! swapped out, e.g. for a kernel environment that services page tables
//! directly.
//!
//! # Safety
//! Memory mapping manipulates the process's address space. Incorrect
//! usage can cause crashes, data corruption, or security issues.

use crate::Result;
use bitflags::bitflags;
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "use-syscall")] {
        mod linux_syscall;
        pub use linux_syscall::MmapImpl;
    } else if #[cfg(unix)] {
        mod unix;
        pub use unix::MmapImpl;
    } else {
        compile_error!("no mmap backend for this target, enable the use-syscall feature");
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default)]
    /// Memory protection flags for controlling access permissions.
    pub struct ProtFlags: c_int {
        /// No access allowed. Useful for reserving address space.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    /// Memory mapping configuration flags.
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;

        /// Place the mapping at exactly the specified address. The kernel
        /// replaces whatever was mapped there before.
        const MAP_FIXED = 16;

        /// Create an anonymous mapping not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

/// A trait for the low-level memory mapping operations of the loader.
///
/// # Safety
/// All methods manipulate the process's virtual address space. Improper
/// use can cause memory corruption, crashes, or security vulnerabilities.
pub trait Mmap {
    /// Maps part of a file into memory.
    ///
    /// # Arguments
    /// * `addr` - Exact starting address (page-aligned), `None` lets the system choose.
    /// * `len` - Size of the mapping in bytes (rounded up to page size).
    /// * `prot` - Memory protection flags.
    /// * `flags` - Mapping configuration.
    /// * `fd` - File descriptor of the mapped file.
    /// * `offset` - File offset the mapping starts at (page-aligned).
    ///
    /// # Safety
    /// `addr` must be page-aligned if specified and `fd` must be a valid,
    /// readable descriptor.
    unsafe fn mmap(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: c_int,
        offset: usize,
    ) -> Result<NonNull<c_void>>;

    /// Creates an anonymous zero-filled memory mapping.
    ///
    /// # Safety
    /// `addr` must be page-aligned if non-zero, and with `MAP_FIXED` it
    /// replaces any existing mapping in the range.
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>>;

    /// Unmaps a memory region.
    ///
    /// # Safety
    /// `addr` and `len` must match an existing mapping, and the region
    /// must not be accessed after unmapping.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Changes the protection of a memory region.
    ///
    /// # Safety
    /// `addr` must be page-aligned. Removing permissions from a region
    /// that running code depends on will fault.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;

    /// Reserves a region of address space without committing memory.
    ///
    /// The default implementation maps the region anonymous and
    /// `PROT_NONE`; the segments are later placed over it with fixed
    /// mappings.
    ///
    /// # Safety
    /// The reserved region must not be accessed until properly mapped.
    unsafe fn mmap_reserve(len: usize) -> Result<NonNull<c_void>> {
        unsafe { Self::mmap_anonymous(0, len, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE) }
    }
}
