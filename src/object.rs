//! Owned file descriptors and the read-only view of the file bytes.

use crate::{
    Result,
    mmap::{MapFlags, Mmap, ProtFlags},
    unknown_error,
};
use alloc::ffi::CString;
use core::{
    ffi::{c_int, c_void},
    mem::MaybeUninit,
    ptr::NonNull,
};
use libc::O_RDONLY;

/// An ELF object on disk: an owned descriptor plus the size reported by
/// the kernel. Dropping it closes the descriptor.
pub(crate) struct ElfFile {
    pub(crate) fd: c_int,
    pub(crate) size: usize,
}

impl ElfFile {
    pub(crate) fn from_path(path: &str) -> Result<Self> {
        let name = CString::new(path)
            .map_err(|_| unknown_error("path contains an interior nul byte"))?;
        let fd = unsafe { libc::open(name.as_ptr(), O_RDONLY) };
        if fd == -1 {
            return Err(unknown_error("open failed"));
        }
        // Wrapped before the fstat so the descriptor closes if it fails.
        let mut file = ElfFile { fd, size: 0 };
        file.size = stat_size(fd)?;
        Ok(file)
    }

    /// # Safety
    ///
    /// `fd` must be an owned, open file descriptor; the returned value
    /// takes over closing it.
    pub(crate) unsafe fn from_owned_fd(fd: c_int) -> Result<Self> {
        let mut file = ElfFile { fd, size: 0 };
        file.size = stat_size(fd)?;
        Ok(file)
    }
}

impl Drop for ElfFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn stat_size(fd: c_int) -> Result<usize> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(unknown_error("fstat failed"));
    }
    Ok(unsafe { stat.assume_init() }.st_size as usize)
}

/// A read-only private mapping of the whole file. The header tables are
/// read through this view; `PT_LOAD` contents are mapped separately by
/// the segment loader.
pub(crate) struct FileMap {
    memory: NonNull<c_void>,
    len: usize,
    munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
}

impl FileMap {
    pub(crate) fn new<M: Mmap>(file: &ElfFile) -> Result<Self> {
        let memory = unsafe {
            M::mmap(
                None,
                file.size,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file.fd,
                0,
            )?
        };
        Ok(FileMap {
            memory,
            len: file.size,
            munmap: M::munmap,
        })
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.memory.as_ptr().cast(), self.len) }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        unsafe {
            (self.munmap)(self.memory, self.len).unwrap();
        }
    }
}
