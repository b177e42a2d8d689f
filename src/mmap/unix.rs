use super::{MapFlags, Mmap, ProtFlags};
use crate::{Result, unknown_error};
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};

/// An implementation of the [`Mmap`] trait that goes through libc.
pub struct MmapImpl;

impl Mmap for MmapImpl {
    unsafe fn mmap(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: c_int,
        offset: usize,
    ) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            libc::mmap(
                addr.unwrap_or(0) as _,
                len,
                prot.bits(),
                flags.bits(),
                fd,
                offset as _,
            )
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(unknown_error("mmap failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            libc::mmap(
                addr as _,
                len,
                prot.bits(),
                flags.union(MapFlags::MAP_ANONYMOUS).bits(),
                -1,
                0,
            )
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(unknown_error("mmap anonymous failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        let res = unsafe { libc::munmap(addr.as_ptr(), len) };
        if res != 0 {
            return Err(unknown_error("munmap failed"));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { libc::mprotect(addr.as_ptr(), len, prot.bits()) };
        if res != 0 {
            return Err(unknown_error("mprotect failed"));
        }
        Ok(())
    }
}
