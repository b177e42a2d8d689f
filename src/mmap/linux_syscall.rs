use super::{MapFlags, Mmap, ProtFlags};
use crate::{Error, Result, unknown_error};
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};
use syscalls::Sysno;

/// An implementation of the [`Mmap`] trait that issues raw linux
/// syscalls, for environments without a libc.
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
            from_ret(
                syscalls::raw_syscall!(
                    Sysno::mmap,
                    addr.unwrap_or(0),
                    len,
                    prot.bits(),
                    flags.bits(),
                    fd,
                    offset
                ),
                "mmap failed",
            )?
        };
        Ok(unsafe { NonNull::new_unchecked(ptr as *mut c_void) })
    }

    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            from_ret(
                syscalls::raw_syscall!(
                    Sysno::mmap,
                    addr,
                    len,
                    prot.bits(),
                    flags.union(MapFlags::MAP_ANONYMOUS).bits(),
                    usize::MAX,
                    0
                ),
                "mmap anonymous failed",
            )?
        };
        Ok(unsafe { NonNull::new_unchecked(ptr as *mut c_void) })
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        unsafe {
            from_ret(
                syscalls::raw_syscall!(Sysno::munmap, addr.as_ptr(), len),
                "munmap failed",
            )?;
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        unsafe {
            from_ret(
                syscalls::raw_syscall!(Sysno::mprotect, addr.as_ptr(), len, prot.bits()),
                "mprotect failed",
            )?;
        }
        Ok(())
    }
}

/// Converts a raw syscall return value to a result.
#[inline(always)]
fn from_ret(value: usize, msg: &'static str) -> core::result::Result<usize, Error> {
    if value > -4096isize as usize {
        // Truncation of the error value is guaranteed to never occur due to
        // the above check. This is the same check that musl uses:
        // https://git.musl-libc.org/cgit/musl/tree/src/internal/syscall_ret.c?h=v1.1.15
        return Err(unknown_error(msg));
    }
    Ok(value)
}
