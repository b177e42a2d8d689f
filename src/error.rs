use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `elf_image` library.
/// Every fallible operation reports exactly one of these classes. The message
/// carried inside is diagnostic text; callers should match on the variant,
/// not on the text.
#[derive(Debug)]
pub enum Error {
    /// An underlying system call failed for a reason that has no more
    /// precise class.
    ///
    /// This error typically indicates issues such as:
    /// * Opening or stating the file failed
    /// * Mapping the file for reading failed
    /// * Changing memory protection failed
    Unknown {
        /// A descriptive message about the failure.
        msg: Cow<'static, str>,
    },

    /// An operation was invoked in a state that does not permit it.
    ///
    /// Examples:
    /// * Loading the program before opening a file
    /// * Opening a second file while one is already open
    /// * Looking up a symbol before the image is loaded
    InvalidOperation {
        /// A descriptive message about the rejected call.
        msg: Cow<'static, str>,
    },

    /// A caller-supplied argument is unusable.
    ///
    /// Examples:
    /// * A page size of zero or one that is not a power of two
    /// * A null image base address
    InvalidArgument {
        /// A descriptive message about the argument.
        msg: Cow<'static, str>,
    },

    /// The file is structurally damaged and cannot be an ELF object.
    ///
    /// Examples:
    /// * Invalid magic bytes
    /// * Header tables reaching past the end of the file
    /// * A non-zero field in the null section header
    InvalidFormat {
        /// A descriptive message about the damage.
        msg: Cow<'static, str>,
    },

    /// A requested item does not exist in the image.
    ///
    /// Examples:
    /// * A symbol name absent from the hash table
    /// * An image without any hash table to search
    NotFound {
        /// A descriptive message about the missing item.
        msg: Cow<'static, str>,
    },

    /// Metadata was located but its layout cannot be interpreted.
    ///
    /// Examples:
    /// * A relocation entry size smaller than the entry itself
    /// * A `DT_PLTREL` value naming neither `DT_REL` nor `DT_RELA`
    UnknownFormat {
        /// A descriptive message about the metadata.
        msg: Cow<'static, str>,
    },

    /// A well-formed ELF object built for a different target.
    ///
    /// Examples:
    /// * 32-bit class or big-endian data encoding
    /// * A machine other than the one this crate is compiled for
    /// * An object type other than `ET_DYN`
    NotSupported {
        /// A descriptive message about the mismatch.
        msg: Cow<'static, str>,
    },

    /// Reserving address space for the image failed.
    OutOfMemory {
        /// A descriptive message about the reservation.
        msg: Cow<'static, str>,
    },

    /// A fixed-position mapping inside the reserved region failed.
    InvalidMemMap {
        /// A descriptive message about the mapping.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Unknown { msg } => write!(f, "Unknown error: {msg}"),
            Error::InvalidOperation { msg } => write!(f, "Invalid operation: {msg}"),
            Error::InvalidArgument { msg } => write!(f, "Invalid argument: {msg}"),
            Error::InvalidFormat { msg } => write!(f, "Invalid ELF format: {msg}"),
            Error::NotFound { msg } => write!(f, "Not found: {msg}"),
            Error::UnknownFormat { msg } => write!(f, "Unknown metadata format: {msg}"),
            Error::NotSupported { msg } => write!(f, "Not supported: {msg}"),
            Error::OutOfMemory { msg } => write!(f, "Out of memory: {msg}"),
            Error::InvalidMemMap { msg } => write!(f, "Invalid memory mapping: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

/// Creates an `Error::Unknown` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn unknown_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Unknown { msg: msg.into() }
}

/// Creates an `Error::InvalidOperation` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn invalid_operation(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidOperation { msg: msg.into() }
}

/// Creates an `Error::InvalidArgument` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn invalid_argument(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidArgument { msg: msg.into() }
}

/// Creates an `Error::InvalidFormat` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn invalid_format(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidFormat { msg: msg.into() }
}

/// Creates an `Error::NotFound` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn not_found(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::NotFound { msg: msg.into() }
}

/// Creates an `Error::UnknownFormat` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn unknown_format(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::UnknownFormat { msg: msg.into() }
}

/// Creates an `Error::NotSupported` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn not_supported(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::NotSupported { msg: msg.into() }
}

/// Creates an `Error::OutOfMemory` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn out_of_memory(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::OutOfMemory { msg: msg.into() }
}

/// Creates an `Error::InvalidMemMap` with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn invalid_mem_map(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidMemMap { msg: msg.into() }
}
