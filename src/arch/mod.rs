//! The architecture this crate can load images for.
//!
//! Only little-endian x86-64 is implemented. The dispatch is kept so
//! that further architectures slot in beside it.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    }
}

pub const REL_NONE: u32 = 0;
