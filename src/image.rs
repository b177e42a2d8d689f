//! The loader facade: a state machine that takes an ELF shared object
//! from a file, or from a region somebody else already mapped, to a
//! callable image.

use crate::{
    Result,
    arch::Dyn,
    dynamic::{ElfDynamic, ElfRawDynamic},
    ehdr::ElfHeader,
    invalid_argument, invalid_format, invalid_operation,
    mmap::{Mmap, MmapImpl},
    not_found,
    object::{ElfFile, FileMap},
    phdrs::ElfPhdrs,
    relocation,
    segment::{self, ElfRelro, ElfSegments},
    shdrs::ElfShdrs,
    symbol::SymbolTable,
};
use alloc::format;
use core::{
    ffi::{c_int, c_void},
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
};
use elf::abi::{PT_DYNAMIC, PT_GNU_RELRO};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageState {
    Closed,
    Opened,
    Loaded,
}

/// An ELF shared object going through its loading lifecycle.
///
/// The lifecycle is a straight line: `Closed` until one of [`open`],
/// [`open_with_fd`] or [`read_loaded_image`] succeeds, `Opened` once the
/// file is mapped and validated, `Loaded` once the segments are resident
/// and relocated ([`read_loaded_image`] goes to `Loaded` directly).
/// [`unload`] steps back to `Opened`, [`close`] back to `Closed`. Calling
/// an operation from any other state reports
/// [`InvalidOperation`](crate::Error::InvalidOperation) and changes
/// nothing.
///
/// The image mapping built by [`load_program`] is never unmapped: once an
/// object is loaded, its code and data stay resident for the rest of the
/// process, so function pointers handed out through [`get`] remain valid
/// even after [`unload`].
///
/// [`open`]: ElfImage::open
/// [`open_with_fd`]: ElfImage::open_with_fd
/// [`read_loaded_image`]: ElfImage::read_loaded_image
/// [`load_program`]: ElfImage::load_program
/// [`unload`]: ElfImage::unload
/// [`close`]: ElfImage::close
/// [`get`]: ElfImage::get
///
/// # Examples
/// ```no_run
/// use elf_image::ElfImage;
///
/// let mut image: ElfImage = ElfImage::new();
/// image.open("target/liba.so", 0x1000).unwrap();
/// image.load_program().unwrap();
/// let addr = image.symbol_addr("awesome_function").unwrap();
/// ```
pub struct ElfImage<M = MmapImpl>
where
    M: Mmap,
{
    state: ImageState,
    page_size: usize,
    /// `Some` whenever the image was opened from a file.
    file: Option<ElfFile>,
    file_map: Option<FileMap>,
    /// A copy of the file header, kept so the header tables can be
    /// re-sliced without trusting stale pointers.
    ehdr: Option<ElfHeader>,
    segments: Option<ElfSegments>,
    dynamic: Option<ElfDynamic>,
    symtab: Option<SymbolTable>,
    _marker: PhantomData<M>,
}

impl<M: Mmap> Default for ElfImage<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmap> ElfImage<M> {
    /// Creates an image in the `Closed` state.
    pub const fn new() -> Self {
        ElfImage {
            state: ImageState::Closed,
            page_size: 0,
            file: None,
            file_map: None,
            ehdr: None,
            segments: None,
            dynamic: None,
            symtab: None,
            _marker: PhantomData,
        }
    }

    fn check_state(&self, expected: ImageState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(invalid_operation(format!(
                "{op} is not valid in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Opens the file at `path`, maps it read-only and validates it as a
    /// loadable shared object. `Closed` to `Opened`.
    ///
    /// `page_size` is used for every alignment decision of the later
    /// load; it must be the page size of the running system.
    pub fn open(&mut self, path: &str, page_size: usize) -> Result<()> {
        self.check_state(ImageState::Closed, "open")?;
        check_page_size(page_size)?;
        let file = ElfFile::from_path(path)?;
        self.open_common(file, page_size)
    }

    /// Like [`open`](ElfImage::open), starting from an already open
    /// descriptor. `Closed` to `Opened`.
    ///
    /// # Safety
    /// `fd` must be an owned, open file descriptor; the image takes over
    /// closing it.
    pub unsafe fn open_with_fd(&mut self, fd: c_int, page_size: usize) -> Result<()> {
        self.check_state(ImageState::Closed, "open_with_fd")?;
        check_page_size(page_size)?;
        let file = unsafe { ElfFile::from_owned_fd(fd)? };
        self.open_common(file, page_size)
    }

    fn open_common(&mut self, file: ElfFile, page_size: usize) -> Result<()> {
        let file_map = FileMap::new::<M>(&file)?;
        let data = file_map.as_slice();
        let ehdr = ElfHeader::new(data)?;
        ehdr.validate()?;
        if let Some(phdrs) = ElfPhdrs::new(ehdr, data)? {
            phdrs.validate()?;
        }
        ElfShdrs::new(ehdr, data)?;
        let ehdr = ehdr.clone();
        #[cfg(feature = "log")]
        log::trace!("[Open] mapped {} file bytes read-only", file.size);
        self.file = Some(file);
        self.file_map = Some(file_map);
        self.ehdr = Some(ehdr);
        self.page_size = page_size;
        self.state = ImageState::Opened;
        Ok(())
    }

    /// Adopts an image that is already resident, e.g. mapped by the
    /// platform loader or by an earlier boot stage. `Closed` straight to
    /// `Loaded`.
    ///
    /// `base` points at the ELF header of the resident image. No new
    /// mapping is created; the dynamic section is read, relocations are
    /// applied in place and RELRO ranges are sealed.
    ///
    /// # Safety
    /// `base` must point to a complete, resident `ET_DYN` image whose
    /// program headers and `PT_DYNAMIC` segment are readable, and whose
    /// writable segments really are writable, since relocation stores
    /// through them.
    pub unsafe fn read_loaded_image(&mut self, base: *mut c_void, page_size: usize) -> Result<()> {
        self.check_state(ImageState::Closed, "read_loaded_image")?;
        check_page_size(page_size)?;
        let Some(memory) = NonNull::new(base) else {
            return Err(invalid_argument("image base address is null"));
        };
        let ehdr = unsafe { ElfHeader::from_ptr(base as *const u8) };
        ehdr.validate()?;
        if ehdr.e_phoff() == 0 || ehdr.e_phnum() == 0 {
            return Err(invalid_format("object has no program header table"));
        }
        let phdrs = unsafe {
            ElfPhdrs::from_ptr(
                (base as usize + ehdr.e_phoff()) as *const u8,
                ehdr.e_phentsize(),
                ehdr.e_phnum(),
            )
        };
        phdrs.validate()?;
        let (vaddr_offset, len) = segment::image_span(&phdrs, page_size)?;
        let segments = ElfSegments::from_raw(memory, vaddr_offset, len, page_size);
        let image_base = segments.base();
        #[cfg(feature = "log")]
        log::trace!(
            "[Read] resident image at 0x{:x}, length: {}",
            base as usize,
            len
        );
        let dynamic = Self::read_dynamics(&phdrs, image_base)?;
        let symtab = SymbolTable::from_dynamic(&dynamic)?;
        relocation::relocate_dynamic(&dynamic, image_base, &symtab)?;
        Self::fix_relro(&phdrs, image_base, page_size)?;
        self.ehdr = Some(ehdr.clone());
        self.segments = Some(segments);
        self.dynamic = Some(dynamic);
        self.symtab = Some(symtab);
        self.page_size = page_size;
        self.state = ImageState::Loaded;
        Ok(())
    }

    /// Maps the loadable segments, reads the dynamic section, applies
    /// relocations and seals RELRO ranges. `Opened` to `Loaded`.
    ///
    /// A failure here may leave partial mappings behind; the image must
    /// then be abandoned, not retried.
    pub fn load_program(&mut self) -> Result<()> {
        self.check_state(ImageState::Opened, "load_program")?;
        let (Some(file), Some(file_map), Some(ehdr)) = (&self.file, &self.file_map, &self.ehdr)
        else {
            return Err(invalid_operation(
                "load_program requires an image opened from a file",
            ));
        };
        let data = file_map.as_slice();
        let phdrs = ElfPhdrs::new(ehdr, data)?
            .ok_or_else(|| invalid_format("object has no program header table"))?;
        let segments = segment::load_segments::<M>(&phdrs, file.fd, self.page_size)?;
        let base = segments.base();
        let dynamic = Self::read_dynamics(&phdrs, base)?;
        let symtab = SymbolTable::from_dynamic(&dynamic)?;
        if let Some(shdrs) = ElfShdrs::new(ehdr, data)? {
            relocation::relocate_sections(&shdrs, data, base, &symtab)?;
        }
        Self::fix_relro(&phdrs, base, self.page_size)?;
        #[cfg(feature = "log")]
        log::trace!("[Load] image at 0x{:x}, length: {}", base, segments.len());
        self.segments = Some(segments);
        self.dynamic = Some(dynamic);
        self.symtab = Some(symtab);
        self.state = ImageState::Loaded;
        Ok(())
    }

    fn read_dynamics(phdrs: &ElfPhdrs, base: usize) -> Result<ElfDynamic> {
        let dyn_phdr = phdrs
            .find(PT_DYNAMIC)
            .ok_or_else(|| invalid_format("object has no PT_DYNAMIC segment"))?;
        let dynamic_ptr = (base + dyn_phdr.p_vaddr as usize) as *const Dyn;
        ElfRawDynamic::new(dynamic_ptr)?.finish(base)
    }

    fn fix_relro(phdrs: &ElfPhdrs, base: usize, page_size: usize) -> Result<()> {
        for phdr in phdrs.iter() {
            if phdr.p_type == PT_GNU_RELRO {
                ElfRelro::new(phdr, base, page_size).apply::<M>()?;
            }
        }
        Ok(())
    }

    /// Resolves `name` through the image's hash table. `Loaded` only.
    ///
    /// An image without a hash table, or a name it does not export,
    /// reports [`NotFound`](crate::Error::NotFound).
    pub fn symbol_addr(&self, name: &str) -> Result<*const ()> {
        self.check_state(ImageState::Loaded, "symbol_addr")?;
        let symtab = self.symtab.as_ref().unwrap();
        let segments = self.segments.as_ref().unwrap();
        let sym = symtab
            .lookup(name)
            .ok_or_else(|| not_found(format!("symbol '{name}' is not defined")))?;
        let addr = segments.base() + sym.st_value();
        #[cfg(feature = "log")]
        log::trace!("[Symbol] resolved '{}' to 0x{:x}", name, addr);
        Ok(addr as *const ())
    }

    /// Gets a pointer to a function or static variable by symbol name.
    ///
    /// The name is used as-is; no mangling is applied, so symbols like
    /// `x::y` are most likely invalid.
    ///
    /// # Safety
    /// The caller must name the correct type for the symbol.
    ///
    /// # Examples
    /// ```no_run
    /// # use elf_image::ElfImage;
    /// # let mut image: ElfImage = ElfImage::new();
    /// # image.open("target/liba.so", 0x1000).unwrap();
    /// # image.load_program().unwrap();
    /// let awesome_function =
    ///     unsafe { image.get::<extern "C" fn(f64) -> f64>("awesome_function").unwrap() };
    /// awesome_function(0.42);
    /// ```
    pub unsafe fn get<'lib, T>(&'lib self, name: &str) -> Result<Symbol<'lib, T>> {
        let ptr = self.symbol_addr(name)?;
        Ok(Symbol {
            ptr: ptr as *mut (),
            pd: PhantomData,
        })
    }

    /// Drops the derived dynamic and symbol state. `Loaded` to `Opened`.
    ///
    /// No memory is released; the image mapping stays resident.
    pub fn unload(&mut self) -> Result<()> {
        self.check_state(ImageState::Loaded, "unload")?;
        self.symtab = None;
        self.dynamic = None;
        self.segments = None;
        self.state = ImageState::Opened;
        Ok(())
    }

    /// Unmaps the file view and closes the descriptor. `Opened` to
    /// `Closed`, after which the image can be reused for another object.
    pub fn close(&mut self) -> Result<()> {
        self.check_state(ImageState::Opened, "close")?;
        self.file_map = None;
        self.file = None;
        self.ehdr = None;
        self.page_size = 0;
        self.state = ImageState::Closed;
        Ok(())
    }

    /// The process address that the file's virtual address zero maps to.
    pub fn base(&self) -> Option<usize> {
        self.segments.as_ref().map(|segments| segments.base())
    }

    /// The page-rounded span of the loaded image.
    pub fn image_size(&self) -> Option<usize> {
        self.segments.as_ref().map(|segments| segments.len())
    }

    /// The object's `DT_SONAME`, when it declares one.
    pub fn soname(&self) -> Option<&'static str> {
        self.dynamic.as_ref()?.soname
    }

    /// Names of the libraries the object declares via `DT_NEEDED`.
    /// Recorded only; this crate does not load dependencies.
    pub fn needed_libs(&self) -> Option<&[&'static str]> {
        self.dynamic
            .as_ref()
            .map(|dynamic| dynamic.needed_libs.as_slice())
    }

    /// The object's `DT_RPATH`, when present.
    pub fn rpath(&self) -> Option<&'static str> {
        self.dynamic.as_ref()?.rpath
    }

    /// The object's `DT_RUNPATH`, when present.
    pub fn runpath(&self) -> Option<&'static str> {
        self.dynamic.as_ref()?.runpath
    }

    /// The raw `DT_FLAGS` value.
    pub fn dt_flags(&self) -> Option<usize> {
        self.dynamic.as_ref().map(|dynamic| dynamic.flags)
    }

    /// The `DT_INIT` constructor. The facade never calls it; running
    /// constructors is the embedding runtime's decision.
    pub fn init_fn(&self) -> Option<extern "C" fn()> {
        self.dynamic.as_ref()?.init_fn
    }

    /// The `DT_INIT_ARRAY` constructors, in call order.
    pub fn init_array(&self) -> Option<&'static [extern "C" fn()]> {
        self.dynamic.as_ref()?.init_array_fn
    }

    /// The `DT_FINI` destructor.
    pub fn fini_fn(&self) -> Option<extern "C" fn()> {
        self.dynamic.as_ref()?.fini_fn
    }

    /// The `DT_FINI_ARRAY` destructors, in call order.
    pub fn fini_array(&self) -> Option<&'static [extern "C" fn()]> {
        self.dynamic.as_ref()?.fini_array_fn
    }
}

fn check_page_size(page_size: usize) -> Result<()> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(invalid_argument("page size must be a nonzero power of two"));
    }
    Ok(())
}

/// A symbol handle tied to the image it came from.
#[derive(Debug, Clone)]
pub struct Symbol<'lib, T: 'lib> {
    ptr: *mut (),
    pd: PhantomData<&'lib T>,
}

impl<'lib, T> Deref for Symbol<'lib, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*(&self.ptr as *const *mut _ as *const T) }
    }
}

impl<'lib, T> Symbol<'lib, T> {
    pub fn into_raw(self) -> *const () {
        self.ptr
    }
}
