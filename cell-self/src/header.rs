use std::fmt;
use std::io::{ErrorKind, Read};

use snafu::{Snafu, ensure};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32, U64},
};

use crate::keys::SelfType;

/// Errors when reading the fixed SCE/SELF headers.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("data too small for {what}"))]
    TooSmall { what: &'static str },

    #[snafu(display("invalid SCE magic"))]
    InvalidMagic,

    #[snafu(display("i/o failed while reading {what}"))]
    IoFailed {
        what: &'static str,
        source: std::io::Error,
    },
}

type Result<T, E = ReadError> = std::result::Result<T, E>;

/// `"SCE\0"`.
pub const SCE_MAGIC: u32 = 0x53434500;

/// Size of [`SceHeader`] on disk.
pub const SCE_HEADER_SIZE: usize = size_of::<SceHeader>();

macro_rules! impl_read {
    ($ty:ty, $what:literal) => {
        impl $ty {
            /// Parses the structure from the start of `data`.
            pub fn read(data: &[u8]) -> Result<Self> {
                let (v, _) = Self::read_from_prefix(data)
                    .map_err(|_| ReadError::TooSmall { what: $what })?;
                Ok(v)
            }

            /// Reads the structure from the current position of `reader`.
            pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
                crate::io::read_struct(reader).map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        ReadError::TooSmall { what: $what }
                    } else {
                        ReadError::IoFailed {
                            what: $what,
                            source: e,
                        }
                    }
                })
            }
        }
    };
}

bitflags::bitflags! {
    /// Key revision field of the SCE header.
    ///
    /// The low bits select the key revision, the top bit marks a debug SELF.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SceFlags: u16 {
        const DEBUG = 0x8000;
        const _ = !0;
    }
}

impl fmt::Display for SceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.bits())?;

        if self.contains(Self::DEBUG) {
            f.write_str(" (debug)")?;
        }

        Ok(())
    }
}

/// SCE header (32 bytes), always at offset 0.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SceHeader {
    magic: U32,       // 0x00
    version: U32,     // 0x04
    flags: U16,       // 0x08 - key revision
    category: U16,    // 0x0A
    meta_offset: U32, // 0x0C - relative to the end of this header
    header_len: U64,  // 0x10
    data_len: U64,    // 0x18
}

impl_read!(SceHeader, "SCE header");

impl SceHeader {
    /// Returns `true` if the magic identifies a SCE container.
    #[must_use]
    pub fn check_magic(&self) -> bool {
        self.magic.get() == SCE_MAGIC
    }

    /// Same as [`read_from()`](Self::read_from) but also rejects a wrong magic.
    pub fn read_checked<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let hdr = Self::read_from(reader)?;
        ensure!(hdr.check_magic(), InvalidMagicSnafu);
        Ok(hdr)
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version.get()
    }

    #[must_use]
    pub const fn flags(&self) -> SceFlags {
        SceFlags::from_bits_retain(self.flags.get())
    }

    /// Returns the raw key revision used to select a keyset.
    #[must_use]
    pub const fn key_revision(&self) -> u16 {
        self.flags.get()
    }

    #[must_use]
    pub const fn category(&self) -> u16 {
        self.category.get()
    }

    /// Offset of the metadata info, relative to the end of the SCE header.
    #[must_use]
    pub const fn meta_offset(&self) -> u32 {
        self.meta_offset.get()
    }

    /// Total length of all headers, including metadata.
    #[must_use]
    pub const fn header_len(&self) -> u64 {
        self.header_len.get()
    }

    #[must_use]
    pub const fn data_len(&self) -> u64 {
        self.data_len.get()
    }
}

impl fmt::Debug for SceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceHeader")
            .field("magic", &format_args!("0x{:08X}", self.magic.get()))
            .field("version", &self.version())
            .field("flags", &self.flags())
            .field("category", &self.category())
            .field("meta_offset", &format_args!("0x{:X}", self.meta_offset()))
            .field("header_len", &format_args!("0x{:X}", self.header_len()))
            .field("data_len", &format_args!("0x{:X}", self.data_len()))
            .finish()
    }
}

/// SELF header (80 bytes), directly after [`SceHeader`].
///
/// Every offset is relative to the start of the file.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SelfHeader {
    header_type: U64,     // 0x00
    app_info_offset: U64, // 0x08
    elf_offset: U64,      // 0x10
    phdr_offset: U64,     // 0x18
    shdr_offset: U64,     // 0x20
    secinfo_offset: U64,  // 0x28
    version_offset: U64,  // 0x30
    control_offset: U64,  // 0x38
    control_size: U64,    // 0x40
    padding: U64,         // 0x48
}

impl_read!(SelfHeader, "SELF header");

impl SelfHeader {
    #[must_use]
    pub const fn header_type(&self) -> u64 {
        self.header_type.get()
    }

    #[must_use]
    pub const fn app_info_offset(&self) -> u64 {
        self.app_info_offset.get()
    }

    #[must_use]
    pub const fn elf_offset(&self) -> u64 {
        self.elf_offset.get()
    }

    #[must_use]
    pub const fn phdr_offset(&self) -> u64 {
        self.phdr_offset.get()
    }

    /// Offset of the ELF section headers, zero if the SELF carries none.
    #[must_use]
    pub const fn shdr_offset(&self) -> u64 {
        self.shdr_offset.get()
    }

    #[must_use]
    pub const fn section_info_offset(&self) -> u64 {
        self.secinfo_offset.get()
    }

    #[must_use]
    pub const fn version_info_offset(&self) -> u64 {
        self.version_offset.get()
    }

    #[must_use]
    pub const fn control_offset(&self) -> u64 {
        self.control_offset.get()
    }

    /// Total size of all control info records.
    #[must_use]
    pub const fn control_size(&self) -> u64 {
        self.control_size.get()
    }
}

/// Application info (32 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AppInfo {
    auth_id: U64,
    vendor_id: U32,
    self_type: U32,
    version: U64,
    padding: U64,
}

impl_read!(AppInfo, "application info");

impl AppInfo {
    #[must_use]
    pub const fn auth_id(&self) -> u64 {
        self.auth_id.get()
    }

    #[must_use]
    pub const fn vendor_id(&self) -> u32 {
        self.vendor_id.get()
    }

    #[must_use]
    pub const fn self_type(&self) -> SelfType {
        SelfType::from_u32(self.self_type.get())
    }

    /// Firmware version the SELF was built for.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version.get()
    }
}

impl fmt::Debug for AppInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppInfo")
            .field("auth_id", &format_args!("0x{:016X}", self.auth_id()))
            .field("vendor_id", &format_args!("0x{:08X}", self.vendor_id()))
            .field("self_type", &self.self_type())
            .field("version", &format_args!("0x{:016X}", self.version()))
            .finish_non_exhaustive()
    }
}

/// Per-segment section info (32 bytes), one for each program header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SectionInfo {
    offset: U64,
    size: U64,
    compressed: U32,
    unknown1: U32,
    unknown2: U32,
    encrypted: U32,
}

impl_read!(SectionInfo, "section info");

impl SectionInfo {
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset.get()
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size.get()
    }

    #[must_use]
    pub const fn compressed(&self) -> u32 {
        self.compressed.get()
    }

    #[must_use]
    pub const fn encrypted(&self) -> u32 {
        self.encrypted.get()
    }
}

/// SCE version info (16 bytes).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct VersionInfo {
    subheader_type: U32,
    present: U32,
    size: U32,
    unknown: U32,
}

impl_read!(VersionInfo, "version info");

impl VersionInfo {
    #[must_use]
    pub const fn subheader_type(&self) -> u32 {
        self.subheader_type.get()
    }

    #[must_use]
    pub const fn present(&self) -> u32 {
        self.present.get()
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size.get()
    }
}
