use std::fmt;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, warn};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U32, U64},
};

use crate::container::SelfContainer;
use crate::crypto::{aes128_ctr_apply, aes256_cbc_decrypt};
use crate::header::{SCE_HEADER_SIZE, SceFlags};
use crate::keys::{self, KeyVault};
use crate::npdrm::{self, LicenseStore, METADATA_INFO_SIZE, unwrap_npdrm};

use decrypt_error::*;

macro_rules! impl_read {
    ($ty:ty) => {
        impl $ty {
            /// Parses the structure from the start of `data`.
            pub fn read(data: &[u8]) -> Result<Self, DecryptError> {
                let (v, _) = Self::read_from_prefix(data).map_err(|_| DecryptError::Truncated)?;
                Ok(v)
            }

            /// Reads the structure from the current position of `reader`.
            pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, DecryptError> {
                crate::io::read_struct(reader).map_err(map_io)
            }
        }
    };
}

/// Metadata info (64 bytes): the key and IV protecting the metadata headers.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MetadataInfo {
    key: [u8; 16],
    key_pad: [u8; 16],
    iv: [u8; 16],
    iv_pad: [u8; 16],
}

impl_read!(MetadataInfo);

impl MetadataInfo {
    #[must_use]
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    #[must_use]
    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    /// Returns `true` if both pads are zero, which only happens when the
    /// block was decrypted with the right keys.
    #[must_use]
    pub fn has_valid_padding(&self) -> bool {
        self.key_pad.iter().chain(&self.iv_pad).all(|&b| b == 0)
    }
}

impl fmt::Debug for MetadataInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataInfo").finish_non_exhaustive()
    }
}

/// Metadata header (32 bytes).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MetadataHeader {
    signature_input_length: U64,
    unknown1: U32,
    section_count: U32,
    key_count: U32,
    opt_header_size: U32,
    unknown2: U32,
    unknown3: U32,
}

impl_read!(MetadataHeader);

impl MetadataHeader {
    #[must_use]
    pub const fn signature_input_length(&self) -> u64 {
        self.signature_input_length.get()
    }

    #[must_use]
    pub const fn section_count(&self) -> u32 {
        self.section_count.get()
    }

    /// Number of 16-byte entries in the key pool.
    #[must_use]
    pub const fn key_count(&self) -> u32 {
        self.key_count.get()
    }

    #[must_use]
    pub const fn opt_header_size(&self) -> u32 {
        self.opt_header_size.get()
    }
}

/// What a metadata section holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    SectionHeaders,
    ProgramSegment,
    SceVersion,
    Unknown(u32),
}

impl SectionKind {
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::SectionHeaders,
            2 => Self::ProgramSegment,
            3 => Self::SceVersion,
            v => Self::Unknown(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encryption {
    Plain,
    AesCtr,
    Unknown(u32),
}

impl Encryption {
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::Plain,
            3 => Self::AesCtr,
            v => Self::Unknown(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Plain,
    Zlib,
    Unknown(u32),
}

impl Compression {
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::Plain,
            2 => Self::Zlib,
            v => Self::Unknown(v),
        }
    }
}

/// Metadata section header (48 bytes), one for each protected region.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MetadataSectionHeader {
    data_offset: U64, // 0x00
    data_size: U64,   // 0x08
    kind: U32,        // 0x10
    program_idx: U32, // 0x14
    hashed: U32,      // 0x18
    sha1_idx: U32,    // 0x1C
    encrypted: U32,   // 0x20
    key_idx: U32,     // 0x24
    iv_idx: U32,      // 0x28
    compressed: U32,  // 0x2C
}

impl_read!(MetadataSectionHeader);

impl MetadataSectionHeader {
    /// Offset of the section data from the start of the file.
    #[must_use]
    pub const fn data_offset(&self) -> u64 {
        self.data_offset.get()
    }

    #[must_use]
    pub const fn data_size(&self) -> u64 {
        self.data_size.get()
    }

    #[must_use]
    pub const fn kind(&self) -> SectionKind {
        SectionKind::from_u32(self.kind.get())
    }

    /// Index of the program header this section belongs to.
    #[must_use]
    pub const fn program_idx(&self) -> u32 {
        self.program_idx.get()
    }

    #[must_use]
    pub const fn hashed(&self) -> u32 {
        self.hashed.get()
    }

    #[must_use]
    pub const fn sha1_idx(&self) -> u32 {
        self.sha1_idx.get()
    }

    #[must_use]
    pub const fn encryption(&self) -> Encryption {
        Encryption::from_u32(self.encrypted.get())
    }

    #[must_use]
    pub const fn key_idx(&self) -> u32 {
        self.key_idx.get()
    }

    #[must_use]
    pub const fn iv_idx(&self) -> u32 {
        self.iv_idx.get()
    }

    #[must_use]
    pub const fn compression(&self) -> Compression {
        Compression::from_u32(self.compressed.get())
    }
}

/// The 16-byte keys and IVs referenced by metadata sections.
#[derive(Clone, Default)]
pub struct KeyPool {
    data: Vec<u8>,
}

impl KeyPool {
    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / 16
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns entry `idx`, or `None` if `idx` is out of range.
    #[must_use]
    pub fn get(&self, idx: u32) -> Option<&[u8; 16]> {
        let start = usize::try_from(idx).ok()?.checked_mul(16)?;
        let entry = self.data.get(start..start.checked_add(16)?)?;

        entry.try_into().ok()
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Decrypted metadata of a SELF.
#[derive(Debug, Clone)]
pub struct Metadata {
    info: MetadataInfo,
    header: MetadataHeader,
    sections: Vec<MetadataSectionHeader>,
    keys: KeyPool,
}

impl Metadata {
    /// Reads and decrypts the metadata of `container`.
    pub fn load<R, L>(
        reader: &mut R,
        container: &SelfContainer,
        vault: &KeyVault,
        licenses: &L,
    ) -> Result<Self, DecryptError>
    where
        R: Read + Seek + ?Sized,
        L: LicenseStore + ?Sized,
    {
        let sce = container.sce_header();
        let info_offset = SCE_HEADER_SIZE as u64 + u64::from(sce.meta_offset());
        let headers_offset = info_offset + METADATA_INFO_SIZE as u64;
        let header_len = sce.header_len();

        let headers_len = header_len
            .checked_sub(headers_offset)
            .context(InvalidMetadataRangeSnafu {
                header_len,
                offset: info_offset,
            })?;

        let stream_len = reader.seek(SeekFrom::End(0)).context(IoFailedSnafu)?;

        ensure!(header_len <= stream_len, TruncatedSnafu);

        // Bounded by the stream length above.
        let headers_len = headers_len as usize;

        let mut raw_info = [0u8; METADATA_INFO_SIZE];
        reader
            .seek(SeekFrom::Start(info_offset))
            .and_then(|_| reader.read_exact(&mut raw_info))
            .map_err(map_io)?;

        let mut headers = crate::io::read_vec_at(reader, headers_offset, headers_len).map_err(map_io)?;

        if sce.flags().contains(SceFlags::DEBUG) {
            warn!("debug SELF, metadata info is not encrypted");
        } else {
            let app = container.app_info();
            let key = vault
                .lookup(app.self_type(), sce.key_revision(), app.version())
                .context(FindKeySnafu)?;

            debug!(?key, "found keyset");

            unwrap_npdrm(&mut raw_info, container.controls(), licenses).context(NpdrmSnafu)?;
            aes256_cbc_decrypt(&key.erk, &key.riv, &mut raw_info);
        }

        let info = MetadataInfo::read(&raw_info)?;

        ensure!(info.has_valid_padding(), InvalidPaddingSnafu);

        aes128_ctr_apply(info.key(), info.iv(), &mut headers);

        let (header, rest) = MetadataHeader::read_from_prefix(&headers).map_err(|_| DecryptError::Truncated)?;
        let section_count = header.section_count() as usize;
        let key_count = header.key_count() as usize;

        debug!(?header, "metadata header");

        let (sections, rest) =
            <[MetadataSectionHeader]>::ref_from_prefix_with_elems(rest, section_count)
                .map_err(|_| DecryptError::Truncated)?;

        let keys_len = key_count.checked_mul(16).context(TruncatedSnafu)?;
        let keys = rest.get(..keys_len).context(TruncatedSnafu)?;

        info!(
            sections = section_count,
            keys = key_count,
            "metadata decrypted"
        );

        Ok(Self {
            info,
            header,
            sections: sections.to_vec(),
            keys: KeyPool {
                data: keys.to_vec(),
            },
        })
    }

    #[must_use]
    pub fn info(&self) -> &MetadataInfo {
        &self.info
    }

    #[must_use]
    pub fn header(&self) -> &MetadataHeader {
        &self.header
    }

    #[must_use]
    pub fn sections(&self) -> &[MetadataSectionHeader] {
        &self.sections
    }

    #[must_use]
    pub fn keys(&self) -> &KeyPool {
        &self.keys
    }
}

#[cfg(test)]
impl Metadata {
    /// Builds metadata from already decrypted section headers and key pool.
    pub(crate) fn from_parts(sections: Vec<MetadataSectionHeader>, keys: Vec<u8>) -> Self {
        Self {
            info: MetadataInfo::read(&[0; METADATA_INFO_SIZE]).unwrap(),
            header: MetadataHeader::read(&[0; 0x20]).unwrap(),
            sections,
            keys: KeyPool { data: keys },
        }
    }
}

fn map_io(e: io::Error) -> DecryptError {
    if e.kind() == ErrorKind::UnexpectedEof {
        DecryptError::Truncated
    } else {
        DecryptError::IoFailed { source: e }
    }
}

/// Represents an error when [`Metadata::load()`] fails.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum DecryptError {
    #[snafu(display("metadata offset 0x{offset:X} lies past the header length 0x{header_len:X}"))]
    InvalidMetadataRange { header_len: u64, offset: u64 },

    #[snafu(display("metadata is truncated"))]
    Truncated,

    #[snafu(display("i/o failed while reading metadata"))]
    IoFailed { source: io::Error },

    #[snafu(display("cannot find the keyset"))]
    FindKey { source: keys::LookupError },

    #[snafu(display("cannot remove the NPDRM layer"))]
    Npdrm { source: npdrm::UnwrapError },

    #[snafu(display("metadata info has non-zero padding (wrong keys?)"))]
    InvalidPadding,
}
