use std::fmt;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use snafu::{Snafu, ensure};
use tracing::debug;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U32, U64},
};

/// Errors when reading control info records.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("control info is truncated"))]
    TooSmall,

    #[snafu(display("i/o failed"))]
    IoFailed { source: std::io::Error },

    #[snafu(display("control info of type {kind} has invalid size 0x{size:X}"))]
    InvalidSize { kind: u32, size: u32 },

    #[snafu(display("unknown control info type {kind}"))]
    UnknownType { kind: u32 },
}

type Result<T, E = ReadError> = std::result::Result<T, E>;

fn map_io(e: std::io::Error) -> ReadError {
    if e.kind() == ErrorKind::UnexpectedEof {
        ReadError::TooSmall
    } else {
        ReadError::IoFailed { source: e }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ControlHeaderRaw {
    kind: U32,
    size: U32,
    next: U64,
}

const HEADER_SIZE: u32 = size_of::<ControlHeaderRaw>() as u32;

const TYPE_FLAGS: u32 = 1;
const TYPE_DIGEST: u32 = 2;
const TYPE_NPDRM: u32 = 3;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FlagsRaw {
    flags: [U32; 8],
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Digest30Raw {
    digest: [u8; 20],
    padding: [u8; 4],
    unknown: U64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Digest40Raw {
    digest1: [u8; 20],
    digest2: [u8; 20],
    unknown: U64,
}

/// NPDRM control info body (128 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct NpdrmInfo {
    magic: U32,
    unknown1: U32,
    license: U32,
    app_type: U32,
    content_id: [u8; 48],
    digest: [u8; 16],
    inv_digest: [u8; 16],
    xor_digest: [u8; 16],
    unknown2: U64,
    unknown3: U64,
}

/// How the NPDRM key of a title is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum License {
    /// Requires an online activation; no offline key exists.
    Network,
    /// Key comes from a `.rap` file matching the content ID.
    Local,
    /// Fixed key shared by all free titles.
    Free,
    /// Unrecognized license type.
    Unknown(u32),
}

impl License {
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::Network,
            2 => Self::Local,
            3 => Self::Free,
            other => Self::Unknown(other),
        }
    }
}

impl NpdrmInfo {
    #[must_use]
    pub const fn magic(&self) -> u32 {
        self.magic.get()
    }

    #[must_use]
    pub const fn license(&self) -> License {
        License::from_u32(self.license.get())
    }

    #[must_use]
    pub const fn app_type(&self) -> u32 {
        self.app_type.get()
    }

    /// Returns the raw 48-byte content ID field.
    #[must_use]
    pub fn content_id_bytes(&self) -> &[u8; 48] {
        &self.content_id
    }

    /// Returns the content ID (e.g. `UP0001-NPUB12345_00-0000000000000000`).
    #[must_use]
    pub fn content_id(&self) -> &str {
        let len = self
            .content_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.content_id.len());
        std::str::from_utf8(&self.content_id[..len]).unwrap_or("<invalid>")
    }

    #[must_use]
    pub fn digest(&self) -> &[u8; 16] {
        &self.digest
    }

    #[must_use]
    pub fn inv_digest(&self) -> &[u8; 16] {
        &self.inv_digest
    }

    #[must_use]
    pub fn xor_digest(&self) -> &[u8; 16] {
        &self.xor_digest
    }
}

impl fmt::Debug for NpdrmInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpdrmInfo")
            .field("magic", &format_args!("0x{:08X}", self.magic()))
            .field("license", &self.license())
            .field("app_type", &self.app_type())
            .field("content_id", &self.content_id())
            .field("digest", &hex::encode(self.digest))
            .field("inv_digest", &hex::encode(self.inv_digest))
            .field("xor_digest", &hex::encode(self.xor_digest))
            .finish_non_exhaustive()
    }
}

/// File digest carried by a type 2 control info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDigest {
    /// 0x30-byte record: one SHA-1 digest.
    Single { digest: [u8; 20], unknown: u64 },
    /// 0x40-byte record: two SHA-1 digests.
    Double {
        digest1: [u8; 20],
        digest2: [u8; 20],
        unknown: u64,
    },
}

/// Body of a control info record.
#[derive(Debug, Clone, Copy)]
pub enum ControlData {
    Flags([u32; 8]),
    FileDigest(FileDigest),
    Npdrm(NpdrmInfo),
}

/// A control info record.
#[derive(Debug, Clone, Copy)]
pub struct ControlInfo {
    size: u32,
    next: u64,
    data: ControlData,
}

impl ControlInfo {
    /// Parses one record from the start of `data`.
    pub fn read(mut data: &[u8]) -> Result<Self> {
        Self::read_from(&mut data)
    }

    /// Reads one record from the current position of `reader`.
    ///
    /// The record header is read first and its `(type, size)` pair selects
    /// how the body is decoded.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let hdr: ControlHeaderRaw = crate::io::read_struct(reader).map_err(map_io)?;
        let kind = hdr.kind.get();
        let size = hdr.size.get();

        ensure!(size >= HEADER_SIZE, InvalidSizeSnafu { kind, size });

        let body_size = match (kind, size) {
            (TYPE_FLAGS, _) => size_of::<FlagsRaw>(),
            (TYPE_DIGEST, 0x30) => size_of::<Digest30Raw>(),
            (TYPE_DIGEST, 0x40) => size_of::<Digest40Raw>(),
            (TYPE_DIGEST, _) => return InvalidSizeSnafu { kind, size }.fail(),
            (TYPE_NPDRM, _) => size_of::<NpdrmInfo>(),
            _ => return UnknownTypeSnafu { kind }.fail(),
        };

        ensure!(
            (size - HEADER_SIZE) as usize >= body_size,
            InvalidSizeSnafu { kind, size }
        );

        let data = Self::read_body(reader, kind, size)?;

        Ok(Self {
            size,
            next: hdr.next.get(),
            data,
        })
    }

    fn read_body<R: Read + ?Sized>(reader: &mut R, kind: u32, size: u32) -> Result<ControlData> {
        Ok(match (kind, size) {
            (TYPE_FLAGS, _) => {
                let raw: FlagsRaw = crate::io::read_struct(reader).map_err(map_io)?;
                ControlData::Flags(raw.flags.map(|v| v.get()))
            }
            (TYPE_DIGEST, 0x30) => {
                let raw: Digest30Raw = crate::io::read_struct(reader).map_err(map_io)?;
                ControlData::FileDigest(FileDigest::Single {
                    digest: raw.digest,
                    unknown: raw.unknown.get(),
                })
            }
            (TYPE_DIGEST, _) => {
                let raw: Digest40Raw = crate::io::read_struct(reader).map_err(map_io)?;
                ControlData::FileDigest(FileDigest::Double {
                    digest1: raw.digest1,
                    digest2: raw.digest2,
                    unknown: raw.unknown.get(),
                })
            }
            _ => ControlData::Npdrm(crate::io::read_struct(reader).map_err(map_io)?),
        })
    }

    /// Reads all records in `[offset, offset + total_size)`.
    ///
    /// Each record starts where the previous one ends according to its
    /// declared size.
    pub fn read_all<R: Read + Seek + ?Sized>(
        reader: &mut R,
        offset: u64,
        total_size: u64,
    ) -> Result<Vec<Self>> {
        let mut infos = Vec::new();
        let mut consumed = 0u64;

        while consumed < total_size {
            reader
                .seek(SeekFrom::Start(offset + consumed))
                .map_err(map_io)?;

            let info = Self::read_from(reader)?;
            debug!(?info, "control info");

            consumed += u64::from(info.size);
            infos.push(info);
        }

        Ok(infos)
    }

    /// Returns the record type.
    #[must_use]
    pub const fn kind(&self) -> u32 {
        match self.data {
            ControlData::Flags(_) => TYPE_FLAGS,
            ControlData::FileDigest(_) => TYPE_DIGEST,
            ControlData::Npdrm(_) => TYPE_NPDRM,
        }
    }

    /// Returns the declared record size, including the 16-byte header.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub const fn next(&self) -> u64 {
        self.next
    }

    #[must_use]
    pub const fn data(&self) -> &ControlData {
        &self.data
    }

    /// Returns the NPDRM body if this is an NPDRM record.
    #[must_use]
    pub const fn npdrm(&self) -> Option<&NpdrmInfo> {
        match &self.data {
            ControlData::Npdrm(v) => Some(v),
            _ => None,
        }
    }

    /// Encodes the record, padded with zeroes to its declared size.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let hdr = ControlHeaderRaw {
            kind: self.kind().into(),
            size: self.size.into(),
            next: self.next.into(),
        };

        let mut out = hdr.as_bytes().to_vec();

        match &self.data {
            ControlData::Flags(flags) => {
                let raw = FlagsRaw {
                    flags: flags.map(U32::new),
                };
                out.extend_from_slice(raw.as_bytes());
            }
            ControlData::FileDigest(FileDigest::Single { digest, unknown }) => {
                let raw = Digest30Raw {
                    digest: *digest,
                    padding: [0; 4],
                    unknown: (*unknown).into(),
                };
                out.extend_from_slice(raw.as_bytes());
            }
            ControlData::FileDigest(FileDigest::Double {
                digest1,
                digest2,
                unknown,
            }) => {
                let raw = Digest40Raw {
                    digest1: *digest1,
                    digest2: *digest2,
                    unknown: (*unknown).into(),
                };
                out.extend_from_slice(raw.as_bytes());
            }
            ControlData::Npdrm(npdrm) => out.extend_from_slice(npdrm.as_bytes()),
        }

        out.resize(self.size as usize, 0);
        out
    }
}
