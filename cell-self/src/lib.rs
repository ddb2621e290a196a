//! A library for unwrapping PlayStation 3 SELF executables into plain ELF
//! images.
//!
//! SELF is the signed and encrypted container the PlayStation 3 uses for
//! its executables (`EBOOT.BIN`, `.self`, `.sprx`). Unwrapping one means
//! decrypting its metadata with a per-firmware keyset, optionally removing
//! the NPDRM layer of store titles, decrypting every program segment and
//! writing them back at their ELF locations.
//!
//! # Features
//!
//! - Parse every SCE/SELF header, control info and embedded ELF header
//! - Decrypt retail, NPDRM (free and local `.rap` licenses) and debug SELFs
//! - Inflate zlib-compressed segments of 32-bit and 64-bit images
//!
//! # Example
//!
//! ```no_run
//! use cell_self::Decrypter;
//! use cell_self::keys::KeyVault;
//! use cell_self::npdrm::RapDirectory;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vault = KeyVault::load("keys.ini")?;
//! let decrypter = Decrypter::new(&vault, RapDirectory::new("dev_hdd0"));
//!
//! decrypter.decrypt_file("EBOOT.BIN", "EBOOT.elf")?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [PS3 Developer Wiki - SELF](https://www.psdevwiki.com/ps3/SELF_-_SPRX)

use self::container::SelfContainer;
use self::header::{SceFlags, SceHeader, SelfHeader};
use self::keys::KeyVault;
use self::metadata::Metadata;
use self::npdrm::LicenseStore;
use self::section::decrypt_sections;
use self::writer::write_elf;
use snafu::{ResultExt, Snafu};
use std::fs::File;
use std::io::{BufReader, BufWriter, IntoInnerError, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use decrypt_error::*;

pub mod container;
pub mod control;
mod crypto;
pub mod elf;
pub mod header;
mod io;
pub mod keys;
pub mod metadata;
pub mod npdrm;
pub mod rap;
pub mod section;
pub mod writer;

/// How [`Decrypter::decrypt()`] produced its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The SELF was decrypted and rebuilt into an ELF.
    Decrypted,
    /// The SELF was a debug build; the embedded ELF was copied as is.
    DebugPassthrough,
}

/// Turns SELF files into ELF files.
///
/// One [`Decrypter`] can be reused for any number of files.
#[derive(Debug, Clone)]
pub struct Decrypter<'a, L> {
    vault: &'a KeyVault,
    licenses: L,
}

impl<'a, L: LicenseStore> Decrypter<'a, L> {
    pub fn new(vault: &'a KeyVault, licenses: L) -> Self {
        Self { vault, licenses }
    }

    /// Decrypts the SELF in `input` and writes the ELF to `output`.
    ///
    /// `output` may be partially written if this fails.
    pub fn decrypt<R, W>(&self, input: &mut R, output: &mut W) -> Result<Outcome, DecryptError>
    where
        R: Read + Seek + ?Sized,
        W: Write + Seek + ?Sized,
    {
        input.seek(SeekFrom::Start(0)).context(ReadInputFailedSnafu)?;

        let sce = SceHeader::read_checked(input).context(ReadSceHeaderFailedSnafu)?;

        // Debug SELFs carry a plain ELF right after the headers.
        if sce.key_revision() == SceFlags::DEBUG.bits() {
            warn!(
                offset = sce.header_len(),
                "debug SELF detected, copying the embedded ELF"
            );

            input
                .seek(SeekFrom::Start(sce.header_len()))
                .context(ReadInputFailedSnafu)?;
            std::io::copy(input, output).context(CopyDebugElfFailedSnafu)?;
            output.flush().context(CopyDebugElfFailedSnafu)?;

            return Ok(Outcome::DebugPassthrough);
        }

        let container = SelfContainer::load(input).context(LoadHeadersFailedSnafu)?;

        info!(
            self_type = %container.app_info().self_type(),
            elf32 = container.is_elf32(),
            "SELF headers loaded"
        );

        let metadata = Metadata::load(input, &container, self.vault, &self.licenses)
            .context(LoadMetadataFailedSnafu)?;
        let sections = decrypt_sections(input, &metadata).context(DecryptDataFailedSnafu)?;

        info!(bytes = sections.data_len(), "section data decrypted");

        write_elf(output, input, &container, &metadata, &sections).context(MakeElfFailedSnafu)?;

        info!("ELF written");

        Ok(Outcome::Decrypted)
    }

    /// Decrypts the SELF at `input` into a new file at `output`.
    ///
    /// The output file is only created once decryption has fully succeeded.
    pub fn decrypt_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<Outcome, DecryptError> {
        let input = input.as_ref();
        let output = output.as_ref();

        let file = File::open(input).context(OpenInputFailedSnafu { path: input })?;
        let mut reader = BufReader::new(file);

        // The image is built next to `output` and only renamed over it on success.
        let dir = match output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(dir).context(WriteOutputFailedSnafu { path: output })?;
        let mut image = BufWriter::new(temp);

        let outcome = self.decrypt(&mut reader, &mut image)?;

        let temp = image
            .into_inner()
            .map_err(IntoInnerError::into_error)
            .context(WriteOutputFailedSnafu { path: output })?;

        temp.persist(output)
            .map_err(|e| e.error)
            .context(WriteOutputFailedSnafu { path: output })?;

        Ok(outcome)
    }
}

/// Returns `true` if the file at `path` starts with a SCE header.
pub fn is_self(path: impl AsRef<Path>) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };

    SceHeader::read_from(&mut file).is_ok_and(|hdr| hdr.check_magic())
}

/// Returns `true` if the file at `path` is a SELF wrapping a 32-bit ELF.
pub fn is_self_elf32(path: impl AsRef<Path>) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };

    let mut reader = BufReader::new(file);

    if SceHeader::read_checked(&mut reader).is_err() {
        return false;
    }

    let Ok(directory) = SelfHeader::read_from(&mut reader) else {
        return false;
    };

    let mut ident = [0u8; 8];

    reader
        .seek(SeekFrom::Start(directory.elf_offset()))
        .and_then(|_| reader.read_exact(&mut ident))
        .is_ok_and(|_| ident[elf::EI_CLASS] == elf::ELFCLASS32)
}

/// Represents an error when [`Decrypter::decrypt()`] or
/// [`Decrypter::decrypt_file()`] fails.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum DecryptError {
    #[snafu(display("cannot open {}", path.display()))]
    OpenInputFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot read the input"))]
    ReadInputFailed { source: std::io::Error },

    #[snafu(display("invalid SCE header"))]
    ReadSceHeaderFailed { source: header::ReadError },

    #[snafu(display("cannot copy the ELF of a debug SELF"))]
    CopyDebugElfFailed { source: std::io::Error },

    #[snafu(display("cannot load SELF headers"))]
    LoadHeadersFailed { source: container::LoadError },

    #[snafu(display("cannot load SELF metadata"))]
    LoadMetadataFailed { source: metadata::DecryptError },

    #[snafu(display("cannot decrypt SELF data"))]
    DecryptDataFailed { source: section::DecryptError },

    #[snafu(display("cannot make the ELF"))]
    MakeElfFailed { source: writer::WriteError },

    #[snafu(display("cannot write {}", path.display()))]
    WriteOutputFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}
