use std::io::{Read, Seek, SeekFrom};

use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, warn};

use crate::control::{self, ControlInfo, NpdrmInfo};
use crate::elf::{self, ElfClass, ElfHeader, ProgramHeader, SectionHeader};
use crate::header::{self, AppInfo, SceHeader, SectionInfo, SelfHeader, VersionInfo};

use load_error::*;

/// Every plaintext header of a SELF, loaded in file order.
///
/// Reference: <https://www.psdevwiki.com/ps3/SELF_-_SPRX>
#[derive(Debug, Clone)]
pub struct SelfContainer {
    sce: SceHeader,
    directory: SelfHeader,
    app_info: AppInfo,
    elf: ElfHeader,
    program_headers: Vec<ProgramHeader>,
    section_infos: Vec<SectionInfo>,
    version_info: VersionInfo,
    controls: Vec<ControlInfo>,
    section_headers: Vec<SectionHeader>,
}

impl SelfContainer {
    /// Loads the headers from `reader`.
    pub fn load<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<Self, LoadError> {
        seek(reader, 0)?;

        let sce = SceHeader::read_checked(reader).context(ReadSceHeaderFailedSnafu)?;
        let directory = SelfHeader::read_from(reader).context(ReadSelfHeaderFailedSnafu)?;

        debug!(?sce, ?directory, "SELF headers");

        seek(reader, directory.app_info_offset())?;
        let app_info = AppInfo::read_from(reader).context(ReadAppInfoFailedSnafu)?;

        debug!(?app_info, "application info");

        seek(reader, directory.elf_offset())?;
        let elf = ElfHeader::read_from(reader).context(ReadElfHeaderFailedSnafu)?;
        let class = elf.class();
        let endian = elf.endian();

        debug!(?elf, "ELF header");

        ensure!(elf.e_phoff != 0 || elf.e_phnum == 0, NullProgramHeaderOffsetSnafu);

        seek(reader, directory.phdr_offset())?;
        let program_headers = (0..elf.e_phnum)
            .map(|_| ProgramHeader::read_from(reader, class, endian))
            .collect::<Result<Vec<_>, _>>()
            .context(ReadProgramHeaderFailedSnafu)?;

        seek(reader, directory.section_info_offset())?;
        let section_infos = (0..elf.e_phnum)
            .map(|_| SectionInfo::read_from(reader))
            .collect::<Result<Vec<_>, _>>()
            .context(ReadSectionInfoFailedSnafu)?;

        seek(reader, directory.version_info_offset())?;
        let version_info = VersionInfo::read_from(reader).context(ReadVersionInfoFailedSnafu)?;

        let controls = ControlInfo::read_all(
            reader,
            directory.control_offset(),
            directory.control_size(),
        )
        .context(ReadControlInfoFailedSnafu)?;

        let section_headers = if elf.e_shoff == 0 && elf.e_shnum != 0 {
            warn!("ELF section header offset is null, ignoring section headers");
            Vec::new()
        } else {
            seek(reader, directory.shdr_offset())?;
            (0..elf.e_shnum)
                .map(|_| SectionHeader::read_from(reader, class, endian))
                .collect::<Result<Vec<_>, _>>()
                .context(ReadSectionHeaderFailedSnafu)?
        };

        debug!(
            programs = program_headers.len(),
            controls = controls.len(),
            sections = section_headers.len(),
            "loaded SELF headers"
        );

        Ok(Self {
            sce,
            directory,
            app_info,
            elf,
            program_headers,
            section_infos,
            version_info,
            controls,
            section_headers,
        })
    }

    #[must_use]
    pub fn sce_header(&self) -> &SceHeader {
        &self.sce
    }

    #[must_use]
    pub fn self_header(&self) -> &SelfHeader {
        &self.directory
    }

    #[must_use]
    pub fn app_info(&self) -> &AppInfo {
        &self.app_info
    }

    #[must_use]
    pub fn elf_header(&self) -> &ElfHeader {
        &self.elf
    }

    #[must_use]
    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    #[must_use]
    pub fn section_infos(&self) -> &[SectionInfo] {
        &self.section_infos
    }

    #[must_use]
    pub fn version_info(&self) -> &VersionInfo {
        &self.version_info
    }

    #[must_use]
    pub fn controls(&self) -> &[ControlInfo] {
        &self.controls
    }

    /// Returns the ELF section headers; empty when the SELF carries none.
    #[must_use]
    pub fn section_headers(&self) -> &[SectionHeader] {
        &self.section_headers
    }

    /// Returns the first NPDRM control info, if any.
    #[must_use]
    pub fn npdrm(&self) -> Option<&NpdrmInfo> {
        self.controls.iter().find_map(ControlInfo::npdrm)
    }

    #[must_use]
    pub fn is_elf32(&self) -> bool {
        self.elf.class() == ElfClass::Elf32
    }
}

fn seek<R: Seek + ?Sized>(reader: &mut R, offset: u64) -> Result<(), LoadError> {
    reader
        .seek(SeekFrom::Start(offset))
        .context(SeekFailedSnafu { offset })?;
    Ok(())
}

/// Represents an error when [`SelfContainer::load()`] fails.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(display("cannot seek to 0x{offset:X}"))]
    SeekFailed {
        offset: u64,
        source: std::io::Error,
    },

    #[snafu(display("invalid SCE header"))]
    ReadSceHeaderFailed { source: header::ReadError },

    #[snafu(display("invalid SELF header"))]
    ReadSelfHeaderFailed { source: header::ReadError },

    #[snafu(display("invalid application info"))]
    ReadAppInfoFailed { source: header::ReadError },

    #[snafu(display("invalid ELF header"))]
    ReadElfHeaderFailed { source: elf::ReadError },

    #[snafu(display("ELF program header offset is null"))]
    NullProgramHeaderOffset,

    #[snafu(display("invalid ELF program header"))]
    ReadProgramHeaderFailed { source: elf::ReadError },

    #[snafu(display("invalid section info"))]
    ReadSectionInfoFailed { source: header::ReadError },

    #[snafu(display("invalid version info"))]
    ReadVersionInfoFailed { source: header::ReadError },

    #[snafu(display("invalid control info"))]
    ReadControlInfoFailed { source: control::ReadError },

    #[snafu(display("invalid ELF section header"))]
    ReadSectionHeaderFailed { source: elf::ReadError },
}

impl LoadError {
    /// Returns `true` if the input is not a SCE container at all.
    #[must_use]
    pub fn is_not_self(&self) -> bool {
        matches!(
            self,
            Self::ReadSceHeaderFailed {
                source: header::ReadError::InvalidMagic
            }
        )
    }

    /// Returns `true` if the input ended before a header was complete.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        matches!(
            self,
            Self::ReadSceHeaderFailed {
                source: header::ReadError::TooSmall { .. }
            } | Self::ReadSelfHeaderFailed {
                source: header::ReadError::TooSmall { .. }
            } | Self::ReadAppInfoFailed {
                source: header::ReadError::TooSmall { .. }
            } | Self::ReadSectionInfoFailed {
                source: header::ReadError::TooSmall { .. }
            } | Self::ReadVersionInfoFailed {
                source: header::ReadError::TooSmall { .. }
            } | Self::ReadElfHeaderFailed {
                source: elf::ReadError::TooSmall { .. }
            } | Self::ReadProgramHeaderFailed {
                source: elf::ReadError::TooSmall { .. }
            } | Self::ReadSectionHeaderFailed {
                source: elf::ReadError::TooSmall { .. }
            } | Self::ReadControlInfoFailed {
                source: control::ReadError::TooSmall
            }
        )
    }
}
