use std::borrow::Cow;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};

use flate2::FlushDecompress;
use snafu::{IntoError, OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, warn};

use crate::container::SelfContainer;
use crate::elf::{ProgramHeader, SectionHeader};
use crate::metadata::{Compression, Encryption, Metadata, SectionKind};
use crate::section::DecryptedSections;

use write_error::*;

/// Largest ELF image that can be rebuilt: the 32-bit address space of a PS3
/// process.
pub const MAX_IMAGE_SIZE: u64 = 1 << 32;

const INFLATE_CHUNK: u64 = 0x1_0000;

/// Writes the ELF image described by `container` and `metadata` to `output`.
///
/// Program segment data comes from `decrypted` for AES-CTR sections and is
/// read directly from `input` for plaintext ones.
pub fn write_elf<W, R>(
    output: &mut W,
    input: &mut R,
    container: &SelfContainer,
    metadata: &Metadata,
    decrypted: &DecryptedSections,
) -> Result<(), WriteError>
where
    W: Write + Seek + ?Sized,
    R: Read + Seek + ?Sized,
{
    let elf = container.elf_header();
    let class = elf.class();
    let endian = elf.endian();
    let phdrs = container.program_headers();

    check_header_range(
        "program header table",
        elf.e_phoff,
        phdrs.len() as u64 * ProgramHeader::size(class) as u64,
    )?;

    output.seek(SeekFrom::Start(0)).context(WriteHeaderFailedSnafu)?;
    elf.write_to(output).context(WriteHeaderFailedSnafu)?;

    output
        .seek(SeekFrom::Start(elf.e_phoff))
        .context(WriteHeaderFailedSnafu)?;

    for phdr in phdrs {
        phdr.write_to(output, class, endian)
            .context(WriteHeaderFailedSnafu)?;
    }

    for (index, section) in metadata.sections().iter().enumerate() {
        if section.kind() != SectionKind::ProgramSegment {
            continue;
        }

        let program_idx = section.program_idx();
        let phdr = usize::try_from(program_idx)
            .ok()
            .and_then(|i| phdrs.get(i))
            .context(InvalidProgramIndexSnafu {
                index,
                program_idx,
                count: phdrs.len(),
            })?;

        let payload = match decrypted.get(index) {
            Some(v) => Cow::Borrowed(v),
            None if section.encryption() == Encryption::AesCtr => {
                warn!(index, program_idx, "section was not decrypted, leaving segment empty");
                continue;
            }
            None => Cow::Owned(read_plain(input, index, section.data_offset(), section.data_size())?),
        };

        let data = match section.compression() {
            Compression::Zlib => Cow::Owned(inflate(&payload, phdr.p_filesz, index)?),
            _ => payload,
        };

        ensure!(
            phdr.p_offset
                .checked_add(data.len() as u64)
                .is_some_and(|end| end <= MAX_IMAGE_SIZE),
            SegmentOutOfRangeSnafu {
                index,
                offset: phdr.p_offset,
                len: data.len() as u64,
            }
        );

        debug!(
            index,
            program_idx,
            offset = phdr.p_offset,
            len = data.len(),
            "writing segment"
        );

        output
            .seek(SeekFrom::Start(phdr.p_offset))
            .context(WriteSegmentFailedSnafu { index })?;
        output
            .write_all(&data)
            .context(WriteSegmentFailedSnafu { index })?;
    }

    if container.self_header().shdr_offset() != 0 {
        let shdrs = container.section_headers();

        check_header_range(
            "section header table",
            elf.e_shoff,
            shdrs.len() as u64 * SectionHeader::size(class) as u64,
        )?;

        output
            .seek(SeekFrom::Start(elf.e_shoff))
            .context(WriteSectionHeadersFailedSnafu)?;

        for shdr in shdrs {
            shdr.write_to(output, class, endian)
                .context(WriteSectionHeadersFailedSnafu)?;
        }
    }

    output.flush().context(FlushFailedSnafu)?;

    Ok(())
}

fn read_plain<R: Read + Seek + ?Sized>(
    input: &mut R,
    index: usize,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>, WriteError> {
    let len = input
        .seek(SeekFrom::End(0))
        .context(ReadPlainFailedSnafu { index })?;

    if !offset.checked_add(size).is_some_and(|end| end <= len) {
        return Err(ReadPlainFailedSnafu { index }.into_error(ErrorKind::UnexpectedEof.into()));
    }

    crate::io::read_vec_at(input, offset, size as usize).context(ReadPlainFailedSnafu { index })
}

fn check_header_range(what: &'static str, offset: u64, len: u64) -> Result<(), WriteError> {
    ensure!(
        offset.checked_add(len).is_some_and(|end| end <= MAX_IMAGE_SIZE),
        HeaderOutOfRangeSnafu { what, offset, len }
    );

    Ok(())
}

/// Inflates a zlib stream that must produce exactly `size` bytes.
///
/// The buffer only grows with the data the stream actually yields.
fn inflate(compressed: &[u8], size: u64, index: usize) -> Result<Vec<u8>, WriteError> {
    ensure!(
        size <= MAX_IMAGE_SIZE,
        DecompressSnafu {
            index,
            reason: "program header size exceeds the image limit",
        }
    );

    let mut inflater = flate2::Decompress::new(true);
    let mut out = Vec::new();

    while out.len() as u64 <= size {
        let produced = out.len() as u64;

        if out.len() == out.capacity() {
            // One byte past `size` is enough to see a stream that runs long.
            let grow = (size - produced).min(produced.max(INFLATE_CHUNK)).max(1);
            out.reserve_exact(grow as usize);
        }

        let consumed = inflater.total_in();
        let input = compressed.get(consumed as usize..).unwrap_or_default();

        let status = inflater
            .decompress_vec(input, &mut out, FlushDecompress::Finish)
            .ok()
            .context(DecompressSnafu {
                index,
                reason: "invalid zlib data",
            })?;

        if status == flate2::Status::StreamEnd {
            ensure!(
                out.len() as u64 == size,
                DecompressSnafu {
                    index,
                    reason: "decompressed size does not match the program header",
                }
            );

            return Ok(out);
        }

        ensure!(
            inflater.total_in() != consumed || out.len() as u64 != produced,
            DecompressSnafu {
                index,
                reason: "zlib stream is truncated",
            }
        );
    }

    DecompressSnafu {
        index,
        reason: "decompressed size does not match the program header",
    }
    .fail()
}

/// Represents an error when [`write_elf()`] fails.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(display("cannot write ELF headers"))]
    WriteHeaderFailed { source: io::Error },

    #[snafu(display("section #{index} refers to program header #{program_idx} but only {count} exist"))]
    InvalidProgramIndex {
        index: usize,
        program_idx: u32,
        count: usize,
    },

    #[snafu(display(
        "{what} at 0x{offset:X} (0x{len:X} bytes) lies past the image size limit"
    ))]
    HeaderOutOfRange {
        what: &'static str,
        offset: u64,
        len: u64,
    },

    #[snafu(display(
        "data of section #{index} at 0x{offset:X} (0x{len:X} bytes) lies past the image size limit"
    ))]
    SegmentOutOfRange { index: usize, offset: u64, len: u64 },

    #[snafu(display("cannot read plaintext data of section #{index}"))]
    ReadPlainFailed { index: usize, source: io::Error },

    #[snafu(display("cannot decompress section #{index}: {reason}"))]
    Decompress { index: usize, reason: &'static str },

    #[snafu(display("cannot write data of section #{index}"))]
    WriteSegmentFailed { index: usize, source: io::Error },

    #[snafu(display("cannot write ELF section headers"))]
    WriteSectionHeadersFailed { source: io::Error },

    #[snafu(display("cannot flush the output"))]
    FlushFailed { source: io::Error },
}
