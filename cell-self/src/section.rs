use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::ops::Range;

use snafu::{Snafu, ensure};
use tracing::{debug, warn};

use crate::crypto::aes128_ctr_apply;
use crate::metadata::{Encryption, Metadata};

use decrypt_error::*;

/// Decrypted payload of every AES-CTR section, in one buffer.
#[derive(Debug, Default)]
pub struct DecryptedSections {
    data: Vec<u8>,
    ranges: Vec<Option<Range<usize>>>,
}

impl DecryptedSections {
    /// Returns the decrypted data of metadata section `index`, or `None` if
    /// the section was not decrypted.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        let range = self.ranges.get(index)?.clone()?;
        self.data.get(range)
    }

    /// Total number of decrypted bytes.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Decrypts the data of every AES-CTR section of `metadata`.
///
/// Each section gets its own keystream seeded with the key and IV it
/// references in the key pool. Sections referencing entries outside of the
/// pool are skipped.
pub fn decrypt_sections<R: Read + Seek + ?Sized>(
    reader: &mut R,
    metadata: &Metadata,
) -> Result<DecryptedSections, DecryptError> {
    let stream_len = reader.seek(SeekFrom::End(0)).map_err(map_io)?;
    let keys = metadata.keys();
    let mut out = DecryptedSections::default();

    for (index, section) in metadata.sections().iter().enumerate() {
        if section.encryption() != Encryption::AesCtr {
            out.ranges.push(None);
            continue;
        }

        let (key, iv) = match (keys.get(section.key_idx()), keys.get(section.iv_idx())) {
            (Some(k), Some(i)) => (k, i),
            _ => {
                warn!(
                    index,
                    key_idx = section.key_idx(),
                    iv_idx = section.iv_idx(),
                    key_count = keys.len(),
                    "section key or IV index out of range, skipping"
                );
                out.ranges.push(None);
                continue;
            }
        };

        let offset = section.data_offset();
        let size = section.data_size();

        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= stream_len),
            OutOfBoundsSnafu {
                index,
                offset,
                size
            }
        );

        // Sections never overlap, so all of them together fit in the input.
        let start = out.data.len();

        ensure!(
            (start as u64).saturating_add(size) <= stream_len,
            TooMuchDataSnafu {
                index,
                stream_len
            }
        );

        out.data.resize(start + size as usize, 0);

        let buf = &mut out.data[start..];

        reader.seek(SeekFrom::Start(offset)).map_err(map_io)?;
        reader.read_exact(buf).map_err(map_io)?;

        aes128_ctr_apply(key, iv, buf);

        debug!(index, offset, size, "decrypted section");

        out.ranges.push(Some(start..out.data.len()));
    }

    Ok(out)
}

fn map_io(e: io::Error) -> DecryptError {
    if e.kind() == ErrorKind::UnexpectedEof {
        DecryptError::Truncated
    } else {
        DecryptError::IoFailed { source: e }
    }
}

/// Represents an error when [`decrypt_sections()`] fails.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum DecryptError {
    #[snafu(display(
        "section #{index} data at 0x{offset:X} (0x{size:X} bytes) lies outside of the input"
    ))]
    OutOfBounds { index: usize, offset: u64, size: u64 },

    #[snafu(display(
        "section #{index} brings the decrypted data past the input size 0x{stream_len:X}"
    ))]
    TooMuchData { index: usize, stream_len: u64 },

    #[snafu(display("section data is truncated"))]
    Truncated,

    #[snafu(display("i/o failed while reading section data"))]
    IoFailed { source: io::Error },
}
