use std::io::{self, Read, Seek, SeekFrom};

use zerocopy::FromBytes;

/// Reads a fixed-layout structure from the current position of `reader`.
pub(crate) fn read_struct<T: FromBytes, R: Read + ?Sized>(reader: &mut R) -> io::Result<T> {
    let mut buf = vec![0u8; size_of::<T>()];

    reader.read_exact(&mut buf)?;

    Ok(T::read_from_bytes(&buf).expect("buffer is correctly sized"))
}

/// Reads exactly `len` bytes located at `offset`.
pub(crate) fn read_vec_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    len: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];

    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut buf)?;

    Ok(buf)
}
