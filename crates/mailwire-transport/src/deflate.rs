//! Raw deflate streams with sync flushes, as used by `COMPRESS=DEFLATE`.

use std::io;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const GROW_BY: usize = 4096;

/// Creates a raw (headerless) compressor.
pub fn compressor() -> Compress {
    Compress::new(Compression::default(), false)
}

/// Creates a raw (headerless) decompressor.
pub fn decompressor() -> Decompress {
    Decompress::new(false)
}

/// Compresses `input` and sync-flushes, so the peer can decode everything
/// sent so far.
pub fn deflate(compress: &mut Compress, input: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut consumed = 0;

    loop {
        let before = compress.total_in();
        compress
            .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
            .map_err(io::Error::other)?;
        consumed += progress(before, compress.total_in())?;

        if consumed == input.len() && out.len() < out.capacity() {
            return Ok(out);
        }
        out.reserve(GROW_BY);
    }
}

/// Decompresses whatever `input` completes.
pub fn inflate(decompress: &mut Decompress, input: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 4 + 64);
    let mut consumed = 0;

    loop {
        let before_in = decompress.total_in();
        let before_out = decompress.total_out();
        let status = decompress
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        consumed += progress(before_in, decompress.total_in())?;

        let stalled = before_in == decompress.total_in() && before_out == decompress.total_out();
        let room_left = out.len() < out.capacity();
        if status == Status::StreamEnd || (room_left && (consumed == input.len() || stalled)) {
            return Ok(out);
        }
        out.reserve(GROW_BY);
    }
}

fn progress(before: u64, after: u64) -> io::Result<usize> {
    usize::try_from(after - before).map_err(io::Error::other)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_each_flush_is_decodable() {
        let mut compress = compressor();
        let mut decompress = decompressor();

        let first = deflate(&mut compress, b"a001 CAPABILITY\r\n").unwrap();
        assert_eq!(inflate(&mut decompress, &first).unwrap(), b"a001 CAPABILITY\r\n");

        let second = deflate(&mut compress, b"a002 NOOP\r\n").unwrap();
        assert_eq!(inflate(&mut decompress, &second).unwrap(), b"a002 NOOP\r\n");
    }

    #[test]
    fn test_large_payload_grows_buffers() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut compress = compressor();
        let mut decompress = decompressor();

        let packed = deflate(&mut compress, &payload).unwrap();
        assert_eq!(inflate(&mut decompress, &packed).unwrap(), payload);
    }

    #[test]
    fn test_split_input() {
        let mut compress = compressor();
        let mut decompress = decompressor();
        let packed = deflate(&mut compress, b"* OK compression active\r\n").unwrap();

        let (head, tail) = packed.split_at(packed.len() / 2);
        let mut text = inflate(&mut decompress, head).unwrap();
        text.extend(inflate(&mut decompress, tail).unwrap());
        assert_eq!(text, b"* OK compression active\r\n");
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let mut decompress = decompressor();
        let err = inflate(&mut decompress, &[0xFF; 16]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
