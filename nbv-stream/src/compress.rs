//! lz4 frame helpers.
//!
//! Every compressed chunk is a self-contained lz4 frame, so chunks of one
//! split DATA frame can be concatenated back-to-back and taken apart
//! again with the sizes from the compression trailer.

use std::io::Write;

use crate::FormatError;

/// Method name recorded in the stream metadata.
pub const METHOD: &str = "lz4";

/// Compress one chunk into a standalone lz4 frame.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .map_err(|err| FormatError::Lz4(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| FormatError::Lz4(err.to_string()))
}

/// Decompress one lz4 frame produced by [compress].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
    let mut out = Vec::new();
    std::io::copy(&mut decoder, &mut out)
        .map_err(|err| FormatError::Lz4(err.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() -> Result<(), FormatError> {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&data)?;
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed)?, data);
        Ok(())
    }

    #[test]
    fn concatenated_frames_split_cleanly() -> Result<(), FormatError> {
        let a = vec![0xaau8; 4096];
        let b = vec![0x55u8; 8192];
        let ca = compress(&a)?;
        let cb = compress(&b)?;

        let mut joined = ca.clone();
        joined.extend_from_slice(&cb);

        assert_eq!(decompress(&joined[..ca.len()])?, a);
        assert_eq!(decompress(&joined[ca.len()..])?, b);
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(decompress(b"not an lz4 frame").is_err());
    }
}
