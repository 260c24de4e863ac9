//! Compression trailer.
//!
//! Compressed streams append a JSON document after the STOP frame: one
//! entry per DATA frame, in stream order. A frame written in a single
//! read is recorded as its compressed byte length; a frame split into
//! multiple reads is recorded as a one-entry map from the uncompressed
//! region length to the list of compressed chunk lengths, so a reader can
//! split the back-to-back lz4 frames again.

use std::io::{Read, Seek, SeekFrom, Write};

use serde_json::Value;

use crate::format::{stop_frame_bytes, FRAME_LEN};
use crate::FormatError;

// plenty for the usual extent counts; doubled while scanning for the
// stop frame on oversized trailers
const TAIL_SCAN_SIZE: u64 = 4 * 1024 * 1024;

/// Compressed sizes of one DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSizes {
    /// The whole region fit into one transfer, one lz4 frame.
    Single(u64),
    /// The region was split at the transport's maximum request size.
    Split {
        /// Uncompressed length of the region.
        uncompressed: u64,
        /// Compressed length of each chunk, in order.
        chunks: Vec<u64>,
    },
}

impl FrameSizes {
    /// Total number of compressed payload bytes inside the DATA frame.
    pub fn compressed_len(&self) -> u64 {
        match self {
            FrameSizes::Single(len) => *len,
            FrameSizes::Split { chunks, .. } => chunks.iter().sum(),
        }
    }

    /// Compressed chunk lengths, one element for unsplit frames.
    pub fn chunk_lengths(&self) -> Vec<u64> {
        match self {
            FrameSizes::Single(len) => vec![*len],
            FrameSizes::Split { chunks, .. } => chunks.clone(),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            FrameSizes::Single(len) => Value::from(*len),
            FrameSizes::Split {
                uncompressed,
                chunks,
            } => {
                let mut map = serde_json::Map::new();
                map.insert(
                    uncompressed.to_string(),
                    Value::from(chunks.clone()),
                );
                Value::Object(map)
            }
        }
    }

    fn from_value(value: &Value) -> Result<Self, FormatError> {
        match value {
            Value::Number(num) => num
                .as_u64()
                .map(FrameSizes::Single)
                .ok_or_else(|| malformed("negative frame size")),
            Value::Object(map) => {
                let (key, chunks) = map
                    .iter()
                    .next()
                    .ok_or_else(|| malformed("empty split entry"))?;
                let uncompressed = key
                    .parse::<u64>()
                    .map_err(|_| malformed("split entry key is not a length"))?;
                let chunks = chunks
                    .as_array()
                    .ok_or_else(|| malformed("split entry is not a list"))?
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .ok_or_else(|| malformed("chunk size is not a length"))
                    })
                    .collect::<Result<Vec<u64>, FormatError>>()?;
                Ok(FrameSizes::Split {
                    uncompressed,
                    chunks,
                })
            }
            _ => Err(malformed("unexpected trailer entry")),
        }
    }
}

fn malformed(msg: &str) -> FormatError {
    FormatError::MalformedTrailer(msg.to_string())
}

/// Append the trailer. Must be called exactly once, after the STOP frame.
pub fn write_compression_trailer(
    writer: &mut dyn Write,
    sizes: &[FrameSizes],
) -> Result<(), FormatError> {
    let entries: Vec<Value> = sizes.iter().map(FrameSizes::to_value).collect();
    let data = serde_json::to_vec(&Value::Array(entries))?;
    writer.write_all(&data)?;
    Ok(())
}

/// Locate and parse the trailer by scanning backwards from the file end
/// for the STOP frame.
pub fn read_compression_trailer<R: Read + Seek>(
    reader: &mut R,
) -> Result<Vec<FrameSizes>, FormatError> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < FRAME_LEN as u64 {
        return Err(FormatError::Truncated);
    }

    let stop = stop_frame_bytes();
    let mut window = TAIL_SCAN_SIZE;
    loop {
        let len = window.min(file_size);
        reader.seek(SeekFrom::Start(file_size - len))?;
        let mut tail = vec![0u8; len as usize];
        reader.read_exact(&mut tail)?;

        if let Some(pos) = rfind(&tail, &stop) {
            let trailer = &tail[pos + FRAME_LEN..];
            if trailer.is_empty() {
                return Err(FormatError::MissingTrailer);
            }
            let value: Value = serde_json::from_slice(trailer)?;
            let entries = value
                .as_array()
                .ok_or_else(|| malformed("trailer is not a list"))?;
            return entries.iter().map(FrameSizes::from_value).collect();
        }
        if len == file_size {
            return Err(FormatError::Truncated);
        }
        window *= 2;
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).rev().find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{write_frame, write_term, FrameKind};
    use std::io::Cursor;

    #[test]
    fn trailer_roundtrip() -> Result<(), FormatError> {
        let sizes = vec![
            FrameSizes::Single(117),
            FrameSizes::Split {
                uncompressed: 128 * 1024 * 1024,
                chunks: vec![401, 402, 403, 404],
            },
            FrameSizes::Single(9),
        ];

        let mut stream = Vec::new();
        write_frame(&mut stream, FrameKind::Stop, 0, 0)?;
        write_compression_trailer(&mut stream, &sizes)?;

        let parsed = read_compression_trailer(&mut Cursor::new(stream))?;
        assert_eq!(parsed, sizes);
        Ok(())
    }

    #[test]
    fn trailer_wire_shape() -> Result<(), FormatError> {
        let sizes = vec![
            FrameSizes::Single(7),
            FrameSizes::Split {
                uncompressed: 100,
                chunks: vec![3, 4],
            },
        ];
        let mut buf = Vec::new();
        write_compression_trailer(&mut buf, &sizes)?;
        assert_eq!(String::from_utf8(buf).unwrap(), r#"[7,{"100":[3,4]}]"#);
        Ok(())
    }

    #[test]
    fn trailer_found_behind_payload_bytes() -> Result<(), FormatError> {
        // a DATA payload may contain arbitrary bytes, including fake
        // stop frames; only the last one counts
        let mut stream = Vec::new();
        write_frame(&mut stream, FrameKind::Data, 0, FRAME_LEN as u64)?;
        stream.extend_from_slice(&stop_frame_bytes());
        write_term(&mut stream)?;
        write_frame(&mut stream, FrameKind::Stop, 0, 0)?;
        write_compression_trailer(&mut stream, &[FrameSizes::Single(36)])?;

        let parsed = read_compression_trailer(&mut Cursor::new(stream))?;
        assert_eq!(parsed, vec![FrameSizes::Single(36)]);
        Ok(())
    }

    #[test]
    fn missing_stop_is_truncation() {
        let mut stream = Vec::new();
        write_frame(&mut stream, FrameKind::Data, 0, 0).unwrap();
        match read_compression_trailer(&mut Cursor::new(stream)) {
            Err(FormatError::Truncated) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn stop_without_trailer_is_missing_trailer() {
        let mut stream = Vec::new();
        write_frame(&mut stream, FrameKind::Stop, 0, 0).unwrap();
        match read_compression_trailer(&mut Cursor::new(stream)) {
            Err(FormatError::MissingTrailer) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
