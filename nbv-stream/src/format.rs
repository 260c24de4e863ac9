//! Frame encoding.
//!
//! A frame header is 36 bytes of ASCII: the kind tag, a NUL, the start
//! offset as 16 lower-case hex digits, a NUL, the length as 16 hex digits
//! and a final NUL. DATA and META frames are followed by `length` payload
//! bytes and the two byte [TERM] marker; ZERO and STOP frames are headers
//! only.

// WARNING: PLEASE DO NOT MODIFY THE FRAME LAYOUT - existing archives
// depend on it byte for byte.

use std::io::{Read, Write};

use crate::FormatError;

/// Size of an encoded frame header.
pub const FRAME_LEN: usize = 36;

/// Terminator written after every DATA and META payload.
pub const TERM: &[u8; 2] = b"\0\0";

const TAG_META: u8 = b'M';
const TAG_DATA: u8 = b'D';
const TAG_ZERO: u8 = b'Z';
const TAG_STOP: u8 = b'S';

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Stream metadata JSON, exactly once at offset 0.
    Meta,
    /// Payload bytes for one disk region.
    Data,
    /// A region known to read as zeroes, no payload.
    Zero,
    /// End of stream marker.
    Stop,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Meta => TAG_META,
            FrameKind::Data => TAG_DATA,
            FrameKind::Zero => TAG_ZERO,
            FrameKind::Stop => TAG_STOP,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, FormatError> {
        match tag {
            TAG_META => Ok(FrameKind::Meta),
            TAG_DATA => Ok(FrameKind::Data),
            TAG_ZERO => Ok(FrameKind::Zero),
            TAG_STOP => Ok(FrameKind::Stop),
            other => Err(FormatError::UnknownKind(other)),
        }
    }

    /// True for frames carrying a payload plus terminator.
    pub fn has_payload(self) -> bool {
        matches!(self, FrameKind::Meta | FrameKind::Data)
    }
}

/// One decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub start: u64,
    pub length: u64,
}

/// Emit a frame header. Payload and terminator are written by the caller.
pub fn write_frame(
    writer: &mut dyn Write,
    kind: FrameKind,
    start: u64,
    length: u64,
) -> Result<(), FormatError> {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = kind.tag();
    write_hex(&mut buf[2..18], start);
    write_hex(&mut buf[19..35], length);
    writer.write_all(&buf)?;
    Ok(())
}

/// Emit the payload terminator.
pub fn write_term(writer: &mut dyn Write) -> Result<(), FormatError> {
    writer.write_all(TERM)?;
    Ok(())
}

/// Parse the next frame header from the reader.
///
/// A clean EOF before the first header byte is reported as
/// [FormatError::Truncated] since every well formed stream ends with a
/// STOP frame, not with EOF.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, FormatError> {
    let mut buf = [0u8; FRAME_LEN];
    let mut filled = 0;
    while filled < FRAME_LEN {
        let count = reader.read(&mut buf[filled..])?;
        if count == 0 {
            if filled == 0 {
                return Err(FormatError::Truncated);
            }
            return Err(FormatError::ShortHeader(filled));
        }
        filled += count;
    }
    parse_frame(&buf)
}

/// Decode a 36 byte header.
pub fn parse_frame(buf: &[u8; FRAME_LEN]) -> Result<Frame, FormatError> {
    if buf[1] != 0 || buf[18] != 0 || buf[35] != 0 {
        return Err(FormatError::MalformedHeader);
    }
    let kind = FrameKind::from_tag(buf[0])?;
    let start = parse_hex(&buf[2..18])?;
    let length = parse_hex(&buf[19..35])?;
    Ok(Frame { kind, start, length })
}

/// Consume and verify the payload terminator.
pub fn read_term<R: Read>(reader: &mut R) -> Result<(), FormatError> {
    let mut term = [0u8; TERM.len()];
    reader
        .read_exact(&mut term)
        .map_err(|_| FormatError::MissingTerm)?;
    if term != *TERM {
        return Err(FormatError::MissingTerm);
    }
    Ok(())
}

/// The exact bytes of an encoded STOP frame (start and length zero).
pub fn stop_frame_bytes() -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = TAG_STOP;
    write_hex(&mut buf[2..18], 0);
    write_hex(&mut buf[19..35], 0);
    buf
}

fn write_hex(out: &mut [u8], value: u64) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for (i, byte) in out.iter_mut().enumerate() {
        let shift = 60 - 4 * i;
        *byte = HEX[((value >> shift) & 0xf) as usize];
    }
}

fn parse_hex(field: &[u8]) -> Result<u64, FormatError> {
    let text = std::str::from_utf8(field).map_err(|_| FormatError::MalformedHeader)?;
    u64::from_str_radix(text, 16).map_err(|_| FormatError::MalformedHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_header_layout_is_stable() -> Result<(), FormatError> {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Data, 0x1000, 0x200)?;

        assert_eq!(buf.len(), FRAME_LEN);
        assert_eq!(&buf[..], b"D\x000000000000001000\x000000000000000200\x00");
        Ok(())
    }

    #[test]
    fn frame_roundtrip() -> Result<(), FormatError> {
        let cases = [
            (FrameKind::Meta, 0u64, 517u64),
            (FrameKind::Data, 256 * 1024, 4096),
            (FrameKind::Zero, 768 * 1024, 128 * 1024 * 1024),
            (FrameKind::Stop, 0, 0),
        ];

        for (kind, start, length) in cases {
            let mut buf = Vec::new();
            write_frame(&mut buf, kind, start, length)?;
            let frame = read_frame(&mut Cursor::new(&buf))?;
            assert_eq!(frame, Frame { kind, start, length });
        }
        Ok(())
    }

    #[test]
    fn stop_frame_bytes_match_encoder() -> Result<(), FormatError> {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Stop, 0, 0)?;
        assert_eq!(&buf[..], &stop_frame_bytes()[..]);
        Ok(())
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Data, 0, 0).unwrap();
        buf[0] = b'X';
        match read_frame(&mut Cursor::new(&buf)) {
            Err(FormatError::UnknownKind(b'X')) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_short_header() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Data, 0, 0).unwrap();
        buf.truncate(10);
        match read_frame(&mut Cursor::new(&buf)) {
            Err(FormatError::ShortHeader(10)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn eof_reports_truncation() {
        match read_frame(&mut Cursor::new(&[])) {
            Err(FormatError::Truncated) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn term_verification() {
        let mut buf = Vec::new();
        write_term(&mut buf).unwrap();
        read_term(&mut Cursor::new(&buf)).unwrap();

        match read_term(&mut Cursor::new(b"\x01\x00")) {
            Err(FormatError::MissingTerm) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
