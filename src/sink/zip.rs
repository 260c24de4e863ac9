//! Streaming ZIP sink.
//!
//! Used for `-` output, where the whole backup is streamed as one zip
//! archive to stdout. Entries are written with the store method (stream
//! payloads are already lz4 compressed) and unknown sizes up front, so
//! every entry carries a zip64 data descriptor; the central directory
//! follows at the end. For the format, see
//! https://pkware.cachefly.net/webdocs/casestudies/APPNOTE.TXT

use std::io::Write;
use std::sync::Mutex;

use chrono::{Datelike, Local, Timelike};
use crc32fast::Hasher;

use super::{OutputError, OutputSink, SinkWriter};

const LOCAL_FH_SIG: u32 = 0x04034B50;
const DATA_DESCRIPTOR_SIG: u32 = 0x08074B50;
const CENTRAL_DIRECTORY_FH_SIG: u32 = 0x02014B50;
const END_OF_CENTRAL_DIR: u32 = 0x06054B50;
const ZIP64_EOCD_RECORD: u32 = 0x06064B50;
const ZIP64_EOCD_LOCATOR: u32 = 0x07064B50;
const ZIP64_EXTRA_ID: u16 = 0x0001;
const VERSION_NEEDED: u16 = 0x002d;
const VERSION_MADE_BY: u16 = 0x032d;
// bit 3: sizes in data descriptor, bit 11: UTF-8 names
const GP_FLAGS: u16 = (1 << 3) | (1 << 11);
const METHOD_STORE: u16 = 0;

fn dos_date_time() -> (u16, u16) {
    let now = Local::now();
    let year = now.year();
    if !(1980..=2107).contains(&year) {
        return (0, 0);
    }
    let date = (((year - 1980) as u16) << 9)
        | ((now.month() as u16) << 5)
        | now.day() as u16;
    let time = ((now.hour() as u16) << 11)
        | ((now.minute() as u16) << 5)
        | (now.second() as u16 / 2);
    (date, time)
}

struct EntryRecord {
    name: String,
    offset: u64,
    crc: u32,
    size: u64,
    date: u16,
    time: u16,
}

/// Plain streaming zip encoder over any writer.
pub struct ZipWriter<W: Write> {
    output: W,
    written: u64,
    entries: Vec<EntryRecord>,
    open_entry: Option<OpenEntry>,
}

struct OpenEntry {
    name: String,
    offset: u64,
    hasher: Hasher,
    size: u64,
    date: u16,
    time: u16,
}

impl<W: Write> ZipWriter<W> {
    pub fn new(output: W) -> Self {
        ZipWriter {
            output,
            written: 0,
            entries: Vec::new(),
            open_entry: None,
        }
    }

    fn push(&mut self, data: &[u8]) -> Result<(), OutputError> {
        self.output.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Write the local file header and make `name` the open entry.
    pub fn begin_entry(&mut self, name: &str) -> Result<(), OutputError> {
        if self.open_entry.is_some() {
            return Err(OutputError::Busy);
        }
        let offset = self.written;
        let (date, time) = dos_date_time();

        // sizes are unknown, announced via the zip64 data descriptor
        let mut header = Vec::with_capacity(50 + name.len());
        header.extend_from_slice(&LOCAL_FH_SIG.to_le_bytes());
        header.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
        header.extend_from_slice(&GP_FLAGS.to_le_bytes());
        header.extend_from_slice(&METHOD_STORE.to_le_bytes());
        header.extend_from_slice(&time.to_le_bytes());
        header.extend_from_slice(&date.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // crc
        header.extend_from_slice(&u32::MAX.to_le_bytes()); // compressed size
        header.extend_from_slice(&u32::MAX.to_le_bytes()); // uncompressed size
        header.extend_from_slice(&(name.len() as u16).to_le_bytes());
        header.extend_from_slice(&20u16.to_le_bytes()); // extra field length
        header.extend_from_slice(name.as_bytes());
        header.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        header.extend_from_slice(&16u16.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes()); // uncompressed, in descriptor
        header.extend_from_slice(&0u64.to_le_bytes()); // compressed, in descriptor
        self.push(&header)?;

        self.open_entry = Some(OpenEntry {
            name: name.to_string(),
            offset,
            hasher: Hasher::new(),
            size: 0,
            date,
            time,
        });
        Ok(())
    }

    /// Append payload bytes to the open entry.
    pub fn write_entry_data(&mut self, data: &[u8]) -> Result<(), OutputError> {
        let entry = self.open_entry.as_mut().ok_or(OutputError::Busy)?;
        entry.hasher.update(data);
        entry.size += data.len() as u64;
        self.output.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Close the open entry with its zip64 data descriptor.
    pub fn end_entry(&mut self) -> Result<(), OutputError> {
        let entry = self.open_entry.take().ok_or(OutputError::Busy)?;
        let crc = entry.hasher.finalize();

        let mut descriptor = Vec::with_capacity(24);
        descriptor.extend_from_slice(&DATA_DESCRIPTOR_SIG.to_le_bytes());
        descriptor.extend_from_slice(&crc.to_le_bytes());
        descriptor.extend_from_slice(&entry.size.to_le_bytes()); // stored: compressed
        descriptor.extend_from_slice(&entry.size.to_le_bytes()); // == uncompressed
        self.push(&descriptor)?;

        self.entries.push(EntryRecord {
            name: entry.name,
            offset: entry.offset,
            crc,
            size: entry.size,
            date: entry.date,
            time: entry.time,
        });
        Ok(())
    }

    /// Write the central directory and the zip64 end records.
    pub fn finish(&mut self) -> Result<(), OutputError> {
        if self.open_entry.is_some() {
            return Err(OutputError::Busy);
        }
        let directory_offset = self.written;

        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            let mut header = Vec::with_capacity(74 + entry.name.len());
            header.extend_from_slice(&CENTRAL_DIRECTORY_FH_SIG.to_le_bytes());
            header.extend_from_slice(&VERSION_MADE_BY.to_le_bytes());
            header.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
            header.extend_from_slice(&GP_FLAGS.to_le_bytes());
            header.extend_from_slice(&METHOD_STORE.to_le_bytes());
            header.extend_from_slice(&entry.time.to_le_bytes());
            header.extend_from_slice(&entry.date.to_le_bytes());
            header.extend_from_slice(&entry.crc.to_le_bytes());
            header.extend_from_slice(&u32::MAX.to_le_bytes());
            header.extend_from_slice(&u32::MAX.to_le_bytes());
            header.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            header.extend_from_slice(&28u16.to_le_bytes()); // extra field length
            header.extend_from_slice(&0u16.to_le_bytes()); // comment
            header.extend_from_slice(&0u16.to_le_bytes()); // disk number
            header.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            header.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            header.extend_from_slice(&u32::MAX.to_le_bytes()); // offset
            header.extend_from_slice(entry.name.as_bytes());
            header.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
            header.extend_from_slice(&24u16.to_le_bytes());
            header.extend_from_slice(&entry.size.to_le_bytes());
            header.extend_from_slice(&entry.size.to_le_bytes());
            header.extend_from_slice(&entry.offset.to_le_bytes());
            self.push(&header)?;
        }

        let directory_size = self.written - directory_offset;
        let entry_count = entries.len() as u64;

        let mut eocd64 = Vec::with_capacity(56);
        eocd64.extend_from_slice(&ZIP64_EOCD_RECORD.to_le_bytes());
        eocd64.extend_from_slice(&44u64.to_le_bytes());
        eocd64.extend_from_slice(&VERSION_MADE_BY.to_le_bytes());
        eocd64.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
        eocd64.extend_from_slice(&0u32.to_le_bytes());
        eocd64.extend_from_slice(&0u32.to_le_bytes());
        eocd64.extend_from_slice(&entry_count.to_le_bytes());
        eocd64.extend_from_slice(&entry_count.to_le_bytes());
        eocd64.extend_from_slice(&directory_size.to_le_bytes());
        eocd64.extend_from_slice(&directory_offset.to_le_bytes());
        let eocd64_offset = self.written;
        self.push(&eocd64)?;

        let mut locator = Vec::with_capacity(20);
        locator.extend_from_slice(&ZIP64_EOCD_LOCATOR.to_le_bytes());
        locator.extend_from_slice(&0u32.to_le_bytes());
        locator.extend_from_slice(&eocd64_offset.to_le_bytes());
        locator.extend_from_slice(&1u32.to_le_bytes());
        self.push(&locator)?;

        let mut eocd = Vec::with_capacity(22);
        eocd.extend_from_slice(&END_OF_CENTRAL_DIR.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&u16::MAX.to_le_bytes());
        eocd.extend_from_slice(&u16::MAX.to_le_bytes());
        eocd.extend_from_slice(&u32::MAX.to_le_bytes());
        eocd.extend_from_slice(&u32::MAX.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        self.push(&eocd)?;

        self.output.flush()?;
        Ok(())
    }
}

/// [OutputSink] wrapper around [ZipWriter], single-writer by design.
pub struct ZipSink {
    writer: Mutex<ZipWriter<Box<dyn Write + Send>>>,
}

impl ZipSink {
    pub fn new(output: Box<dyn Write + Send>) -> Self {
        ZipSink {
            writer: Mutex::new(ZipWriter::new(output)),
        }
    }
}

impl OutputSink for ZipSink {
    fn create(&self, name: &str) -> Result<Box<dyn SinkWriter + '_>, OutputError> {
        self.writer.lock().unwrap().begin_entry(name)?;
        Ok(Box::new(ZipEntryWriter { sink: self }))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<(), OutputError> {
        let mut writer = self.writer.lock().unwrap();
        writer.begin_entry(name)?;
        writer.write_entry_data(data)?;
        writer.end_entry()
    }

    fn single_writer(&self) -> bool {
        true
    }

    fn finish(&self) -> Result<(), OutputError> {
        self.writer.lock().unwrap().finish()
    }
}

struct ZipEntryWriter<'a> {
    sink: &'a ZipSink,
}

impl Write for ZipEntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sink
            .writer
            .lock()
            .unwrap()
            .write_entry_data(buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SinkWriter for ZipEntryWriter<'_> {
    fn seek_to(&mut self, _offset: u64) -> Result<(), OutputError> {
        Err(OutputError::SeekUnsupported)
    }

    fn set_size(&mut self, _size: u64) -> Result<(), OutputError> {
        Err(OutputError::SeekUnsupported)
    }

    fn finish(&mut self) -> Result<(), OutputError> {
        self.sink.writer.lock().unwrap().end_entry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_u32(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn archive_structure() -> Result<(), OutputError> {
        let mut writer = ZipWriter::new(Vec::new());
        writer.begin_entry("vda.full.data")?;
        writer.write_entry_data(b"stream bytes")?;
        writer.end_entry()?;
        writer.begin_entry("vmconfig.nbdvault.0.xml")?;
        writer.write_entry_data(b"<domain/>")?;
        writer.end_entry()?;
        writer.finish()?;

        let data = writer.output;
        assert_eq!(le_u32(&data, 0), LOCAL_FH_SIG);
        // end of central directory record is the last 22 bytes
        assert_eq!(le_u32(&data, data.len() - 22), END_OF_CENTRAL_DIR);
        // payload is stored uncompressed
        assert!(data
            .windows(12)
            .any(|window| window == b"stream bytes"));
        Ok(())
    }

    #[test]
    fn descriptor_carries_crc_and_sizes() -> Result<(), OutputError> {
        let payload = b"payload under test";
        let mut writer = ZipWriter::new(Vec::new());
        writer.begin_entry("entry")?;
        writer.write_entry_data(payload)?;
        writer.end_entry()?;

        let mut hasher = Hasher::new();
        hasher.update(payload);
        let crc = hasher.finalize();

        let data = writer.output;
        let descriptor_at = data.len() - 24;
        assert_eq!(le_u32(&data, descriptor_at), DATA_DESCRIPTOR_SIG);
        assert_eq!(le_u32(&data, descriptor_at + 4), crc);
        assert_eq!(
            u64::from_le_bytes(data[descriptor_at + 8..descriptor_at + 16].try_into().unwrap()),
            payload.len() as u64
        );
        Ok(())
    }

    #[test]
    fn only_one_open_entry() -> Result<(), OutputError> {
        let mut writer = ZipWriter::new(Vec::new());
        writer.begin_entry("first")?;
        match writer.begin_entry("second") {
            Err(OutputError::Busy) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }
        Ok(())
    }
}
