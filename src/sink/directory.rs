//! Filesystem directory sink.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::debug;

use super::{OutputError, OutputSink, SinkWriter};
use crate::naming::PARTIAL_SUFFIX;

/// Writes every stream to `<name>.partial` and renames it into place on
/// finish, so a crashed run never leaves a final-named torso behind.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectorySink { dir: dir.into() }
    }
}

impl OutputSink for DirectorySink {
    fn create(&self, name: &str) -> Result<Box<dyn SinkWriter + '_>, OutputError> {
        let final_path = self.dir.join(name);
        let partial_path = self.dir.join(format!("{}{}", name, PARTIAL_SUFFIX));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&partial_path)?;
        Ok(Box::new(DirectoryWriter {
            file,
            partial_path,
            final_path,
            finished: false,
        }))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<(), OutputError> {
        std::fs::write(self.dir.join(name), data)?;
        Ok(())
    }

    fn single_writer(&self) -> bool {
        false
    }

    fn finish(&self) -> Result<(), OutputError> {
        Ok(())
    }
}

struct DirectoryWriter {
    file: File,
    partial_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl Write for DirectoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl SinkWriter for DirectoryWriter {
    fn seek_to(&mut self, offset: u64) -> Result<(), OutputError> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn set_size(&mut self, size: u64) -> Result<(), OutputError> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
        self.file.flush()?;
        std::fs::rename(&self.partial_path, &self.final_path)?;
        self.finished = true;
        debug!("renamed {} into place", self.final_path.display());
        Ok(())
    }
}

impl Drop for DirectoryWriter {
    fn drop(&mut self) {
        if !self.finished {
            // keep the .partial file as evidence of the failed run
            debug!("leaving {} behind", self.partial_path.display());
        }
    }
}
