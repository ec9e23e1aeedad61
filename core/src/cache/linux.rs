//! Direct positioned file cache (no in-memory track buffering), optionally
//! write-through. Mirrors `LinuxCache` in the original implementation.

use super::{Cache, CacheStatistics, LongAccessCache};
use crate::error::IoError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub struct LinuxFileCache {
    path: PathBuf,
    sector_size: usize,
    #[allow(dead_code)]
    sector_count: u64,
    write_through: bool,
    file: Option<File>,
    stats: CacheStatistics,
}

impl LinuxFileCache {
    pub fn new(path: impl Into<PathBuf>, sector_size: usize, sector_count: u64, write_through: bool) -> Self {
        Self {
            path: path.into(),
            sector_size,
            sector_count,
            write_through,
            file: None,
            stats: CacheStatistics::default(),
        }
    }

    fn file_mut(&mut self) -> Result<&mut File, IoError> {
        if self.file.is_none() {
            let f = OpenOptions::new().read(true).write(true).open(&self.path)?;
            self.file = Some(f);
        }
        Ok(self.file.as_mut().unwrap())
    }

    fn read(&mut self, buf: &mut [u8], byte_offset: u64) -> Result<usize, IoError> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(byte_offset))?;
        match file.read_exact(buf) {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                self.stats.read_error_count += 1;
                Err(IoError::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8], byte_offset: u64) -> Result<usize, IoError> {
        let write_through = self.write_through;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(byte_offset))?;
        let result = file.write_all(buf).map(|()| buf.len());
        if result.is_err() {
            self.stats.write_error_count += 1;
        }
        let written = result?;
        if write_through {
            self.flush()?;
        }
        Ok(written)
    }
}

impl Cache for LinuxFileCache {
    fn init(&mut self) -> Result<(), IoError> {
        self.file_mut()?;
        Ok(())
    }

    fn read_sectors(&mut self, buf: &mut [u8], sector: u64, count: u32) -> Result<usize, IoError> {
        let len = count as usize * self.sector_size;
        self.read(&mut buf[..len], sector * self.sector_size as u64)
    }

    fn write_sectors(&mut self, buf: &[u8], sector: u64, count: u32) -> Result<usize, IoError> {
        let len = count as usize * self.sector_size;
        self.write(&buf[..len], sector * self.sector_size as u64)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
            f.sync_data()?;
        }
        Ok(())
    }

    fn statistics(&self) -> CacheStatistics {
        self.stats
    }
}

impl LongAccessCache for LinuxFileCache {
    fn read_long(&mut self, buf: &mut [u8], sector: u64, length: usize) -> Result<usize, IoError> {
        self.read(&mut buf[..length], sector * self.sector_size as u64)
    }

    fn write_long(&mut self, buf: &[u8], sector: u64, length: usize) -> Result<usize, IoError> {
        self.write(&buf[..length], sector * self.sector_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn read_write_round_trip() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 4096]).unwrap();
        let mut cache = LinuxFileCache::new(file.path(), 512, 8, false);
        cache.init().unwrap();

        let pattern: Vec<u8> = (0..512u32).map(|b| b as u8).collect();
        cache.write_sectors(&pattern, 2, 1).unwrap();
        let mut out = vec![0u8; 512];
        cache.read_sectors(&mut out, 2, 1).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn read_long_is_not_sector_aligned() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![7u8; 4096]).unwrap();
        let mut cache = LinuxFileCache::new(file.path(), 512, 8, false);
        cache.init().unwrap();
        let mut out = vec![0u8; 516];
        cache.read_long(&mut out, 0, 516).unwrap();
        assert!(out.iter().all(|&b| b == 7));
    }
}
