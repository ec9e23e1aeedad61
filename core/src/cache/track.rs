//! PiSCSI-style track cache: 16 least-recently-used track slots, 256
//! sectors per track, dirty-sector bitmaps, lazy flush. Mirrors
//! `DiskCache`/`DiskTrack` in the original implementation.

use super::{Cache, CacheStatistics};
use crate::error::IoError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

const CACHE_MAX: usize = 16;
const SECTORS_PER_TRACK: u64 = 256;

struct Track {
    track_number: i64,
    buffer: Vec<u8>,
    modified: Vec<bool>,
    is_modified: bool,
    serial: u32,
}

impl Track {
    fn new(track_number: i64, sector_size: usize, sectors_in_track: usize) -> Self {
        Self {
            track_number,
            buffer: vec![0u8; sector_size * sectors_in_track],
            modified: vec![false; sectors_in_track],
            is_modified: false,
            serial: 0,
        }
    }
}

/// Fixed-capacity (16-slot) LRU track cache over a file opened for
/// positioned random access.
pub struct TrackCache {
    path: PathBuf,
    sector_size: usize,
    sector_count: u64,
    file: Option<File>,
    slots: Vec<Option<Track>>,
    serial: u32,
    stats: CacheStatistics,
}

impl TrackCache {
    pub fn new(path: impl Into<PathBuf>, sector_size: usize, sector_count: u64) -> Self {
        Self {
            path: path.into(),
            sector_size,
            sector_count,
            file: None,
            slots: (0..CACHE_MAX).map(|_| None).collect(),
            serial: 0,
            stats: CacheStatistics::default(),
        }
    }

    fn sectors_in_track(&self, track_number: i64) -> usize {
        let track_start = track_number as u64 * SECTORS_PER_TRACK;
        let remaining = self.sector_count.saturating_sub(track_start);
        remaining.min(SECTORS_PER_TRACK) as usize
    }

    fn file_mut(&mut self) -> Result<&mut File, IoError> {
        if self.file.is_none() {
            let f = OpenOptions::new().read(true).write(true).open(&self.path)?;
            self.file = Some(f);
        }
        Ok(self.file.as_mut().unwrap())
    }

    fn track_offset(&self, track_number: i64) -> u64 {
        track_number as u64 * SECTORS_PER_TRACK * self.sector_size as u64
    }

    fn save(&mut self, index: usize) -> Result<(), IoError> {
        let offset;
        let dirty_ranges: Vec<(usize, usize)>;
        {
            let Some(track) = self.slots[index].as_ref() else { return Ok(()) };
            if !track.is_modified {
                return Ok(());
            }
            offset = self.track_offset(track.track_number);
            dirty_ranges = contiguous_dirty_ranges(&track.modified);
        }
        let sector_size = self.sector_size;
        let file = self.file_mut()?;
        let track = self.slots[index].as_mut().unwrap();
        for (start, len) in dirty_ranges {
            file.seek(SeekFrom::Start(offset + (start * sector_size) as u64))?;
            file.write_all(&track.buffer[start * sector_size..(start + len) * sector_size])?;
        }
        track.is_modified = false;
        track.modified.iter_mut().for_each(|m| *m = false);
        Ok(())
    }

    fn load(&mut self, index: usize, track_number: i64) -> Result<(), IoError> {
        self.save(index)?;
        let sectors = self.sectors_in_track(track_number);
        let mut track = Track::new(track_number, self.sector_size, sectors);
        let offset = self.track_offset(track_number);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        let read = file.read(&mut track.buffer)?;
        // Short reads (e.g. the last, partial track) leave the remainder
        // zero-initialized, matching a sparse/truncated backing file.
        let _ = read;
        self.serial += 1;
        track.serial = self.serial;
        self.slots[index] = Some(track);
        Ok(())
    }

    /// Finds the slot holding `track_number`, or assigns the LRU slot,
    /// flushing it first if dirty.
    fn assign(&mut self, track_number: i64) -> Result<usize, IoError> {
        if let Some(pos) = self.slots.iter().position(|s| matches!(s, Some(t) if t.track_number == track_number)) {
            self.slots[pos].as_mut().unwrap().serial = {
                self.serial += 1;
                self.serial
            };
            return Ok(pos);
        }

        self.stats.cache_miss_read_count += 1;

        let lru_index = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map(|t| t.serial).unwrap_or(0))
            .map(|(i, _)| i)
            .unwrap_or(0);

        if self.serial == u32::MAX {
            for s in self.slots.iter_mut().flatten() {
                s.serial = 0;
            }
            self.serial = 0;
        }

        self.load(lru_index, track_number)?;
        Ok(lru_index)
    }

    fn sector_track(&self, sector: u64) -> (i64, usize) {
        let track = (sector / SECTORS_PER_TRACK) as i64;
        let offset_in_track = (sector % SECTORS_PER_TRACK) as usize;
        (track, offset_in_track)
    }
}

fn contiguous_dirty_ranges(modified: &[bool]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < modified.len() {
        if modified[i] {
            let start = i;
            while i < modified.len() && modified[i] {
                i += 1;
            }
            ranges.push((start, i - start));
        } else {
            i += 1;
        }
    }
    ranges
}

impl Cache for TrackCache {
    fn init(&mut self) -> Result<(), IoError> {
        self.file_mut()?;
        Ok(())
    }

    fn read_sectors(&mut self, buf: &mut [u8], sector: u64, count: u32) -> Result<usize, IoError> {
        let sector_size = self.sector_size;
        for i in 0..u64::from(count) {
            let (track_number, in_track) = self.sector_track(sector + i);
            let slot = self.assign(track_number)?;
            let track = self.slots[slot].as_ref().unwrap();
            let src = &track.buffer[in_track * sector_size..(in_track + 1) * sector_size];
            let dst_off = i as usize * sector_size;
            buf[dst_off..dst_off + sector_size].copy_from_slice(src);
        }
        Ok(count as usize * sector_size)
    }

    fn write_sectors(&mut self, buf: &[u8], sector: u64, count: u32) -> Result<usize, IoError> {
        let sector_size = self.sector_size;
        self.stats.cache_miss_write_count += 1;
        for i in 0..u64::from(count) {
            let (track_number, in_track) = self.sector_track(sector + i);
            let slot = self.assign(track_number)?;
            let track = self.slots[slot].as_mut().unwrap();
            let src_off = i as usize * sector_size;
            track.buffer[in_track * sector_size..(in_track + 1) * sector_size]
                .copy_from_slice(&buf[src_off..src_off + sector_size]);
            track.modified[in_track] = true;
            track.is_modified = true;
        }
        Ok(count as usize * sector_size)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        for i in 0..self.slots.len() {
            self.save(i)?;
        }
        Ok(())
    }

    fn statistics(&self) -> CacheStatistics {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_round_trips_through_eviction() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 512 * 256 * 20]).unwrap();
        let mut cache = TrackCache::new(file.path(), 512, 256 * 20);
        cache.init().unwrap();

        let pattern: Vec<u8> = (0..512u32).map(|b| b as u8).collect();
        cache.write_sectors(&pattern, 0, 1).unwrap();
        cache.write_sectors(&pattern, 256 * 17, 1).unwrap();
        cache.flush().unwrap();

        let mut out = vec![0u8; 512];
        cache.read_sectors(&mut out, 0, 1).unwrap();
        assert_eq!(out, pattern);

        let mut out2 = vec![0u8; 512];
        cache.read_sectors(&mut out2, 256 * 17, 1).unwrap();
        assert_eq!(out2, pattern);
    }
}
