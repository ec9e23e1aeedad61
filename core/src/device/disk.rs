//! Random-access SCSI devices: HD, removable HD, CD-ROM, MO, SASI HD.
//! Mirrors `Disk`/`ScsiHd`/`ScsiCd`/`SasiHd` in the original implementation.

use super::primary::{cdb_int16, cdb_int32, cdb_int64};
use super::storage::StorageCommon;
use super::DeviceCommon;
use crate::cache::{Cache, CacheStatistics, LongAccessCache, LinuxFileCache, TrackCache};
use crate::codec;
use crate::error::{Asc, IoError, ScsiException, ScsiResult, SenseKey};
use crate::factory::ReservationRegistry;
use crate::mode_pages::ModePageSource;
use crate::pb::PbDeviceType;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Either cache backend, so READ/WRITE LONG can reach the Linux backend's
/// unaligned access without a trait-object downcast.
pub enum DiskCache {
    Track(TrackCache),
    Linux(LinuxFileCache),
}

impl Cache for DiskCache {
    fn init(&mut self) -> Result<(), IoError> {
        match self {
            DiskCache::Track(c) => c.init(),
            DiskCache::Linux(c) => c.init(),
        }
    }

    fn read_sectors(&mut self, buf: &mut [u8], sector: u64, count: u32) -> Result<usize, IoError> {
        match self {
            DiskCache::Track(c) => c.read_sectors(buf, sector, count),
            DiskCache::Linux(c) => c.read_sectors(buf, sector, count),
        }
    }

    fn write_sectors(&mut self, buf: &[u8], sector: u64, count: u32) -> Result<usize, IoError> {
        match self {
            DiskCache::Track(c) => c.write_sectors(buf, sector, count),
            DiskCache::Linux(c) => c.write_sectors(buf, sector, count),
        }
    }

    fn flush(&mut self) -> Result<(), IoError> {
        match self {
            DiskCache::Track(c) => c.flush(),
            DiskCache::Linux(c) => c.flush(),
        }
    }

    fn statistics(&self) -> CacheStatistics {
        match self {
            DiskCache::Track(c) => c.statistics(),
            DiskCache::Linux(c) => c.statistics(),
        }
    }
}

impl DiskCache {
    fn read_long(&mut self, buf: &mut [u8], sector: u64, length: usize) -> Result<usize, IoError> {
        match self {
            DiskCache::Track(_) => Err(IoError::msg("READ LONG requires the linux caching mode")),
            DiskCache::Linux(c) => c.read_long(buf, sector, length),
        }
    }

    fn write_long(&mut self, buf: &[u8], sector: u64, length: usize) -> Result<usize, IoError> {
        match self {
            DiskCache::Track(_) => Err(IoError::msg("WRITE LONG requires the linux caching mode")),
            DiskCache::Linux(c) => c.write_long(buf, sector, length),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskVariant {
    Hd,
    HdApple,
    Removable,
    Cd,
    Mo,
    SasiHd,
}

/// Start/count resolution mode for READ/WRITE/VERIFY/SEEK, per spec.md
/// section 4.7's `check_and_get_start_and_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    Rw6,
    Rw10,
    Rw16,
    Seek6,
    Seek10,
}

pub struct Disk {
    pub common: DeviceCommon,
    pub storage: StorageCommon,
    pub cache: DiskCache,
    pub variant: DiskVariant,
}

fn supported_block_sizes(variant: DiskVariant) -> BTreeSet<u32> {
    match variant {
        DiskVariant::Cd => [2048].into_iter().collect(),
        DiskVariant::SasiHd => [256, 512, 1024].into_iter().collect(),
        _ => [256, 512, 1024, 2048, 4096].into_iter().collect(),
    }
}

impl Disk {
    pub fn new(lun: i32, variant: DiskVariant) -> Self {
        let device_type = match variant {
            DiskVariant::Hd | DiskVariant::HdApple => PbDeviceType::Schd,
            DiskVariant::Removable => PbDeviceType::Scrm,
            DiskVariant::Cd => PbDeviceType::Sccd,
            DiskVariant::Mo => PbDeviceType::Scmo,
            DiskVariant::SasiHd => PbDeviceType::Sahd,
        };

        let mut common = DeviceCommon::new(device_type, 0, lun);
        common.removable = !matches!(variant, DiskVariant::Hd | DiskVariant::HdApple | DiskVariant::SasiHd);
        if variant == DiskVariant::HdApple {
            common.set_product_data("QUANTUM", "FIREBALL", "1.0", false);
        }

        let mut storage = StorageCommon::new(supported_block_sizes(variant));
        storage.protectable = true;
        if variant == DiskVariant::Cd {
            storage.read_only = true;
        }

        Self { common, storage, cache: DiskCache::Track(TrackCache::new("", 512, 0)), variant }
    }

    pub fn variant_is_removable(&self) -> bool {
        !matches!(self.variant, DiskVariant::Hd | DiskVariant::HdApple | DiskVariant::SasiHd)
    }

    /// Opens the backing image file, reserves it in the registry, sizes the
    /// cache, and derives `block_count` from the file size.
    pub fn open(&mut self, path: &Path, registry: &ReservationRegistry, id: i32, lun: i32) -> ScsiResult<()> {
        let metadata = std::fs::metadata(path)
            .map_err(|_| ScsiException::new(SenseKey::NotReady, Asc::MediumNotPresent))?;
        let file_size = metadata.len();

        self.storage.reserve_file(registry, path, id, lun)?;
        self.storage.block_count = file_size / u64::from(self.storage.block_size);

        self.cache = match self.storage.caching_mode {
            super::storage::CachingMode::Piscsi => {
                DiskCache::Track(TrackCache::new(path, self.storage.block_size as usize, self.storage.block_count))
            }
            mode => DiskCache::Linux(LinuxFileCache::new(
                path,
                self.storage.block_size as usize,
                self.storage.block_count,
                mode == super::storage::CachingMode::WriteThrough,
            )),
        };
        self.cache.init().map_err(|_| ScsiException::new(SenseKey::NotReady, Asc::MediumNotPresent))?;

        self.common.ready = true;
        self.storage.removed = false;
        Ok(())
    }

    pub fn eject(&mut self) -> ScsiResult<()> {
        if self.storage.locked {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::LoadOrEjectFailed));
        }
        let _ = self.cache.flush();
        self.common.ready = false;
        Ok(())
    }

    /// `check_and_get_start_and_count`: resolves LBA + count from the CDB
    /// for the given access mode, and bounds-checks against `block_count`.
    pub fn check_and_get_start_and_count(&self, cdb: &[u8], mode: RwMode) -> ScsiResult<(bool, u64, u32)> {
        let (start, count): (u64, u32) = match mode {
            RwMode::Rw6 | RwMode::Seek6 => {
                let lba = codec::get_u24(cdb, 1) & 0x1f_ffff;
                let raw_count = cdb[4];
                (u64::from(lba), if raw_count == 0 { 256 } else { u32::from(raw_count) })
            }
            RwMode::Rw10 | RwMode::Seek10 => {
                if cdb[1] & 0x01 != 0 {
                    return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
                }
                (u64::from(cdb_int32(cdb, 2) as u32), cdb_int16(cdb, 7) as u32)
            }
            RwMode::Rw16 => (cdb_int64(cdb, 2) as u64, cdb_int32(cdb, 10) as u32),
        };

        if start + u64::from(count) > self.storage.block_count {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::LbaOutOfRange));
        }

        let any = count != 0 || matches!(mode, RwMode::Seek6 | RwMode::Seek10);
        Ok((any, start, count))
    }

    pub fn read_data(&mut self, buf: &mut [u8], start: u64, count: u32) -> ScsiResult<usize> {
        self.cache
            .read_sectors(buf, start, count)
            .map_err(|_| ScsiException::new(SenseKey::MediumError, Asc::ReadError))
    }

    pub fn write_data(&mut self, buf: &[u8], start: u64, count: u32) -> ScsiResult<usize> {
        if self.storage.protected || self.storage.read_only {
            return Err(ScsiException::new(SenseKey::DataProtect, Asc::WriteProtected));
        }
        self.cache
            .write_sectors(buf, start, count)
            .map_err(|_| ScsiException::new(SenseKey::MediumError, Asc::ReadError))
    }

    /// READ/WRITE LONG: requires the `linux`/derived caching mode, switching
    /// automatically away from `piscsi` if necessary (spec.md section 4.7).
    pub fn ensure_long_access_cache(&mut self, path: &Path) {
        if matches!(self.storage.caching_mode, super::storage::CachingMode::Piscsi) {
            self.storage.caching_mode = super::storage::CachingMode::Linux;
            self.cache = DiskCache::Linux(LinuxFileCache::new(
                path,
                self.storage.block_size as usize,
                self.storage.block_count,
                false,
            ));
        }
    }

    pub fn read_long(&mut self, buf: &mut [u8], sector: u64, length: usize) -> ScsiResult<()> {
        let block_size = self.storage.block_size as usize;
        if length != block_size {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb)
                .with_ili()
                .with_information((length as i64 - block_size as i64).unsigned_abs() as u32));
        }
        self.cache
            .read_long(buf, sector, length)
            .map_err(|_| ScsiException::new(SenseKey::MediumError, Asc::ReadError))?;
        Ok(())
    }

    pub fn write_long(&mut self, buf: &[u8], sector: u64, length: usize) -> ScsiResult<()> {
        let block_size = self.storage.block_size as usize;
        if length != block_size {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb)
                .with_ili()
                .with_information((length as i64 - block_size as i64).unsigned_abs() as u32));
        }
        self.cache
            .write_long(buf, sector, length)
            .map_err(|_| ScsiException::new(SenseKey::MediumError, Asc::ReadError))?;
        Ok(())
    }

    pub fn read_capacity10(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        let last_lba = self.storage.block_count.saturating_sub(1);
        let saturated = if last_lba > 0xffff_ffff { 0xffff_ffff } else { last_lba as u32 };
        codec::set_u32(&mut buf, 0, saturated);
        codec::set_u32(&mut buf, 4, self.storage.block_size);
        buf
    }

    pub fn read_capacity16(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        let last_lba = self.storage.block_count.saturating_sub(1);
        codec::set_u64(&mut buf, 0, last_lba);
        codec::set_u32(&mut buf, 8, self.storage.block_size);
        buf
    }

    pub fn read_format_capacities(&self) -> Vec<u8> {
        let mut entries = vec![(self.storage.block_count, self.storage.block_size, 2u8)];
        if !self.storage.read_only {
            for &size in &self.storage.supported_block_sizes {
                if size != self.storage.block_size {
                    let file_bytes = self.storage.block_count * u64::from(self.storage.block_size);
                    entries.push((file_bytes / u64::from(size), size, 0));
                }
            }
        }

        let mut buf = vec![0u8; 4 + entries.len() * 8];
        buf[3] = (entries.len() * 8) as u8;
        for (i, (count, size, descriptor_type)) in entries.into_iter().enumerate() {
            let off = 4 + i * 8;
            codec::set_u32(&mut buf[off..], 0, count as u32);
            buf[off + 4] = descriptor_type;
            codec::set_u24(&mut buf[off + 5..], 0, size);
        }
        buf
    }

    /// READ TOC: a 12-byte minimal TOC for a single data track (CD-ROM
    /// only).
    pub fn read_toc(&self, track: u8, msf: bool) -> ScsiResult<[u8; 12]> {
        if self.variant != DiskVariant::Cd {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode));
        }
        if track != 0 && track != 1 && track != 0xaa {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        let mut buf = [0u8; 12];
        codec::set_u16(&mut buf, 0, 10); // TOC length, excludes itself
        buf[2] = 1; // first track
        buf[3] = 1; // last track
        buf[5] = 0x14; // control byte: data track, digital copy permitted
        buf[6] = if track == 0xaa { 0xaa } else { 1 };

        let lba: u32 = if track == 0xaa { self.storage.block_count as u32 } else { 0 };
        if msf {
            let frames = lba % 75;
            let mut seconds = (lba / 75) % 60 + 2;
            let mut minutes = lba / (75 * 60);
            if seconds >= 60 {
                seconds -= 60;
                minutes += 1;
            }
            buf[9] = minutes as u8;
            buf[10] = seconds as u8;
            buf[11] = frames as u8;
        } else {
            codec::set_u32(&mut buf, 8, lba);
        }
        Ok(buf)
    }

    pub fn format_unit(&self, fmtdata: bool) -> ScsiResult<()> {
        if fmtdata {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }
        Ok(())
    }

    fn mo_spare_blocks_page(&self) -> Vec<u8> {
        // Spare-block counts keyed by (block_size, block_count), as in the
        // original's capacity lookup table; unknown capacities fall back to
        // a conservative default.
        let key = (self.storage.block_size, self.storage.block_count);
        let spare_blocks: u32 = match key {
            (512, c) if c >= 1_041_500 => 1024,
            (2048, c) if c >= 310_352 => 256,
            _ => 0,
        };
        let mut page = vec![0u8; 12];
        page[0] = 32;
        page[1] = 10;
        codec::set_u32(&mut page, 4, spare_blocks);
        page
    }
}

impl Disk {
    /// Mode page 3: format device. Sectors-per-track and bytes-per-sector
    /// mirror the fixed 25-sectors-per-track geometry page 4 also assumes.
    fn format_device_page(&self) -> Vec<u8> {
        let mut p = vec![0u8; 24];
        p[0] = 3;
        p[1] = 22;
        codec::set_u16(&mut p, 10, 25); // sectors per track
        codec::set_u16(&mut p, 12, self.storage.block_size as u16); // bytes per sector
        p[20] = 0x80; // SSEC: soft sectoring
        p
    }

    /// Mode page 4: rigid disk drive geometry, derived from `block_count`
    /// assuming 8 heads and 25 sectors per track (spec.md section 4.7).
    fn rigid_disk_geometry_page(&self) -> Vec<u8> {
        const HEADS: u64 = 8;
        const SECTORS_PER_TRACK: u64 = 25;
        let cylinders = self.storage.block_count / (HEADS * SECTORS_PER_TRACK);

        let mut p = vec![0u8; 20];
        p[0] = 4;
        p[1] = 18;
        codec::set_u24(&mut p, 2, cylinders as u32);
        p[5] = HEADS as u8;
        p
    }

    /// Mode page 0x0c: notch and partition page, carried empty (no notched
    /// partitioning supported).
    fn notch_page(&self) -> Vec<u8> {
        let mut p = vec![0u8; 24];
        p[0] = 0x0c;
        p[1] = 22;
        p
    }

    /// Mode page 0x25: DEC-specific vendor page, carried as an opaque
    /// all-zero block (spec.md documents it only as "DEC vendor", with no
    /// field semantics to reproduce).
    fn dec_vendor_page(&self) -> Vec<u8> {
        let mut p = vec![0u8; 4];
        p[0] = 0x25;
        p[1] = 2;
        p
    }
}

impl ModePageSource for Disk {
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        use crate::mode_pages::ALL_PAGES;

        // SASI HD supports neither MODE SENSE nor MODE SELECT (spec.md
        // section 4.7): no pages are ever populated.
        if self.variant == DiskVariant::SasiHd {
            return;
        }

        if page == 1 || page == ALL_PAGES {
            pages.insert(1, StorageCommon::add_read_write_error_recovery_page(changeable));
        }
        if page == 2 || page == ALL_PAGES {
            pages.insert(2, StorageCommon::add_disconnect_reconnect_page());
        }
        if (page == 3 || page == ALL_PAGES) && self.variant != DiskVariant::SasiHd && self.variant != DiskVariant::Cd {
            pages.insert(3, self.format_device_page());
        }
        if (page == 4 || page == ALL_PAGES) && self.variant != DiskVariant::SasiHd && self.variant != DiskVariant::Cd {
            pages.insert(4, self.rigid_disk_geometry_page());
        }
        if page == 0x0a || page == ALL_PAGES {
            pages.insert(0x0a, StorageCommon::add_control_mode_page());
        }
        if (page == 0x0c || page == ALL_PAGES) && self.variant != DiskVariant::SasiHd {
            pages.insert(0x0c, self.notch_page());
        }
        if (page == 0x25 || page == ALL_PAGES) && self.variant != DiskVariant::SasiHd {
            pages.insert(0x25, self.dec_vendor_page());
        }
        if (page == 7 || page == ALL_PAGES) && self.variant != DiskVariant::SasiHd {
            let mut p = vec![0u8; 12];
            p[0] = 7;
            p[1] = 10;
            pages.insert(7, p);
        }
        if (page == 8 || page == ALL_PAGES) && self.variant != DiskVariant::SasiHd {
            let mut p = vec![0u8; 20];
            p[0] = 8;
            p[1] = 18;
            if !changeable {
                codec::set_u16(&mut p, 12, 0xffff);
                codec::set_u16(&mut p, 14, 0xffff);
            }
            pages.insert(8, p);
        }
        if page == 0x20 && self.variant == DiskVariant::Mo {
            pages.insert(0x20, self.mo_spare_blocks_page());
        }
        if (page == 0x30 || page == ALL_PAGES) && self.variant == DiskVariant::HdApple && !changeable {
            let mut p = vec![0u8; 24];
            p[0] = 0x30;
            p[1] = 22;
            p[2..2 + 22].copy_from_slice(b"APPLE COMPUTER, INC   ");
            pages.insert(0x30, p);
        }
    }

    fn supports_mode_select(&self) -> bool {
        self.variant != DiskVariant::SasiHd
    }

    fn vendor(&self) -> &str {
        &self.common.vendor
    }

    fn product(&self) -> &str {
        &self.common.product
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_and_get_start_and_count_rejects_out_of_range() {
        let mut disk = Disk::new(0, DiskVariant::Hd);
        disk.storage.block_count = 100;
        let cdb = [0x28, 0, 0, 0, 0, 99, 0, 0, 5, 0];
        assert!(disk.check_and_get_start_and_count(&cdb, RwMode::Rw10).is_err());
    }

    #[test]
    fn read_capacity10_saturates_past_32_bits() {
        let mut disk = Disk::new(0, DiskVariant::Hd);
        disk.storage.block_count = 1u64 << 40;
        let buf = disk.read_capacity10();
        assert_eq!(codec::get_u32(&buf, 0), 0xffff_ffff);
    }

    #[test]
    fn toc_lead_out_uses_block_count() {
        let mut disk = Disk::new(0, DiskVariant::Cd);
        disk.storage.block_count = 1000;
        let toc = disk.read_toc(0xaa, false).unwrap();
        assert_eq!(codec::get_u32(&toc, 8), 1000);
    }

    #[test]
    fn rigid_disk_geometry_derives_cylinders_from_block_count() {
        let mut disk = Disk::new(0, DiskVariant::Hd);
        disk.storage.block_count = 8 * 25 * 100;
        let mut pages = BTreeMap::new();
        disk.set_up_mode_pages(&mut pages, 4, false);
        let page = &pages[&4];
        assert_eq!(page[5], 8);
        assert_eq!(codec::get_u24(page, 2), 100);
    }

    #[test]
    fn notch_and_dec_vendor_pages_are_carried_but_empty_of_fields() {
        let disk = Disk::new(0, DiskVariant::Hd);
        let mut pages = BTreeMap::new();
        disk.set_up_mode_pages(&mut pages, crate::mode_pages::ALL_PAGES, false);
        assert!(pages.contains_key(&0x0c));
        assert!(pages.contains_key(&0x25));
    }

    #[test]
    fn sasi_hd_and_cd_omit_geometry_pages() {
        let sasi = Disk::new(0, DiskVariant::SasiHd);
        let mut pages = BTreeMap::new();
        sasi.set_up_mode_pages(&mut pages, crate::mode_pages::ALL_PAGES, false);
        assert!(!pages.contains_key(&3));
        assert!(!pages.contains_key(&4));

        let cd = Disk::new(0, DiskVariant::Cd);
        let mut pages = BTreeMap::new();
        cd.set_up_mode_pages(&mut pages, crate::mode_pages::ALL_PAGES, false);
        assert!(!pages.contains_key(&3));
        assert!(!pages.contains_key(&4));
    }

    #[test]
    fn apple_vendor_page_literal() {
        let disk = Disk::new(0, DiskVariant::HdApple);
        let mut pages = BTreeMap::new();
        disk.set_up_mode_pages(&mut pages, 0x30, false);
        assert_eq!(&pages[&0x30][2..24], b"APPLE COMPUTER, INC   ");
    }
}
