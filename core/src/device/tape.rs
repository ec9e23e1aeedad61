//! Sequential access device: SIMH `.tap` and tar-compatibility modes, marks,
//! spacing, locate, erase, format. Mirrors `Tape` in the original
//! implementation (spec.md section 4.8 -- the hardest sub-core).

use super::primary::{cdb_int16, cdb_int32, cdb_int64};
use super::storage::StorageCommon;
use super::DeviceCommon;
use crate::codec;
use crate::codec::get_signed_i24;
use crate::error::{ascq, Asc, IoError, ScsiException, ScsiResult, SenseKey};
use crate::factory::ReservationRegistry;
use crate::mode_pages::ModePageSource;
use crate::pb::PbDeviceType;
use crate::simh::{self, SimhClass, SimhMetaData, META_DATA_SIZE};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// SPACE 6's object-type argument (CDB byte 1 bits 0-2) and the matching
/// classification `find_next_object` walks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectType {
    Block,
    Filemark,
    EndOfData,
}

/// What a SIMH meta-data tag was classified as while scanning, paired with
/// its record length (0 for markers).
struct Found {
    object: ObjectType,
    length: u32,
}

pub struct Tape {
    pub common: DeviceCommon,
    pub storage: StorageCommon,
    file: Option<File>,
    tape_position: i64,
    initial: bool,
    fixed: bool,
    block_size_for_descriptor: u32,
    blocks_read: u32,
    record_start: i64,
    record_length: u32,
    object_location: u64,
    byte_count: u32,
    remaining_count: u32,
    file_size: i64,
    max_file_size: i64,
    tar_file: bool,
    read_error_count: u64,
    write_error_count: u64,
}

const DEFAULT_BLOCK_SIZE: u32 = 512;

impl Tape {
    pub fn new(lun: i32, filename: &str) -> Self {
        let mut common = DeviceCommon::new(PbDeviceType::Sctp, 0, lun);
        common.set_product_data("", "SCSI TAPE", "", true);
        common.removable = true;

        let mut storage = StorageCommon::new([512, 1024, 2048, 4096, 8192].into_iter().collect());
        storage.protectable = true;

        Self {
            common,
            storage,
            file: None,
            tape_position: 0,
            initial: false,
            fixed: false,
            block_size_for_descriptor: 0,
            blocks_read: 0,
            record_start: 0,
            record_length: 0,
            object_location: 0,
            byte_count: 0,
            remaining_count: 0,
            file_size: 0,
            max_file_size: 0,
            tar_file: filename.to_ascii_lowercase().ends_with(".tar"),
            read_error_count: 0,
            write_error_count: 0,
        }
    }

    /// Opens the backing file. `append` is the `append` device param from
    /// spec.md section 6.2: the maximum writable offset, 0 meaning "size of
    /// the existing file" (spec.md section 9's "tape `max_file_size`" open
    /// question: an empty image with `append=0` is a configuration error
    /// here, not silently treated as read-only, per that note's guidance).
    pub fn open(
        &mut self,
        path: &Path,
        append: i64,
        registry: &ReservationRegistry,
        id: i32,
        lun: i32,
    ) -> ScsiResult<()> {
        self.tar_file = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("tar")).unwrap_or(false);

        self.storage.block_size = if self.storage.configured_block_size.unwrap_or(0) != 0 {
            self.storage.configured_block_size.unwrap()
        } else {
            DEFAULT_BLOCK_SIZE
        };

        if append != 0 && append < i64::from(self.storage.block_size) {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInParameterList));
        }
        self.max_file_size = append;
        self.block_size_for_descriptor = self.storage.block_size;

        self.file_size = std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0);

        if self.max_file_size != 0 && self.file_size < i64::from(self.storage.block_size) {
            let mut f = OpenOptions::new().create(true).write(true).open(path)?;
            f.seek(SeekFrom::Start(u64::from(self.storage.block_size) - 1))?;
            f.write_all(&[0u8])?;
            f.flush()?;
            self.file_size = i64::from(self.storage.block_size);
        }

        if self.max_file_size == 0 && self.file_size != 0 {
            self.max_file_size = self.file_size;
        }
        if self.max_file_size == 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInParameterList));
        }

        self.storage.block_count = self.file_size as u64 / u64::from(self.storage.block_size);

        self.storage.reserve_file(registry, path, id, lun)?;
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| ScsiException::new(SenseKey::NotReady, Asc::MediumNotPresent))?;
        self.file = Some(f);

        self.reset_positions();
        self.common.ready = true;
        self.storage.removed = false;
        Ok(())
    }

    pub fn eject(&mut self) -> ScsiResult<()> {
        if self.storage.locked {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::LoadOrEjectFailed));
        }
        self.file = None;
        self.common.ready = false;
        self.read_error_count = 0;
        self.write_error_count = 0;
        Ok(())
    }

    fn file_mut(&mut self) -> ScsiResult<&mut File> {
        self.file.as_mut().ok_or_else(|| ScsiException::new(SenseKey::NotReady, Asc::MediumNotPresent))
    }

    pub fn reset_positions(&mut self) {
        self.tape_position = 0;
        self.object_location = 0;
    }

    fn is_at_record_boundary(&mut self) -> bool {
        if self.tar_file {
            return false;
        }
        let boundary = self.fixed
            || self.initial
            || self.remaining_count == 0
            || self.byte_count - self.remaining_count == self.record_length;
        self.initial = false;
        boundary
    }

    fn check_for_overflow(&mut self, length: i64) -> ScsiResult<()> {
        if self.tape_position + length > self.max_file_size {
            self.write_error_count += 1;
            return Err(ScsiException::new(SenseKey::VolumeOverflow, Asc::NoAdditionalSenseInformation));
        }
        Ok(())
    }

    fn get_byte_count(&mut self, cdb: &[u8], explicit: bool) -> ScsiResult<u32> {
        self.fixed = cdb[1] & 0x01 != 0;
        if self.fixed && self.block_size_for_descriptor == 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }
        let length = codec::get_u24(cdb, if explicit { 12 } else { 2 });
        Ok(if self.fixed { length * self.storage.block_size } else { length })
    }

    /// READ (6/16). `read_16` selects the explicit partition+identifier form.
    pub fn read(&mut self, cdb: &[u8], read_16: bool) -> ScsiResult<Vec<u8>> {
        self.common.check_ready()?;

        if (cdb[1] & 0b11) == 0b11 || (read_16 && cdb[3] != 0) {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        if read_16 {
            let identifier = codec::get_u64(cdb, 4);
            if identifier != 0 && !self.locate_internal(identifier, false)? {
                return Err(ScsiException::new(SenseKey::NoSense, Asc::LocateOperationFailure)
                    .with_information(codec::get_u24(cdb, 12)));
            }
        }

        self.byte_count = self.get_byte_count(cdb, read_16)?;
        if self.byte_count == 0 {
            return Ok(Vec::new());
        }

        self.blocks_read = 0;
        self.remaining_count = self.byte_count;
        self.initial = true;

        self.read_one_transfer(cdb)
    }

    /// Performs the entire READ transfer in one shot (this emulation's
    /// transfer buffer is not chunk-limited, unlike a constrained hardware
    /// target; see DESIGN.md).
    fn read_one_transfer(&mut self, cdb: &[u8]) -> ScsiResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.byte_count as usize);

        if self.tar_file {
            let block_size = self.storage.block_size as u64;
            let mut remaining = self.byte_count as usize;
            let mut buf = vec![0u8; remaining];
            let pos = self.tape_position as u64;
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(pos)).map_err(|_| read_error(self))?;
            file.read_exact(&mut buf).map_err(|_| read_error(self))?;
            self.tape_position += remaining as i64;
            self.object_location = self.tape_position as u64 / block_size.max(1);
            out.append(&mut buf);
            remaining = 0;
            let _ = remaining;
            return Ok(out);
        }

        while self.remaining_count > 0 {
            if self.is_at_record_boundary() {
                self.load_next_read_record()?;
            }

            let length = (self.byte_count - self.remaining_count + self.remaining_count).min(self.remaining_count) as usize;
            // length is the full remaining chunk for this record; read it.
            let to_read = self.remaining_count.min(self.record_length.saturating_sub(
                (self.tape_position - self.record_start - META_DATA_SIZE as i64).max(0) as u32,
            )).max(1).min(self.remaining_count) as usize;
            let to_read = to_read.min(length).max(1).min(self.remaining_count as usize);

            let mut buf = vec![0u8; to_read];
            let pos = self.tape_position as u64;
            {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos)).map_err(|_| read_error(self))?;
                file.read_exact(&mut buf).map_err(|_| read_error(self))?;
            }
            self.tape_position += to_read as i64;
            self.remaining_count -= to_read as u32;
            out.append(&mut buf);

            if self.is_at_record_boundary() {
                self.tape_position = self.record_start + META_DATA_SIZE as i64 + simh::pad(self.record_length) as i64;
                let mut tag_bytes = [0u8; META_DATA_SIZE];
                let pos = self.tape_position as u64;
                {
                    let file = self.file_mut()?;
                    file.seek(SeekFrom::Start(pos)).map_err(|_| read_error(self))?;
                    file.read_exact(&mut tag_bytes).map_err(|_| read_error(self))?;
                }
                let trailing = simh::from_little_endian(tag_bytes);
                if trailing.value != self.record_length {
                    self.tape_position += META_DATA_SIZE as i64;
                    self.blocks_read += 1;
                    self.read_error_count += 1;
                    return Err(ScsiException::new(SenseKey::MediumError, Asc::ReadError)
                        .with_information(if self.fixed { self.blocks_read } else { self.byte_count }));
                }
                self.tape_position += META_DATA_SIZE as i64;
                if self.remaining_count == 0 {
                    self.blocks_read += 1;
                }
            }

            let _ = cdb;
        }

        Ok(out)
    }

    fn load_next_read_record(&mut self) -> ScsiResult<()> {
        let pos = self.tape_position as u64;
        let meta = {
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(pos)).map_err(|_| read_error(self))?;
            simh::read_meta_data(file).map_err(|_| read_error(self))?
        };

        if matches!(meta.class, SimhClass::BadDataRecord) && meta.value == 0 {
            self.read_error_count += 1;
            return Err(ScsiException::new(SenseKey::MediumError, Asc::ReadError));
        }

        self.record_length = meta.value;
        self.record_start = pos as i64;
        self.tape_position = pos as i64 + META_DATA_SIZE as i64;

        let actual = self.check_block_length()?;
        if actual != 0 {
            self.byte_count = actual.min(self.byte_count);
            self.remaining_count = self.byte_count;
        }

        Ok(())
    }

    /// Mirrors `Tape::CheckBlockLength`: latches ILI and returns the actual
    /// transferable length (0 meaning "no mismatch").
    fn check_block_length(&mut self) -> ScsiResult<u32> {
        if self.record_length == self.byte_count {
            return Ok(0);
        }

        if self.fixed && self.record_length != 0 && self.byte_count % self.record_length != 0 {
            let info = (self.byte_count - self.remaining_count) / self.storage.block_size - self.blocks_read;
            return Err(ScsiException::new(SenseKey::NoSense, Asc::NoAdditionalSenseInformation)
                .with_ili()
                .with_information(info));
        }

        Ok(0)
    }

    /// WRITE (6/16).
    pub fn write(&mut self, cdb: &[u8], write_16: bool) -> ScsiResult<u32> {
        self.common.check_ready()?;
        if self.storage.protected || self.storage.read_only {
            return Err(ScsiException::new(SenseKey::DataProtect, Asc::WriteProtected));
        }
        if write_16 && (cdb[1] & 0b1100 != 0 || cdb[3] != 0) {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        if write_16 {
            let identifier = codec::get_u64(cdb, 4);
            if identifier != 0 && !self.locate_internal(identifier, false)? {
                return Err(ScsiException::new(SenseKey::NoSense, Asc::LocateOperationFailure)
                    .with_information(codec::get_u24(cdb, 12)));
            }
        }

        self.byte_count = self.get_byte_count(cdb, write_16)?;
        Ok(self.byte_count)
    }

    /// Commits the DATA OUT payload collected for a preceding `write()`.
    pub fn finish_write(&mut self, data: &[u8]) -> ScsiResult<()> {
        if self.byte_count == 0 {
            return Ok(());
        }

        self.remaining_count = self.byte_count;
        self.record_length = if self.fixed { self.storage.block_size } else { self.byte_count };
        self.initial = true;

        if self.tar_file {
            let pos = self.tape_position as u64;
            self.check_for_overflow(data.len() as i64)?;
            {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos))?;
                file.write_all(data)?;
                file.flush()?;
            }
            self.tape_position += data.len() as i64;
            self.object_location = self.tape_position as u64 / u64::from(self.storage.block_size).max(1);
            self.remaining_count = 0;
            return Ok(());
        }

        let mut offset = 0usize;
        while self.remaining_count > 0 {
            if self.is_at_record_boundary() {
                self.write_meta_data(ObjectType::Block, self.record_length)?;
            }

            let length = self.byte_count.min(self.remaining_count) as usize;
            let chunk = &data[offset..offset + length.min(data.len() - offset)];
            self.check_for_overflow(chunk.len() as i64)?;

            let pos = self.tape_position as u64;
            {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos))?;
                file.write_all(chunk)?;
                file.flush()?;
            }
            self.tape_position += chunk.len() as i64;
            self.remaining_count -= chunk.len() as u32;
            offset += chunk.len();

            if self.is_at_record_boundary() {
                if self.tape_position % 2 != 0 {
                    let file = self.file_mut()?;
                    file.write_all(&[0u8])?;
                    self.tape_position += 1;
                }
                self.tape_position += self.write_simh_tag(SimhClass::TapeMarkOrGoodDataRecord, self.record_length)?;
                self.object_location += 1;
            }
        }

        self.write_meta_data(ObjectType::EndOfData, 0)
    }

    fn write_simh_tag(&mut self, class: SimhClass, value: u32) -> ScsiResult<i64> {
        let meta = SimhMetaData { class, value };
        let pos = self.tape_position as u64;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(&simh::to_little_endian(meta))?;
        file.flush()?;
        Ok(META_DATA_SIZE as i64)
    }

    fn write_meta_data(&mut self, object_type: ObjectType, size: u32) -> ScsiResult<()> {
        if self.tar_file {
            return Ok(());
        }

        if matches!(object_type, ObjectType::Block | ObjectType::Filemark) {
            self.tape_position += self.write_simh_tag(SimhClass::TapeMarkOrGoodDataRecord, size)?;
        }

        if self.file_size >= self.tape_position + META_DATA_SIZE as i64 {
            let value = (object_type_code(ObjectType::EndOfData) << 24) | simh::PRIVATE_MARKER_MAGIC;
            self.write_simh_tag(SimhClass::PrivateMarker, value)?;
        }

        Ok(())
    }

    /// ERASE (6).
    pub fn erase6(&mut self, cdb: &[u8]) -> ScsiResult<()> {
        self.common.check_ready()?;
        if self.tar_file {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode));
        }
        if self.storage.protected || self.storage.read_only {
            return Err(ScsiException::new(SenseKey::DataProtect, Asc::WriteProtected));
        }

        if cdb[1] & 0x01 != 0 {
            self.erase_long()?;
            self.reset_positions();
        }

        self.write_meta_data(ObjectType::EndOfData, 0)
    }

    /// Fills `[tape_position, file_size)` with erase-gap markers in
    /// 1024-marker chunks. No fsync beyond the final write; partial-erase
    /// crash recovery is not a supported durability level (spec.md section
    /// 9's open question -- see DESIGN.md).
    fn erase_long(&mut self) -> ScsiResult<()> {
        let gap = simh::marker::ERASE_GAP.to_le_bytes();
        let mut chunk = Vec::with_capacity(1024 * META_DATA_SIZE);
        for _ in 0..1024 {
            chunk.extend_from_slice(&gap);
        }

        let mut remaining = (self.file_size - self.tape_position).max(0) as u64;
        while remaining >= META_DATA_SIZE as u64 {
            let n = remaining.min(chunk.len() as u64) as usize;
            let pos = self.tape_position as u64;
            {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos))?;
                file.write_all(&chunk[..n])?;
            }
            remaining -= n as u64;
            self.tape_position += n as i64;
            self.object_location += n as u64 / u64::from(self.storage.block_size).max(1);
        }
        self.file_mut()?.flush()?;
        Ok(())
    }

    pub fn read_block_limits() -> [u8; 6] {
        let mut buf = [0u8; 6];
        codec::set_u32(&mut buf, 0, 0x02ff_fffc);
        codec::set_u16(&mut buf, 4, 4);
        buf
    }

    /// SPACE (6).
    pub fn space6(&mut self, cdb: &[u8]) -> ScsiResult<()> {
        self.common.check_ready()?;
        if self.tar_file {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode));
        }

        match cdb[1] & 0x07 {
            0b000 => {
                let count = get_signed_i24(cdb, 2);
                if count != 0 {
                    self.find_next_object(ObjectType::Block, count, false)?;
                }
            }
            0b001 => {
                let count = get_signed_i24(cdb, 2);
                if count != 0 {
                    self.find_next_object(ObjectType::Filemark, count, false)?;
                }
            }
            0b011 => {
                self.find_next_object(ObjectType::EndOfData, 0, false)?;
                self.tape_position -= META_DATA_SIZE as i64;
            }
            _ => return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb)),
        }
        Ok(())
    }

    /// WRITE FILEMARKS (6/16).
    pub fn write_filemarks(&mut self, cdb: &[u8], write_16: bool) -> ScsiResult<()> {
        self.common.check_ready()?;
        if self.tar_file {
            return Ok(());
        }
        if self.storage.protected || self.storage.read_only {
            return Err(ScsiException::new(SenseKey::DataProtect, Asc::WriteProtected));
        }
        if cdb[1] & 0x02 != 0 || (write_16 && (cdb[1] & 0b1100 != 0 || cdb[3] != 0)) {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        let count = if write_16 {
            let identifier = codec::get_u64(cdb, 4) as u32;
            if identifier != 0 {
                self.reset_positions();
                if !self.find_object(identifier)? {
                    return Err(ScsiException::new(SenseKey::NoSense, Asc::LocateOperationFailure)
                        .with_information(codec::get_u24(cdb, 12)));
                }
            }
            codec::get_u24(cdb, 12) as i32
        } else {
            get_signed_i24(cdb, 2)
        };

        for _ in 0..count {
            self.write_meta_data(ObjectType::Filemark, 0)?;
        }
        Ok(())
    }

    /// LOCATE (10/16). Returns `false` on LOCATE OPERATION FAILURE.
    pub fn locate(&mut self, cdb: &[u8], locate_16: bool) -> ScsiResult<bool> {
        self.common.check_ready()?;
        if cdb[1] & 0x02 != 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        let identifier = if locate_16 { codec::get_u64(cdb, 4) } else { cdb_int32(cdb, 3) as u32 as u64 };
        self.locate_internal(identifier, cdb[1] & 0x04 != 0)
    }

    fn locate_internal(&mut self, identifier: u64, bt: bool) -> ScsiResult<bool> {
        if self.tar_file {
            let block_size = u64::from(self.storage.block_size);
            if bt {
                if identifier % block_size != 0 {
                    return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
                }
                self.tape_position = identifier as i64;
                self.object_location = identifier / block_size;
            } else {
                self.tape_position = (identifier * block_size) as i64;
                self.object_location = identifier;
            }
            return Ok(true);
        }

        if bt && identifier != 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }
        self.reset_positions();
        if identifier != 0 {
            return self.find_object(identifier as u32);
        }
        Ok(true)
    }

    pub fn read_position(&mut self, cdb: &[u8]) -> [u8; 20] {
        let mut buf = [0u8; 20];
        if self.tape_position == 0 {
            buf[0] |= 0b1000_0000;
        }
        if self.tape_position >= self.file_size {
            buf[0] |= 0b0100_0000;
        }
        let bt = cdb[1] & 0x01 != 0;
        let value = if bt { self.tape_position as u32 } else { self.object_location as u32 };
        codec::set_u32(&mut buf, 4, value);
        codec::set_u32(&mut buf, 8, value);
        buf
    }

    pub fn format_medium(&mut self) -> ScsiResult<()> {
        self.common.check_ready()?;
        if self.tar_file {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode));
        }
        if self.storage.protected || self.storage.read_only {
            return Err(ScsiException::new(SenseKey::DataProtect, Asc::WriteProtected));
        }
        if self.tape_position != 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::SequentialPositioningError));
        }

        self.erase_long()?;
        self.reset_positions();
        self.write_meta_data(ObjectType::EndOfData, 0)
    }

    /// Walks SIMH records toward `type_to_find`, counting matches. Mirrors
    /// `Tape::FindNextObject`.
    fn find_next_object(&mut self, type_to_find: ObjectType, requested_count: i32, _read: bool) -> ScsiResult<Found> {
        let reverse = requested_count < 0;
        let mut requested_count = requested_count.unsigned_abs() as i64;

        loop {
            let found = self.read_simh_meta_data(requested_count as i32, reverse)?;

            if !reverse && is_record_like(&found) {
                self.tape_position += simh::pad(found.length) as i64 + META_DATA_SIZE as i64;
            }

            if found.object == ObjectType::EndOfData {
                if type_to_find == ObjectType::EndOfData {
                    return Ok(found);
                }
                self.tape_position -= META_DATA_SIZE as i64;
                return Err(ScsiException::new(SenseKey::BlankCheck, Asc::NoAdditionalSenseInformation)
                    .with_information(requested_count as u32));
            } else if found.object == ObjectType::Filemark && type_to_find == ObjectType::Block {
                let info = if reverse { requested_count as u32 } else { requested_count as u32 };
                return Err(ScsiException::new(SenseKey::NoSense, Asc::NoAdditionalSenseInformation)
                    .with_filemark()
                    .with_information(info));
            }

            if type_to_find != ObjectType::EndOfData && found.object == type_to_find {
                requested_count -= 1;
                if requested_count <= 0 {
                    return Ok(found);
                }
            }
        }
    }

    fn read_next_meta_data(&mut self, reverse: bool) -> ScsiResult<SimhMetaData> {
        if reverse {
            self.tape_position -= META_DATA_SIZE as i64;
            if self.tape_position < 0 {
                self.reset_positions();
                return Err(ScsiException::with_ascq(
                    SenseKey::NoSense,
                    Asc::NoAdditionalSenseInformation,
                    ascq::BEGINNING_OF_PARTITION_MEDIUM_DETECTED,
                )
                .with_eom());
            }
            let pos = self.tape_position as u64;
            let meta = {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos)).map_err(|_| read_error(self))?;
                simh::read_meta_data(file).map_err(|_| read_error(self))?
            };
            if meta.is_record() {
                self.tape_position -= simh::pad(meta.value) as i64 + META_DATA_SIZE as i64;
            }
            Ok(meta)
        } else {
            let pos = self.tape_position as u64;
            let meta = {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos)).map_err(|_| read_error(self))?;
                simh::read_meta_data(file).map_err(|_| read_error(self))?
            };
            self.tape_position += META_DATA_SIZE as i64;
            Ok(meta)
        }
    }

    fn update_object_location(&mut self, meta: &SimhMetaData, reverse: bool) {
        if meta.is_record() || (matches!(meta.class, SimhClass::BadDataRecord) && meta.value == 0) || meta.is_filemark()
        {
            if reverse {
                self.object_location = self.object_location.saturating_sub(1);
            } else {
                self.object_location += 1;
            }
        }
    }

    fn read_simh_meta_data(&mut self, count: i32, reverse: bool) -> ScsiResult<Found> {
        loop {
            let meta = self.read_next_meta_data(reverse)?;
            self.update_object_location(&meta, reverse);

            match meta.class {
                SimhClass::TapeMarkOrGoodDataRecord => {
                    return Ok(Found {
                        object: if meta.value != 0 { ObjectType::Block } else { ObjectType::Filemark },
                        length: meta.value,
                    });
                }
                SimhClass::BadDataRecord => return Ok(Found { object: ObjectType::Block, length: meta.value }),
                SimhClass::ReservedMarker => {
                    if meta.value == simh::marker::END_OF_MEDIUM {
                        return Err(ScsiException::with_ascq(
                            SenseKey::MediumError,
                            Asc::NoAdditionalSenseInformation,
                            ascq::END_OF_PARTITION_MEDIUM_DETECTED,
                        )
                        .with_eom()
                        .with_information(count as u32));
                    }
                    // Erase gaps and unknown reserved markers are skipped.
                }
                SimhClass::PrivateMarker => {
                    if meta.value & 0x00ff_ffff == simh::PRIVATE_MARKER_MAGIC {
                        let sub_type = (meta.value >> 24) & 0x0f;
                        if sub_type == u32::from(simh::PRIVATE_MARKER_END_OF_DATA) {
                            return Ok(Found { object: ObjectType::EndOfData, length: 0 });
                        }
                    }
                    // Unknown private markers are skipped.
                }
                SimhClass::Reserved(_) => {
                    if !reverse {
                        self.tape_position += simh::pad(meta.value) as i64 + META_DATA_SIZE as i64;
                    }
                }
            }
        }
    }

    /// Scans forward from the current position counting every record or
    /// filemark, returning `false` if end-of-data is hit first. Used by
    /// LOCATE and WRITE FILEMARKS' identifier form.
    fn find_object(&mut self, mut identifier: u32) -> ScsiResult<bool> {
        loop {
            let pos = self.tape_position as u64;
            let meta = {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos)).map_err(|_| read_error(self))?;
                simh::read_meta_data(file).map_err(|_| read_error(self))?
            };
            self.tape_position += META_DATA_SIZE as i64;

            if matches!(meta.class, SimhClass::PrivateMarker) && meta.value & 0x00ff_ffff == simh::PRIVATE_MARKER_MAGIC
            {
                return Ok(false);
            }

            let counts = meta.is_record()
                || (matches!(meta.class, SimhClass::BadDataRecord) && meta.value == 0)
                || (matches!(meta.class, SimhClass::TapeMarkOrGoodDataRecord) && meta.value == 0);

            if counts {
                if meta.is_record() {
                    self.tape_position += simh::pad(meta.value) as i64 + META_DATA_SIZE as i64;
                }
                identifier -= 1;
                if identifier == 0 {
                    return Ok(true);
                }
            }
        }
    }
}

fn object_type_code(t: ObjectType) -> u32 {
    match t {
        ObjectType::Block => 0,
        ObjectType::Filemark => 1,
        ObjectType::EndOfData => 3,
    }
}

fn is_record_like(found: &Found) -> bool {
    matches!(found.object, ObjectType::Block) && found.length != 0
}

fn read_error(tape: &mut Tape) -> ScsiException {
    tape.read_error_count += 1;
    ScsiException::new(SenseKey::MediumError, Asc::ReadError)
}

impl From<IoError> for ScsiException {
    fn from(_: IoError) -> Self {
        ScsiException::new(SenseKey::MediumError, Asc::WriteError)
    }
}

impl From<std::io::Error> for ScsiException {
    fn from(_: std::io::Error) -> Self {
        ScsiException::new(SenseKey::MediumError, Asc::WriteError)
    }
}

impl ModePageSource for Tape {
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        use crate::mode_pages::ALL_PAGES;

        if page == 1 || page == ALL_PAGES {
            pages.insert(1, StorageCommon::add_read_write_error_recovery_page(changeable));
        }
        if page == 2 || page == ALL_PAGES {
            pages.insert(2, StorageCommon::add_disconnect_reconnect_page());
        }
        if page == 0x0a || page == ALL_PAGES {
            pages.insert(0x0a, StorageCommon::add_control_mode_page());
        }
        if page == 0x0f || page == ALL_PAGES {
            pages.insert(0x0f, vec![0u8; 16]);
        }
        if page == 0x10 || page == ALL_PAGES {
            let mut p = vec![0u8; 16];
            if !changeable {
                p[8] = 0b0100_0000;
                p[10] = 0b0001_0000;
            }
            pages.insert(0x10, p);
        }
        if page == 0x11 || page == ALL_PAGES {
            let mut p = vec![0u8; 8];
            if !changeable {
                p[4] = 0b1001_0000;
            }
            pages.insert(0x11, p);
        }
    }

    fn supports_mode_select(&self) -> bool {
        true
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
    use crate::factory::ReservationRegistry;
    use tempfile::NamedTempFile;

    fn opened_tape() -> (Tape, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 512]).unwrap();
        let mut tape = Tape::new(0, file.path().to_str().unwrap());
        let registry = ReservationRegistry::new();
        tape.open(file.path(), 1 << 20, &registry, 0, 0).unwrap();
        (tape, file)
    }

    #[test]
    fn rewind_resets_positions() {
        let (mut tape, _file) = opened_tape();
        tape.tape_position = 123;
        tape.object_location = 4;
        tape.reset_positions();
        assert_eq!(tape.tape_position, 0);
        assert_eq!(tape.object_location, 0);
    }

    #[test]
    fn write_then_read_round_trips_a_record() {
        let (mut tape, _file) = opened_tape();
        let payload: Vec<u8> = (0..37u32).map(|b| b as u8).collect();

        let cdb_write = [0x0a, 0, 0, 0, 37, 0];
        let len = tape.write(&cdb_write, false).unwrap();
        assert_eq!(len, 37);
        tape.finish_write(&payload).unwrap();
        assert_eq!(tape.tape_position, simh::pad(37) as i64 + 8);

        tape.reset_positions();
        let cdb_read = [0x08, 0, 0, 0, 37, 0];
        let out = tape.read(&cdb_read, false).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn write_filemarks_then_space_over_them() {
        let (mut tape, _file) = opened_tape();
        let cdb = [0x10, 0, 0, 6, 0, 0];
        tape.write_filemarks(&cdb, false).unwrap();

        let space_forward = [0x11, 0b001, 0, 0, 1, 0];
        tape.space6(&space_forward).unwrap();
        assert_eq!(tape.tape_position, 4);
        assert_eq!(tape.object_location, 1);
    }

    #[test]
    fn tar_compat_locate_is_arithmetic() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 4096]).unwrap();
        let path = file.path().with_extension("tar");
        std::fs::copy(file.path(), &path).unwrap();
        let mut tape = Tape::new(0, path.to_str().unwrap());
        let registry = ReservationRegistry::new();
        tape.open(&path, 4096, &registry, 0, 0).unwrap();
        assert!(tape.tar_file);

        let cdb = [0x2b, 0, 0, 0, 0, 2, 0, 0, 0, 0];
        assert!(tape.locate(&cdb, false).unwrap());
        assert_eq!(tape.object_location, 2);
        std::fs::remove_file(&path).ok();
    }
}
