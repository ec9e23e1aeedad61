//! SIMH `.tap` record framing: the 4-byte little-endian tag that leads (and,
//! for data records, trails) every object in a tape image. Mirrors
//! `simh_util` in the original implementation bit-for-bit.

use crate::error::IoError;
use std::io::{Read, Write};

pub const META_DATA_SIZE: usize = 4;

/// High nibble of the packed tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimhClass {
    /// Tape mark (value 0) or good data record (value = byte length).
    TapeMarkOrGoodDataRecord,
    /// Bad data record: recovered with `value` bytes, or unrecovered if 0.
    BadDataRecord,
    /// A private marker; `value`'s low 24 bits carry [`PRIVATE_MARKER_MAGIC`]
    /// and the high byte's low nibble a private sub-type (end-of-data = 3).
    PrivateMarker,
    /// Reserved marker: [`SimhMarker::EraseGap`] or [`SimhMarker::EndOfMedium`].
    ReservedMarker,
    /// Classes 1-6 and 9-14: always a record, reserved for vendor use.
    Reserved(u8),
}

impl SimhClass {
    fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0 => SimhClass::TapeMarkOrGoodDataRecord,
            8 => SimhClass::BadDataRecord,
            7 => SimhClass::PrivateMarker,
            15 => SimhClass::ReservedMarker,
            n => SimhClass::Reserved(n),
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            SimhClass::TapeMarkOrGoodDataRecord => 0,
            SimhClass::BadDataRecord => 8,
            SimhClass::PrivateMarker => 7,
            SimhClass::ReservedMarker => 15,
            SimhClass::Reserved(n) => n,
        }
    }
}

/// Sentinel values carried by a [`SimhClass::ReservedMarker`] tag.
pub mod marker {
    pub const ERASE_GAP: u32 = 0xffffffe;
    pub const END_OF_MEDIUM: u32 = 0xfffffff;
}

/// Low 24 bits of a private end-of-data marker ("S2P" in the original).
pub const PRIVATE_MARKER_MAGIC: u32 = 0x00533250;
/// High nibble of byte 3 identifying the private marker as end-of-data.
pub const PRIVATE_MARKER_END_OF_DATA: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimhMetaData {
    pub class: SimhClass,
    pub value: u32,
}

impl SimhMetaData {
    pub fn filemark() -> Self {
        Self { class: SimhClass::TapeMarkOrGoodDataRecord, value: 0 }
    }

    pub fn good_data_record(length: u32) -> Self {
        Self { class: SimhClass::TapeMarkOrGoodDataRecord, value: length }
    }

    pub fn end_of_medium() -> Self {
        Self { class: SimhClass::ReservedMarker, value: marker::END_OF_MEDIUM }
    }

    pub fn erase_gap() -> Self {
        Self { class: SimhClass::ReservedMarker, value: marker::ERASE_GAP }
    }

    pub fn end_of_data_marker() -> Self {
        Self {
            class: SimhClass::PrivateMarker,
            value: (u32::from(PRIVATE_MARKER_END_OF_DATA) << 24) | PRIVATE_MARKER_MAGIC,
        }
    }

    /// A record, per the original's `IsRecord`: any class 0 with nonzero
    /// value, any recovered (nonzero-value) class 8, or any class 1-6/9-14.
    /// Markers (class 7, 15) and filemarks/unrecovered errors (zero value)
    /// are not records.
    pub fn is_record(&self) -> bool {
        match self.class {
            SimhClass::TapeMarkOrGoodDataRecord => self.value != 0,
            SimhClass::BadDataRecord => self.value != 0,
            SimhClass::PrivateMarker | SimhClass::ReservedMarker => false,
            SimhClass::Reserved(_) => true,
        }
    }

    pub fn is_filemark(&self) -> bool {
        matches!(self.class, SimhClass::TapeMarkOrGoodDataRecord) && self.value == 0
    }

    pub fn is_end_of_data(&self) -> bool {
        matches!(self.class, SimhClass::PrivateMarker) && self.value == self.end_of_data_value()
    }

    fn end_of_data_value(&self) -> u32 {
        (u32::from(PRIVATE_MARKER_END_OF_DATA) << 24) | PRIVATE_MARKER_MAGIC
    }

    pub fn is_end_of_medium(&self) -> bool {
        matches!(self.class, SimhClass::ReservedMarker) && self.value == marker::END_OF_MEDIUM
    }

    pub fn is_erase_gap(&self) -> bool {
        matches!(self.class, SimhClass::ReservedMarker) && self.value == marker::ERASE_GAP
    }
}

/// Packs a (class, value) pair into the 4-byte little-endian tag.
pub fn to_little_endian(meta: SimhMetaData) -> [u8; META_DATA_SIZE] {
    let packed = (meta.value & 0x0fff_ffff) | (u32::from(meta.class.to_nibble()) << 28);
    packed.to_le_bytes()
}

/// Unpacks a 4-byte little-endian tag into a (class, value) pair.
pub fn from_little_endian(bytes: [u8; META_DATA_SIZE]) -> SimhMetaData {
    let packed = u32::from_le_bytes(bytes);
    let class = SimhClass::from_nibble((packed >> 28) as u8);
    let value = packed & 0x0fff_ffff;
    SimhMetaData { class, value }
}

/// Pads `length` up to the next even number, as SIMH records are padded.
pub fn pad(length: u32) -> u32 {
    length + (length % 2)
}

/// Reads the next tag from `file`. EOF synthesizes an end-of-medium marker
/// (mirrors the original's `ReadMetaData`, which treats a clean EOF as the
/// tape having run off the end of the image rather than an I/O failure).
pub fn read_meta_data<R: Read>(file: &mut R) -> Result<SimhMetaData, IoError> {
    let mut bytes = [0u8; META_DATA_SIZE];
    match file.read_exact(&mut bytes) {
        Ok(()) => Ok(from_little_endian(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(SimhMetaData::end_of_medium()),
        Err(e) => Err(IoError::Io(e)),
    }
}

/// Writes a filemark tag (4 zero bytes).
pub fn write_filemark<W: Write>(file: &mut W) -> Result<(), IoError> {
    file.write_all(&to_little_endian(SimhMetaData::filemark()))?;
    Ok(())
}

/// Writes a good-data record: leading tag, payload, trailing tag. Does not
/// pad `data` itself; callers write padding bytes separately if `data.len()`
/// is odd.
pub fn write_good_data<W: Write>(file: &mut W, data: &[u8]) -> Result<(), IoError> {
    let tag = to_little_endian(SimhMetaData::good_data_record(data.len() as u32));
    file.write_all(&tag)?;
    file.write_all(data)?;
    if data.len() % 2 != 0 {
        file.write_all(&[0u8])?;
    }
    file.write_all(&tag)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn tag_round_trip() {
        let meta = SimhMetaData::good_data_record(1234);
        let bytes = to_little_endian(meta);
        assert_eq!(from_little_endian(bytes), meta);
    }

    #[test]
    fn pad_rounds_up_odd_lengths() {
        assert_eq!(pad(0), 0);
        assert_eq!(pad(1), 2);
        assert_eq!(pad(2), 2);
        assert_eq!(pad(7), 8);
    }

    #[test]
    fn classification() {
        assert!(SimhMetaData::good_data_record(10).is_record());
        assert!(!SimhMetaData::filemark().is_record());
        assert!(SimhMetaData::filemark().is_filemark());
        assert!(!SimhMetaData::end_of_medium().is_record());
        assert!(SimhMetaData::end_of_medium().is_end_of_medium());
        assert!(SimhMetaData::end_of_data_marker().is_end_of_data());
    }

    #[test]
    fn read_meta_data_synthesizes_eom_at_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let meta = read_meta_data(&mut cursor).unwrap();
        assert!(meta.is_end_of_medium());
    }

    #[test]
    fn write_good_data_pads_odd_payload() {
        let mut buf = Vec::new();
        write_good_data(&mut buf, &[1, 2, 3]).unwrap();
        // leading tag (4) + payload (3) + pad (1) + trailing tag (4)
        assert_eq!(buf.len(), 12);
        let leading = from_little_endian(buf[0..4].try_into().unwrap());
        let trailing = from_little_endian(buf[8..12].try_into().unwrap());
        assert_eq!(leading, trailing);
        assert_eq!(leading.value, 3);
    }
}
