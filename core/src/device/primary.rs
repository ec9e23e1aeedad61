//! Base SCSI primary commands shared by every device family: TEST UNIT
//! READY, INQUIRY, REQUEST SENSE, REPORT LUNS, RESERVE/RELEASE, SEND
//! DIAGNOSTIC; and the per-device sense/reservation state they operate on.
//! Mirrors `PrimaryDevice` in the original implementation (whose source was
//! not included in the retrieved pack; reconstructed from spec.md section
//! 4.5 and its callers in `storage_device.cpp`/`disk.cpp`/`tape.cpp`).

use crate::codec;
use crate::error::{Asc, ScsiException, ScsiResult, SenseKey};
use crate::pb::PbDeviceType;

/// SCSI opcodes used across device families. Not every device recognizes
/// every opcode here; dispatch tables are per device kind (controller.rs).
pub mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const FORMAT_UNIT: u8 = 0x04;
    pub const READ_BLOCK_LIMITS: u8 = 0x05;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0a;
    pub const SEEK_6: u8 = 0x0b;
    pub const WRITE_FILEMARKS_6: u8 = 0x10;
    pub const SPACE_6: u8 = 0x11;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const RESERVE_6: u8 = 0x16;
    pub const RELEASE_6: u8 = 0x17;
    pub const ERASE_6: u8 = 0x19;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const START_STOP_UNIT: u8 = 0x1b;
    pub const SEND_DIAGNOSTIC: u8 = 0x1d;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
    pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
    pub const SEEK_10: u8 = 0x2b;
    pub const LOCATE_10: u8 = 0x2b;
    pub const VERIFY_10: u8 = 0x2f;
    pub const READ_LONG_10: u8 = 0x3e;
    pub const WRITE_LONG_10: u8 = 0x3f;
    pub const READ_TOC: u8 = 0x43;
    pub const READ_POSITION: u8 = 0x34;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const RESERVE_10: u8 = 0x56;
    pub const RELEASE_10: u8 = 0x57;
    pub const MODE_SENSE_10: u8 = 0x5a;
    pub const LOCATE_16: u8 = 0x92;
    pub const REPORT_LUNS: u8 = 0xa0;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8a;
    pub const VERIFY_16: u8 = 0x8f;
    pub const READ_CAPACITY_16: u8 = 0x9e;
    pub const EXECUTE_OPERATION: u8 = 0xc0;
    pub const RECEIVE_OPERATION_RESULTS: u8 = 0xc1;

    /// Printer device opcodes. Numerically identical to opcodes used by
    /// other device families (e.g. PRINT == WRITE_6); meaning is
    /// per-device-kind, as in the original's per-device command tables.
    pub const PRINT: u8 = 0x0a;
    pub const SYNCHRONIZE_BUFFER: u8 = 0x10;
    pub const STOP_PRINT: u8 = 0x1b;
}

/// CDB field accessors, mirroring `PrimaryDevice::GetCdbByte/Int16/...`.
pub fn cdb_byte(cdb: &[u8], index: usize) -> u8 {
    cdb[index]
}

pub fn cdb_int16(cdb: &[u8], offset: usize) -> i32 {
    codec::get_u16(cdb, offset) as i32
}

pub fn cdb_int24(cdb: &[u8], offset: usize) -> i32 {
    codec::get_u24(cdb, offset) as i32
}

pub fn cdb_int32(cdb: &[u8], offset: usize) -> i32 {
    codec::get_u32(cdb, offset) as i32
}

pub fn cdb_int64(cdb: &[u8], offset: usize) -> i64 {
    codec::get_u64(cdb, offset) as i64
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SenseState {
    pub sense_key: Option<SenseKey>,
    pub asc: Asc,
    pub ascq: u8,
    pub information: Option<u32>,
    pub filemark: bool,
    pub eom: bool,
    pub ili: bool,
}

impl Default for Asc {
    fn default() -> Self {
        Asc::NoAdditionalSenseInformation
    }
}

impl SenseState {
    pub fn clear(&mut self) {
        *self = SenseState::default();
    }

    pub fn latch(&mut self, e: &ScsiException) {
        self.sense_key = Some(e.sense_key);
        self.asc = e.asc;
        self.ascq = e.ascq;
        self.information = e.information;
        self.filemark = e.filemark;
        self.eom = e.eom;
        self.ili = e.ili;
    }
}

#[derive(Debug, Clone)]
pub struct DeviceCommon {
    pub id: i32,
    pub lun: i32,
    pub device_type: PbDeviceType,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub scsi_level: i32,
    pub removable: bool,
    pub ready: bool,
    pub reserved_by: Option<i32>,
    pub unit_attention: bool,
    pub sense: SenseState,
}

/// SPC-3, the default level for most device kinds here.
pub const SCSI_LEVEL_SPC_3: i32 = 5;
pub const SCSI_LEVEL_SCSI_2: i32 = 2;

const DEFAULT_VENDOR: &str = "SCSI2Pi";

impl DeviceCommon {
    pub fn new(device_type: PbDeviceType, id: i32, lun: i32) -> Self {
        Self {
            id,
            lun,
            device_type,
            vendor: DEFAULT_VENDOR.to_string(),
            product: String::new(),
            revision: "0100".to_string(),
            scsi_level: SCSI_LEVEL_SCSI_2,
            removable: false,
            ready: false,
            reserved_by: None,
            unit_attention: true,
            sense: SenseState::default(),
        }
    }

    /// Sets vendor/product/revision. `use_default_vendor` fills in the
    /// `"SCSI2Pi"` vendor when the caller passes an empty string, mirroring
    /// `PrimaryDevice::SetProductData`.
    pub fn set_product_data(&mut self, vendor: &str, product: &str, revision: &str, use_default_vendor: bool) {
        self.vendor = if vendor.is_empty() && use_default_vendor {
            DEFAULT_VENDOR.to_string()
        } else {
            vendor.to_string()
        };
        self.product = product.to_string();
        if !revision.is_empty() {
            self.revision = revision.to_string();
        }
    }

    pub fn set_scsi_level(&mut self, level: i32) {
        self.scsi_level = level;
    }

    pub fn raise_unit_attention(&mut self) {
        self.unit_attention = true;
    }

    /// Checked once before dispatching any command other than INQUIRY or
    /// REQUEST SENSE; returns (and clears) the latent unit-attention
    /// condition, if any.
    pub fn take_unit_attention(&mut self) -> Option<ScsiException> {
        if self.unit_attention {
            self.unit_attention = false;
            Some(ScsiException::new(SenseKey::UnitAttention, Asc::PowerOnOrReset))
        } else {
            None
        }
    }

    pub fn check_ready(&self) -> ScsiResult<()> {
        if self.ready {
            Ok(())
        } else {
            Err(ScsiException::new(SenseKey::NotReady, Asc::MediumNotPresent))
        }
    }

    pub fn check_reservation(&self, initiator_id: i32) -> ScsiResult<()> {
        match self.reserved_by {
            Some(owner) if owner != initiator_id => Err(ScsiException::reservation_conflict()),
            _ => Ok(()),
        }
    }

    pub fn reserve(&mut self, initiator_id: i32) -> ScsiResult<()> {
        self.check_reservation(initiator_id)?;
        self.reserved_by = Some(initiator_id);
        Ok(())
    }

    pub fn release(&mut self, initiator_id: i32) {
        if self.reserved_by == Some(initiator_id) {
            self.reserved_by = None;
        }
    }

    /// INQUIRY: 36-byte response. `evpd`/`page_code` must both be
    /// zero/absent; a non-existent LUN is signalled by `lun_exists == false`,
    /// which forces device type `0x7f` per spec.md section 4.5.
    pub fn handle_inquiry(&self, evpd: bool, page_code: u8, lun_exists: bool) -> ScsiResult<[u8; 36]> {
        if evpd || page_code != 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        let mut buf = [0u8; 36];
        buf[0] = if lun_exists { device_type_code(self.device_type) } else { 0x7f };
        buf[1] = if self.removable { 0x80 } else { 0x00 };
        buf[2] = self.scsi_level as u8;
        buf[3] = 0x02; // response data format
        buf[4] = 0x1f; // additional length
        write_padded(&mut buf[8..16], &self.vendor);
        write_padded(&mut buf[16..32], &self.product);
        write_padded(&mut buf[32..36], &self.revision);
        Ok(buf)
    }

    /// REQUEST SENSE: 18-byte extended format (allocation length is
    /// enforced by the caller, which truncates). Clears sense on success.
    pub fn handle_request_sense(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 18];
        buf[0] = 0x70; // current errors, extended format
        let sense_key = self.sense.sense_key.unwrap_or(SenseKey::NoSense);
        buf[2] = sense_key as u8;
        if self.sense.filemark {
            buf[2] |= 0x80;
        }
        if self.sense.eom {
            buf[2] |= 0x40;
        }
        if self.sense.ili {
            buf[2] |= 0x20;
        }
        if let Some(info) = self.sense.information {
            buf[0] |= 0x80;
            codec::set_u32(&mut buf, 3, info);
        }
        buf[7] = 10; // additional sense length
        buf[12] = self.sense.asc as u8;
        buf[13] = self.sense.ascq;
        self.sense.clear();
        buf
    }

    /// SASI HD's reduced 4-byte non-extended REQUEST SENSE form.
    pub fn handle_request_sense_sasi(&mut self) -> [u8; 4] {
        let sense_key = self.sense.sense_key.unwrap_or(SenseKey::NoSense);
        let buf = [sense_key as u8, (self.lun as u8) << 5, 0, 0];
        self.sense.clear();
        buf
    }

    /// SASI HD's 2-byte INQUIRY.
    pub fn handle_inquiry_sasi(&self) -> [u8; 2] {
        [0, 0]
    }

    pub fn handle_report_luns(&self, existing_luns: &[i32], select_report: u8) -> ScsiResult<Vec<u8>> {
        if select_report != 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }
        let mut buf = vec![0u8; 8 + existing_luns.len() * 8];
        codec::set_u32(&mut buf, 0, (existing_luns.len() * 8) as u32);
        for (i, lun) in existing_luns.iter().enumerate() {
            buf[8 + i * 8 + 1] = *lun as u8;
        }
        Ok(buf)
    }

    pub fn handle_send_diagnostic(&self, parameter_list_length: u16) -> ScsiResult<()> {
        if parameter_list_length != 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }
        Ok(())
    }
}

fn write_padded(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in dst[n..].iter_mut() {
        *b = b' ';
    }
}

fn device_type_code(t: PbDeviceType) -> u8 {
    use PbDeviceType::*;
    match t {
        Schd | Scrm | Sahd => 0x00,
        Sccd => 0x05,
        Scmo => 0x07,
        Sctp => 0x01,
        Schs => 0x03,
        Sclp => 0x03,
        Scdp => 0x03,
        Scsg => 0x00,
        Undefined => 0x1f,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_shape() {
        let mut d = DeviceCommon::new(PbDeviceType::Schd, 0, 0);
        d.set_product_data("", "SCSI HD", "1.0", true);
        let buf = d.handle_inquiry(false, 0, true).unwrap();
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[4], 0x1f);
        assert_eq!(&buf[8..16], b"SCSI2Pi ");
    }

    #[test]
    fn non_existent_lun_returns_7f() {
        let d = DeviceCommon::new(PbDeviceType::Schd, 0, 1);
        let buf = d.handle_inquiry(false, 0, false).unwrap();
        assert_eq!(buf[0], 0x7f);
    }

    #[test]
    fn request_sense_clears_after_read() {
        let mut d = DeviceCommon::new(PbDeviceType::Schd, 0, 0);
        d.sense.latch(&ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        let buf = d.handle_request_sense();
        assert_eq!(buf[2] & 0x0f, SenseKey::IllegalRequest as u8);
        let buf2 = d.handle_request_sense();
        assert_eq!(buf2[2] & 0x0f, SenseKey::NoSense as u8);
    }

    #[test]
    fn unit_attention_fires_once() {
        let mut d = DeviceCommon::new(PbDeviceType::Schd, 0, 0);
        assert!(d.take_unit_attention().is_some());
        assert!(d.take_unit_attention().is_none());
    }

    #[test]
    fn reservation_conflict_for_other_initiator() {
        let mut d = DeviceCommon::new(PbDeviceType::Schd, 0, 0);
        d.reserve(0).unwrap();
        assert!(d.check_reservation(1).is_err());
        assert!(d.check_reservation(0).is_ok());
    }
}
