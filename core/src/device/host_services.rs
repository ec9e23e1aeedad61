//! Host Services device: schedules server/Pi shutdown via START STOP UNIT,
//! and tunnels management-protocol commands over EXECUTE OPERATION /
//! RECEIVE OPERATION RESULTS (spec.md section 4.9). Mirrors `HostServices`
//! in the original implementation.

use super::primary::opcode;
use super::DeviceCommon;
use crate::error::{Asc, ScsiException, ScsiResult, SenseKey};
use crate::mode_pages::ModePageSource;
use crate::pb::PbDeviceType;
use chrono::{Datelike, Timelike};
use std::collections::{BTreeMap, BTreeSet};

/// What this device asked the servicing loop to do after START STOP UNIT,
/// per spec.md section 4.9's shutdown modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    StopServer,
    StopHost,
    RestartHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationFormat {
    Binary,
    Json,
    Text,
}

pub struct HostServices {
    pub common: DeviceCommon,
    pending: BTreeMap<i32, (OperationFormat, Vec<u8>)>,
    results: BTreeMap<i32, (OperationFormat, Vec<u8>)>,
    scheduled_shutdown: Option<ShutdownMode>,
}

impl HostServices {
    pub fn new(lun: i32) -> Self {
        let mut common = DeviceCommon::new(PbDeviceType::Schs, 0, lun);
        common.set_product_data("", "Host Services", "", true);
        common.set_scsi_level(super::primary::SCSI_LEVEL_SCSI_2);
        common.ready = true;

        Self { common, pending: BTreeMap::new(), results: BTreeMap::new(), scheduled_shutdown: None }
    }

    pub fn take_scheduled_shutdown(&mut self) -> Option<ShutdownMode> {
        self.scheduled_shutdown.take()
    }

    /// START STOP UNIT: `start`/`load_eject` are CDB byte 4 bits 0 and 1.
    pub fn start_stop_unit(&mut self, start: bool, load_eject: bool) -> ScsiResult<()> {
        match (start, load_eject) {
            (false, _) => {
                self.scheduled_shutdown = Some(if load_eject { ShutdownMode::StopHost } else { ShutdownMode::StopServer });
                Ok(())
            }
            (true, true) => {
                self.scheduled_shutdown = Some(ShutdownMode::RestartHost);
                Ok(())
            }
            (true, false) => Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb)),
        }
    }

    /// EXECUTE OPERATION: validates the format bits (exactly one of
    /// BIN/JSON/TEXT in CDB byte 1 bits 0-2) and the transfer length,
    /// returning the length to request for the DATA OUT phase.
    pub fn execute_operation(&mut self, cdb: &[u8], initiator_id: i32) -> ScsiResult<u32> {
        self.results.remove(&initiator_id);

        let format = match cdb[1] & 0x07 {
            0b001 => OperationFormat::Binary,
            0b010 => OperationFormat::Json,
            0b100 => OperationFormat::Text,
            _ => return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb)),
        };

        let length = crate::codec::get_u32(cdb, 6);
        if length == 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        self.pending.insert(initiator_id, (format, Vec::new()));
        self.pending.get_mut(&initiator_id).unwrap().0 = format;
        Ok(length)
    }

    /// Stores the received payload for later dispatch; returns the request
    /// so the caller (the controller, wired to the command dispatcher) can
    /// run it and hand the serialized result back via [`store_result`].
    pub fn finish_execute_operation(&mut self, initiator_id: i32, data: &[u8]) -> Option<(OperationFormat, Vec<u8>)> {
        let format = self.pending.remove(&initiator_id)?.0;
        Some((format, data.to_vec()))
    }

    pub fn store_result(&mut self, initiator_id: i32, format: OperationFormat, data: Vec<u8>) {
        self.results.insert(initiator_id, (format, data));
    }

    /// RECEIVE OPERATION RESULTS: returns the serialized result for
    /// `initiator_id`, removing it. Errors if no result is available.
    pub fn receive_operation_results(&mut self, initiator_id: i32) -> ScsiResult<Vec<u8>> {
        self.results
            .remove(&initiator_id)
            .map(|(_, data)| data)
            .ok_or_else(|| ScsiException::new(SenseKey::AbortedCommand, Asc::DataCurrentlyUnavailable))
    }

    pub fn mode_sense_rejects_block_descriptor(cdb: &[u8]) -> bool {
        cdb[3] != 0 || cdb[1] & 0x08 == 0
    }
}

impl ModePageSource for HostServices {
    /// Mode page 0x20: real-time clock. `(major, minor, year, month, day,
    /// hour, minute, second)` sourced from the host clock; seconds clamp to
    /// 59 on a leap second, as the original does.
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        use crate::mode_pages::ALL_PAGES;
        if (page == 0x20 || page == ALL_PAGES) && !changeable {
            let now = chrono::Local::now();
            let mut p = vec![0u8; 10];
            p[0] = 1; // major version
            p[2] = (now.year() - 1900).clamp(0, 255) as u8;
            p[3] = now.month0() as u8;
            p[4] = now.day() as u8;
            p[5] = now.hour() as u8;
            p[6] = now.minute() as u8;
            p[7] = (now.second() as u8).min(59);
            pages.insert(0x20, p);
        }
    }

    fn supports_mode_select(&self) -> bool {
        false
    }

    fn vendor(&self) -> &str {
        &self.common.vendor
    }

    fn product(&self) -> &str {
        &self.common.product
    }
}

pub const START_STOP_UNIT_OPCODE: u8 = opcode::START_STOP_UNIT;

/// At most one Host Services device may be attached per target (enforced by
/// `factory::is_unique_device_type`); this set exists so callers assembling
/// a target's LUN table can check before attaching.
pub fn existing_unique_types() -> BTreeSet<PbDeviceType> {
    BTreeSet::from([PbDeviceType::Schs])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_schedules_shutdown() {
        let mut hs = HostServices::new(0);
        hs.start_stop_unit(false, false).unwrap();
        assert_eq!(hs.take_scheduled_shutdown(), Some(ShutdownMode::StopServer));
        assert_eq!(hs.take_scheduled_shutdown(), None);
    }

    #[test]
    fn start_stop_load_without_start_stops_host() {
        let mut hs = HostServices::new(0);
        hs.start_stop_unit(false, true).unwrap();
        assert_eq!(hs.take_scheduled_shutdown(), Some(ShutdownMode::StopHost));
    }

    #[test]
    fn start_without_load_is_illegal() {
        let mut hs = HostServices::new(0);
        assert!(hs.start_stop_unit(true, false).is_err());
    }

    #[test]
    fn execute_operation_requires_single_format_bit() {
        let mut hs = HostServices::new(0);
        let cdb = [opcode::EXECUTE_OPERATION, 0b011, 0, 0, 0, 0, 0, 0, 0, 16];
        assert!(hs.execute_operation(&cdb, 0).is_err());
    }

    #[test]
    fn receive_without_result_is_unavailable() {
        let mut hs = HostServices::new(0);
        assert!(hs.receive_operation_results(0).is_err());
    }

    #[test]
    fn round_trips_a_stored_result() {
        let mut hs = HostServices::new(0);
        let cdb = [opcode::EXECUTE_OPERATION, 0b010, 0, 0, 0, 0, 0, 0, 0, 16];
        let len = hs.execute_operation(&cdb, 7).unwrap();
        assert_eq!(len, 16);
        let req = hs.finish_execute_operation(7, b"{}").unwrap();
        assert_eq!(req.0, OperationFormat::Json);
        hs.store_result(7, req.0, b"result".to_vec());
        assert_eq!(hs.receive_operation_results(7).unwrap(), b"result");
    }
}
