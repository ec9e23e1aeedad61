//! SCSI printer: buffers PRINT data into a temp file, hands it to an
//! external print command on SYNCHRONIZE BUFFER. Mirrors `Printer` in the
//! original implementation.

use super::primary::opcode;
use super::DeviceCommon;
use crate::codec;
use crate::error::{Asc, ScsiException, ScsiResult, SenseKey};
use crate::pb::PbDeviceType;
use std::collections::BTreeMap;
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

const DEFAULT_CMD: &str = "lp -oraw %f";
const CMD_PARAM: &str = "cmd";

pub struct Printer {
    pub common: DeviceCommon,
    params: BTreeMap<String, String>,
    file: Option<NamedTempFile>,
    file_print_count: u64,
    byte_receive_count: u64,
    print_error_count: u64,
    print_warning_count: u64,
    pending_length: u32,
}

impl Printer {
    pub fn new(lun: i32) -> Self {
        let mut common = DeviceCommon::new(PbDeviceType::Sclp, 0, lun);
        common.set_product_data("", "SCSI PRINTER", "", true);
        common.set_scsi_level(super::primary::SCSI_LEVEL_SCSI_2);
        common.ready = true;

        let mut params = BTreeMap::new();
        params.insert(CMD_PARAM.to_string(), DEFAULT_CMD.to_string());

        Self {
            common,
            params,
            file: None,
            file_print_count: 0,
            byte_receive_count: 0,
            print_error_count: 0,
            print_warning_count: 0,
            pending_length: 0,
        }
    }

    /// Validates and stores device params. Requires a `cmd` param with a
    /// `%f` placeholder, defaulting to `"lp -oraw %f"`.
    pub fn set_params(&mut self, params: BTreeMap<String, String>) -> Result<(), String> {
        let cmd = params.get(CMD_PARAM).cloned().unwrap_or_else(|| DEFAULT_CMD.to_string());
        if !cmd.contains("%f") {
            return Err("Missing filename specifier '%f'".to_string());
        }
        self.params = params;
        self.params.entry(CMD_PARAM.to_string()).or_insert(cmd);
        Ok(())
    }

    fn cmd(&self) -> String {
        self.params.get(CMD_PARAM).cloned().unwrap_or_else(|| DEFAULT_CMD.to_string())
    }

    fn cleanup(&mut self) {
        self.file = None;
    }

    /// PRINT: validates the transfer length fits the caller's buffer and
    /// requests a DATA OUT phase of that length.
    pub fn print(&mut self, cdb: &[u8], buffer_capacity: usize) -> ScsiResult<u32> {
        let length = codec::get_u24(cdb, 2);
        if length as usize > buffer_capacity {
            self.print_error_count += 1;
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }
        Ok(length)
    }

    /// Appends received PRINT data to the (lazily created) buffer file.
    pub fn write_data(&mut self, cdb: &[u8], data: &[u8]) -> ScsiResult<()> {
        if cdb[0] != opcode::PRINT {
            return Err(ScsiException::new(SenseKey::AbortedCommand, Asc::InternalTargetFailure));
        }

        self.byte_receive_count += data.len() as u64;

        if self.file.is_none() {
            let file = tempfile::Builder::new()
                .prefix("s2p_printer_")
                .tempfile()
                .map_err(|_| printer_io_error(self))?;
            self.file = Some(file);
        }

        let file = self.file.as_mut().unwrap();
        file.write_all(data).map_err(|_| printer_io_error(self))?;
        Ok(())
    }

    /// SYNCHRONIZE BUFFER: runs the configured print command over the
    /// buffered file, then removes it.
    pub fn synchronize_buffer(&mut self) -> ScsiResult<()> {
        let Some(file) = self.file.take() else {
            self.print_warning_count += 1;
            return Err(ScsiException::new(SenseKey::AbortedCommand, Asc::IoProcessTerminated));
        };

        file.as_file().sync_all().ok();
        let path = file.path().to_string_lossy().into_owned();
        let cmd = self.cmd().replace("%f", &path);

        let status = Command::new("sh").arg("-c").arg(&cmd).status();
        drop(file);

        match status {
            Ok(s) if s.success() => {
                self.file_print_count += 1;
                Ok(())
            }
            _ => {
                self.print_error_count += 1;
                Err(ScsiException::new(SenseKey::AbortedCommand, Asc::IoProcessTerminated))
            }
        }
    }

    pub fn stop_print(&mut self) {}

    pub fn statistics(&self) -> PrinterStatistics {
        PrinterStatistics {
            file_print_count: self.file_print_count,
            byte_receive_count: self.byte_receive_count,
            print_error_count: self.print_error_count,
            print_warning_count: self.print_warning_count,
        }
    }
}

impl Drop for Printer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn printer_io_error(printer: &mut Printer) -> ScsiException {
    printer.print_error_count += 1;
    ScsiException::new(SenseKey::AbortedCommand, Asc::IoProcessTerminated)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrinterStatistics {
    pub file_print_count: u64,
    pub byte_receive_count: u64,
    pub print_error_count: u64,
    pub print_warning_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_cmd_without_placeholder() {
        let mut printer = Printer::new(0);
        let mut params = BTreeMap::new();
        params.insert(CMD_PARAM.to_string(), "lp -oraw".to_string());
        assert!(printer.set_params(params).is_err());
    }

    #[test]
    fn print_rejects_oversized_transfer() {
        let printer_cdb = [0x0a, 0, 0, 0x10, 0, 0];
        let mut printer = Printer::new(0);
        assert!(printer.print(&printer_cdb, 4).is_err());
        assert_eq!(printer.statistics().print_error_count, 1);
    }

    #[test]
    fn synchronize_without_data_warns() {
        let mut printer = Printer::new(0);
        assert!(printer.synchronize_buffer().is_err());
        assert_eq!(printer.statistics().print_warning_count, 1);
    }

    #[test]
    fn write_then_synchronize_runs_command() {
        let mut printer = Printer::new(0);
        let mut params = BTreeMap::new();
        params.insert(CMD_PARAM.to_string(), "true %f".to_string());
        printer.set_params(params).unwrap();

        let cdb = [opcode::PRINT, 0, 0, 0, 5, 0];
        printer.write_data(&cdb, b"hello").unwrap();
        assert_eq!(printer.statistics().byte_receive_count, 5);

        printer.synchronize_buffer().unwrap();
        assert_eq!(printer.statistics().file_print_count, 1);
    }
}
