//! SCSI Generic (SG) passthrough: forwards CDBs to a real `/dev/sg*` (or
//! block) device via `SG_IO`, rather than emulating a device family.
//! Mirrors `ScsiGeneric` in the original implementation.

use super::DeviceCommon;
use crate::error::{Asc, IoError, ScsiException, ScsiResult, SenseKey};
use crate::pb::PbDeviceType;
use nix::ioctl_readwrite;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_TRANSFER_LENGTH: usize = 65536;
const TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);
const TIMEOUT_FORMAT: Duration = Duration::from_secs(120);

const SG_IO_MAGIC: u8 = b'S';
const SG_IO_NR: u8 = 0x85;

/// Mirrors the kernel's `struct sg_io_hdr` (see `<scsi/sg.h>`), just the
/// fields this core populates.
#[repr(C)]
struct SgIoHdr {
    interface_id: i32,
    dxfer_direction: i32,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: *mut std::ffi::c_void,
    cmdp: *mut u8,
    sbp: *mut u8,
    timeout: u32,
    flags: u32,
    pack_id: i32,
    usr_ptr: *mut std::ffi::c_void,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

const SG_DXFER_NONE: i32 = -1;
const SG_DXFER_TO_DEV: i32 = -2;
const SG_DXFER_FROM_DEV: i32 = -3;

ioctl_readwrite!(sg_io, SG_IO_MAGIC, SG_IO_NR, SgIoHdr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    ToDevice,
    FromDevice,
}

pub struct ScsiGeneric {
    pub common: DeviceCommon,
    device_path: Option<PathBuf>,
    file: Option<File>,
    block_size: u32,
}

impl ScsiGeneric {
    pub fn new(lun: i32) -> Self {
        let mut common = DeviceCommon::new(PbDeviceType::Scsg, 0, lun);
        common.set_product_data("", "", "", true);
        Self { common, device_path: None, file: None, block_size: 512 }
    }

    pub fn open(&mut self, device_path: &Path) -> ScsiResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|_| ScsiException::new(SenseKey::NotReady, Asc::MediumNotPresent))?;
        self.device_path = Some(device_path.to_path_buf());
        self.file = Some(file);
        self.common.ready = true;
        Ok(())
    }

    fn file(&self) -> ScsiResult<&File> {
        self.file.as_ref().ok_or_else(|| ScsiException::new(SenseKey::NotReady, Asc::MediumNotPresent))
    }

    /// Forwards `cdb` through `SG_IO`, transferring `buffer` in the
    /// direction given by `direction`. Returns the sense buffer the kernel
    /// filled in (empty on success).
    pub fn dispatch(&self, cdb: &[u8], direction: Direction, buffer: &mut [u8]) -> ScsiResult<Vec<u8>> {
        if buffer.len() > MAX_TRANSFER_LENGTH {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        let fd = self.file()?.as_raw_fd();
        let mut cdb_buf = cdb.to_vec();
        let mut sense = vec![0u8; 32];

        let timeout = if cdb.first() == Some(&0x04) { TIMEOUT_FORMAT } else { TIMEOUT_DEFAULT };

        let mut hdr = SgIoHdr {
            interface_id: i32::from(b'S'),
            dxfer_direction: match direction {
                Direction::None => SG_DXFER_NONE,
                Direction::ToDevice => SG_DXFER_TO_DEV,
                Direction::FromDevice => SG_DXFER_FROM_DEV,
            },
            cmd_len: cdb_buf.len() as u8,
            mx_sb_len: sense.len() as u8,
            iovec_count: 0,
            dxfer_len: buffer.len() as u32,
            dxferp: if buffer.is_empty() { std::ptr::null_mut() } else { buffer.as_mut_ptr().cast() },
            cmdp: cdb_buf.as_mut_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: timeout.as_millis() as u32,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        // SAFETY: `hdr` and the buffers it points at (`cdb_buf`, `sense`,
        // `buffer`) all outlive this call.
        unsafe { sg_io(fd, &mut hdr as *mut SgIoHdr) }
            .map_err(|e| ScsiException::from(IoError::msg(format!("SG_IO failed: {e}"))))?;

        if hdr.status != 0 {
            sense.truncate(hdr.sb_len_wr as usize);
            return Err(if hdr.sb_len_wr > 2 {
                deferred_sense(&sense)
            } else {
                ScsiException::new(SenseKey::AbortedCommand, Asc::InternalTargetFailure)
            });
        }

        Ok(Vec::new())
    }

    /// Tracks the block size the generic device reports (updated whenever
    /// a READ CAPACITY response is observed passing through).
    pub fn update_block_size(&mut self, block_size: u32) {
        if block_size != 0 {
            self.block_size = block_size;
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn identifier(&self) -> String {
        let path = self.device_path.as_deref().map(|p| p.display().to_string()).unwrap_or_default();
        format!("device ({path})")
    }
}

fn deferred_sense(sense: &[u8]) -> ScsiException {
    let sense_key = sense.get(2).map(|b| b & 0x0f).unwrap_or(0);
    let key = match sense_key {
        0x2 => SenseKey::NotReady,
        0x3 => SenseKey::MediumError,
        0x5 => SenseKey::IllegalRequest,
        0x6 => SenseKey::UnitAttention,
        0x7 => SenseKey::DataProtect,
        0xb => SenseKey::AbortedCommand,
        _ => SenseKey::HardwareError,
    };
    ScsiException::new(key, Asc::InternalTargetFailure)
}

impl From<IoError> for ScsiException {
    fn from(_: IoError) -> Self {
        ScsiException::new(SenseKey::HardwareError, Asc::InternalTargetFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_includes_device_path() {
        let mut g = ScsiGeneric::new(0);
        g.device_path = Some(PathBuf::from("/dev/sg3"));
        assert_eq!(g.identifier(), "device (/dev/sg3)");
    }

    #[test]
    fn dispatch_rejects_oversized_buffer() {
        let g = ScsiGeneric::new(0);
        let mut buf = vec![0u8; MAX_TRANSFER_LENGTH + 1];
        assert!(g.dispatch(&[0x12, 0, 0, 0, 36, 0], Direction::FromDevice, &mut buf).is_err());
    }

    #[test]
    fn block_size_updates_on_nonzero_value() {
        let mut g = ScsiGeneric::new(0);
        g.update_block_size(2048);
        assert_eq!(g.block_size(), 2048);
        g.update_block_size(0);
        assert_eq!(g.block_size(), 2048);
    }
}
