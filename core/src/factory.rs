//! Device type resolution by file extension or keyword, and the
//! process-wide reserved-file registry (spec.md section 4.11). Mirrors
//! `DeviceFactory` and `StorageDevice::reserved_files` in the original
//! implementation.

use crate::device::disk::{Disk, DiskVariant};
use crate::device::generic::ScsiGeneric;
use crate::device::host_services::HostServices;
use crate::device::printer::Printer;
use crate::device::tape::Tape;
use crate::device::DeviceKind;
use crate::pb::PbDeviceType;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Process-wide mapping `filename -> (id, lun)`, preventing two devices
/// from opening the same backing file concurrently.
#[derive(Debug, Clone, Default)]
pub struct ReservationRegistry {
    inner: Arc<Mutex<BTreeMap<PathBuf, (i32, i32)>>>,
}

impl ReservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `filename` for `(id, lun)`. Returns `false` if it is
    /// already reserved by a *different* `(id, lun)` pair.
    pub fn reserve(&self, filename: &Path, id: i32, lun: i32) -> bool {
        let mut map = self.inner.lock();
        match map.get(filename) {
            Some(&(owner_id, owner_lun)) if (owner_id, owner_lun) != (id, lun) => false,
            _ => {
                map.insert(filename.to_path_buf(), (id, lun));
                true
            }
        }
    }

    pub fn unreserve(&self, filename: &Path) {
        self.inner.lock().remove(filename);
    }

    pub fn ids_for(&self, filename: &Path) -> Option<(i32, i32)> {
        self.inner.lock().get(filename).copied()
    }

    /// Snapshot used to save/restore registry state around a dry-run pass
    /// (spec.md section 4.12).
    pub fn snapshot(&self) -> BTreeMap<PathBuf, (i32, i32)> {
        self.inner.lock().clone()
    }

    pub fn restore(&self, snapshot: BTreeMap<PathBuf, (i32, i32)>) {
        *self.inner.lock() = snapshot;
    }
}

/// Keyword -> type mapping for filenames with no extension (`"printer"`,
/// `"services"`, ...), and mutable extension -> type mapping.
pub struct DeviceFactory {
    keyword_mapping: BTreeMap<&'static str, PbDeviceType>,
    extension_mapping: BTreeMap<String, PbDeviceType>,
}

impl Default for DeviceFactory {
    fn default() -> Self {
        let mut keyword_mapping = BTreeMap::new();
        keyword_mapping.insert("daynaport", PbDeviceType::Scdp);
        keyword_mapping.insert("printer", PbDeviceType::Sclp);
        keyword_mapping.insert("services", PbDeviceType::Schs);

        let mut extension_mapping = BTreeMap::new();
        for ext in ["hd1", "hds", "hda"] {
            extension_mapping.insert(ext.to_string(), PbDeviceType::Schd);
        }
        extension_mapping.insert("hdr".to_string(), PbDeviceType::Scrm);
        for ext in ["iso", "cdr", "toast", "is1"] {
            extension_mapping.insert(ext.to_string(), PbDeviceType::Sccd);
        }
        for ext in ["tar", "tap"] {
            extension_mapping.insert(ext.to_string(), PbDeviceType::Sctp);
        }
        extension_mapping.insert("mos".to_string(), PbDeviceType::Scmo);

        Self { keyword_mapping, extension_mapping }
    }
}

impl DeviceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extension_mapping(&self) -> &BTreeMap<String, PbDeviceType> {
        &self.extension_mapping
    }

    /// New extensions can be added but not overridden, per spec.md section
    /// 4.11.
    pub fn add_extension_mapping(&mut self, extension: &str, device_type: PbDeviceType) -> bool {
        if self.extension_mapping.contains_key(extension) {
            false
        } else {
            self.extension_mapping.insert(extension.to_string(), device_type);
            true
        }
    }

    pub fn type_for_file(&self, filename: &str) -> Option<PbDeviceType> {
        let stem = Path::new(filename).file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if let Some(&t) = self.keyword_mapping.get(stem) {
            return Some(t);
        }
        let extension = Path::new(filename).extension().and_then(|e| e.to_str())?;
        self.extension_mapping.get(extension).copied()
    }

    /// Constructs the concrete device for `device_type` (resolving it from
    /// `filename` first if `device_type` is `Undefined`).
    pub fn create_device(&self, device_type: PbDeviceType, lun: i32, filename: &str) -> Option<DeviceKind> {
        let resolved = if device_type == PbDeviceType::Undefined {
            self.type_for_file(filename)?
        } else {
            device_type
        };

        let variant = match resolved {
            PbDeviceType::Schd => {
                if filename.ends_with(".hda") {
                    DiskVariant::HdApple
                } else {
                    DiskVariant::Hd
                }
            }
            PbDeviceType::Scrm => DiskVariant::Removable,
            PbDeviceType::Sccd => DiskVariant::Cd,
            PbDeviceType::Scmo => DiskVariant::Mo,
            PbDeviceType::Sahd => DiskVariant::SasiHd,
            PbDeviceType::Sctp => return Some(DeviceKind::Tape(Tape::new(lun, filename))),
            PbDeviceType::Sclp => return Some(DeviceKind::Printer(Printer::new(lun))),
            PbDeviceType::Schs => return Some(DeviceKind::HostServices(HostServices::new(lun))),
            PbDeviceType::Scsg => return Some(DeviceKind::Generic(ScsiGeneric::new(lun))),
            PbDeviceType::Scdp | PbDeviceType::Undefined => return None,
        };

        Some(DeviceKind::Disk(Disk::new(lun, variant)))
    }
}

/// At most one Host Services (and, were it implemented, DaynaPort) device
/// may be attached per target.
pub fn is_unique_device_type(t: PbDeviceType) -> bool {
    matches!(t, PbDeviceType::Schs | PbDeviceType::Scdp)
}

/// Maximum LUN (exclusive) for a device type: SASI HD is limited to 2 LUNs,
/// everything else to 32.
pub fn lun_max(t: PbDeviceType) -> i32 {
    if t == PbDeviceType::Sahd { 2 } else { 32 }
}
