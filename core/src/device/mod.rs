//! Device layer: the primary-command base, storage-device semantics, and
//! the concrete device families (spec.md sections 4.5-4.9).

pub mod disk;
pub mod generic;
pub mod host_services;
pub mod primary;
pub mod printer;
pub mod storage;
pub mod tape;

pub use primary::{DeviceCommon, SenseState};
pub use storage::{CachingMode, StorageCommon};

use crate::cache::Cache;
use crate::error::ScsiResult;
use crate::pb::PbDeviceType;

/// Tagged union over every concrete device family this core implements.
/// Replaces the original's inheritance chain with a mixin-data-plus-match
/// design, per spec.md section 9's design note.
pub enum DeviceKind {
    Disk(disk::Disk),
    Tape(tape::Tape),
    Printer(printer::Printer),
    HostServices(host_services::HostServices),
    Generic(generic::ScsiGeneric),
}

impl DeviceKind {
    pub fn common(&self) -> &DeviceCommon {
        match self {
            DeviceKind::Disk(d) => &d.common,
            DeviceKind::Tape(t) => &t.common,
            DeviceKind::Printer(p) => &p.common,
            DeviceKind::HostServices(h) => &h.common,
            DeviceKind::Generic(g) => &g.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut DeviceCommon {
        match self {
            DeviceKind::Disk(d) => &mut d.common,
            DeviceKind::Tape(t) => &mut t.common,
            DeviceKind::Printer(p) => &mut p.common,
            DeviceKind::HostServices(h) => &mut h.common,
            DeviceKind::Generic(g) => &mut g.common,
        }
    }

    pub fn device_type(&self) -> PbDeviceType {
        self.common().device_type
    }

    pub fn is_removable(&self) -> bool {
        match self {
            DeviceKind::Disk(d) => d.storage.protectable || d.variant_is_removable(),
            DeviceKind::Tape(_) => true,
            _ => false,
        }
    }

    /// Reservation filename, if this is a storage-backed device with an
    /// open image file.
    pub fn reserved_filename(&self) -> Option<&std::path::Path> {
        match self {
            DeviceKind::Disk(d) => d.storage.filename.as_deref(),
            DeviceKind::Tape(t) => t.storage.filename.as_deref(),
            _ => None,
        }
    }

    pub fn eject(&mut self) -> ScsiResult<()> {
        match self {
            DeviceKind::Disk(d) => d.eject(),
            DeviceKind::Tape(t) => t.eject(),
            _ => Ok(()),
        }
    }

    pub fn cache_statistics(&self) -> Option<crate::cache::CacheStatistics> {
        match self {
            DeviceKind::Disk(d) => Some(d.cache.statistics()),
            _ => None,
        }
    }
}
