//! Validates and enacts ATTACH/DETACH/INSERT/EJECT/START/STOP/PROTECT/etc.
//! against the live device topology (spec.md section 4.12). Mirrors
//! `CommandExecutor` in the original implementation; the
//! `execution_locker` mutex it describes is this module's
//! `Topology<B>`'s `Mutex`, shared with the SCSI servicing loop that also
//! locks it around `Controller::run_once` (spec.md section 5).

use crate::bus::Bus;
use crate::controller::Controller;
use crate::device::storage::CachingMode;
use crate::device::DeviceKind;
use crate::factory::{self, DeviceFactory, ReservationRegistry};
use crate::pb::{PbCachingMode, PbDeviceDefinition, PbDeviceType, PbErrorCode};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The live set of per-target controllers, plus the administratively
/// reserved id set RESERVE_IDS maintains. One instance is shared (behind a
/// `Mutex`) between the management-command executor and the SCSI servicing
/// loop(s), per spec.md section 5's "single executor mutex" guarantee.
pub struct Topology<B: Bus + Default + Send> {
    pub controllers: BTreeMap<i32, Controller<B>>,
    pub reserved_ids: BTreeSet<i32>,
}

impl<B: Bus + Default + Send> Default for Topology<B> {
    fn default() -> Self {
        Self { controllers: BTreeMap::new(), reserved_ids: BTreeSet::new() }
    }
}

impl<B: Bus + Default + Send> Topology<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lun0_invariant_holds(&self) -> bool {
        self.controllers.values().all(|c| c.devices().is_empty() || c.devices().contains_key(&0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    pub code: PbErrorCode,
    pub message: String,
}

impl ExecError {
    fn new(code: PbErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

/// A single device definition, resolved and validated, ready to enact.
struct Resolved {
    id: i32,
    lun: i32,
    device_type: PbDeviceType,
}

fn caching_mode(m: PbCachingMode) -> CachingMode {
    match m {
        PbCachingMode::Default | PbCachingMode::Piscsi => CachingMode::Piscsi,
        PbCachingMode::Linux => CachingMode::Linux,
        PbCachingMode::LinuxOptimized => CachingMode::LinuxOptimized,
        PbCachingMode::WriteThrough => CachingMode::WriteThrough,
    }
}

/// Validates id/lun bounds, duplicate-attach, and (for non-ATTACH
/// operations) that the target device exists. Mirrors `validate_device`.
fn validate_device(
    topology: &Topology<impl Bus + Default + Send>,
    factory: &DeviceFactory,
    def: &PbDeviceDefinition,
    for_attach: bool,
) -> ExecResult<Resolved> {
    if !(0..8).contains(&def.id) {
        return Err(ExecError::new(PbErrorCode::DeviceIdInvalid, format!("invalid device id {}", def.id)));
    }

    let device_type = PbDeviceType::try_from(def.r#type).unwrap_or(PbDeviceType::Undefined);
    let resolved_type = if device_type == PbDeviceType::Undefined && for_attach {
        factory.type_for_file(&def.file).unwrap_or(PbDeviceType::Undefined)
    } else {
        device_type
    };

    let lun_max = if resolved_type == PbDeviceType::Undefined { 32 } else { factory::lun_max(resolved_type) };
    if !(0..lun_max).contains(&def.unit) {
        return Err(ExecError::new(PbErrorCode::LunInvalid, format!("invalid lun {}", def.unit)));
    }

    let existing = topology.controllers.get(&def.id).and_then(|c| c.devices().get(&def.unit));

    if for_attach {
        if existing.is_some() {
            return Err(ExecError::new(PbErrorCode::DuplicateId, format!("device {}:{} already attached", def.id, def.unit)));
        }
        if topology.reserved_ids.contains(&def.id) {
            return Err(ExecError::new(PbErrorCode::ReservedId, format!("id {} is reserved", def.id)));
        }
    } else if existing.is_none() {
        return Err(ExecError::new(PbErrorCode::NoDevice, format!("no device at {}:{}", def.id, def.unit)));
    }

    Ok(Resolved { id: def.id, lun: def.unit, device_type: resolved_type })
}

/// PROTECT/UNPROTECT/START/STOP/INSERT/EJECT target-capability checks.
/// Mirrors `validate_operation`.
fn validate_protect(device: &DeviceKind, protect: bool) -> ExecResult<()> {
    if protect {
        if !device.common().ready {
            return Err(ExecError::new(PbErrorCode::OperationDenied, "device is not ready"));
        }
        let protectable = match device {
            DeviceKind::Disk(d) => d.storage.protectable,
            DeviceKind::Tape(t) => t.storage.protectable,
            _ => false,
        };
        if !protectable {
            return Err(ExecError::new(PbErrorCode::OperationDenied, "device does not support write protection"));
        }
    }
    Ok(())
}

/// Validates and enacts topology-mutating management commands under the
/// shared `Topology` mutex. Holds the `DeviceFactory` and
/// `ReservationRegistry` by value (not as process-wide singletons) per
/// spec.md section 9.
pub struct Executor<B: Bus + Default + Send + 'static> {
    pub topology: Arc<Mutex<Topology<B>>>,
    pub registry: ReservationRegistry,
    pub factory: DeviceFactory,
    pub image_folder: PathBuf,
}

impl<B: Bus + Default + Send + 'static> Executor<B> {
    pub fn new(registry: ReservationRegistry, image_folder: PathBuf) -> Self {
        Self { topology: Arc::new(Mutex::new(Topology::new())), registry, factory: DeviceFactory::new(), image_folder }
    }

    fn resolve_path(&self, file: &str) -> PathBuf {
        let candidate = Path::new(file);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.image_folder.join(candidate)
        }
    }

    /// Runs `defs` through [`validate_device`] without mutating any state,
    /// and (for ATTACH) attempts to actually open each backing file so
    /// "file does not exist" surfaces before anything real is touched. The
    /// reservation registry is snapshotted and restored around this, per
    /// spec.md section 4.12.
    pub fn dry_run(&self, defs: &[PbDeviceDefinition], for_attach: bool) -> ExecResult<()> {
        let snapshot = self.registry.snapshot();
        let result = self.dry_run_inner(defs, for_attach);
        self.registry.restore(snapshot);
        result
    }

    fn dry_run_inner(&self, defs: &[PbDeviceDefinition], for_attach: bool) -> ExecResult<()> {
        let topology = self.topology.lock();
        for def in defs {
            let resolved = validate_device(&topology, &self.factory, def, for_attach)?;
            if for_attach && resolved.device_type == PbDeviceType::Undefined {
                return Err(ExecError::new(PbErrorCode::UnknownDeviceType, format!("cannot resolve type for {}", def.file)));
            }
            if for_attach && needs_image_file(resolved.device_type) {
                if def.file.is_empty() {
                    return Err(ExecError::new(PbErrorCode::MissingFilename, "missing file"));
                }
                let path = self.resolve_path(&def.file);
                let mut probe = self.construct(resolved.device_type, resolved.lun, &def.file);
                if let Some(probe) = probe.as_mut() {
                    open_storage(probe, &path, &self.registry, resolved.id, resolved.lun)
                        .map_err(|e| ExecError::new(PbErrorCode::ReservedFile, e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn construct(&self, device_type: PbDeviceType, lun: i32, file: &str) -> Option<DeviceKind> {
        self.factory.create_device(device_type, lun, file)
    }

    /// ATTACH: resolves type, enforces unique-device-type and reserved-id
    /// rules, opens the backing file for storage devices, and attaches the
    /// constructed device to its target's controller (creating the
    /// controller if this is the target's first LUN).
    pub fn attach(&self, def: &PbDeviceDefinition, new_controller: impl FnOnce() -> B) -> ExecResult<()> {
        let mut topology = self.topology.lock();
        let resolved = validate_device(&topology, &self.factory, def, true)?;

        if resolved.device_type == PbDeviceType::Undefined {
            return Err(ExecError::new(PbErrorCode::UnknownDeviceType, format!("cannot resolve type for {}", def.file)));
        }

        if factory::is_unique_device_type(resolved.device_type) {
            let already_present = topology
                .controllers
                .values()
                .any(|c| c.devices().values().any(|d| d.device_type() == resolved.device_type));
            if already_present {
                return Err(ExecError::new(PbErrorCode::OperationDenied, "device type already attached"));
            }
        }

        let mut device = self
            .construct(resolved.device_type, resolved.lun, &def.file)
            .ok_or_else(|| ExecError::new(PbErrorCode::UnknownDeviceType, "device construction failed"))?;

        {
            let common = device.common_mut();
            common.id = resolved.id;
            if !def.vendor.is_empty() || !def.product.is_empty() || !def.revision.is_empty() {
                common.set_product_data(&def.vendor, &def.product, &def.revision, true);
            }
            if def.scsi_level != 0 {
                common.set_scsi_level(def.scsi_level);
            }
        }

        if let DeviceKind::Disk(d) = &mut device {
            if def.block_size != 0 {
                d.storage.configured_block_size = Some(def.block_size as u32);
                d.storage.block_size = def.block_size as u32;
            }
            d.storage.caching_mode = caching_mode(PbCachingMode::try_from(def.caching_mode).unwrap_or(PbCachingMode::Default));
            d.storage.read_only = def.read_only || d.storage.read_only;
        }
        if let DeviceKind::Tape(t) = &mut device {
            if def.block_size != 0 {
                t.storage.configured_block_size = Some(def.block_size as u32);
            }
            t.storage.read_only = def.read_only;
        }

        if needs_image_file(resolved.device_type) {
            if def.file.is_empty() {
                return Err(ExecError::new(PbErrorCode::MissingFilename, "missing file"));
            }
            let path = self.resolve_path(&def.file);
            open_storage(&mut device, &path, &self.registry, resolved.id, resolved.lun)
                .map_err(|e| ExecError::new(PbErrorCode::ReservedFile, e.to_string()))?;
        } else if resolved.device_type == PbDeviceType::Scsg {
            if let DeviceKind::Generic(g) = &mut device {
                g.open(&self.resolve_path(&def.file)).map_err(|e| ExecError::new(PbErrorCode::ScsiError, e.to_string()))?;
            }
        }

        let controller = topology.controllers.entry(resolved.id).or_insert_with(|| {
            Controller::new(new_controller(), resolved.id, self.registry.clone())
        });
        controller.attach(resolved.lun, device);
        Ok(())
    }

    /// DETACH: refuses to remove LUN 0 while any other LUN remains on the
    /// same target; tears down the controller once its last LUN is gone.
    pub fn detach(&self, id: i32, lun: i32) -> ExecResult<()> {
        let mut topology = self.topology.lock();
        let controller = topology
            .controllers
            .get_mut(&id)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no controller at id {id}")))?;

        if !controller.devices().contains_key(&lun) {
            return Err(ExecError::new(PbErrorCode::NoDevice, format!("no device at {id}:{lun}")));
        }
        if lun == 0 && controller.devices().len() > 1 {
            return Err(ExecError::new(PbErrorCode::Lun0Invalid, "cannot detach LUN 0 while other LUNs remain"));
        }

        if let Some(mut device) = controller.detach(lun) {
            if let Some(name) = device.reserved_filename().map(Path::to_path_buf) {
                self.registry.unreserve(&name);
            }
            let _ = device.eject();
        }

        if controller.devices().is_empty() {
            topology.controllers.remove(&id);
        }
        Ok(())
    }

    /// DETACH_ALL: tears down every controller and every reservation.
    pub fn detach_all(&self) {
        let mut topology = self.topology.lock();
        topology.controllers.clear();
        for name in self.registry.snapshot().keys() {
            self.registry.unreserve(name);
        }
    }

    /// RESERVE_IDS: parses the administrative id set, rejecting ids that
    /// currently own a controller.
    pub fn reserve_ids(&self, ids: &[i32]) -> ExecResult<()> {
        let mut topology = self.topology.lock();
        for &id in ids {
            if !(0..8).contains(&id) {
                return Err(ExecError::new(PbErrorCode::DeviceIdInvalid, format!("invalid id {id}")));
            }
            if topology.controllers.contains_key(&id) {
                return Err(ExecError::new(PbErrorCode::OperationDenied, format!("id {id} owns a controller")));
            }
        }
        topology.reserved_ids = ids.iter().copied().collect();
        Ok(())
    }

    pub fn reserved_ids(&self) -> Vec<i32> {
        self.topology.lock().reserved_ids.iter().copied().collect()
    }

    /// INSERT: requires the device to be currently removed; reuses the
    /// supplied filename or, if none given, the last one used.
    pub fn insert(&self, def: &PbDeviceDefinition) -> ExecResult<()> {
        let mut topology = self.topology.lock();
        let controller = topology
            .controllers
            .get_mut(&def.id)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no controller at id {}", def.id)))?;
        let device = controller
            .devices_mut()
            .get_mut(&def.unit)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no device at {}:{}", def.id, def.unit)))?;

        let storage_removed = match device {
            DeviceKind::Disk(d) => d.storage.removed,
            DeviceKind::Tape(t) => t.storage.removed,
            _ => return Err(ExecError::new(PbErrorCode::OperationDenied, "device does not support media")),
        };
        if !storage_removed {
            return Err(ExecError::new(PbErrorCode::OperationDenied, "device is not removed"));
        }

        let filename = if def.file.is_empty() {
            match device {
                DeviceKind::Disk(d) => d.storage.last_filename.clone(),
                DeviceKind::Tape(t) => t.storage.last_filename.clone(),
                _ => None,
            }
            .ok_or_else(|| ExecError::new(PbErrorCode::MissingFilename, "no previous filename to reuse"))?
        } else {
            self.resolve_path(&def.file)
        };

        open_storage(device, &filename, &self.registry, def.id, def.unit)
            .map_err(|e| ExecError::new(PbErrorCode::ReservedFile, e.to_string()))?;
        match device {
            DeviceKind::Disk(d) => d.storage.medium_changed = true,
            DeviceKind::Tape(t) => t.storage.medium_changed = true,
            _ => {}
        }
        Ok(())
    }

    /// EJECT: locked media refuses; otherwise flushes, releases the
    /// reservation, and marks the device removed.
    pub fn eject(&self, id: i32, lun: i32) -> ExecResult<()> {
        let mut topology = self.topology.lock();
        let controller = topology
            .controllers
            .get_mut(&id)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no controller at id {id}")))?;
        let device = controller
            .devices_mut()
            .get_mut(&lun)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no device at {id}:{lun}")))?;

        device.eject().map_err(|e| ExecError::new(PbErrorCode::ScsiError, e.to_string()))?;
        if let Some(name) = device.reserved_filename().map(Path::to_path_buf) {
            self.registry.unreserve(&name);
        }
        match device {
            DeviceKind::Disk(d) => {
                d.storage.removed = true;
                d.storage.filename = None;
            }
            DeviceKind::Tape(t) => {
                t.storage.removed = true;
                t.storage.filename = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// START/STOP: only meaningful for devices with a `stopped` flag; no-op
    /// for everything else.
    pub fn start_stop(&self, id: i32, lun: i32, start: bool) -> ExecResult<()> {
        let mut topology = self.topology.lock();
        let controller = topology
            .controllers
            .get_mut(&id)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no controller at id {id}")))?;
        let device = controller
            .devices_mut()
            .get_mut(&lun)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no device at {id}:{lun}")))?;
        match device {
            DeviceKind::Disk(d) => d.storage.stopped = !start,
            DeviceKind::Tape(t) => t.storage.stopped = !start,
            _ => {}
        }
        Ok(())
    }

    /// PROTECT/UNPROTECT: rejected on a not-ready device when protecting.
    pub fn protect(&self, id: i32, lun: i32, protect: bool) -> ExecResult<()> {
        let mut topology = self.topology.lock();
        let controller = topology
            .controllers
            .get_mut(&id)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no controller at id {id}")))?;
        let device = controller
            .devices_mut()
            .get_mut(&lun)
            .ok_or_else(|| ExecError::new(PbErrorCode::NoDevice, format!("no device at {id}:{lun}")))?;

        validate_protect(device, protect)?;
        match device {
            DeviceKind::Disk(d) => d.storage.protected = protect,
            DeviceKind::Tape(t) => t.storage.protected = protect,
            _ => {}
        }
        Ok(())
    }

    pub fn check_authentication(&self, token_expected: &str, token_given: &str) -> ExecResult<()> {
        if token_expected.is_empty() || token_expected == token_given {
            Ok(())
        } else {
            Err(ExecError::new(PbErrorCode::Unauthorized, "authentication token mismatch"))
        }
    }
}

fn needs_image_file(t: PbDeviceType) -> bool {
    matches!(t, PbDeviceType::Schd | PbDeviceType::Scrm | PbDeviceType::Sccd | PbDeviceType::Scmo | PbDeviceType::Sctp | PbDeviceType::Sahd)
}

/// Opens the backing file for whichever storage-device kind `device` is.
fn open_storage(device: &mut DeviceKind, path: &Path, registry: &ReservationRegistry, id: i32, lun: i32) -> Result<(), crate::error::ScsiException> {
    match device {
        DeviceKind::Disk(d) => d.open(path, registry, id, lun),
        DeviceKind::Tape(t) => {
            let append = 0; // spec.md section 9: append=0 with no existing file is a configuration error, not silently permitted.
            t.open(path, append, registry, id, lun)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;

    fn executor() -> Executor<LoopbackBus> {
        let registry = ReservationRegistry::new();
        Executor::new(registry, PathBuf::from("/tmp"))
    }

    fn disk_def(id: i32, unit: i32, file: &str) -> PbDeviceDefinition {
        PbDeviceDefinition {
            id,
            unit,
            r#type: PbDeviceType::Schd as i32,
            block_size: 512,
            caching_mode: PbCachingMode::Piscsi as i32,
            file: file.to_string(),
            vendor: String::new(),
            product: String::new(),
            revision: String::new(),
            scsi_level: 0,
            read_only: false,
            protected: false,
            stoppable: false,
            removable: false,
            locked: false,
            removed: false,
            params: Default::default(),
        }
    }

    #[test]
    fn attach_then_detach_lun0_requires_emptiness() {
        let exec = executor();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.hda");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let def0 = disk_def(0, 0, path.to_str().unwrap());
        exec.attach(&def0, LoopbackBus::new).unwrap();

        let def1 = disk_def(0, 1, path.to_str().unwrap());
        exec.attach(&def1, LoopbackBus::new).unwrap();

        assert!(exec.detach(0, 0).is_err());
        exec.detach(0, 1).unwrap();
        exec.detach(0, 0).unwrap();
        assert!(exec.topology.lock().controllers.is_empty());
    }

    #[test]
    fn attach_rejects_duplicate() {
        let exec = executor();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.hda");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let def = disk_def(1, 0, path.to_str().unwrap());
        exec.attach(&def, LoopbackBus::new).unwrap();
        assert_eq!(exec.attach(&def, LoopbackBus::new).unwrap_err().code, PbErrorCode::DuplicateId);
    }

    #[test]
    fn reserve_ids_rejects_owning_controller() {
        let exec = executor();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.hda");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        exec.attach(&disk_def(2, 0, path.to_str().unwrap()), LoopbackBus::new).unwrap();

        assert!(exec.reserve_ids(&[2]).is_err());
        assert!(exec.reserve_ids(&[3]).is_ok());
        assert_eq!(exec.reserved_ids(), vec![3]);
    }

    #[test]
    fn attach_onto_reserved_id_is_rejected() {
        let exec = executor();
        exec.reserve_ids(&[4]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.hda");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let def = disk_def(4, 0, path.to_str().unwrap());
        assert_eq!(exec.attach(&def, LoopbackBus::new).unwrap_err().code, PbErrorCode::ReservedId);
    }
}
