//! Top-level routing of `PbOperation` values (spec.md section 4.13).
//! Informational queries and non-device-idle operations (image-file CRUD,
//! log level, shutdown, properties) are handled directly; everything with a
//! device list is forwarded to the [`Executor`] under its topology lock.
//! Mirrors `CommandDispatcher` in the original implementation.

use crate::bus::Bus;
use crate::device::DeviceKind;
use crate::executor::{ExecError, Executor};
use crate::images;
use crate::pb::{
    PbCachingMode, PbCommand, PbDeviceInfo, PbDeviceType, PbDevicesInfo, PbErrorCode, PbImageFile, PbImageFilesInfo,
    PbLogLevelInfo, PbNetworkInterfacesInfo, PbOperation, PbReservedIdsInfo, PbResult, PbServerInfo, PbStatistics,
    PbVersionInfo,
};
use crate::properties::PropertyMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// What the caller (the management server's accept loop, or the Host
/// Services EXECUTE OPERATION tunnel) should do once the current response
/// has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    StopServer,
    Halt,
    Reboot,
}

/// Global and per-device log level, tracked here rather than pushed
/// directly into a `tracing` reload handle: the handle type depends on the
/// subscriber the binary assembled, which this library-level dispatcher
/// does not own (spec.md section 9's singleton note, applied to logging).
struct LogLevelState {
    current: String,
    device_overrides: BTreeMap<(i32, i32), String>,
}

impl Default for LogLevelState {
    fn default() -> Self {
        Self { current: "info".to_string(), device_overrides: BTreeMap::new() }
    }
}

pub struct Dispatcher<B: Bus + Default + Send + 'static> {
    pub executor: Executor<B>,
    pub image_folder: PathBuf,
    pub scan_depth: usize,
    pub config_path: PathBuf,
    token: String,
    properties: Mutex<PropertyMap>,
    log_level: Mutex<LogLevelState>,
}

impl<B: Bus + Default + Send + 'static> Dispatcher<B> {
    pub fn new(executor: Executor<B>, properties: PropertyMap, token: String) -> Self {
        let image_folder = properties.image_folder().to_path_buf();
        let scan_depth = properties.scan_depth();
        Self {
            executor,
            image_folder,
            scan_depth,
            config_path: PropertyMap::default_config_path(),
            token,
            properties: Mutex::new(properties),
            log_level: Mutex::new(LogLevelState::default()),
        }
    }

    /// Routes one `PbCommand`, returning the `PbResult` to send back and,
    /// if a Host Services device scheduled one, the shutdown the caller
    /// should perform once the response is on the wire.
    pub fn dispatch(&self, command: &PbCommand) -> (PbResult, Option<ShutdownRequest>) {
        if !command.token.is_empty() || !self.token.is_empty() {
            if let Err(e) = self.executor.check_authentication(&self.token, &command.token) {
                return (error_result(e), None);
            }
        }

        let operation = PbOperation::try_from(command.operation).unwrap_or(PbOperation::NoOperation);
        match operation {
            PbOperation::NoOperation => (ok_result(), None),
            PbOperation::CheckAuthentication => (ok_result(), None),
            PbOperation::VersionInfo => (self.version_info(), None),
            PbOperation::ServerInfo => (self.server_info(), None),
            PbOperation::DevicesInfo => (self.devices_info(), None),
            PbOperation::DeviceTypesInfo => (self.device_types_info(), None),
            PbOperation::ReservedIdsInfo => (self.reserved_ids_info(), None),
            PbOperation::DefaultImageFolderInfo => (self.default_image_folder_info(), None),
            PbOperation::ImageFileInfo => (self.image_file_info(), None),
            PbOperation::NetworkInterfacesInfo => (self.network_interfaces_info(), None),
            PbOperation::LogLevelInfo => (self.log_level_info(), None),

            PbOperation::LogLevel => (self.log_level_op(&command.params), None),
            PbOperation::ReserveIds => (self.reserve_ids_op(&command.params), None),
            PbOperation::CreateImage => (self.create_image_op(&command.params), None),
            PbOperation::DeleteImage => (self.delete_image_op(&command.params), None),
            PbOperation::RenameImage => (self.rename_image_op(&command.params), None),
            PbOperation::CopyImage => (self.copy_image_op(&command.params), None),
            PbOperation::ProtectImage => (self.protect_image_op(&command.params, true), None),
            PbOperation::UnprotectImage => (self.protect_image_op(&command.params, false), None),
            PbOperation::PersistConfiguration => (self.persist_configuration(), None),
            PbOperation::ShutDown => self.shut_down(&command.params),

            PbOperation::Attach | PbOperation::Detach | PbOperation::Insert | PbOperation::Eject
            | PbOperation::Start | PbOperation::Stop | PbOperation::Protect | PbOperation::Unprotect => {
                let result = self.enact_device_operation(operation, &command.devices);
                (result, None)
            }
            PbOperation::DetachAll => {
                self.executor.detach_all();
                (self.devices_info_result(ok_result()), None)
            }
            PbOperation::ExecuteOperations => (ok_result(), None),
        }
    }

    fn enact_device_operation(&self, operation: PbOperation, devices: &[crate::pb::PbDeviceDefinition]) -> PbResult {
        let for_attach = operation == PbOperation::Attach;
        if let Err(e) = self.executor.dry_run(devices, for_attach) {
            return error_result(e);
        }

        for def in devices {
            let outcome = match operation {
                PbOperation::Attach => self.executor.attach(def, B::default),
                PbOperation::Detach => self.executor.detach(def.id, def.unit),
                PbOperation::Insert => self.executor.insert(def),
                PbOperation::Eject => self.executor.eject(def.id, def.unit),
                PbOperation::Start => self.executor.start_stop(def.id, def.unit, true),
                PbOperation::Stop => self.executor.start_stop(def.id, def.unit, false),
                PbOperation::Protect => self.executor.protect(def.id, def.unit, true),
                PbOperation::Unprotect => self.executor.protect(def.id, def.unit, false),
                _ => unreachable!(),
            };
            if let Err(e) = outcome {
                return error_result(e);
            }
        }

        if !self.executor.topology.lock().lun0_invariant_holds() {
            return error_result(ExecError { code: PbErrorCode::Lun0Invalid, message: "LUN 0 invariant violated".to_string() });
        }

        // ATTACH/DETACH/INSERT/EJECT change the device list: refill it in
        // the response, per spec.md section 4.13.
        match operation {
            PbOperation::Attach | PbOperation::Detach | PbOperation::Insert | PbOperation::Eject => {
                self.devices_info_result(ok_result())
            }
            _ => ok_result(),
        }
    }

    fn version_info(&self) -> PbResult {
        let mut result = ok_result();
        result.version_info = Some(version_info());
        result
    }

    fn server_info(&self) -> PbResult {
        let mut result = ok_result();
        let devices = self.collect_devices();
        let properties = self.properties.lock().clone();
        let mut props_out = BTreeMap::new();
        props_out.insert("image_folder".to_string(), self.image_folder.to_string_lossy().into_owned());
        props_out.insert("scan_depth".to_string(), self.scan_depth.to_string());
        props_out.insert("port".to_string(), properties.port().to_string());
        result.server_info = Some(PbServerInfo {
            version_info: Some(version_info()),
            devices_info: Some(PbDevicesInfo { devices }),
            device_types_info: device_type_names(),
            max_luns: 32,
            properties: props_out.into_iter().collect(),
        });
        result
    }

    fn devices_info(&self) -> PbResult {
        self.devices_info_result(ok_result())
    }

    fn devices_info_result(&self, mut result: PbResult) -> PbResult {
        result.devices_info = Some(PbDevicesInfo { devices: self.collect_devices() });
        result
    }

    fn collect_devices(&self) -> Vec<PbDeviceInfo> {
        let topology = self.executor.topology.lock();
        let mut out = Vec::new();
        for (&id, controller) in &topology.controllers {
            for (&lun, device) in controller.devices() {
                out.push(device_info(id, lun, device));
            }
        }
        out
    }

    fn device_types_info(&self) -> PbResult {
        let mut result = ok_result();
        result.server_info = Some(PbServerInfo {
            version_info: None,
            devices_info: None,
            device_types_info: device_type_names(),
            max_luns: 32,
            properties: BTreeMap::new(),
        });
        result
    }

    fn reserved_ids_info(&self) -> PbResult {
        let mut result = ok_result();
        result.reserved_ids_info = Some(PbReservedIdsInfo { ids: self.executor.reserved_ids() });
        result
    }

    fn default_image_folder_info(&self) -> PbResult {
        let mut result = ok_result();
        result.default_image_folder = self.image_folder.to_string_lossy().into_owned();
        result
    }

    fn image_file_info(&self) -> PbResult {
        let mut result = ok_result();
        let registry = &self.executor.registry;
        let files = images::list_images(&self.image_folder, self.scan_depth)
            .into_iter()
            .map(|f| {
                let full_path = self.image_folder.join(&f.name);
                let (id, unit, detected) = match registry.ids_for(&full_path) {
                    Some((id, unit)) => (id, unit, true),
                    None => (0, 0, false),
                };
                PbImageFile {
                    name: f.name.to_string_lossy().into_owned(),
                    r#type: PbDeviceType::Undefined as i32,
                    size: f.size,
                    read_only: f.read_only,
                    detected,
                    id,
                    unit,
                }
            })
            .collect();
        result.image_files_info =
            Some(PbImageFilesInfo { default_image_folder: self.image_folder.to_string_lossy().into_owned(), image_files: files });
        result
    }

    fn network_interfaces_info(&self) -> PbResult {
        let mut result = ok_result();
        result.network_interfaces_info = Some(PbNetworkInterfacesInfo { name: network_interface_names() });
        result
    }

    fn log_level_info(&self) -> PbResult {
        let mut result = ok_result();
        let state = self.log_level.lock();
        result.log_level_info =
            Some(PbLogLevelInfo { current_log_level: state.current.clone(), log_levels: LOG_LEVELS.iter().map(|s| s.to_string()).collect() });
        result
    }

    /// LOG_LEVEL: parameter is `level[:id[:lun]]`, per spec.md section 4.13.
    fn log_level_op(&self, params: &BTreeMap<String, String>) -> PbResult {
        let Some(raw) = params.get("level") else {
            return error_result(ExecError { code: PbErrorCode::MissingParameter, message: "missing level".to_string() });
        };

        let mut parts = raw.splitn(3, ':');
        let level = parts.next().unwrap_or("");
        if !LOG_LEVELS.contains(&level) {
            return error_result(ExecError { code: PbErrorCode::UnknownParameter, message: format!("unknown log level {level}") });
        }

        let id = parts.next().and_then(|s| s.parse::<i32>().ok());
        let lun = parts.next().and_then(|s| s.parse::<i32>().ok()).unwrap_or(0);

        let mut state = self.log_level.lock();
        match id {
            Some(id) => {
                state.device_overrides.insert((id, lun), level.to_string());
            }
            None => state.current = level.to_string(),
        }
        ok_result()
    }

    fn reserve_ids_op(&self, params: &BTreeMap<String, String>) -> PbResult {
        let Some(raw) = params.get("ids") else {
            return error_result(ExecError { code: PbErrorCode::MissingParameter, message: "missing ids".to_string() });
        };
        let ids = match crate::properties::parse_id_set(raw) {
            Ok(ids) => ids,
            Err(e) => return error_result(ExecError { code: PbErrorCode::UnknownParameter, message: e.to_string() }),
        };
        match self.executor.reserve_ids(&ids) {
            Ok(()) => {
                let mut result = ok_result();
                result.reserved_ids_info = Some(PbReservedIdsInfo { ids: self.executor.reserved_ids() });
                result
            }
            Err(e) => error_result(e),
        }
    }

    fn create_image_op(&self, params: &BTreeMap<String, String>) -> PbResult {
        let Some(file) = params.get("file") else {
            return missing_param("file");
        };
        let Some(size) = params.get("size").and_then(|s| s.parse::<u64>().ok()) else {
            return missing_param("size");
        };
        let read_only = params.get("read_only").map(|v| v == "true").unwrap_or(false);

        let path = match images::resolve_path(&self.image_folder, self.scan_depth, file) {
            Ok(p) => p,
            Err(e) => return image_error_result(e),
        };
        match images::create_image(&path, size, read_only) {
            Ok(()) => ok_result(),
            Err(e) => image_error_result(e),
        }
    }

    fn delete_image_op(&self, params: &BTreeMap<String, String>) -> PbResult {
        let Some(file) = params.get("file") else { return missing_param("file") };
        let path = match images::resolve_path(&self.image_folder, self.scan_depth, file) {
            Ok(p) => p,
            Err(e) => return image_error_result(e),
        };
        match images::delete_image(&self.executor.registry, &path) {
            Ok(()) => ok_result(),
            Err(e) => image_error_result(e),
        }
    }

    fn rename_image_op(&self, params: &BTreeMap<String, String>) -> PbResult {
        self.move_image_op(params, false)
    }

    fn copy_image_op(&self, params: &BTreeMap<String, String>) -> PbResult {
        self.move_image_op(params, true)
    }

    fn move_image_op(&self, params: &BTreeMap<String, String>, copy: bool) -> PbResult {
        let Some(from) = params.get("file") else { return missing_param("file") };
        let Some(to) = params.get("to") else { return missing_param("to") };

        let from_path = match images::resolve_path(&self.image_folder, self.scan_depth, from) {
            Ok(p) => p,
            Err(e) => return image_error_result(e),
        };
        let to_path = match images::resolve_path(&self.image_folder, self.scan_depth, to) {
            Ok(p) => p,
            Err(e) => return image_error_result(e),
        };

        let outcome = if copy {
            images::copy_image(&self.executor.registry, &from_path, &to_path)
        } else {
            images::rename_image(&self.executor.registry, &from_path, &to_path)
        };
        match outcome {
            Ok(()) => ok_result(),
            Err(e) => image_error_result(e),
        }
    }

    fn protect_image_op(&self, params: &BTreeMap<String, String>, protect: bool) -> PbResult {
        let Some(file) = params.get("file") else { return missing_param("file") };
        let path = match images::resolve_path(&self.image_folder, self.scan_depth, file) {
            Ok(p) => p,
            Err(e) => return image_error_result(e),
        };
        match images::set_protected(&path, protect) {
            Ok(()) => ok_result(),
            Err(e) => image_error_result(e),
        }
    }

    fn persist_configuration(&self) -> PbResult {
        let properties = self.properties.lock();
        match images::persist_properties(&self.config_path, &properties) {
            Ok(()) => ok_result(),
            Err(e) => image_error_result(e),
        }
    }

    /// SHUT_DOWN: `"rascsi"` (stop server) works as any user; `"system"`
    /// (halt) and `"reboot"` require root, per spec.md section 4.13.
    fn shut_down(&self, params: &BTreeMap<String, String>) -> (PbResult, Option<ShutdownRequest>) {
        let mode = params.get("mode").map(String::as_str).unwrap_or("rascsi");
        let is_root = nix::unistd::geteuid().is_root();

        match mode {
            "rascsi" => (ok_result(), Some(ShutdownRequest::StopServer)),
            "system" if is_root => (ok_result(), Some(ShutdownRequest::Halt)),
            "reboot" if is_root => (ok_result(), Some(ShutdownRequest::Reboot)),
            "system" | "reboot" => (
                error_result(ExecError { code: PbErrorCode::Unauthorized, message: "root privileges required".to_string() }),
                None,
            ),
            other => (
                error_result(ExecError { code: PbErrorCode::UnknownParameter, message: format!("unknown shutdown mode {other}") }),
                None,
            ),
        }
    }

    /// Decodes and runs one Host Services EXECUTE OPERATION payload,
    /// returning the serialized `PbResult`. Detects binary-protobuf vs. JSON
    /// by sniffing the leading byte; the protocol's third ("text") encoding
    /// is protobuf text format, which this workspace does not carry a crate
    /// for, so it is treated as JSON (documented in DESIGN.md).
    pub fn dispatch_raw(&self, request: &[u8]) -> Vec<u8> {
        let looks_like_json = request.iter().find(|b| !b.is_ascii_whitespace()).map(|&b| b == b'{').unwrap_or(false);

        let decoded = if looks_like_json {
            serde_json::from_slice::<PbCommand>(request).ok()
        } else {
            <PbCommand as prost::Message>::decode(request).ok()
        };

        let Some(command) = decoded else {
            let result = error_result(ExecError { code: PbErrorCode::InternalError, message: "malformed operation payload".to_string() });
            return if looks_like_json { serde_json::to_vec(&result).unwrap_or_default() } else { encode_binary(&result) };
        };

        let (result, _shutdown) = self.dispatch(&command);
        if looks_like_json {
            serde_json::to_vec(&result).unwrap_or_default()
        } else {
            encode_binary(&result)
        }
    }
}

fn encode_binary(result: &PbResult) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = prost::Message::encode(result, &mut buf);
    buf
}

fn missing_param(name: &str) -> PbResult {
    error_result(ExecError { code: PbErrorCode::MissingParameter, message: format!("missing parameter {name}") })
}

fn image_error_result(e: images::ImageError) -> PbResult {
    let code = match &e {
        images::ImageError::InvalidPath(_) => PbErrorCode::UnknownParameter,
        images::ImageError::AlreadyExists(_) => PbErrorCode::OperationDenied,
        images::ImageError::NotFound(_) => PbErrorCode::NoDevice,
        images::ImageError::ReservedFile(_) => PbErrorCode::ReservedFile,
        images::ImageError::Io(_) => PbErrorCode::InternalError,
        images::ImageError::InvalidSize(_) => PbErrorCode::UnknownParameter,
    };
    let mut result = PbResult { status: false, error_code: code as i32, ..Default::default() };
    result.msg = e.to_string();
    result
}

fn ok_result() -> PbResult {
    PbResult { status: true, error_code: PbErrorCode::NoError as i32, ..Default::default() }
}

fn error_result(e: ExecError) -> PbResult {
    PbResult { status: false, msg: e.message, error_code: e.code as i32, ..Default::default() }
}

fn version_info() -> PbVersionInfo {
    PbVersionInfo {
        major_version: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor_version: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(1),
        patch_version: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    }
}

fn device_type_names() -> Vec<String> {
    ["SAHD", "SCHD", "SCRM", "SCCD", "SCMO", "SCTP", "SCLP", "SCHS", "SCDP", "SCSG"].iter().map(|s| s.to_string()).collect()
}

fn network_interface_names() -> Vec<String> {
    match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => {
            let mut names: Vec<String> = addrs.map(|a| a.interface_name).collect();
            names.sort();
            names.dedup();
            names
        }
        Err(_) => Vec::new(),
    }
}

fn pb_caching_mode(m: crate::device::storage::CachingMode) -> PbCachingMode {
    match m {
        crate::device::storage::CachingMode::Piscsi => PbCachingMode::Piscsi,
        crate::device::storage::CachingMode::Linux => PbCachingMode::Linux,
        crate::device::storage::CachingMode::LinuxOptimized => PbCachingMode::LinuxOptimized,
        crate::device::storage::CachingMode::WriteThrough => PbCachingMode::WriteThrough,
    }
}

fn device_info(id: i32, lun: i32, device: &DeviceKind) -> PbDeviceInfo {
    let common = device.common();
    let mut info = PbDeviceInfo {
        id,
        unit: lun,
        r#type: device.device_type() as i32,
        vendor: common.vendor.clone(),
        product: common.product.clone(),
        revision: common.revision.clone(),
        scsi_level: common.scsi_level,
        removable: device.is_removable(),
        ready: common.ready,
        ..Default::default()
    };

    match device {
        DeviceKind::Disk(d) => {
            info.block_size = d.storage.block_size as i32;
            info.block_count = d.storage.block_count;
            info.caching_mode = pb_caching_mode(d.storage.caching_mode) as i32;
            info.file = d.storage.filename.as_ref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
            info.read_only = d.storage.read_only;
            info.protected = d.storage.protected;
            info.stoppable = true;
            info.locked = d.storage.locked;
            info.removed = d.storage.removed;
        }
        DeviceKind::Tape(t) => {
            info.block_size = t.storage.block_size as i32;
            info.block_count = t.storage.block_count;
            info.caching_mode = pb_caching_mode(t.storage.caching_mode) as i32;
            info.file = t.storage.filename.as_ref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
            info.read_only = t.storage.read_only;
            info.protected = t.storage.protected;
            info.stoppable = true;
            info.locked = t.storage.locked;
            info.removed = t.storage.removed;
        }
        _ => {}
    }

    if let Some(stats) = device.cache_statistics() {
        info.statistics = vec![
            PbStatistics { key: "read_error_count".to_string(), value: stats.read_error_count, r#type: device.device_type() as i32, id, unit: lun },
            PbStatistics { key: "write_error_count".to_string(), value: stats.write_error_count, r#type: device.device_type() as i32, id, unit: lun },
            PbStatistics {
                key: "cache_miss_read_count".to_string(),
                value: stats.cache_miss_read_count,
                r#type: device.device_type() as i32,
                id,
                unit: lun,
            },
            PbStatistics {
                key: "cache_miss_write_count".to_string(),
                value: stats.cache_miss_write_count,
                r#type: device.device_type() as i32,
                id,
                unit: lun,
            },
        ];
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::factory::ReservationRegistry;

    fn dispatcher() -> Dispatcher<LoopbackBus> {
        let registry = ReservationRegistry::new();
        let executor = Executor::new(registry, PathBuf::from("/tmp"));
        Dispatcher::new(executor, PropertyMap::new(), String::new())
    }

    #[test]
    fn version_info_reports_current_crate_version() {
        let d = dispatcher();
        let command = PbCommand { operation: PbOperation::VersionInfo as i32, ..Default::default() };
        let (result, shutdown) = d.dispatch(&command);
        assert!(result.status);
        assert!(result.version_info.unwrap().major_version >= 0);
        assert!(shutdown.is_none());
    }

    #[test]
    fn log_level_rejects_unknown_level() {
        let d = dispatcher();
        let mut params = BTreeMap::new();
        params.insert("level".to_string(), "verbose".to_string());
        let command = PbCommand { operation: PbOperation::LogLevel as i32, params, ..Default::default() };
        let (result, _) = d.dispatch(&command);
        assert!(!result.status);
    }

    #[test]
    fn log_level_accepts_known_level() {
        let d = dispatcher();
        let mut params = BTreeMap::new();
        params.insert("level".to_string(), "debug".to_string());
        let command = PbCommand { operation: PbOperation::LogLevel as i32, params, ..Default::default() };
        let (result, _) = d.dispatch(&command);
        assert!(result.status);

        let info_command = PbCommand { operation: PbOperation::LogLevelInfo as i32, ..Default::default() };
        let (info, _) = d.dispatch(&info_command);
        assert_eq!(info.log_level_info.unwrap().current_log_level, "debug");
    }

    #[test]
    fn shut_down_rascsi_mode_requests_stop_server() {
        let d = dispatcher();
        let mut params = BTreeMap::new();
        params.insert("mode".to_string(), "rascsi".to_string());
        let command = PbCommand { operation: PbOperation::ShutDown as i32, params, ..Default::default() };
        let (result, shutdown) = d.dispatch(&command);
        assert!(result.status);
        assert_eq!(shutdown, Some(ShutdownRequest::StopServer));
    }

    #[test]
    fn shut_down_system_mode_requires_root() {
        let d = dispatcher();
        let mut params = BTreeMap::new();
        params.insert("mode".to_string(), "system".to_string());
        let command = PbCommand { operation: PbOperation::ShutDown as i32, params, ..Default::default() };
        let (result, shutdown) = d.dispatch(&command);
        if nix::unistd::geteuid().is_root() {
            assert!(result.status);
            assert_eq!(shutdown, Some(ShutdownRequest::Halt));
        } else {
            assert!(!result.status);
            assert_eq!(shutdown, None);
        }
    }

    #[test]
    fn create_then_delete_image_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ReservationRegistry::new();
        let executor = Executor::new(registry, dir.path().to_path_buf());
        let d = Dispatcher::new(executor, PropertyMap::new(), String::new());

        let mut params = BTreeMap::new();
        params.insert("file".to_string(), "disk.hda".to_string());
        params.insert("size".to_string(), "512".to_string());
        let create = PbCommand { operation: PbOperation::CreateImage as i32, params: params.clone(), ..Default::default() };
        let (result, _) = d.dispatch(&create);
        assert!(result.status, "{:?}", result);

        let delete = PbCommand { operation: PbOperation::DeleteImage as i32, params, ..Default::default() };
        let (result, _) = d.dispatch(&delete);
        assert!(result.status);
    }

    #[test]
    fn authentication_rejects_wrong_token() {
        let registry = ReservationRegistry::new();
        let executor = Executor::new(registry, PathBuf::from("/tmp"));
        let d = Dispatcher::new(executor, PropertyMap::new(), "secret".to_string());

        let command = PbCommand { operation: PbOperation::VersionInfo as i32, token: "wrong".to_string(), ..Default::default() };
        let (result, _) = d.dispatch(&command);
        assert!(!result.status);
        assert_eq!(result.error_code, PbErrorCode::Unauthorized as i32);
    }
}
