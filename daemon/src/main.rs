//! Entry point for `s2pd`: CLI/property parsing, startup device
//! auto-attach, and the two long-running threads spec.md section 5
//! describes -- the SCSI servicing loop and the management TCP server.

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use s2p_core::bus::LoopbackBus;
use s2p_core::dispatcher::Dispatcher;
use s2p_core::executor::Executor;
use s2p_core::factory::ReservationRegistry;
use s2p_core::pb::{PbCachingMode, PbDeviceDefinition};
use s2p_core::properties::{self, PropertyMap};
use s2p_core::server::ManagementServer;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Every flag here doubles as a `/etc/s2p.conf` property key (spec.md
/// section 6.2/6.3): a CLI value always wins over the one loaded from file.
#[derive(Parser, Debug)]
#[command(name = "s2pd", version, about = "SCSI target emulation daemon")]
struct Args {
    #[arg(long)]
    image_folder: Option<String>,
    #[arg(long)]
    scan_depth: Option<usize>,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    log_pattern: Option<String>,
    #[arg(long)]
    log_limit: Option<String>,
    #[arg(long)]
    reserved_ids: Option<String>,
    #[arg(long)]
    token_file: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    script_file: Option<String>,
    #[arg(long)]
    without_types: Option<String>,
    #[arg(long)]
    locale: Option<String>,
    #[arg(long = "property-files")]
    property_files: Option<String>,
    #[arg(long = "config-file")]
    config_file: Option<String>,
}

impl Args {
    fn merge_into(&self, properties: &mut PropertyMap) {
        let mut set_str = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                properties.set(key, v.clone());
            }
        };
        set_str("image_folder", &self.image_folder);
        if let Some(v) = self.scan_depth {
            properties.set("scan_depth", v.to_string());
        }
        set_str("log_level", &self.log_level);
        set_str("log_pattern", &self.log_pattern);
        set_str("log_limit", &self.log_limit);
        set_str("reserved_ids", &self.reserved_ids);
        set_str("token_file", &self.token_file);
        if let Some(v) = self.port {
            properties.set("port", v.to_string());
        }
        set_str("script_file", &self.script_file);
        set_str("without_types", &self.without_types);
        set_str("locale", &self.locale);
        set_str("property_files", &self.property_files);
    }
}

fn main() {
    let args = Args::parse();

    let mut properties = PropertyMap::new();
    for path in resolve_config_files(&args) {
        match PropertyMap::load(&path) {
            Ok(loaded) => properties.merge(&loaded),
            Err(e) => {
                eprintln!("s2pd: failed to load {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }
    let mut cli_properties = PropertyMap::new();
    args.merge_into(&mut cli_properties);
    properties.merge(&cli_properties);

    init_tracing(properties.log_level());

    let token = match load_token(&properties) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("failed to load token file: {e}");
            std::process::exit(1);
        }
    };

    let registry = ReservationRegistry::new();
    let executor: Executor<LoopbackBus> = Executor::new(registry, properties.image_folder().to_path_buf());

    match properties.reserved_ids() {
        Ok(ids) if !ids.is_empty() => {
            if let Err(e) = executor.reserve_ids(&ids) {
                tracing::error!("failed to apply reserved_ids: {}", e.message);
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("invalid reserved_ids property: {e}");
            std::process::exit(1);
        }
    }

    attach_configured_devices(&executor, &properties);

    let dispatcher = Arc::new(Dispatcher::new(executor, properties.clone(), token));

    let running = Arc::new(AtomicBool::new(true));
    let servicing_handle = spawn_servicing_loop(Arc::clone(&dispatcher), Arc::clone(&running));

    let bind_addr = format!("0.0.0.0:{}", properties.port());
    let server = match ManagementServer::bind(&bind_addr, Arc::clone(&dispatcher)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("failed to bind management server on {bind_addr}: {e}");
            std::process::exit(1);
        }
    };

    install_signal_handlers();
    spawn_signal_watcher(Arc::clone(&running), server.stop_handle());

    tracing::info!(port = properties.port(), "s2pd listening");
    if let Err(e) = server.run() {
        tracing::error!("management server stopped: {e}");
    }

    running.store(false, Ordering::SeqCst);
    dispatcher.executor.detach_all();
    let _ = servicing_handle.join();
}

fn resolve_config_files(args: &Args) -> Vec<PathBuf> {
    if let Some(files) = &args.property_files {
        files.split(',').map(str::trim).filter(|s| !s.is_empty()).map(PathBuf::from).collect()
    } else if let Some(file) = &args.config_file {
        vec![PathBuf::from(file)]
    } else {
        vec![PropertyMap::default_config_path()]
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Reads the access token from `token_file`, warning (not failing) when the
/// file isn't root-owned mode 600 as spec.md section 4.14 expects -- a
/// misconfigured permission bit shouldn't itself be a denial-of-service
/// vector against the operator.
fn load_token(properties: &PropertyMap) -> Result<String, String> {
    let Some(path) = properties.get("token_file") else {
        return Ok(String::new());
    };
    let path = PathBuf::from(path);
    let metadata = std::fs::metadata(&path).map_err(|e| format!("{}: {e}", path.display()))?;
    if metadata.uid() != 0 {
        tracing::warn!("token file {} is not root-owned", path.display());
    }
    if metadata.permissions().mode() & 0o777 != 0o600 {
        tracing::warn!("token file {} is not mode 600", path.display());
    }
    std::fs::read_to_string(&path).map(|s| s.trim().to_string()).map_err(|e| format!("{}: {e}", path.display()))
}

/// Auto-attaches every `device.<id>[:<lun>]` entry in the property map,
/// logging and skipping (rather than aborting startup over) any single
/// malformed entry.
fn attach_configured_devices(executor: &Executor<LoopbackBus>, properties: &PropertyMap) {
    for (id, lun) in properties.configured_devices() {
        let props = properties.device_properties(id, lun);
        if props.get("active").map(String::as_str) == Some("false") {
            continue;
        }
        let Some(type_keyword) = props.get("type") else {
            tracing::warn!("device.{id}:{lun} has no type property, skipping");
            continue;
        };
        let Some(device_type) = properties::device_type_from_keyword(type_keyword) else {
            tracing::warn!("device.{id}:{lun} has unknown type {type_keyword}, skipping");
            continue;
        };

        let mut params = std::collections::BTreeMap::new();
        for (key, value) in &props {
            if let Some(subkey) = key.strip_prefix("params.") {
                params.insert(subkey.to_string(), value.clone());
            }
        }

        let caching_mode = match props.get("caching_mode").map(String::as_str) {
            Some("linux") => PbCachingMode::Linux,
            Some("linux_optimized") => PbCachingMode::LinuxOptimized,
            Some("write_through") => PbCachingMode::WriteThrough,
            _ => PbCachingMode::Piscsi,
        };

        let def = PbDeviceDefinition {
            id,
            unit: lun,
            r#type: device_type as i32,
            block_size: props.get("block_size").and_then(|v| v.parse().ok()).unwrap_or(0),
            caching_mode: caching_mode as i32,
            file: props.get("name").cloned().unwrap_or_default(),
            vendor: String::new(),
            product: String::new(),
            revision: String::new(),
            scsi_level: props.get("scsi_level").and_then(|v| v.parse().ok()).unwrap_or(0),
            read_only: false,
            protected: false,
            stoppable: false,
            removable: false,
            locked: false,
            removed: false,
            params,
        };

        if let Err(e) = executor.dry_run(std::slice::from_ref(&def), true) {
            tracing::warn!("device.{id}:{lun} failed validation: {}", e.message);
            continue;
        }
        if let Err(e) = executor.attach(&def, LoopbackBus::new) {
            tracing::warn!("device.{id}:{lun} failed to attach: {}", e.message);
        } else {
            tracing::info!("attached device.{id}:{lun} ({type_keyword})");
        }
    }
}

/// Without a physical bus driver (out of scope, per spec.md section 1) each
/// attached controller's only source of SCSI activity is whatever a test
/// harness or future bus implementation feeds it through [`LoopbackBus`];
/// `run_once` is non-blocking for that bus, so this loop polls rather than
/// waiting the way a real-hardware servicing thread would.
fn spawn_servicing_loop(dispatcher: Arc<Dispatcher<LoopbackBus>>, running: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            {
                let mut topology = dispatcher.executor.topology.lock();
                for controller in topology.controllers.values_mut() {
                    if let Err(e) = controller.run_once() {
                        tracing::warn!("servicing loop error on target {}: {e}", controller.target_id());
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    })
}

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination_signal(_: i32) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let action = SigAction::new(SigHandler::Handler(handle_termination_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGTERM, &action);
        let _ = sigaction(Signal::SIGINT, &action);
    }
}

/// Watches the flag the signal handler sets and translates it into the
/// cooperative shutdown spec.md section 5 describes: the servicing loop's
/// running flag and the management server's stop flag.
fn spawn_signal_watcher(running: Arc<AtomicBool>, stop_handle: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        tracing::info!("shutdown signal received");
        running.store(false, Ordering::SeqCst);
        stop_handle.store(true, Ordering::SeqCst);
    })
}
