//! Common image-file semantics for storage-backed devices: block size
//! negotiation, reservation, eject/load, START/STOP, and the default mode
//! pages (1, 2, 0x0a). Mirrors `StorageDevice` in the original
//! implementation.

use crate::error::{Asc, ScsiException, ScsiResult, SenseKey};
use crate::factory::ReservationRegistry;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachingMode {
    #[default]
    Piscsi,
    Linux,
    LinuxOptimized,
    WriteThrough,
}

#[derive(Debug, Clone)]
pub struct StorageCommon {
    pub filename: Option<PathBuf>,
    pub last_filename: Option<PathBuf>,
    pub block_size: u32,
    pub block_count: u64,
    pub supported_block_sizes: BTreeSet<u32>,
    pub configured_block_size: Option<u32>,
    pub medium_changed: bool,
    pub locked: bool,
    pub removed: bool,
    pub read_only: bool,
    pub protectable: bool,
    pub protected: bool,
    pub stopped: bool,
    pub caching_mode: CachingMode,
}

impl StorageCommon {
    pub fn new(supported_block_sizes: BTreeSet<u32>) -> Self {
        Self {
            filename: None,
            last_filename: None,
            block_size: *supported_block_sizes.iter().next().unwrap_or(&512),
            block_count: 0,
            supported_block_sizes,
            configured_block_size: None,
            medium_changed: false,
            locked: false,
            removed: true,
            read_only: false,
            protectable: false,
            protected: false,
            stopped: false,
            caching_mode: CachingMode::default(),
        }
    }

    pub fn capacity_invariant_holds(&self, file_size: u64) -> bool {
        u64::from(self.block_size) * self.block_count <= file_size
    }

    /// Any multiple of 4 is accepted as a temporary block size change,
    /// mirroring `VerifyBlockSizeChange`'s permissive check.
    pub fn verify_block_size_change(&self, new_size: u32) -> ScsiResult<()> {
        if new_size == 0 || new_size % 4 != 0 {
            return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInParameterList));
        }
        Ok(())
    }

    pub fn change_block_size(&mut self, new_size: u32) {
        self.block_size = new_size;
    }

    pub fn reserve_file(&mut self, registry: &ReservationRegistry, filename: &Path, id: i32, lun: i32) -> ScsiResult<()> {
        if !registry.reserve(filename, id, lun) {
            return Err(ScsiException::new(SenseKey::AbortedCommand, Asc::InternalTargetFailure));
        }
        self.filename = Some(filename.to_path_buf());
        Ok(())
    }

    pub fn unreserve_file(&mut self, registry: &ReservationRegistry) {
        if let Some(name) = self.filename.take() {
            registry.unreserve(&name);
            self.last_filename = Some(name);
        }
    }

    /// START/STOP UNIT, keyed by CDB byte 4 bits 0 (START) and 1 (LOEJ),
    /// per spec.md section 4.6.
    pub fn start_stop_unit(&mut self, registry: &ReservationRegistry, start: bool, load_eject: bool, id: i32, lun: i32) -> ScsiResult<()> {
        match (load_eject, start) {
            (false, false) => {
                self.stopped = true;
            }
            (false, true) => {
                self.stopped = false;
            }
            (true, false) => {
                if self.locked {
                    return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::LoadOrEjectFailed));
                }
                self.unreserve_file(registry);
                self.removed = true;
            }
            (true, true) => {
                if let Some(name) = self.last_filename.clone() {
                    self.reserve_file(registry, &name, id, lun)?;
                    self.removed = false;
                    self.medium_changed = true;
                }
            }
        }
        Ok(())
    }

    pub fn prevent_allow_medium_removal(&mut self, prevent: bool) {
        self.locked = prevent;
    }

    /// Mode page 1: read/write error recovery. Values mirror the IBM
    /// DORS-39130 drive defaults the original carries.
    pub fn add_read_write_error_recovery_page(changeable: bool) -> Vec<u8> {
        let mut page = vec![0u8; 12];
        page[0] = 1;
        page[1] = 10;
        if !changeable {
            page[2] = 0x26; // TB, PER, DTE
            page[3] = 1;
            page[8] = 1;
            page[11] = 218;
        }
        page
    }

    /// Mode page 2: disconnect/reconnect, all fields zero (no timing
    /// preferences asserted).
    pub fn add_disconnect_reconnect_page() -> Vec<u8> {
        let mut page = vec![0u8; 16];
        page[0] = 2;
        page[1] = 14;
        page
    }

    /// Mode page 0x0a: control mode page, queue algorithm modifier unrestricted.
    pub fn add_control_mode_page() -> Vec<u8> {
        let mut page = vec![0u8; 10];
        page[0] = 0x0a;
        page[1] = 8;
        page
    }

    /// Validates PF/SP and whether the embedded block size (page 3 /
    /// descriptor) matches the current one, per MODE SELECT semantics in
    /// spec.md section 4.6.
    pub fn evaluate_block_descriptor(&mut self, descriptor_block_size: Option<u32>) -> ScsiResult<()> {
        if let Some(size) = descriptor_block_size {
            if size != 0 {
                if !self.supported_block_sizes.contains(&size) && Some(size) != self.configured_block_size {
                    self.verify_block_size_change(size)?;
                }
                self.change_block_size(size);
            }
        }
        Ok(())
    }
}
