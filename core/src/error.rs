//! Error taxonomy for the SCSI target core: [`ParserError`] and [`IoError`]
//! surface to the caller; [`ScsiException`] never escapes the controller
//! (see `Controller::execute`).

use thiserror::Error;

/// Configuration, property-map, or CLI malformation.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("missing required property: {0}")]
    MissingProperty(String),
    #[error("invalid value for property {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("malformed id set: {0}")]
    MalformedIdSet(String),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Filesystem, socket, or bus I/O failure.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IoError {
    pub fn msg(s: impl Into<String>) -> Self {
        IoError::Message(s.into())
    }
}

/// SCSI sense keys (SPC-6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    AbortedCommand = 0xb,
    VolumeOverflow = 0xd,
    Miscompare = 0xe,
}

/// Additional sense code (ASC). Only the subset this core raises.
///
/// `Asc::NoAdditionalSenseInformation` (ASC 0x00) is reused for the
/// beginning-of-partition and end-of-partition tape conditions; those are
/// distinguished by ASCQ (see `ascq` module), not by ASC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Asc {
    NoAdditionalSenseInformation = 0x00,
    WriteError = 0x0c,
    ReadError = 0x11,
    LocateOperationFailure = 0x15,
    InvalidCommandOperationCode = 0x20,
    LbaOutOfRange = 0x21,
    InvalidFieldInCdb = 0x24,
    LogicalUnitNotSupported = 0x25,
    InvalidFieldInParameterList = 0x26,
    WriteProtected = 0x27,
    NotReadyToReadyChange = 0x28,
    PowerOnOrReset = 0x29,
    CommandSequenceError = 0x2c,
    SavingParametersNotSupported = 0x39,
    MediumNotPresent = 0x3a,
    SequentialPositioningError = 0x3b,
    InternalTargetFailure = 0x44,
    IoProcessTerminated = 0x48,
    LoadOrEjectFailed = 0x53,
    /// Vendor-specific: no stored Host Services operation result available.
    DataCurrentlyUnavailable = 0x80,
}

/// ASCQ values that disambiguate an ASC shared across conditions.
pub mod ascq {
    pub const BEGINNING_OF_PARTITION_MEDIUM_DETECTED: u8 = 0x04;
    pub const END_OF_PARTITION_MEDIUM_DETECTED: u8 = 0x05;
    pub const FILEMARK_DETECTED: u8 = 0x01;
}

/// The SCSI fault mechanism. Raised by device command handlers, caught by
/// the controller and converted into CHECK CONDITION + latched sense state
/// -- unless `reservation_conflict` is set, in which case the controller
/// reports status RESERVATION CONFLICT instead and leaves sense untouched,
/// per spec.md section 3 ("Reservation") and the original's
/// `StatusCode::RESERVATION_CONFLICT` (a status code, not a sense key).
#[derive(Debug, Clone, Copy, Error)]
#[error("SCSI exception: sense_key={sense_key:?} asc={asc:?} ascq={ascq}")]
pub struct ScsiException {
    pub sense_key: SenseKey,
    pub asc: Asc,
    pub ascq: u8,
    pub information: Option<u32>,
    pub filemark: bool,
    pub eom: bool,
    pub ili: bool,
    pub reservation_conflict: bool,
}

impl ScsiException {
    pub fn new(sense_key: SenseKey, asc: Asc) -> Self {
        Self {
            sense_key,
            asc,
            ascq: 0,
            information: None,
            filemark: false,
            eom: false,
            ili: false,
            reservation_conflict: false,
        }
    }

    /// RESERVATION CONFLICT: reported as a bare status code, no sense data
    /// latched. The `sense_key`/`asc` fields here are unused by the
    /// controller in this case but kept so the type stays uniform.
    pub fn reservation_conflict() -> Self {
        Self { reservation_conflict: true, ..Self::new(SenseKey::AbortedCommand, Asc::InternalTargetFailure) }
    }

    pub fn with_ascq(sense_key: SenseKey, asc: Asc, ascq: u8) -> Self {
        Self { ascq, ..Self::new(sense_key, asc) }
    }

    pub fn with_information(mut self, information: u32) -> Self {
        self.information = Some(information);
        self
    }

    pub fn with_filemark(mut self) -> Self {
        self.filemark = true;
        self
    }

    pub fn with_eom(mut self) -> Self {
        self.eom = true;
        self
    }

    pub fn with_ili(mut self) -> Self {
        self.ili = true;
        self
    }
}

pub type ScsiResult<T> = Result<T, ScsiException>;

/// Top-level error at the binary's `main()` boundary.
#[derive(Debug, Error)]
pub enum S2pError {
    #[error(transparent)]
    Parser(#[from] ParserError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Scsi(#[from] ScsiException),
}
