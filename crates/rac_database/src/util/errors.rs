use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// Bad device definitions in the spec
    #[error("DiskValidation: {0}")]
    DiskValidation(String),

    #[error("disk '{disk}' is still part of diskgroup '{disk_group}' and must be removed manually")]
    DiskInUse { disk: String, disk_group: String },

    #[error("cannot add and remove ASM disks in the same step (added: {added:?}, removed: {removed:?})")]
    DiskChangeConflict { added: Vec<String>, removed: Vec<String> },

    #[error("persistent volume {0} has a different disk configuration. Please delete or update the existing PV to proceed")]
    VolumeDrift(String),

    #[error("disk group {disk_group:?} has mismatched disk sizes: disk {disk:?} = {size_gb}GB, expected {expected_gb}GB")]
    DiskSizeMismatch {
        disk_group: String,
        disk: String,
        size_gb: u64,
        expected_gb: u64,
    },

    /// The disk probe found a path that is not a block device
    #[error("InvalidBlockDevice: {0}")]
    InvalidBlockDevice(String),

    #[error("ExecError: {0}")]
    ExecError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("MetricsError: {0}")]
    MetricsError(#[source] prometheus::Error),
}

/// How a failed step affects the rest of the pass and the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry later without touching the lifecycle state
    Transient,
    /// Spec or runtime check refused the change; nothing was mutated
    Blocking,
    /// Continuing could lose data; needs a human
    Fatal,
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let label = match self {
            StdError::JsonSerializationError(_) => "jsonserializationerror",
            StdError::KubeError(_) => "kubeerror",
            StdError::FinalizerError(_) => "finalizererror",
            StdError::MetadataMissing(_) => "metadatamissing",
            StdError::InvalidArgument(_) => "invalidargument",
            StdError::DiskValidation(_) => "diskvalidation",
            StdError::DiskInUse { .. } => "diskinuse",
            StdError::DiskChangeConflict { .. } => "diskchangeconflict",
            StdError::VolumeDrift(_) => "volumedrift",
            StdError::DiskSizeMismatch { .. } => "disksizemismatch",
            StdError::InvalidBlockDevice(_) => "invalidblockdevice",
            StdError::ExecError(_) => "execerror",
            StdError::Timeout(_) => "timeout",
            StdError::Cancelled(_) => "cancelled",
            StdError::MetricsError(_) => "metricserror",
        };
        label.to_string()
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StdError::VolumeDrift(_) | StdError::DiskSizeMismatch { .. } | StdError::InvalidBlockDevice(_) => {
                ErrorClass::Fatal
            }
            StdError::InvalidArgument(_)
            | StdError::DiskValidation(_)
            | StdError::DiskInUse { .. }
            | StdError::DiskChangeConflict { .. }
            | StdError::JsonSerializationError(_) => ErrorClass::Blocking,
            _ => ErrorClass::Transient,
        }
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::StdError(e) => e.class(),
            Error::ErrorWithRequeue(_) => ErrorClass::Transient,
        }
    }

    /// True for HTTP 409 responses from the API server.
    pub fn is_conflict(&self) -> bool {
        let inner = match self {
            Error::StdError(e) => e,
            Error::ErrorWithRequeue(e) => &e.error,
        };
        matches!(inner, StdError::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }

    pub fn requeue(error: StdError, duration: Duration) -> Self {
        Error::ErrorWithRequeue(ErrorWithRequeue::new(error, duration))
    }
}

impl From<StdError> for Error {
    fn from(e: StdError) -> Self {
        Error::StdError(e)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::StdError(StdError::KubeError(e))
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::StdError(StdError::MetricsError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::StdError(StdError::JsonSerializationError(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
