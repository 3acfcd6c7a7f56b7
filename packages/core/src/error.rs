use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackdropError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to fetch source media: {0}")]
    SourceFetch(String),

    #[error("Failed to decode source media: {0}")]
    SourceDecode(String),

    #[error("Compositing error: {0}")]
    Composite(String),

    #[error("No supported video encoding found")]
    NoSupportedEncoding,

    #[error("Failed to start capture: {0}")]
    CaptureStart(String),

    #[error("Segmentation service error: {0}")]
    RemoteService(String),

    #[error("Free request limit reached ({used}/{limit}). Please check back later.")]
    QuotaExceeded { used: u32, limit: u32 },

    #[error("Source video too long: {actual_secs:.1}s (maximum {max_secs}s)")]
    SourceTooLong { actual_secs: f64, max_secs: u64 },
}

pub type BackdropResult<T> = Result<T, BackdropError>;

/// Pipeline stage an error originated in, carried with every failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    LoadingSource,
    Compositing,
    Finalizing,
}

impl std::fmt::Display for ExportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportStage::LoadingSource => write!(f, "loading source"),
            ExportStage::Compositing => write!(f, "compositing"),
            ExportStage::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Error detail published on a failed export job.
///
/// The message is suitable for verbatim display to the user.
#[derive(Debug, Clone)]
pub struct ExportFailure {
    pub stage: ExportStage,
    pub kind: ExportErrorKind,
    pub message: String,
}

/// Error kind without payload, for matching on the originating failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportErrorKind {
    SourceFetch,
    SourceDecode,
    Composite,
    NoSupportedEncoding,
    CaptureStart,
    RemoteService,
    QuotaExceeded,
    Other,
}

impl ExportFailure {
    pub fn new(stage: ExportStage, error: &BackdropError) -> Self {
        let kind = match error {
            BackdropError::SourceFetch(_) => ExportErrorKind::SourceFetch,
            BackdropError::SourceDecode(_) => ExportErrorKind::SourceDecode,
            BackdropError::Composite(_) => ExportErrorKind::Composite,
            BackdropError::NoSupportedEncoding => ExportErrorKind::NoSupportedEncoding,
            BackdropError::CaptureStart(_) => ExportErrorKind::CaptureStart,
            BackdropError::RemoteService(_) => ExportErrorKind::RemoteService,
            BackdropError::QuotaExceeded { .. } => ExportErrorKind::QuotaExceeded,
            _ => ExportErrorKind::Other,
        };

        Self {
            stage,
            kind,
            message: format!("{}: {}", stage, error),
        }
    }
}
