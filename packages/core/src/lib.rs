pub mod background;
pub mod capture;
pub mod compositor;
pub mod error;
pub mod export;
pub mod remote;
pub mod source;

pub use background::{BackgroundSpec, Color, ImageHandle};
pub use capture::{ExportArtifact, CAPTURE_FRAME_RATE};
pub use error::{BackdropError, BackdropResult, ExportErrorKind, ExportFailure, ExportStage};
pub use export::{wait_terminal, ExportJob, ExportService, ExportStatus};
pub use source::SourceRef;
