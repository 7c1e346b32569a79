//! Error types for report output.

use thiserror::Error;

/// Failures while producing report output. Reports are best-effort: the
/// boundary consumes these (one stderr line at init, silence per-call).
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no output file configured")]
    NoOutputPath,
}
