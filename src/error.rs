use thiserror::Error;

use crate::db::SinkError;
use crate::sniff::CaptureError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("storage error: {0}")]
    Sink(#[from] SinkError),
    #[error("report encoding error: {0}")]
    Report(#[from] serde_json::Error),
    #[error("signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
