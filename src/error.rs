use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Couldn't find shared library {library}, is iperf3 installed? ({reason})")]
    Load { library: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("stdout capture is already active in this process")]
    CaptureBusy,

    #[error("Test cancelled")]
    Cancelled,

    #[error("Test timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server worker exited without handing back a result")]
    WorkerLost,
}

pub type Result<T> = std::result::Result<T, Error>;
