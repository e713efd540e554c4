//! Error types
//!
//! Library-level errors. The command-line tool wraps these in `anyhow`.

use thiserror::Error;

use crate::recording::RecordingReport;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to allocate transfer buffers: {0}")]
    Allocation(#[from] std::collections::TryReserveError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Firmware error: {0}")]
    Firmware(String),

    #[error(
        "Recording ended in state {} after {} samples in {} transfers",
        .0.final_state,
        .0.total_samples,
        .0.total_transfers
    )]
    Recording(Box<RecordingReport>),
}

impl Error {
    /// The report of a recording that reached a failure state, if any
    pub fn report(&self) -> Option<&RecordingReport> {
        match self {
            Error::Recording(report) => Some(report),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
