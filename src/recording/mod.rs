//! Streaming recording engine
//!
//! This module provides the `RecordingSession` that pulls a continuous byte
//! stream out of the analyzer:
//! - A pool of bulk-read transfers kept in flight for the whole recording
//! - Resubmission of completed transfers in place
//! - Warm-up handling until the device acknowledges the start command
//! - Terminal failure states for timeouts, disconnects and overflows

mod callback;
mod config;
mod pool;
mod report;
mod session;
mod state;

pub use callback::DataCallback;
pub use config::{
    RecordingConfig, DEFAULT_PUMP_INTERVAL, DEFAULT_TRANSFER_BUFFERS,
    DEFAULT_TRANSFER_BUFFER_SIZE, DEFAULT_TRANSFER_TIMEOUT, DEFAULT_WARMUP_TIMEOUT_BUDGET,
    DEFAULT_WARMUP_TRANSFERS, DEFAULT_WARMUP_TRANSFER_TIMEOUT,
};
pub use pool::{SlotPool, TransferSlot};
pub use report::RecordingReport;
pub use session::{execute, RecordingSession};
pub use state::RecordingState;
