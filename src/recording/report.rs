use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use super::state::RecordingState;

/// Outcome of a recording
#[derive(Debug, Clone, Serialize)]
pub struct RecordingReport {
    /// Identifies the recording in logs
    pub recording_id: Uuid,

    /// Label of the sample rate that was requested
    pub sample_rate: &'static str,

    /// Terminal state the recording ended in
    pub final_state: RecordingState,

    /// Bytes delivered to the data callback (one byte per sample)
    pub total_samples: u64,

    /// Data transfers completed while the recording was live
    pub total_transfers: u64,

    /// Timeouts after the device started streaming. The first one ends the
    /// recording, so this is 0 or 1.
    pub timeout_count: u32,

    /// Timeouts tolerated while warming up
    pub warmup_timeouts: u32,

    /// When the transfers were first submitted
    pub started_at: DateTime<Utc>,

    /// Wall-clock time from submission to teardown
    pub elapsed: Duration,
}

impl RecordingReport {
    pub fn is_success(&self) -> bool {
        self.final_state.is_success()
    }

    /// Effective throughput over the whole recording
    pub fn samples_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_samples as f64 / secs
        } else {
            0.0
        }
    }
}
