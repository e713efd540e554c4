//! Recording state machine states

use serde::Serialize;
use std::fmt;

/// Phase of a recording
///
/// `WarmingUp` moves to `Running` once the device acknowledges the start
/// command. Every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    /// Transfers are queued but the device has not switched to streaming yet
    WarmingUp,
    /// Device is streaming
    Running,
    /// The data callback asked to stop
    CompletedSuccessfully,
    /// Device disconnected
    DeviceGone,
    /// A transfer timed out, or warm-up ran out of retries
    Timeout,
    /// Device overran a transfer buffer
    Overflow,
    /// Any other transport failure
    Unknown,
}

impl RecordingState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordingState::WarmingUp | RecordingState::Running)
    }

    pub fn is_success(self) -> bool {
        self == RecordingState::CompletedSuccessfully
    }
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::WarmingUp
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::WarmingUp => "warming up",
            RecordingState::Running => "running",
            RecordingState::CompletedSuccessfully => "completed",
            RecordingState::DeviceGone => "device gone",
            RecordingState::Timeout => "timeout",
            RecordingState::Overflow => "overflow",
            RecordingState::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}
