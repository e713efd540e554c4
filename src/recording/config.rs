use std::time::Duration;

use crate::error::{Error, Result};
use crate::rate::SampleRate;

pub const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_TRANSFER_BUFFERS: usize = 4;
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);
/// Timeout of reads submitted before the device streams. The device is
/// silent until the start command, so these are expected to time out.
pub const DEFAULT_WARMUP_TRANSFER_TIMEOUT: Duration = Duration::from_millis(4);
/// Completed transfers before the start command is sent
pub const DEFAULT_WARMUP_TRANSFERS: u64 = 200;
/// Timeouts tolerated before the device acknowledges the start command
pub const DEFAULT_WARMUP_TIMEOUT_BUDGET: u32 = 1000;
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a single recording
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub sample_rate: &'static SampleRate,

    /// Size of each transfer buffer in bytes
    pub transfer_buffer_size: usize,

    /// Number of transfers kept in flight
    pub n_transfer_buffers: usize,

    /// Per-transfer timeout
    pub transfer_timeout: Duration,

    /// Per-transfer timeout of reads submitted before the device
    /// acknowledged the start command
    pub warmup_transfer_timeout: Duration,

    /// Number of transfer completions to wait for before sending the start
    /// command. Zero sends it right after the pool is submitted.
    pub warmup_transfers: u64,

    /// Timeouts tolerated while warming up
    pub warmup_timeout_budget: u32,

    /// Upper bound for a single event pump
    pub pump_interval: Duration,

    /// How long teardown waits for cancelled transfers to come back
    pub drain_timeout: Duration,
}

impl RecordingConfig {
    pub fn new(sample_rate: &'static SampleRate) -> Self {
        Self {
            sample_rate,
            transfer_buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
            n_transfer_buffers: DEFAULT_TRANSFER_BUFFERS,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            warmup_transfer_timeout: DEFAULT_WARMUP_TRANSFER_TIMEOUT,
            warmup_transfers: DEFAULT_WARMUP_TRANSFERS,
            warmup_timeout_budget: DEFAULT_WARMUP_TIMEOUT_BUDGET,
            pump_interval: DEFAULT_PUMP_INTERVAL,
            drain_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    /// Override the transfer tuning. Zero leaves a value unchanged.
    pub fn tune(
        mut self,
        transfer_buffer_size: usize,
        n_transfer_buffers: usize,
        transfer_timeout_ms: u64,
    ) -> Self {
        if transfer_buffer_size != 0 {
            self.transfer_buffer_size = transfer_buffer_size;
        }
        if n_transfer_buffers != 0 {
            self.n_transfer_buffers = n_transfer_buffers;
        }
        if transfer_timeout_ms != 0 {
            self.transfer_timeout = Duration::from_millis(transfer_timeout_ms);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer_buffer_size == 0 {
            return Err(Error::Config("transfer buffer size must be positive".to_string()));
        }
        if self.n_transfer_buffers == 0 {
            return Err(Error::Config("transfer buffer count must be positive".to_string()));
        }
        if self.transfer_timeout.is_zero() {
            return Err(Error::Config("transfer timeout must be positive".to_string()));
        }
        if self.pump_interval.is_zero() {
            return Err(Error::Config("pump interval must be positive".to_string()));
        }
        if self.warmup_transfer_timeout.is_zero() {
            return Err(Error::Config("warm-up transfer timeout must be positive".to_string()));
        }
        if self.warmup_timeout_budget == 0 {
            return Err(Error::Config("warm-up timeout budget must be positive".to_string()));
        }
        // Every warm-up read times out, so the budget has to outlast them
        if self.warmup_transfers >= u64::from(self.warmup_timeout_budget) {
            return Err(Error::Config(format!(
                "{} warm-up transfers would exhaust the warm-up timeout budget of {}",
                self.warmup_transfers, self.warmup_timeout_budget
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate() -> &'static SampleRate {
        SampleRate::lookup("1MHz").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = RecordingConfig::new(rate());
        assert_eq!(config.transfer_buffer_size, 4096);
        assert_eq!(config.n_transfer_buffers, 4);
        assert_eq!(config.transfer_timeout, Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tune_zero_keeps_defaults() {
        let config = RecordingConfig::new(rate()).tune(0, 0, 0);
        assert_eq!(config.transfer_buffer_size, DEFAULT_TRANSFER_BUFFER_SIZE);
        assert_eq!(config.n_transfer_buffers, DEFAULT_TRANSFER_BUFFERS);
        assert_eq!(config.transfer_timeout, DEFAULT_TRANSFER_TIMEOUT);
    }

    #[test]
    fn test_tune_overrides() {
        let config = RecordingConfig::new(rate()).tune(512, 16, 250);
        assert_eq!(config.transfer_buffer_size, 512);
        assert_eq!(config.n_transfer_buffers, 16);
        assert_eq!(config.transfer_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = RecordingConfig::new(rate());
        config.n_transfer_buffers = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = RecordingConfig::new(rate());
        config.pump_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = RecordingConfig::new(rate());
        config.warmup_transfer_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_warmup_outlasting_budget() {
        let mut config = RecordingConfig::new(rate());
        config.warmup_transfers = 50;
        config.warmup_timeout_budget = 50;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.warmup_timeout_budget = 51;
        assert!(config.validate().is_ok());

        // Sending the command straight away needs no budget headroom
        config.warmup_transfers = 0;
        config.warmup_timeout_budget = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_warmup_is_short() {
        let config = RecordingConfig::new(rate());
        let worst_case = config.warmup_transfer_timeout * config.warmup_transfers as u32;
        assert!(worst_case <= Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }
}
