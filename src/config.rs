use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::rate::SampleRate;
use crate::recording::{
    RecordingConfig, DEFAULT_PUMP_INTERVAL, DEFAULT_TRANSFER_BUFFERS,
    DEFAULT_TRANSFER_BUFFER_SIZE, DEFAULT_TRANSFER_TIMEOUT, DEFAULT_WARMUP_TIMEOUT_BUDGET,
    DEFAULT_WARMUP_TRANSFERS, DEFAULT_WARMUP_TRANSFER_TIMEOUT,
};

/// Saleae Logic
pub const DEFAULT_VENDOR_ID: u16 = 0x0925;
pub const DEFAULT_PRODUCT_ID: u16 = 0x3881;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub usb: UsbConfig,
    pub recording: TuningConfig,
}

#[derive(Debug, Deserialize)]
pub struct UsbConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    /// Log level of the USB stack, 0 (silent) to 3 (verbose)
    pub debug_level: u8,
}

#[derive(Debug, Deserialize)]
pub struct TuningConfig {
    pub transfer_buffer_size: usize,
    pub n_transfer_buffers: usize,
    pub transfer_timeout_ms: u64,
    pub warmup_transfer_timeout_ms: u64,
    pub warmup_transfers: u64,
    pub warmup_timeout_budget: u32,
    pub pump_interval_ms: u64,
}

impl Config {
    /// Load defaults, then the optional file at `path`, then `SLOGIC_*`
    /// environment variables (e.g. `SLOGIC_RECORDING__N_TRANSFER_BUFFERS`)
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("usb.vendor_id", DEFAULT_VENDOR_ID as i64)?
            .set_default("usb.product_id", DEFAULT_PRODUCT_ID as i64)?
            .set_default("usb.interface", 0)?
            .set_default("usb.debug_level", 0)?
            .set_default("recording.transfer_buffer_size", DEFAULT_TRANSFER_BUFFER_SIZE as i64)?
            .set_default("recording.n_transfer_buffers", DEFAULT_TRANSFER_BUFFERS as i64)?
            .set_default(
                "recording.transfer_timeout_ms",
                DEFAULT_TRANSFER_TIMEOUT.as_millis() as i64,
            )?
            .set_default(
                "recording.warmup_transfer_timeout_ms",
                DEFAULT_WARMUP_TRANSFER_TIMEOUT.as_millis() as i64,
            )?
            .set_default("recording.warmup_transfers", DEFAULT_WARMUP_TRANSFERS as i64)?
            .set_default(
                "recording.warmup_timeout_budget",
                DEFAULT_WARMUP_TIMEOUT_BUDGET as i64,
            )?
            .set_default("recording.pump_interval_ms", DEFAULT_PUMP_INTERVAL.as_millis() as i64)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("SLOGIC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Recording configuration for `sample_rate` with this file's tuning
    pub fn recording(&self, sample_rate: &'static SampleRate) -> RecordingConfig {
        let tuning = &self.recording;
        let mut config = RecordingConfig::new(sample_rate).tune(
            tuning.transfer_buffer_size,
            tuning.n_transfer_buffers,
            tuning.transfer_timeout_ms,
        );
        config.warmup_transfer_timeout = Duration::from_millis(tuning.warmup_transfer_timeout_ms);
        config.warmup_transfers = tuning.warmup_transfers;
        config.warmup_timeout_budget = tuning.warmup_timeout_budget;
        config.pump_interval = Duration::from_millis(tuning.pump_interval_ms);
        config.drain_timeout = config.transfer_timeout;
        config
    }
}
