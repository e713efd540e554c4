pub mod config;
pub mod error;
pub mod firmware;
pub mod rate;
pub mod recording;
pub mod sink;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use firmware::{DeviceControl, FirmwareCommand, FirmwareImage};
pub use rate::SampleRate;
pub use recording::{
    execute, DataCallback, RecordingConfig, RecordingReport, RecordingSession, RecordingState,
    SlotPool, TransferSlot,
};
pub use sink::SampleSink;
pub use transport::{
    Completion, TransferHandle, TransferStatus, TransportChannel, TransportError, UsbChannel,
};
