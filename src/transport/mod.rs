//! Transport channel capability
//!
//! The recording engine never talks to USB directly. It drives an already
//! opened, interface-claimed channel through [`TransportChannel`]: bulk reads
//! and writes are submitted asynchronously, and their completions come back
//! out of [`TransportChannel::pump_events`]. Buffers travel with the request
//! and are handed back in the [`Completion`], so a submitted buffer is owned
//! by the transport until it completes.

pub mod usb;

use std::time::Duration;
use thiserror::Error;

pub use usb::UsbChannel;

/// Endpoint the start-streaming command (and readiness probe) is written to
pub const COMMAND_ENDPOINT: u8 = 0x01;

/// Endpoint sample data streams in on (endpoint 2, IN direction)
pub const STREAM_ENDPOINT: u8 = 0x82;

/// Opaque identifier of a submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferHandle(pub u64);

/// Final status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    /// Transfer finished; `actual_length` bytes are valid
    Completed,
    /// Per-transfer timeout elapsed before any data arrived
    TimedOut,
    /// Endpoint halted
    Stalled,
    /// Transfer was cancelled before completing
    Cancelled,
    /// Device disconnected
    NoDevice,
    /// Device sent more data than the buffer could hold
    Overflow,
    /// Any other transport failure
    Error,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// A finished transfer, handed back by the transport
#[derive(Debug)]
pub struct Completion {
    pub handle: TransferHandle,
    pub status: TransferStatus,
    /// The buffer that was submitted, returned for reuse
    pub buffer: Vec<u8>,
    /// Number of bytes actually transferred
    pub actual_length: usize,
}

impl Completion {
    /// The received bytes (empty unless the transfer completed)
    pub fn data(&self) -> &[u8] {
        let len = self.actual_length.min(self.buffer.len());
        &self.buffer[..len]
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No device found with id {vendor_id:04x}:{product_id:04x}")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("Failed to submit transfer on endpoint {endpoint:#04x}: {reason}")]
    Submit { endpoint: u8, reason: String },

    #[error("Transfer on endpoint {endpoint:#04x} ended with {status:?}")]
    Status { endpoint: u8, status: TransferStatus },

    #[error("Event processing failed: {0}")]
    Events(String),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),
}

/// An open, firmware-ready communication channel to the device
///
/// Completion handling is single-threaded: completions are only produced
/// from inside `pump_events`, on the caller's thread, and the caller is free
/// to submit again once `pump_events` has returned.
pub trait TransportChannel {
    /// Queue a bulk read of up to `buffer.len()` bytes
    fn submit_bulk_read(
        &mut self,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransferHandle, TransportError>;

    /// Queue a bulk write of `data`
    fn submit_bulk_write(
        &mut self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransferHandle, TransportError>;

    /// Request cancellation of a transfer
    ///
    /// Cancelling a transfer that already completed, was already cancelled or
    /// was never submitted is a no-op. A cancelled transfer still produces a
    /// completion (status `Cancelled`) on a later pump so its buffer returns.
    fn cancel(&mut self, handle: TransferHandle);

    /// Wait up to `max_wait` for transfer events and append every finished
    /// transfer to `completed`, in delivery order
    fn pump_events(
        &mut self,
        max_wait: Duration,
        completed: &mut Vec<Completion>,
    ) -> Result<(), TransportError>;
}
