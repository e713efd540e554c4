//! Firmware readiness check and upload
//!
//! The analyzer enumerates without firmware. A firmware image is a table of
//! vendor control writes; each command names the `wValue`/`wIndex` of the
//! write and how many bytes of the image's data blob it carries.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::{TransportError, COMMAND_ENDPOINT};

/// Vendor request type, host-to-device
const FIRMWARE_REQUEST_TYPE: u8 = 0x40;
/// Firmware load request
const FIRMWARE_REQUEST: u8 = 0xA0;
const FIRMWARE_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

const PROBE_BYTE: u8 = 0x05;
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Time the device needs to renumerate after an upload
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Blocking control operations used during device setup
pub trait DeviceControl {
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError>;

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError>;
}

/// One control write of the upload sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FirmwareCommand {
    pub value: u16,
    pub index: u16,
    /// Number of data bytes this command carries
    pub length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareImage {
    pub commands: Vec<FirmwareCommand>,
    pub data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(commands: Vec<FirmwareCommand>, data: Vec<u8>) -> Result<Self> {
        let image = Self { commands, data };
        image.validate()?;
        Ok(image)
    }

    /// Load an image from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware image from {}", path.display());

        let contents = std::fs::read(path)
            .map_err(|e| Error::Firmware(format!("{}: {}", path.display(), e)))?;
        let image: FirmwareImage = serde_json::from_slice(&contents)
            .map_err(|e| Error::Firmware(format!("{}: {}", path.display(), e)))?;

        image.validate()?;
        Ok(image)
    }

    fn validate(&self) -> Result<()> {
        let total: usize = self.commands.iter().map(|c| c.length).sum();
        if total > self.data.len() {
            return Err(Error::Firmware(format!(
                "commands reference {} bytes but the image only has {}",
                total,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Pair every command with its slice of the data blob
    fn writes(&self) -> impl Iterator<Item = (&FirmwareCommand, &[u8])> {
        let mut offset = 0;
        self.commands.iter().map(move |command| {
            let chunk = &self.data[offset..offset + command.length];
            offset += command.length;
            (command, chunk)
        })
    }
}

/// Probe whether firmware is running by writing a single byte to the
/// command endpoint. A failed write means no firmware is loaded.
pub fn is_ready<D: DeviceControl + ?Sized>(device: &mut D) -> bool {
    match device.bulk_out(COMMAND_ENDPOINT, &[PROBE_BYTE], PROBE_TIMEOUT) {
        Ok(_) => true,
        Err(e) => {
            debug!("Firmware probe failed: {}", e);
            false
        }
    }
}

/// Replay the image's control writes, then wait `settle` for the device to
/// come back. Best effort: failed writes are logged and skipped.
///
/// Returns the number of writes the device rejected.
pub fn upload<D: DeviceControl + ?Sized>(
    device: &mut D,
    image: &FirmwareImage,
    settle: Duration,
) -> usize {
    info!("Uploading firmware ({} commands, {} bytes)", image.commands.len(), image.data.len());

    let mut failures = 0;
    for (command, chunk) in image.writes() {
        if let Err(e) = device.control_out(
            FIRMWARE_REQUEST_TYPE,
            FIRMWARE_REQUEST,
            command.value,
            command.index,
            chunk,
            FIRMWARE_WRITE_TIMEOUT,
        ) {
            warn!(
                "Firmware write {:#06x}/{:#06x} ({} bytes) failed: {}",
                command.value, command.index, command.length, e
            );
            failures += 1;
        }
    }

    std::thread::sleep(settle);

    info!("Firmware upload finished ({} failed writes)", failures);
    failures
}
