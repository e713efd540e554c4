//! Transfer slot pool
//!
//! A fixed set of reusable bulk-read transfers owned by one recording. Each
//! slot keeps its buffer for the whole recording: while a transfer is in
//! flight the buffer is lent to the transport, and it comes back with the
//! completion to be resubmitted in place.

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::{TransferHandle, TransportChannel, TransportError};

/// One reusable (buffer, in-flight request) pair
#[derive(Debug)]
pub struct TransferSlot {
    /// Present while the slot is idle, lent to the transport while in flight
    buffer: Option<Vec<u8>>,
    handle: Option<TransferHandle>,
    sequence_number: u64,
    cancel_requested: bool,
    released: bool,
}

impl TransferSlot {
    fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer: Some(buffer),
            handle: None,
            sequence_number: 0,
            cancel_requested: false,
            released: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.handle.is_some()
    }

    /// Sequence number of the most recent submission
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn handle(&self) -> Option<TransferHandle> {
        self.handle
    }
}

#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<TransferSlot>,
    endpoint: u8,
    timeout: Duration,
    next_sequence: u64,
}

impl SlotPool {
    /// Allocate `count` slots with `buffer_size`-byte buffers reading from
    /// `endpoint`
    pub fn allocate(
        count: usize,
        buffer_size: usize,
        endpoint: u8,
        timeout: Duration,
    ) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(count)?;

        for _ in 0..count {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(buffer_size)?;
            buffer.resize(buffer_size, 0);
            slots.push(TransferSlot::new(buffer));
        }

        debug!("Allocated {} transfer slots of {} bytes", count, buffer_size);

        Ok(Self {
            slots,
            endpoint,
            timeout,
            next_sequence: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[TransferSlot] {
        &self.slots
    }

    /// Number of slots whose transfer is currently owned by the transport
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_flight()).count()
    }

    /// Timeout for the next submissions. Transfers already in flight keep
    /// the one they were submitted with.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sequence number the next submission will get
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Submit every slot. Stops at the first failure.
    pub fn submit_all<C>(&mut self, channel: &mut C) -> std::result::Result<(), TransportError>
    where
        C: TransportChannel + ?Sized,
    {
        for index in 0..self.slots.len() {
            self.submit(index, channel)?;
        }
        Ok(())
    }

    /// Submit (or resubmit) the slot at `index`, reusing its buffer
    pub fn submit<C>(
        &mut self,
        index: usize,
        channel: &mut C,
    ) -> std::result::Result<u64, TransportError>
    where
        C: TransportChannel + ?Sized,
    {
        let endpoint = self.endpoint;
        let slot = self.slots.get_mut(index).ok_or_else(|| TransportError::Submit {
            endpoint,
            reason: format!("no transfer slot {}", index),
        })?;

        if slot.in_flight() {
            return Err(TransportError::Submit {
                endpoint,
                reason: format!("transfer slot {} is already in flight", index),
            });
        }
        let buffer = slot.buffer.take().ok_or_else(|| TransportError::Submit {
            endpoint,
            reason: format!("transfer slot {} has no buffer", index),
        })?;

        let handle = channel.submit_bulk_read(endpoint, buffer, self.timeout)?;

        slot.handle = Some(handle);
        slot.cancel_requested = false;
        slot.sequence_number = self.next_sequence;
        self.next_sequence += 1;

        Ok(slot.sequence_number)
    }

    /// Index of the slot that owns `handle`
    pub fn find(&self, handle: TransferHandle) -> Option<usize> {
        self.slots.iter().position(|slot| slot.handle == Some(handle))
    }

    /// Take back a completed transfer's buffer
    pub fn reclaim(&mut self, index: usize, buffer: Vec<u8>) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.handle = None;
            slot.cancel_requested = false;
            if slot.released {
                return;
            }
            slot.buffer = Some(buffer);
        }
    }

    /// Ask the transport to cancel every in-flight transfer. Safe to call
    /// repeatedly; each transfer is cancelled at most once.
    pub fn cancel_all<C>(&mut self, channel: &mut C)
    where
        C: TransportChannel + ?Sized,
    {
        for slot in &mut self.slots {
            if let (Some(handle), false) = (slot.handle, slot.cancel_requested) {
                channel.cancel(handle);
                slot.cancel_requested = true;
            }
        }
    }

    /// Drop every idle buffer. Returns the number of buffers released now.
    ///
    /// Buffers of transfers still owned by the transport are left to the
    /// transport; such slots are never handed a buffer again.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for slot in &mut self.slots {
            if slot.released {
                continue;
            }
            slot.released = true;
            if slot.buffer.take().is_some() {
                released += 1;
            }
        }

        let stranded = self.in_flight();
        if stranded > 0 {
            warn!("{} transfers were still in flight when the pool was released", stranded);
        }

        released
    }
}
