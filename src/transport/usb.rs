//! USB transport backed by nusb transfer queues
//!
//! Every endpoint gets its own nusb queue, so all submitted transfers are on
//! the bus at once and complete in submission order. nusb transfers carry no
//! timeout: when the oldest transfer on an endpoint passes its deadline the
//! endpoint queue is cancelled. Expired transfers then report `TimedOut`, and
//! the ones caught up in the cancellation are submitted again unchanged.

use nusb::transfer::{
    Completion as QueueCompletion, Control, ControlType, Queue, Recipient, RequestBuffer,
    ResponseBuffer, TransferError,
};
use nusb::Interface;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::poll_fn;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::{Completion, TransferHandle, TransferStatus, TransportChannel, TransportError};
use crate::firmware::DeviceControl;

const ENDPOINT_DIR_IN: u8 = 0x80;

impl From<TransferError> for TransferStatus {
    fn from(error: TransferError) -> Self {
        match error {
            TransferError::Cancelled => TransferStatus::Cancelled,
            TransferError::Stall => TransferStatus::Stalled,
            TransferError::Disconnected => TransferStatus::NoDevice,
            // usbfs reports babble (EOVERFLOW) as a fault
            TransferError::Fault => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    handle: TransferHandle,
    /// Requested length in bytes
    length: usize,
    deadline: Instant,
    cancel_requested: bool,
}

/// What to do with a transfer that came off an endpoint queue
#[derive(Debug, PartialEq, Eq)]
enum Settled {
    Deliver(Pending, TransferStatus),
    /// Cancelled along with an expired or cancelled neighbour
    Resubmit(Pending),
}

/// Transfers queued on one endpoint, oldest first
#[derive(Debug, Default)]
struct InFlight {
    pending: VecDeque<Pending>,
    /// Transfers at the front covered by the last `cancel_all`
    aborting: usize,
}

impl InFlight {
    fn push(&mut self, pending: Pending) {
        self.pending.push_back(pending);
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    /// Mark `handle` cancelled. Returns true when the endpoint queue has to be
    /// cancelled for the request to take effect.
    fn request_cancel(&mut self, handle: TransferHandle) -> bool {
        let Some(position) = self.pending.iter().position(|p| p.handle == handle) else {
            return false;
        };
        let pending = &mut self.pending[position];
        if pending.cancel_requested {
            return false;
        }
        pending.cancel_requested = true;
        position >= self.aborting
    }

    fn begin_abort(&mut self) {
        self.aborting = self.pending.len();
    }

    /// Deadline of the oldest transfer, unless it is already being aborted
    fn next_deadline(&self) -> Option<Instant> {
        if self.aborting > 0 {
            return None;
        }
        self.pending.front().map(|p| p.deadline)
    }

    fn expired(&self, now: Instant) -> bool {
        self.next_deadline().is_some_and(|deadline| deadline <= now)
    }

    fn settle(
        &mut self,
        result: Result<(), TransferError>,
        actual_length: usize,
        now: Instant,
    ) -> Option<Settled> {
        let pending = self.pending.pop_front()?;
        let aborted = self.aborting > 0;
        self.aborting = self.aborting.saturating_sub(1);

        let status = match result {
            Ok(()) => TransferStatus::Completed,
            Err(TransferError::Cancelled) if aborted => {
                if pending.cancel_requested {
                    TransferStatus::Cancelled
                } else if pending.deadline <= now {
                    TransferStatus::TimedOut
                } else if actual_length > 0 {
                    TransferStatus::Completed
                } else {
                    return Some(Settled::Resubmit(pending));
                }
            }
            Err(e) => TransferStatus::from(e),
        };
        Some(Settled::Deliver(pending, status))
    }
}

struct InEndpoint {
    queue: Queue<RequestBuffer>,
    in_flight: InFlight,
}

struct OutEndpoint {
    queue: Queue<Vec<u8>>,
    in_flight: InFlight,
    /// Copy of each queued payload, for resubmission
    payloads: HashMap<TransferHandle, Vec<u8>>,
}

enum Event {
    Read(u8, QueueCompletion<Vec<u8>>),
    Write(u8, QueueCompletion<ResponseBuffer>),
}

impl InEndpoint {
    fn expire(&mut self, endpoint: u8, now: Instant) {
        if self.in_flight.expired(now) {
            debug!("Read on endpoint {:#04x} timed out, cancelling its queue", endpoint);
            self.in_flight.begin_abort();
            self.queue.cancel_all();
        }
    }

    fn settle(
        &mut self,
        completion: QueueCompletion<Vec<u8>>,
        now: Instant,
        completed: &mut Vec<Completion>,
    ) {
        let mut buffer = completion.data;
        let actual_length = buffer.len();

        match self.in_flight.settle(completion.status, actual_length, now) {
            Some(Settled::Deliver(pending, status)) => {
                buffer.resize(pending.length, 0);
                completed.push(Completion {
                    handle: pending.handle,
                    status,
                    buffer,
                    actual_length,
                });
            }
            Some(Settled::Resubmit(pending)) => {
                self.queue.submit(RequestBuffer::reuse(buffer, pending.length));
                self.in_flight.push(pending);
            }
            None => warn!("Read completed with nothing queued"),
        }
    }
}

impl OutEndpoint {
    fn expire(&mut self, endpoint: u8, now: Instant) {
        if self.in_flight.expired(now) {
            debug!("Write on endpoint {:#04x} timed out, cancelling its queue", endpoint);
            self.in_flight.begin_abort();
            self.queue.cancel_all();
        }
    }

    fn settle(
        &mut self,
        completion: QueueCompletion<ResponseBuffer>,
        now: Instant,
        completed: &mut Vec<Completion>,
    ) {
        let actual_length = completion.data.actual_length();

        match self.in_flight.settle(completion.status, actual_length, now) {
            Some(Settled::Deliver(pending, status)) => {
                let buffer = self.payloads.remove(&pending.handle).unwrap_or_default();
                completed.push(Completion {
                    handle: pending.handle,
                    status,
                    buffer,
                    actual_length,
                });
            }
            Some(Settled::Resubmit(pending)) => {
                let data = self.payloads.get(&pending.handle).cloned().unwrap_or_default();
                self.queue.submit(data);
                self.in_flight.push(pending);
            }
            None => warn!("Write completed with nothing queued"),
        }
    }
}

fn poll_any(
    reads: &mut BTreeMap<u8, InEndpoint>,
    writes: &mut BTreeMap<u8, OutEndpoint>,
    cx: &mut Context<'_>,
) -> Poll<Event> {
    for (&endpoint, ep) in writes.iter_mut() {
        if ep.queue.pending() > 0 {
            if let Poll::Ready(completion) = ep.queue.poll_next(cx) {
                return Poll::Ready(Event::Write(endpoint, completion));
            }
        }
    }
    for (&endpoint, ep) in reads.iter_mut() {
        if ep.queue.pending() > 0 {
            if let Poll::Ready(completion) = ep.queue.poll_next(cx) {
                return Poll::Ready(Event::Read(endpoint, completion));
            }
        }
    }
    Poll::Pending
}

/// An opened, interface-claimed logic analyzer
pub struct UsbChannel {
    interface: Interface,
    runtime: Runtime,
    next_handle: u64,
    reads: BTreeMap<u8, InEndpoint>,
    writes: BTreeMap<u8, OutEndpoint>,
}

impl UsbChannel {
    /// Open the first device matching `vendor_id:product_id` and claim `interface`
    pub fn open(vendor_id: u16, product_id: u16, interface: u8) -> Result<Self, TransportError> {
        info!("Opening USB device {:04x}:{:04x}", vendor_id, product_id);

        let info = nusb::list_devices()?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or(TransportError::NotFound {
                vendor_id,
                product_id,
            })?;

        let device = info.open()?;
        if let Err(e) = device.set_configuration(1) {
            warn!("Failed to select configuration 1: {}", e);
        }

        // Detaches an active kernel driver where the platform has one
        let claimed = device.detach_and_claim_interface(interface)?;
        if let Err(e) = claimed.set_alt_setting(0) {
            warn!("Failed to select alternate setting 0: {}", e);
        }

        debug!("Claimed interface {}", interface);
        Self::new(claimed)
    }

    /// Drive an already claimed interface
    pub fn new(interface: Interface) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        Ok(Self {
            interface,
            runtime,
            next_handle: 0,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        })
    }

    fn pending(&mut self, length: usize, timeout: Duration) -> Pending {
        let handle = TransferHandle(self.next_handle);
        self.next_handle += 1;
        Pending {
            handle,
            length,
            deadline: Instant::now() + timeout,
            cancel_requested: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.reads.values().all(|ep| ep.in_flight.len() == 0)
            && self.writes.values().all(|ep| ep.in_flight.len() == 0)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let reads = self.reads.values().filter_map(|ep| ep.in_flight.next_deadline());
        let writes = self.writes.values().filter_map(|ep| ep.in_flight.next_deadline());
        reads.chain(writes).min()
    }
}

impl TransportChannel for UsbChannel {
    fn submit_bulk_read(
        &mut self,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransferHandle, TransportError> {
        if endpoint & ENDPOINT_DIR_IN == 0 {
            return Err(TransportError::Submit {
                endpoint,
                reason: "bulk read on an OUT endpoint".to_string(),
            });
        }

        let length = buffer.len();
        let pending = self.pending(length, timeout);
        let interface = &self.interface;
        let ep = self.reads.entry(endpoint).or_insert_with(|| InEndpoint {
            queue: interface.bulk_in_queue(endpoint),
            in_flight: InFlight::default(),
        });

        ep.queue.submit(RequestBuffer::reuse(buffer, length));
        ep.in_flight.push(pending);
        Ok(pending.handle)
    }

    fn submit_bulk_write(
        &mut self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransferHandle, TransportError> {
        if endpoint & ENDPOINT_DIR_IN != 0 {
            return Err(TransportError::Submit {
                endpoint,
                reason: "bulk write on an IN endpoint".to_string(),
            });
        }

        let pending = self.pending(data.len(), timeout);
        let interface = &self.interface;
        let ep = self.writes.entry(endpoint).or_insert_with(|| OutEndpoint {
            queue: interface.bulk_out_queue(endpoint),
            in_flight: InFlight::default(),
            payloads: HashMap::new(),
        });

        ep.payloads.insert(pending.handle, data.clone());
        ep.queue.submit(data);
        ep.in_flight.push(pending);
        Ok(pending.handle)
    }

    fn cancel(&mut self, handle: TransferHandle) {
        for ep in self.reads.values_mut() {
            if ep.in_flight.request_cancel(handle) {
                ep.in_flight.begin_abort();
                ep.queue.cancel_all();
            }
        }
        for ep in self.writes.values_mut() {
            if ep.in_flight.request_cancel(handle) {
                ep.in_flight.begin_abort();
                ep.queue.cancel_all();
            }
        }
    }

    fn pump_events(
        &mut self,
        max_wait: Duration,
        completed: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        let mut deadline = Instant::now() + max_wait;
        let delivered = completed.len();

        loop {
            let now = Instant::now();
            for (&endpoint, ep) in self.reads.iter_mut() {
                ep.expire(endpoint, now);
            }
            for (&endpoint, ep) in self.writes.iter_mut() {
                ep.expire(endpoint, now);
            }

            if self.is_idle() {
                return Ok(());
            }

            let wake = self.next_deadline().map_or(deadline, |d| d.min(deadline));
            let wait = wake.saturating_duration_since(now);

            let Self {
                runtime,
                reads,
                writes,
                ..
            } = &mut *self;
            let event = runtime.block_on(async {
                tokio::time::timeout(wait, poll_fn(|cx| poll_any(reads, writes, cx))).await
            });

            match event {
                Ok(Event::Read(endpoint, completion)) => {
                    if let Some(ep) = self.reads.get_mut(&endpoint) {
                        ep.settle(completion, Instant::now(), completed);
                    }
                }
                Ok(Event::Write(endpoint, completion)) => {
                    if let Some(ep) = self.writes.get_mut(&endpoint) {
                        ep.settle(completion, Instant::now(), completed);
                    }
                }
                Err(_) if Instant::now() >= deadline => return Ok(()),
                Err(_) => {}
            }

            // Once something was delivered only collect what is already done
            if completed.len() > delivered {
                deadline = deadline.min(Instant::now());
            }
        }
    }
}

fn control(request_type: u8, request: u8, value: u16, index: u16) -> Control {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match request_type & 0x1f {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    Control {
        control_type,
        recipient,
        request,
        value,
        index,
    }
}

impl DeviceControl for UsbChannel {
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let control = control(request_type, request, value, index);
        Ok(self.interface.control_out_blocking(control, data, timeout)?)
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let handle = self.submit_bulk_write(endpoint, data.to_vec(), timeout)?;

        // The queue is cancelled at the deadline, so the write comes back soon after
        let give_up = Instant::now() + timeout * 2;
        let mut completed = Vec::new();
        while Instant::now() < give_up {
            self.pump_events(timeout, &mut completed)?;
            if let Some(completion) = completed.iter().find(|c| c.handle == handle) {
                return match completion.status {
                    TransferStatus::Completed => Ok(completion.actual_length),
                    status => Err(TransportError::Status { endpoint, status }),
                };
            }
        }

        self.cancel(handle);
        Err(TransportError::Status {
            endpoint,
            status: TransferStatus::TimedOut,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn queued(count: u64, now: Instant) -> InFlight {
        let mut in_flight = InFlight::default();
        for n in 0..count {
            in_flight.push(Pending {
                handle: TransferHandle(n),
                length: 512,
                deadline: now + TIMEOUT * (n as u32 + 1),
                cancel_requested: false,
            });
        }
        in_flight
    }

    fn delivered(settled: Option<Settled>) -> (TransferHandle, TransferStatus) {
        match settled {
            Some(Settled::Deliver(pending, status)) => (pending.handle, status),
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_transfer_error_mapping() {
        let cases = [
            (TransferError::Cancelled, TransferStatus::Cancelled),
            (TransferError::Stall, TransferStatus::Stalled),
            (TransferError::Disconnected, TransferStatus::NoDevice),
            (TransferError::Fault, TransferStatus::Overflow),
            (TransferError::Unknown, TransferStatus::Error),
        ];
        for (error, status) in cases {
            let name = format!("{error:?}");
            assert_eq!(TransferStatus::from(error), status, "{name}");
        }
    }

    #[test]
    fn test_completion_in_order() {
        let now = Instant::now();
        let mut in_flight = queued(2, now);

        assert_eq!(
            delivered(in_flight.settle(Ok(()), 512, now)),
            (TransferHandle(0), TransferStatus::Completed)
        );
        assert_eq!(
            delivered(in_flight.settle(Err(TransferError::Disconnected), 0, now)),
            (TransferHandle(1), TransferStatus::NoDevice)
        );
        assert_eq!(in_flight.settle(Ok(()), 0, now), None);
    }

    #[test]
    fn test_cancel_reports_cancelled() {
        let now = Instant::now();
        let mut in_flight = queued(1, now);

        assert!(in_flight.request_cancel(TransferHandle(0)));
        in_flight.begin_abort();

        assert_eq!(
            delivered(in_flight.settle(Err(TransferError::Cancelled), 0, now)),
            (TransferHandle(0), TransferStatus::Cancelled)
        );
        assert_eq!(in_flight.len(), 0);
    }

    #[test]
    fn test_cancel_unknown_or_repeated_is_noop() {
        let now = Instant::now();
        let mut in_flight = queued(2, now);

        assert!(!in_flight.request_cancel(TransferHandle(42)));
        assert!(in_flight.request_cancel(TransferHandle(1)));
        assert!(!in_flight.request_cancel(TransferHandle(1)));

        // Already covered by the running abort
        in_flight.begin_abort();
        assert!(!in_flight.request_cancel(TransferHandle(0)));
    }

    #[test]
    fn test_cancel_after_completion_still_delivers_data() {
        let now = Instant::now();
        let mut in_flight = queued(1, now);
        in_flight.request_cancel(TransferHandle(0));
        in_flight.begin_abort();

        assert_eq!(
            delivered(in_flight.settle(Ok(()), 512, now)),
            (TransferHandle(0), TransferStatus::Completed)
        );
    }

    #[test]
    fn test_expired_transfer_times_out_and_neighbours_resubmit() {
        let start = Instant::now();
        let mut in_flight = queued(3, start);
        assert!(!in_flight.expired(start));

        // Only the first deadline has passed
        let now = start + TIMEOUT + Duration::from_millis(1);
        assert!(in_flight.expired(now));
        in_flight.begin_abort();
        assert_eq!(in_flight.next_deadline(), None);

        assert_eq!(
            delivered(in_flight.settle(Err(TransferError::Cancelled), 0, now)),
            (TransferHandle(0), TransferStatus::TimedOut)
        );
        match in_flight.settle(Err(TransferError::Cancelled), 0, now) {
            Some(Settled::Resubmit(pending)) => {
                assert_eq!(pending.handle, TransferHandle(1));
                in_flight.push(pending);
            }
            other => panic!("expected a resubmission, got {other:?}"),
        }
        // Partial data is handed over rather than thrown away
        assert_eq!(
            delivered(in_flight.settle(Err(TransferError::Cancelled), 100, now)),
            (TransferHandle(2), TransferStatus::Completed)
        );

        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight.next_deadline(), Some(start + TIMEOUT * 2));
    }

    #[test]
    fn test_unexpected_cancel_is_reported() {
        let now = Instant::now();
        let mut in_flight = queued(1, now);

        assert_eq!(
            delivered(in_flight.settle(Err(TransferError::Cancelled), 0, now)),
            (TransferHandle(0), TransferStatus::Cancelled)
        );
    }

    #[test]
    fn test_control_setup_decoding() {
        let control = control(0x40, 0xA0, 0xE600, 0);
        assert!(matches!(control.control_type, ControlType::Vendor));
        assert!(matches!(control.recipient, Recipient::Device));
        assert_eq!(control.request, 0xA0);
        assert_eq!(control.value, 0xE600);
    }
}
