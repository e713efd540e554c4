// Scripted in-memory transport for driving recordings without hardware
//
// Every pump first hands back cancelled transfers, then completes pending
// writes, then completes pending reads in submission order. Each read
// consumes the next scripted reply; once the script runs dry the default
// reply is used. Timed-out reads advance a simulated idle clock by the
// longest timeout among them, since in-flight reads wait side by side.

#![allow(dead_code)]

use slogic::{Completion, TransferHandle, TransferStatus, TransportChannel, TransportError};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Complete successfully with this many bytes
    Data(usize),
    /// Fail with this status
    Status(TransferStatus),
}

pub struct FakeChannel {
    next_handle: u64,
    reads: VecDeque<(TransferHandle, Vec<u8>, Duration)>,
    writes: VecDeque<(TransferHandle, Vec<u8>)>,
    /// Cancelled transfers waiting to be handed back, flagged when a read
    cancelled: Vec<(bool, Completion)>,

    pub script: VecDeque<Reply>,
    pub default_reply: Reply,
    /// Reads completed per pump; `None` completes all of them
    pub reads_per_pump: Option<usize>,
    pub write_status: TransferStatus,
    /// Leave writes pending instead of completing them
    pub hold_writes: bool,
    /// Time out every read until a write has completed
    pub silent_until_started: bool,
    /// Read submissions allowed before submissions start failing
    pub fail_read_submit_after: Option<usize>,
    /// Pump call number (1-based) that returns an error
    pub fail_pump_at: Option<usize>,

    pub read_submissions: usize,
    pub read_timeouts: Vec<Duration>,
    /// Simulated time spent waiting on reads that timed out
    pub idle_time: Duration,
    /// `idle_time` when the first write was submitted
    pub idle_before_command: Option<Duration>,
    pub started: bool,
    pub reads_returned: usize,
    pub written: Vec<Vec<u8>>,
    pub cancel_calls: usize,
    pub pumps: usize,
    pub max_reads_in_flight: usize,
    pub buffer_addresses: HashSet<usize>,
    fill: u8,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            reads: VecDeque::new(),
            writes: VecDeque::new(),
            cancelled: Vec::new(),
            script: VecDeque::new(),
            default_reply: Reply::Data(usize::MAX),
            reads_per_pump: None,
            write_status: TransferStatus::Completed,
            hold_writes: false,
            silent_until_started: false,
            fail_read_submit_after: None,
            fail_pump_at: None,
            read_submissions: 0,
            read_timeouts: Vec::new(),
            idle_time: Duration::ZERO,
            idle_before_command: None,
            started: false,
            reads_returned: 0,
            written: Vec::new(),
            cancel_calls: 0,
            pumps: 0,
            max_reads_in_flight: 0,
            buffer_addresses: HashSet::new(),
            fill: 0,
        }
    }

    pub fn with_script(script: impl IntoIterator<Item = Reply>) -> Self {
        let mut channel = Self::new();
        channel.script = script.into_iter().collect();
        channel
    }

    /// Reads whose buffer has not been handed back yet
    pub fn reads_outstanding(&self) -> usize {
        self.read_submissions - self.reads_returned
    }

    pub fn writes_outstanding(&self) -> usize {
        self.writes.len()
    }

    fn handle(&mut self) -> TransferHandle {
        let handle = TransferHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn complete_read(&mut self, handle: TransferHandle, mut buffer: Vec<u8>) -> Completion {
        let reply = if self.silent_until_started && !self.started {
            Reply::Status(TransferStatus::TimedOut)
        } else {
            self.script.pop_front().unwrap_or(self.default_reply)
        };
        self.reads_returned += 1;
        match reply {
            Reply::Data(n) => {
                let n = n.min(buffer.len());
                self.fill = self.fill.wrapping_add(1);
                buffer[..n].fill(self.fill);
                Completion {
                    handle,
                    status: TransferStatus::Completed,
                    buffer,
                    actual_length: n,
                }
            }
            Reply::Status(status) => Completion {
                handle,
                status,
                buffer,
                actual_length: 0,
            },
        }
    }
}

impl TransportChannel for FakeChannel {
    fn submit_bulk_read(
        &mut self,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransferHandle, TransportError> {
        if let Some(limit) = self.fail_read_submit_after {
            if self.read_submissions >= limit {
                return Err(TransportError::Submit {
                    endpoint,
                    reason: "scripted submission failure".to_string(),
                });
            }
        }
        self.read_submissions += 1;
        self.read_timeouts.push(timeout);
        self.buffer_addresses.insert(buffer.as_ptr() as usize);

        let handle = self.handle();
        self.reads.push_back((handle, buffer, timeout));
        self.max_reads_in_flight = self.max_reads_in_flight.max(self.reads.len());
        Ok(handle)
    }

    fn submit_bulk_write(
        &mut self,
        _endpoint: u8,
        data: Vec<u8>,
        _timeout: Duration,
    ) -> Result<TransferHandle, TransportError> {
        self.idle_before_command.get_or_insert(self.idle_time);
        self.written.push(data.clone());
        let handle = self.handle();
        self.writes.push_back((handle, data));
        Ok(handle)
    }

    fn cancel(&mut self, handle: TransferHandle) {
        self.cancel_calls += 1;
        if let Some(position) = self.reads.iter().position(|(h, _, _)| *h == handle) {
            if let Some((handle, buffer, _)) = self.reads.remove(position) {
                self.cancelled.push((true, Completion {
                    handle,
                    status: TransferStatus::Cancelled,
                    buffer,
                    actual_length: 0,
                }));
            }
        } else if let Some(position) = self.writes.iter().position(|(h, _)| *h == handle) {
            if let Some((handle, data)) = self.writes.remove(position) {
                self.cancelled.push((false, Completion {
                    handle,
                    status: TransferStatus::Cancelled,
                    buffer: data,
                    actual_length: 0,
                }));
            }
        }
    }

    fn pump_events(
        &mut self,
        _max_wait: Duration,
        completed: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        self.pumps += 1;
        if self.fail_pump_at == Some(self.pumps) {
            return Err(TransportError::Events("scripted pump failure".to_string()));
        }

        for (is_read, completion) in self.cancelled.drain(..) {
            if is_read {
                self.reads_returned += 1;
            }
            completed.push(completion);
        }

        while !self.hold_writes {
            let Some((handle, data)) = self.writes.pop_front() else {
                break;
            };
            if self.write_status.is_success() {
                self.started = true;
            }
            let actual_length = if self.write_status.is_success() { data.len() } else { 0 };
            completed.push(Completion {
                handle,
                status: self.write_status,
                buffer: data,
                actual_length,
            });
        }

        let count = self.reads_per_pump.unwrap_or(self.reads.len()).min(self.reads.len());
        let mut waited = Duration::ZERO;
        for _ in 0..count {
            if let Some((handle, buffer, timeout)) = self.reads.pop_front() {
                let completion = self.complete_read(handle, buffer);
                if completion.status == TransferStatus::TimedOut {
                    waited = waited.max(timeout);
                }
                completed.push(completion);
            }
        }
        self.idle_time += waited;

        Ok(())
    }
}
