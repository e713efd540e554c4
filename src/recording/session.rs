use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::callback::DataCallback;
use super::config::RecordingConfig;
use super::pool::SlotPool;
use super::report::RecordingReport;
use super::state::RecordingState;
use crate::error::{Error, Result};
use crate::transport::{
    Completion, TransferHandle, TransferStatus, TransportChannel, COMMAND_ENDPOINT,
    STREAM_ENDPOINT,
};

/// First byte of the start-streaming command, followed by the timing code
const START_COMMAND: u8 = 0x01;

/// A single recording: the transfer pool, counters and state machine
///
/// The session is driven from one thread. Completions are handled as they come
/// out of [`TransportChannel::pump_events`], and continuing slots are
/// resubmitted before the next pump, so the whole pool stays in flight until
/// the recording reaches a terminal state.
pub struct RecordingSession<'a, F: DataCallback + ?Sized> {
    id: Uuid,
    config: RecordingConfig,
    pool: SlotPool,
    callback: &'a mut F,

    state: RecordingState,
    /// Set by the first terminal transition; nothing changes afterwards
    done: bool,

    sample_count: u64,
    transfer_count: u64,
    timeout_count: u32,
    warmup_timeouts: u32,

    start_command: Option<TransferHandle>,
    start_command_sent: bool,
    /// First sequence number submitted after the acknowledgement
    streaming_from: Option<u64>,

    started: Instant,
    started_at: DateTime<Utc>,
    elapsed: Option<Duration>,

    completed: Vec<Completion>,
}

impl<'a, F: DataCallback + ?Sized> RecordingSession<'a, F> {
    /// Validate `config` and allocate the transfer pool
    pub fn new(config: RecordingConfig, callback: &'a mut F) -> Result<Self> {
        config.validate()?;

        let pool = SlotPool::allocate(
            config.n_transfer_buffers,
            config.transfer_buffer_size,
            STREAM_ENDPOINT,
            config.warmup_transfer_timeout,
        )?;

        let id = Uuid::new_v4();
        debug!(
            "Created recording {} at {} ({} x {} byte transfers, {:?} timeout, {:?} while warming up)",
            id,
            config.sample_rate,
            config.n_transfer_buffers,
            config.transfer_buffer_size,
            config.transfer_timeout,
            config.warmup_transfer_timeout
        );

        Ok(Self {
            id,
            completed: Vec::with_capacity(config.n_transfer_buffers + 1),
            config,
            pool,
            callback,
            state: RecordingState::WarmingUp,
            done: false,
            sample_count: 0,
            transfer_count: 0,
            timeout_count: 0,
            warmup_timeouts: 0,
            start_command: None,
            start_command_sent: false,
            streaming_from: None,
            started: Instant::now(),
            started_at: Utc::now(),
            elapsed: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    pub fn warmup_timeouts(&self) -> u32 {
        self.warmup_timeouts
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Data transfers currently owned by the transport
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Submit the whole pool. With no warm-up transfers configured the start
    /// command follows immediately.
    pub fn start<C>(&mut self, channel: &mut C) -> Result<()>
    where
        C: TransportChannel + ?Sized,
    {
        self.started = Instant::now();
        self.started_at = Utc::now();

        self.pool.submit_all(channel)?;
        info!(
            "Recording {} started: {} transfers submitted at {}",
            self.id,
            self.pool.len(),
            self.config.sample_rate
        );

        if self.config.warmup_transfers == 0 {
            self.send_start_command(channel)?;
        }
        Ok(())
    }

    /// Pump the transport once and handle everything it delivered
    pub fn pump<C>(&mut self, channel: &mut C)
    where
        C: TransportChannel + ?Sized,
    {
        let mut completed = std::mem::take(&mut self.completed);
        let result = channel.pump_events(self.config.pump_interval, &mut completed);

        for completion in completed.drain(..) {
            self.handle_completion(channel, completion);
        }
        self.completed = completed;

        if let Err(e) = result {
            error!("Recording {}: event processing failed: {}", self.id, e);
            self.finish(RecordingState::Unknown);
        }
    }

    /// Apply one completion to the state machine
    pub fn handle_completion<C>(&mut self, channel: &mut C, completion: Completion)
    where
        C: TransportChannel + ?Sized,
    {
        if self.start_command.is_some() && self.start_command == Some(completion.handle) {
            self.start_command = None;
            self.on_start_command_complete(completion.status);
            return;
        }

        let Some(index) = self.pool.find(completion.handle) else {
            warn!("Recording {}: completion for unknown transfer {:?}", self.id, completion.handle);
            return;
        };

        if self.done {
            self.pool.reclaim(index, completion.buffer);
            return;
        }

        self.transfer_count += 1;
        let sequence = self.pool.slots()[index].sequence_number();

        let keep_going = match completion.status {
            TransferStatus::Completed => {
                let chunk = completion.data();
                self.sample_count += chunk.len() as u64;
                trace!(
                    "Transfer #{} (slot {}, seq {}): {} bytes, {} samples total",
                    self.transfer_count,
                    index,
                    self.pool.slots()[index].sequence_number(),
                    chunk.len(),
                    self.sample_count
                );
                if self.callback.on_data(chunk) {
                    true
                } else {
                    self.finish(RecordingState::CompletedSuccessfully);
                    false
                }
            }
            TransferStatus::TimedOut => self.on_timeout(sequence),
            status => {
                warn!("Recording {}: transfer on slot {} failed: {:?}", self.id, index, status);
                self.finish(failure_state(status));
                false
            }
        };

        self.pool.reclaim(index, completion.buffer);

        if !keep_going {
            return;
        }

        if self.state == RecordingState::WarmingUp
            && !self.start_command_sent
            && self.transfer_count >= self.config.warmup_transfers
        {
            if let Err(e) = self.send_start_command(channel) {
                error!("Recording {}: failed to send start command: {}", self.id, e);
                self.finish(RecordingState::Unknown);
                return;
            }
        }

        if let Err(e) = self.pool.submit(index, channel) {
            error!("Recording {}: failed to resubmit slot {}: {}", self.id, index, e);
            self.finish(RecordingState::Unknown);
        }
    }

    /// Reads submitted before the acknowledgement count against the warm-up
    /// budget. Any later timeout ends the recording.
    fn on_timeout(&mut self, sequence: u64) -> bool {
        let warming_up = self.streaming_from.map_or(true, |first| sequence < first);
        if warming_up {
            self.warmup_timeouts += 1;
            if self.warmup_timeouts >= self.config.warmup_timeout_budget {
                warn!(
                    "Recording {}: device did not start streaming after {} timeouts",
                    self.id, self.warmup_timeouts
                );
                self.finish(RecordingState::Timeout);
                return false;
            }
            return true;
        }

        self.timeout_count += 1;
        warn!("Recording {}: transfer timed out while streaming", self.id);
        self.finish(RecordingState::Timeout);
        false
    }

    fn on_start_command_complete(&mut self, status: TransferStatus) {
        if self.done {
            return;
        }
        match status {
            TransferStatus::Completed => {
                info!(
                    "Recording {}: device streaming at {} after {} transfers",
                    self.id, self.config.sample_rate, self.transfer_count
                );
                self.state = RecordingState::Running;
                self.streaming_from = Some(self.pool.next_sequence());
                self.pool.set_timeout(self.config.transfer_timeout);
            }
            TransferStatus::TimedOut => {
                warn!("Recording {}: start command timed out", self.id);
                self.finish(RecordingState::Timeout);
            }
            status => {
                warn!("Recording {}: start command failed: {:?}", self.id, status);
                self.finish(failure_state(status));
            }
        }
    }

    fn send_start_command<C>(&mut self, channel: &mut C) -> Result<()>
    where
        C: TransportChannel + ?Sized,
    {
        let command = vec![START_COMMAND, self.config.sample_rate.timing_code];
        let handle =
            channel.submit_bulk_write(COMMAND_ENDPOINT, command, self.config.transfer_timeout)?;

        debug!(
            "Recording {}: start command sent (timing code {})",
            self.id, self.config.sample_rate.timing_code
        );
        self.start_command = Some(handle);
        self.start_command_sent = true;
        Ok(())
    }

    fn finish(&mut self, state: RecordingState) {
        if self.done {
            return;
        }
        self.state = state;
        self.done = true;

        if state.is_success() {
            info!(
                "Recording {} completed: {} samples in {} transfers",
                self.id, self.sample_count, self.transfer_count
            );
        } else {
            warn!(
                "Recording {} ended with {}: {} samples in {} transfers",
                self.id, state, self.sample_count, self.transfer_count
            );
        }
    }

    /// Cancel everything still in flight, wait for the buffers to come back
    /// and release the pool
    pub fn teardown<C>(&mut self, channel: &mut C)
    where
        C: TransportChannel + ?Sized,
    {
        self.pool.cancel_all(channel);
        if let Some(handle) = self.start_command {
            channel.cancel(handle);
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        let mut completed = std::mem::take(&mut self.completed);

        while self.pool.in_flight() > 0 || self.start_command.is_some() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Recording {}: {} transfers did not return before teardown",
                    self.id,
                    self.pool.in_flight()
                );
                break;
            }

            let wait = self.config.pump_interval.min(deadline - now);
            if let Err(e) = channel.pump_events(wait, &mut completed) {
                warn!("Recording {}: event processing failed during teardown: {}", self.id, e);
                break;
            }

            for completion in completed.drain(..) {
                if self.start_command == Some(completion.handle) {
                    self.start_command = None;
                } else if let Some(index) = self.pool.find(completion.handle) {
                    self.pool.reclaim(index, completion.buffer);
                }
            }
        }
        self.completed = completed;

        let released = self.pool.release_all();
        self.elapsed = Some(self.started.elapsed());

        debug!("Recording {}: released {} transfer buffers", self.id, released);
    }

    pub fn report(&self) -> RecordingReport {
        RecordingReport {
            recording_id: self.id,
            sample_rate: self.config.sample_rate.label,
            final_state: self.state,
            total_samples: self.sample_count,
            total_transfers: self.transfer_count,
            timeout_count: self.timeout_count,
            warmup_timeouts: self.warmup_timeouts,
            started_at: self.started_at,
            elapsed: self.elapsed.unwrap_or_else(|| self.started.elapsed()),
        }
    }
}

/// Terminal state for a failed transfer
fn failure_state(status: TransferStatus) -> RecordingState {
    match status {
        TransferStatus::NoDevice => RecordingState::DeviceGone,
        TransferStatus::Overflow => RecordingState::Overflow,
        TransferStatus::TimedOut => RecordingState::Timeout,
        _ => RecordingState::Unknown,
    }
}

/// Run a recording to completion on an open, firmware-ready channel
///
/// Submits the transfer pool, pumps events until `callback` asks to stop or a
/// transfer fails, then cancels and releases every transfer. The pool is torn
/// down on every path, including failed setup.
///
/// Returns the report when the callback ended the recording, and
/// [`Error::Recording`] carrying the report for any other terminal state.
pub fn execute<C, F>(
    channel: &mut C,
    config: RecordingConfig,
    callback: &mut F,
) -> Result<RecordingReport>
where
    C: TransportChannel + ?Sized,
    F: DataCallback + ?Sized,
{
    let mut session = RecordingSession::new(config, callback)?;

    if let Err(e) = session.start(channel) {
        error!("Recording {}: setup failed: {}", session.id(), e);
        session.teardown(channel);
        return Err(e);
    }

    while !session.is_done() {
        session.pump(channel);
    }

    session.teardown(channel);

    let report = session.report();
    info!(
        "Recording {} finished ({}): {} samples, {} transfers in {:.3}s",
        report.recording_id,
        report.final_state,
        report.total_samples,
        report.total_transfers,
        report.elapsed.as_secs_f64()
    );

    if report.is_success() {
        Ok(report)
    } else {
        Err(Error::Recording(Box::new(report)))
    }
}
