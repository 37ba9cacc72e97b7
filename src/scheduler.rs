//! # Request scheduler
//!
//! Sans-IO transaction queue. All poll and write requests of one manager go
//! through a single FIFO; at most one of them is on the wire at a time.
//!
//! The owner drives it with timestamps and events:
//!
//! ```text
//! enqueue ──► queue ──dispatch──► active ──on_frame────────► Completion
//!               ▲                   │
//!               └──── retry ◄───────┴─ on_deadline / on_connection_lost
//! ```
//!
//! Timeouts and connection losses re-queue the request at the tail until
//! `max_retries` re-sends were spent; exceptions and protocol errors complete
//! it immediately. Every admitted request ends in exactly one
//! [`Completion`] unless it is cancelled while still queued.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::constants::{
    DEFAULT_MAX_QUEUE_DEPTH, DEFAULT_MAX_RETRIES, DEFAULT_RESPONSE_TIMEOUT_MS, DEFAULT_UNIT_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{encode_request, Decoded};
use crate::pdu::{RequestPdu, ResponseBody};
use crate::poller::PollerId;
use crate::request::{Origin, RegisterRequest, RequestId, Transaction};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub unit_id: u8,
    pub response_timeout: Duration,
    pub max_retries: u8,
    /// Requests allowed to wait behind the active transaction
    pub max_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unit_id: DEFAULT_UNIT_ID,
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

/// Final outcome of a request
#[derive(Debug)]
pub struct Completion {
    pub request: RegisterRequest,
    pub result: ModbusResult<ResponseBody>,
}

/// Result of a dispatch attempt
#[derive(Debug)]
pub enum Dispatch {
    /// Nothing queued
    Idle,
    /// A transaction is already in flight
    Busy,
    /// Write this frame to the socket
    Send { transaction_id: u16, frame: BytesMut },
    /// The head request could not be encoded
    Failed(Completion),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub responses: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub exceptions: u64,
    pub protocol_errors: u64,
    pub stray_frames: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    queue: VecDeque<RegisterRequest>,
    active: Option<Transaction>,
    last_transaction_id: u16,
    next_request_id: u64,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queue: VecDeque::with_capacity(config.max_queue_depth),
            active: None,
            last_transaction_id: 0,
            next_request_id: 0,
            stats: SchedulerStats::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Admit a request at the tail of the queue
    ///
    /// Fails with a validation error for malformed PDUs and with
    /// `QueueFull` once `max_queue_depth` requests are waiting.
    pub fn enqueue(
        &mut self,
        origin: Origin,
        pdu: RequestPdu,
        now: Instant,
    ) -> ModbusResult<RequestId> {
        pdu.validate()?;
        if self.queue.len() >= self.config.max_queue_depth {
            self.stats.rejected += 1;
            return Err(ModbusError::queue_full(self.config.max_queue_depth));
        }

        self.next_request_id += 1;
        let request = RegisterRequest {
            id: RequestId(self.next_request_id),
            origin,
            pdu,
            enqueued_at: now,
            retries: 0,
        };
        debug!("Enqueued {} ({:?})", request, origin);
        let id = request.id;
        self.queue.push_back(request);
        self.stats.enqueued += 1;
        Ok(id)
    }

    /// Enqueue a poll unless one for the same poller is queued or in flight
    ///
    /// Returns `Ok(None)` when the poll was skipped as a duplicate.
    pub fn enqueue_poll(
        &mut self,
        poller: PollerId,
        pdu: RequestPdu,
        now: Instant,
    ) -> ModbusResult<Option<RequestId>> {
        if self.has_pending(poller) {
            debug!("Poll for {} already pending, skipped", poller);
            return Ok(None);
        }
        self.enqueue(Origin::Poller(poller), pdu, now).map(Some)
    }

    pub fn has_pending(&self, poller: PollerId) -> bool {
        let origin = Origin::Poller(poller);
        self.active
            .as_ref()
            .is_some_and(|t| t.request.origin == origin)
            || self.queue.iter().any(|r| r.origin == origin)
    }

    /// Start the head request if nothing is in flight
    pub fn dispatch(&mut self, now: Instant) -> Dispatch {
        if self.active.is_some() {
            return Dispatch::Busy;
        }
        let Some(request) = self.queue.pop_front() else {
            return Dispatch::Idle;
        };

        let transaction_id = self.next_transaction_id();
        match encode_request(self.config.unit_id, transaction_id, &request.pdu) {
            Ok(frame) => {
                debug!("Dispatching {} as tid {}", request, transaction_id);
                self.active = Some(Transaction {
                    transaction_id,
                    request,
                    sent_at: now,
                    deadline: now + self.config.response_timeout,
                });
                self.stats.dispatched += 1;
                Dispatch::Send {
                    transaction_id,
                    frame,
                }
            }
            Err(err) => {
                error!("Failed to encode {}: {}", request, err);
                self.stats.failed += 1;
                Dispatch::Failed(Completion {
                    request,
                    result: Err(err),
                })
            }
        }
    }

    /// Correlate a decoded frame with the active transaction
    ///
    /// Frames whose transaction id does not match are dropped as strays and
    /// leave the deadline untouched.
    pub fn on_frame(&mut self, decoded: Decoded) -> Option<Completion> {
        let header = *decoded.header()?;
        let matches = self
            .active
            .as_ref()
            .is_some_and(|t| t.transaction_id == header.transaction_id);
        if !matches {
            self.stats.stray_frames += 1;
            warn!(
                "Discarding stray frame tid={} (active: {:?})",
                header.transaction_id,
                self.active.as_ref().map(|t| t.transaction_id)
            );
            return None;
        }
        let transaction = self.active.take()?;
        if header.unit_id != self.config.unit_id {
            warn!(
                "Response tid={} from unit {} (expected {})",
                header.transaction_id, header.unit_id, self.config.unit_id
            );
        }

        let result = match decoded {
            Decoded::Response(frame) => {
                let body = frame.interpret(&transaction.request.pdu);
                match &body {
                    Ok(_) => self.stats.responses += 1,
                    Err(err) => {
                        self.stats.protocol_errors += 1;
                        self.stats.failed += 1;
                        warn!("Invalid response to {}: {}", transaction.request, err);
                    }
                }
                body
            }
            Decoded::Exception(frame) => {
                let err = frame.to_error();
                self.stats.exceptions += 1;
                self.stats.failed += 1;
                warn!("{} answered with {}", transaction.request, err);
                Err(err)
            }
            Decoded::Malformed(frame) => {
                self.stats.protocol_errors += 1;
                self.stats.failed += 1;
                warn!("Malformed response to {}: {}", transaction.request, frame.error);
                Err(frame.error)
            }
            Decoded::Incomplete => return None,
        };
        Some(Completion {
            request: transaction.request,
            result,
        })
    }

    /// Fail the active transaction after an undecodable frame
    pub fn on_protocol_error(&mut self, err: ModbusError) -> Option<Completion> {
        let transaction = self.active.take()?;
        self.stats.protocol_errors += 1;
        self.stats.failed += 1;
        warn!("Protocol error on {}: {}", transaction.request, err);
        Some(Completion {
            request: transaction.request,
            result: Err(err),
        })
    }

    /// Expire the active transaction once its deadline passed
    pub fn on_deadline(&mut self, now: Instant) -> Option<Completion> {
        if !self.active.as_ref().is_some_and(|t| now >= t.deadline) {
            return None;
        }
        let transaction = self.active.take()?;
        self.stats.timeouts += 1;
        let err = ModbusError::timeout(
            format!("{} tid {}", transaction.request, transaction.transaction_id),
            self.config.response_timeout.as_millis() as u64,
        );
        self.retry_or_fail(transaction.request, err)
    }

    /// The socket failed with a transaction in flight
    pub fn on_connection_lost(&mut self, err: ModbusError) -> Option<Completion> {
        let transaction = self.active.take()?;
        self.retry_or_fail(transaction.request, err)
    }

    /// A connect attempt failed; each waiting request spends one attempt
    pub fn on_connect_failed(&mut self, err: &ModbusError) -> Vec<Completion> {
        let waiting: Vec<_> = self.queue.drain(..).collect();
        waiting
            .into_iter()
            .filter_map(|request| self.retry_or_fail(request, err.clone()))
            .collect()
    }

    /// Drop queued polls of a removed poller; in-flight ones run to completion
    pub fn cancel_poller(&mut self, poller: PollerId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|r| r.origin != Origin::Poller(poller));
        let removed = before - self.queue.len();
        self.stats.cancelled += removed as u64;
        removed
    }

    /// Fail everything, queued and in flight, with `err`
    pub fn drain(&mut self, err: ModbusError) -> Vec<Completion> {
        let completions: Vec<_> = self
            .active
            .take()
            .map(|t| t.request)
            .into_iter()
            .chain(self.queue.drain(..))
            .map(|request| Completion {
                request,
                result: Err(err.clone()),
            })
            .collect();
        self.stats.failed += completions.len() as u64;
        completions
    }

    fn retry_or_fail(&mut self, mut request: RegisterRequest, err: ModbusError) -> Option<Completion> {
        if err.is_retryable() && request.retries < self.config.max_retries {
            request.retries += 1;
            self.stats.retries += 1;
            warn!(
                "{} failed ({}), retry {}/{}",
                request, err, request.retries, self.config.max_retries
            );
            self.queue.push_back(request);
            return None;
        }
        self.stats.failed += 1;
        error!("{} dropped after {} retries: {}", request, request.retries, err);
        Some(Completion {
            request,
            result: Err(err),
        })
    }

    /// Wrapping transaction id, skipping 0
    fn next_transaction_id(&mut self) -> u16 {
        self.last_transaction_id = self.last_transaction_id.wrapping_add(1);
        if self.last_transaction_id == 0 {
            self.last_transaction_id = 1;
        }
        self.last_transaction_id
    }

    /// Deadline of the active transaction
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|t| t.deadline)
    }

    pub fn active(&self) -> Option<&Transaction> {
        self.active.as_ref()
    }

    #[inline]
    pub fn in_flight(&self) -> bool {
        self.active.is_some()
    }

    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Anything queued or in flight
    #[inline]
    pub fn has_work(&self) -> bool {
        self.active.is_some() || !self.queue.is_empty()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode_request, decode_response, encode_exception, encode_response};
    use crate::pdu::ReadFunction;
    use crate::watchdog::WatchdogStep;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn scheduler(max_retries: u8, depth: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            unit_id: 1,
            response_timeout: Duration::from_millis(100),
            max_retries,
            max_queue_depth: depth,
        })
    }

    fn read(address: u16) -> RequestPdu {
        RequestPdu::read(ReadFunction::HoldingRegisters, address, 1).unwrap()
    }

    fn sent(dispatch: Dispatch) -> (u16, BytesMut) {
        match dispatch {
            Dispatch::Send {
                transaction_id,
                frame,
            } => (transaction_id, frame),
            other => panic!("expected Send, got {:?}", other),
        }
    }

    fn answer(frame: &mut BytesMut, registers: Vec<u16>) -> Decoded {
        let (header, request) = decode_request(frame).unwrap().unwrap();
        let mut response = encode_response(
            header.transaction_id,
            header.unit_id,
            request.function_code(),
            &ResponseBody::Registers(registers),
        )
        .unwrap();
        decode_response(&mut response).unwrap()
    }

    #[test]
    fn test_fifo_single_in_flight() {
        let now = Instant::now();
        let mut s = scheduler(3, 8);
        let first = s.enqueue(Origin::Write, read(1), now).unwrap();
        let second = s.enqueue(Origin::Write, read(2), now).unwrap();

        let (tid, mut frame) = sent(s.dispatch(now));
        assert_eq!(tid, 1);
        assert!(matches!(s.dispatch(now), Dispatch::Busy));

        let completion = s.on_frame(answer(&mut frame, vec![42])).unwrap();
        assert_eq!(completion.request.id, first);
        assert_eq!(completion.result.unwrap(), ResponseBody::Registers(vec![42]));

        let (tid, _) = sent(s.dispatch(now));
        assert_eq!(tid, 2);
        assert_eq!(s.active().unwrap().request.id, second);
    }

    #[test]
    fn test_poll_deduplicated() {
        let now = Instant::now();
        let mut s = scheduler(3, 8);
        let poller = PollerId(7);
        assert!(s.enqueue_poll(poller, read(1), now).unwrap().is_some());
        assert!(s.enqueue_poll(poller, read(1), now).unwrap().is_none());

        let _ = sent(s.dispatch(now));
        assert!(s.has_pending(poller));
        assert!(s.enqueue_poll(poller, read(1), now).unwrap().is_none());
        assert!(s.enqueue_poll(PollerId(8), read(1), now).unwrap().is_some());
    }

    #[test]
    fn test_queue_full() {
        let now = Instant::now();
        let mut s = scheduler(3, 2);
        s.enqueue(Origin::Write, read(1), now).unwrap();
        s.enqueue(Origin::Write, read(2), now).unwrap();
        assert!(matches!(
            s.enqueue(Origin::Write, read(3), now),
            Err(ModbusError::QueueFull { capacity: 2 })
        ));
        assert_eq!(s.stats().rejected, 1);
    }

    #[test]
    fn test_invalid_pdu_rejected() {
        let now = Instant::now();
        let mut s = scheduler(3, 2);
        let bad = RequestPdu::WriteMultipleRegisters {
            address: 0,
            values: vec![],
        };
        assert!(s.enqueue(Origin::Write, bad, now).unwrap_err().is_validation());
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn test_unanswered_request_retried_then_failed_once() {
        let mut now = Instant::now();
        let mut s = scheduler(3, 8);
        s.enqueue(Origin::Write, read(1), now).unwrap();

        let mut sends = 0;
        let mut completions = Vec::new();
        for _ in 0..10 {
            if let Dispatch::Send { .. } = s.dispatch(now) {
                sends += 1;
            }
            assert!(s.on_deadline(now).is_none(), "deadline not reached yet");
            now += Duration::from_millis(100);
            completions.extend(s.on_deadline(now));
        }

        assert_eq!(sends, 4);
        assert_eq!(completions.len(), 1);
        assert!(matches!(
            completions[0].result,
            Err(ModbusError::Timeout { .. })
        ));
        assert_eq!(completions[0].request.retries, 3);
        assert_eq!(s.stats().timeouts, 4);
        assert!(!s.has_work());
    }

    #[test]
    fn test_exception_not_retried() {
        let now = Instant::now();
        let mut s = scheduler(3, 8);
        s.enqueue(Origin::Write, RequestPdu::write_single(5, 1), now)
            .unwrap();
        let (tid, _) = sent(s.dispatch(now));

        let mut raw = encode_exception(tid, 1, 0x06, 0x02);
        let completion = s.on_frame(decode_response(&mut raw).unwrap()).unwrap();
        assert_eq!(completion.result.unwrap_err().exception_code(), Some(0x02));
        assert!(!s.has_work());
        assert!(s.on_deadline(now + Duration::from_secs(1)).is_none());
        assert_eq!(s.stats().retries, 0);
    }

    #[test]
    fn test_stray_frame_keeps_deadline() {
        let now = Instant::now();
        let mut s = scheduler(0, 8);
        s.enqueue(Origin::Write, read(1), now).unwrap();
        let (tid, _) = sent(s.dispatch(now));
        let deadline = s.deadline();

        let mut stray = encode_exception(tid.wrapping_add(9), 1, 0x03, 0x04);
        assert!(s.on_frame(decode_response(&mut stray).unwrap()).is_none());
        assert_eq!(s.deadline(), deadline);
        assert_eq!(s.stats().stray_frames, 1);
        assert!(s.in_flight());
    }

    #[test]
    fn test_malformed_frame_correlated_by_tid() {
        let now = Instant::now();
        let mut s = scheduler(3, 8);
        s.enqueue(Origin::Write, RequestPdu::write_single(5, 7), now)
            .unwrap();
        let (tid, _) = sent(s.dispatch(now));

        let truncated = |tid: u16| {
            let [hi, lo] = tid.to_be_bytes();
            BytesMut::from(&[hi, lo, 0x00, 0x00, 0x00, 0x04, 0x01, 0x86, 0x02, 0x00][..])
        };

        let mut stray = truncated(tid.wrapping_add(100));
        assert!(s.on_frame(decode_response(&mut stray).unwrap()).is_none());
        assert_eq!(s.stats().stray_frames, 1);
        assert_eq!(s.stats().protocol_errors, 0);
        assert!(s.in_flight());

        let mut own = truncated(tid);
        let completion = s.on_frame(decode_response(&mut own).unwrap()).unwrap();
        assert!(matches!(completion.result, Err(ModbusError::Protocol { .. })));
        assert_eq!(s.stats().protocol_errors, 1);
        assert_eq!(s.stats().retries, 0);
        assert!(!s.in_flight());
    }

    #[test]
    fn test_connection_lost_retries_at_tail() {
        let now = Instant::now();
        let mut s = scheduler(1, 8);
        let first = s.enqueue(Origin::Write, read(1), now).unwrap();
        s.enqueue(Origin::SafeMode, read(2), now).unwrap();
        let _ = sent(s.dispatch(now));

        assert!(s.on_connection_lost(ModbusError::connection("reset")).is_none());
        assert_eq!(s.queue_len(), 2);

        let _ = sent(s.dispatch(now));
        assert_ne!(s.active().unwrap().request.id, first);
        let _ = s.on_connection_lost(ModbusError::connection("reset"));

        let _ = sent(s.dispatch(now));
        assert_eq!(s.active().unwrap().request.id, first);
        let completion = s
            .on_connection_lost(ModbusError::connection("reset"))
            .unwrap();
        assert_eq!(completion.request.id, first);
    }

    #[test]
    fn test_connect_failure_spends_attempts() {
        let now = Instant::now();
        let mut s = scheduler(1, 8);
        s.enqueue(Origin::Write, read(1), now).unwrap();
        let err = ModbusError::connection("refused");
        assert!(s.on_connect_failed(&err).is_empty());
        let failed = s.on_connect_failed(&err);
        assert_eq!(failed.len(), 1);
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn test_protocol_error_not_retried() {
        let now = Instant::now();
        let mut s = scheduler(3, 8);
        s.enqueue(Origin::Watchdog(WatchdogStep::ReadBack), read(1), now)
            .unwrap();
        let (_, mut frame) = sent(s.dispatch(now));
        // two registers answering a one-register read
        let completion = s.on_frame(answer(&mut frame, vec![1, 2])).unwrap();
        assert!(matches!(completion.result, Err(ModbusError::Protocol { .. })));
        assert!(!s.has_work());

        s.enqueue(Origin::Write, read(1), now).unwrap();
        let _ = sent(s.dispatch(now));
        let completion = s
            .on_protocol_error(ModbusError::protocol("bad header"))
            .unwrap();
        assert!(completion.result.is_err());
        assert_eq!(s.stats().protocol_errors, 2);
    }

    #[test]
    fn test_cancel_poller_keeps_in_flight() {
        let now = Instant::now();
        let mut s = scheduler(3, 8);
        let poller = PollerId(1);
        s.enqueue_poll(poller, read(1), now).unwrap();
        let _ = sent(s.dispatch(now));
        s.enqueue(Origin::Write, read(2), now).unwrap();
        s.enqueue_poll(PollerId(2), read(3), now).unwrap();

        assert_eq!(s.cancel_poller(poller), 0);
        assert_eq!(s.cancel_poller(PollerId(2)), 1);
        assert!(s.in_flight());
        assert_eq!(s.queue_len(), 1);
    }

    #[test]
    fn test_transaction_id_skips_zero() {
        let now = Instant::now();
        let mut s = scheduler(0, 8);
        s.last_transaction_id = u16::MAX - 1;
        s.enqueue(Origin::Write, read(1), now).unwrap();
        assert_eq!(sent(s.dispatch(now)).0, u16::MAX);
        s.on_connection_lost(ModbusError::connection("x"));
        s.enqueue(Origin::Write, read(1), now).unwrap();
        assert_eq!(sent(s.dispatch(now)).0, 1);
    }

    #[test]
    fn test_drain_fails_everything() {
        let now = Instant::now();
        let mut s = scheduler(3, 8);
        s.enqueue(Origin::Write, read(1), now).unwrap();
        s.enqueue(Origin::Write, read(2), now).unwrap();
        let _ = sent(s.dispatch(now));
        let drained = s.drain(ModbusError::Closed);
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|c| c.result == Err(ModbusError::Closed)));
        assert!(!s.has_work());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u16),
        Poll(u32),
        Dispatch,
        Respond,
        Stray,
        Timeout,
        Drop,
        Cancel(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u16..100).prop_map(Op::Enqueue),
            (0u32..4).prop_map(Op::Poll),
            Just(Op::Dispatch),
            Just(Op::Respond),
            Just(Op::Stray),
            Just(Op::Timeout),
            Just(Op::Drop),
            (0u32..4).prop_map(Op::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_every_request_accounted_for(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let mut now = Instant::now();
            let mut s = scheduler(2, 6);
            let mut admitted = HashSet::new();
            let mut completed = HashSet::new();
            let mut cancelled = 0usize;
            let mut frame: Option<BytesMut> = None;

            for op in ops {
                let mut done = Vec::new();
                match op {
                    Op::Enqueue(addr) => {
                        if let Ok(id) = s.enqueue(Origin::Write, read(addr), now) {
                            admitted.insert(id);
                        }
                    }
                    Op::Poll(p) => {
                        if let Ok(Some(id)) = s.enqueue_poll(PollerId(p), read(p as u16), now) {
                            admitted.insert(id);
                        }
                    }
                    Op::Dispatch => match s.dispatch(now) {
                        Dispatch::Send { frame: f, .. } => {
                            prop_assert!(frame.is_none());
                            frame = Some(f);
                        }
                        Dispatch::Busy => prop_assert!(s.in_flight()),
                        Dispatch::Idle => prop_assert_eq!(s.queue_len(), 0),
                        Dispatch::Failed(c) => done.push(c),
                    },
                    Op::Respond => {
                        if let Some(mut f) = frame.take() {
                            done.extend(s.on_frame(answer(&mut f, vec![1])));
                        }
                    }
                    Op::Stray => {
                        let mut raw = encode_exception(0, 1, 0x03, 0x04);
                        prop_assert!(s.on_frame(decode_response(&mut raw).unwrap()).is_none());
                    }
                    Op::Timeout => {
                        now += Duration::from_millis(150);
                        if s.in_flight() {
                            frame = None;
                        }
                        done.extend(s.on_deadline(now));
                    }
                    Op::Drop => {
                        frame = None;
                        done.extend(s.on_connection_lost(ModbusError::connection("drop")));
                    }
                    Op::Cancel(p) => cancelled += s.cancel_poller(PollerId(p)),
                }
                for completion in done {
                    prop_assert!(admitted.contains(&completion.request.id));
                    prop_assert!(completed.insert(completion.request.id), "completed twice");
                }
                prop_assert!(s.queue_len() <= 6 + 1);
                prop_assert_eq!(frame.is_some(), s.in_flight());
            }

            let outstanding = s.queue_len() + usize::from(s.in_flight());
            prop_assert_eq!(admitted.len(), completed.len() + outstanding + cancelled);
        }
    }
}
