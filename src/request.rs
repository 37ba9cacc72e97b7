//! Queued requests and the in-flight transaction

use std::fmt;

use tokio::time::Instant;

use crate::pdu::{RequestKind, RequestPdu};
use crate::poller::PollerId;
use crate::watchdog::WatchdogStep;

/// Identity of a queued request, unique per manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who a request's outcome is delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Poller(PollerId),
    /// Application write; completion goes to the waiting handle
    Write,
    Watchdog(WatchdogStep),
    SafeMode,
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub id: RequestId,
    pub origin: Origin,
    pub pdu: RequestPdu,
    pub enqueued_at: Instant,
    /// Re-sends so far
    pub retries: u8,
}

impl RegisterRequest {
    #[inline]
    pub fn kind(&self) -> RequestKind {
        self.pdu.kind()
    }
}

impl fmt::Display for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} FC{:02X} addr={} qty={}",
            self.id,
            self.kind(),
            self.pdu.function_code(),
            self.pdu.address(),
            self.pdu.quantity()
        )
    }
}

/// The single request on the wire awaiting its response
#[derive(Debug)]
pub struct Transaction {
    pub transaction_id: u16,
    pub request: RegisterRequest,
    pub sent_at: Instant,
    pub deadline: Instant,
}
