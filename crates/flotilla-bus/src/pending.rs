//! # Pending Request Table
//!
//! Maps outbound packet ids to callers waiting for a response.
//!
//! Flow:
//! 1. `PacketRequest::exec` calls [`PendingRequests::register`] with the packet id
//! 2. The packet is published
//! 3. The channel dispatcher sees a response packet and calls [`PendingRequests::resolve`]
//! 4. Otherwise the per-request timer fires and the entry expires
//!
//! Every exit path removes the entry from the map first, so whichever of
//! resolve/expire wins the removal is the only one that signals the waiter.
//! Resolving or abandoning an entry also aborts its timer task.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::packet::{PacketId, Response};
use crate::request::RequestError;

/// How a pending request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A non-error response arrived in time.
    Succeeded(Response),
    /// An `ERROR`/`NOT_FOUND` response arrived in time.
    Failed(Response),
    /// The deadline passed first.
    TimedOut,
}

struct PendingRequest {
    channel: String,
    created_at: Instant,
    timeout: Duration,
    /// Distinguishes re-registrations of the same id for the timer.
    seq: u64,
    sender: oneshot::Sender<Resolution>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn disarm(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// Decrements the armed-timer gauge when a timer task ends or is aborted.
struct TimerGuard(Arc<AtomicU64>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counters for the pending table
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_succeeded: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_timeouts: AtomicU64,
    /// Responses that matched nothing (unknown, late, or wrong channel).
    pub total_unmatched: AtomicU64,
}

/// Outstanding requests keyed by packet id.
pub struct PendingRequests {
    pending: DashMap<PacketId, PendingRequest>,
    default_timeout: Duration,
    next_seq: AtomicU64,
    armed_timers: Arc<AtomicU64>,
    stats: PendingStats,
}

impl PendingRequests {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            default_timeout,
            next_seq: AtomicU64::new(0),
            armed_timers: Arc::new(AtomicU64::new(0)),
            stats: PendingStats::default(),
        })
    }

    /// Register a request and arm its deadline timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        id: PacketId,
        channel: &str,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Resolution>, RequestError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(RequestError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    channel: channel.to_string(),
                    created_at: Instant::now(),
                    timeout,
                    seq,
                    sender: tx,
                    timer: None,
                });
            }
        }
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        self.armed_timers.fetch_add(1, Ordering::Relaxed);
        let guard = TimerGuard(Arc::clone(&self.armed_timers));
        let table = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(id, seq);
            }
        })
        .abort_handle();

        match self.pending.get_mut(&id) {
            Some(mut request) if request.seq == seq => request.timer = Some(timer),
            // already resolved or abandoned
            _ => timer.abort(),
        }

        debug!(
            packet_id = %id,
            channel = channel,
            timeout_ms = timeout.as_millis(),
            "Registered pending request"
        );
        Ok(rx)
    }

    /// Resolve the request `correlation_id` with a response seen on `channel`.
    ///
    /// Returns false for unknown ids, already-resolved ids and responses on
    /// another channel; those are dropped without side effects.
    pub fn resolve(&self, channel: &str, correlation_id: PacketId, response: Response) -> bool {
        let Some((_, request)) = self
            .pending
            .remove_if(&correlation_id, |_, request| request.channel == channel)
        else {
            self.stats.total_unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                channel = channel,
                "Dropping unmatched or late response"
            );
            return false;
        };
        request.disarm();

        let resolution = if response.response_type.is_error() {
            self.stats.total_failed.fetch_add(1, Ordering::Relaxed);
            Resolution::Failed(response)
        } else {
            self.stats.total_succeeded.fetch_add(1, Ordering::Relaxed);
            Resolution::Succeeded(response)
        };

        debug!(
            correlation_id = %correlation_id,
            channel = channel,
            response_time_ms = request.created_at.elapsed().as_millis(),
            "Resolved pending request"
        );
        if request.sender.send(resolution).is_err() {
            debug!(correlation_id = %correlation_id, "Waiter already gone");
        }
        true
    }

    fn expire(&self, id: PacketId, seq: u64) {
        let Some((_, request)) = self.pending.remove_if(&id, |_, request| request.seq == seq) else {
            return;
        };
        self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(
            packet_id = %id,
            channel = %request.channel,
            timeout_ms = request.timeout.as_millis(),
            "Request timed out"
        );
        let _ = request.sender.send(Resolution::TimedOut);
    }

    /// Drop a registration without signalling it (the publish never happened).
    pub(crate) fn abandon(&self, id: PacketId) -> bool {
        match self.pending.remove(&id) {
            Some((_, request)) => {
                request.disarm();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: &PacketId) -> bool {
        self.pending.contains_key(id)
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Timer tasks still sleeping towards a deadline.
    #[must_use]
    pub fn armed_timers(&self) -> u64 {
        self.armed_timers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}
