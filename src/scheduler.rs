use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::{
    config::QuotaConfig,
    error::Error,
    types::{ContextId, RequesterId},
    Result,
};

/// Admission control for remote executions: one in-flight request per
/// (requester, context), a token bucket per requester, and a global cap on
/// concurrent remote calls.
pub struct ExecutionScheduler {
    semaphore: Arc<Semaphore>,
    admission_timeout: Duration,
    quota: QuotaConfig,
    inflight: Arc<Mutex<HashSet<(RequesterId, ContextId)>>>,
    buckets: Mutex<HashMap<RequesterId, TokenBucket>>,
    waiting: AtomicUsize,
}

/// Proof of admission. Dropping it releases the execution slot and the
/// in-flight reservation; the consumed quota token is not refunded.
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
    key: (RequesterId, ContextId),
    inflight: Arc<Mutex<HashSet<(RequesterId, ContextId)>>>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&self.key);
    }
}

struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Credit tokens for elapsed refill intervals, clamped to capacity.
    fn refill(&mut self, quota: &QuotaConfig, now: Instant) {
        if quota.refill_interval.is_zero() {
            self.tokens = quota.capacity;
            return;
        }
        let elapsed = now.duration_since(self.last_refill);
        let intervals =
            (elapsed.as_nanos() / quota.refill_interval.as_nanos()).min(u128::from(u32::MAX)) as u32;
        if intervals > 0 {
            self.tokens = self.tokens.saturating_add(intervals).min(quota.capacity);
            if self.tokens == quota.capacity {
                // full bucket, the refill clock restarts at the next take
                self.last_refill = now;
            } else {
                self.last_refill += quota.refill_interval * intervals;
            }
        }
    }

    /// Take one token, or report how long until the next one regenerates.
    fn try_take(&mut self, quota: &QuotaConfig, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(quota, now);
        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            let next = self.last_refill + quota.refill_interval;
            Err(next.saturating_duration_since(now))
        }
    }
}

impl ExecutionScheduler {
    pub fn new(max_concurrent: usize, admission_timeout: Duration, quota: QuotaConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            admission_timeout,
            quota,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            buckets: Mutex::new(HashMap::new()),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Execution slots currently free.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tokens a requester currently holds, after refill. Diagnostic accessor.
    pub fn tokens_available(&self, requester_id: RequesterId) -> u32 {
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets
            .entry(requester_id)
            .or_insert_with(|| TokenBucket::new(self.quota.capacity));
        bucket.refill(&self.quota, Instant::now());
        bucket.tokens
    }

    /// Admit one execution. Checks, in order: the one-in-flight-per-context
    /// invariant, the requester's token bucket, the global slot cap.
    /// Cancel-safe: dropping the returned future releases the reservation.
    pub async fn admit(
        &self,
        requester_id: RequesterId,
        context_id: ContextId,
    ) -> Result<Ticket> {
        let key = (requester_id, context_id);
        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            if !inflight.insert(key) {
                debug!(
                    "Rejecting requester {}: execution already in flight in context {}",
                    requester_id, context_id
                );
                return Err(Error::AlreadyRunning);
            }
        }

        // The reservation is held from here on; the guard releases it on any
        // failure, including this future being dropped mid-await.
        let mut reservation = Reservation {
            key,
            inflight: &*self.inflight,
            armed: true,
        };
        let permit = self.admit_reserved(requester_id).await?;
        reservation.armed = false;

        Ok(Ticket {
            _permit: permit,
            key,
            inflight: self.inflight.clone(),
        })
    }

    async fn admit_reserved(&self, requester_id: RequesterId) -> Result<OwnedSemaphorePermit> {
        self.take_token(requester_id).await?;

        match time::timeout(
            self.admission_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            // acquire_owned only fails if the semaphore is closed, which we
            // never do
            Ok(Err(_)) => Err(Error::Busy),
            Err(_) => {
                warn!(
                    "No execution slot freed within {:?}, rejecting requester {}",
                    self.admission_timeout, requester_id
                );
                Err(Error::Busy)
            }
        }
    }

    async fn take_token(&self, requester_id: RequesterId) -> Result<()> {
        let deadline = Instant::now() + self.quota.max_wait;
        let mut queued: Option<WaitingGuard<'_>> = None;
        loop {
            let wait_hint = {
                let now = Instant::now();
                let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
                let bucket = buckets
                    .entry(requester_id)
                    .or_insert_with(|| TokenBucket::new(self.quota.capacity));
                match bucket.try_take(&self.quota, now) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            let now = Instant::now();
            if self.quota.max_wait.is_zero() || now + wait_hint > deadline {
                debug!("Requester {} is out of quota tokens", requester_id);
                return Err(Error::QuotaExceeded);
            }

            if queued.is_none() {
                let waiting = self.waiting.fetch_add(1, Ordering::Relaxed);
                let guard = WaitingGuard(&self.waiting);
                if waiting >= self.quota.queue_depth {
                    debug!(
                        "Quota wait queue full ({} waiting), rejecting requester {}",
                        waiting, requester_id
                    );
                    return Err(Error::QuotaExceeded);
                }
                queued = Some(guard);
            }

            time::sleep(wait_hint).await;
        }
    }
}

/// Releases the in-flight reservation unless disarmed into a Ticket.
struct Reservation<'a> {
    key: (RequesterId, ContextId),
    inflight: &'a Mutex<HashSet<(RequesterId, ContextId)>>,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight
                .lock()
                .expect("inflight lock poisoned")
                .remove(&self.key);
        }
    }
}

/// Decrements the quota wait counter however the wait ends.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
