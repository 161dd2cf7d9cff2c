//! Correlate published messages with the broker's confirms
//!
//! Every publish on a channel in confirm mode is given a sequence
//! number, which the broker calls the delivery tag. The broker later
//! acks or nacks each tag, possibly many at once with the `multiple`
//! flag. [`ConfirmTracker`] keeps the deliveries that are still waiting
//! and resolves them as the confirms arrive.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};

/// Why a delivery was not confirmed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackReason {
    /// The broker sent `basic.nack`
    Broker,
    /// The channel or connection closed before a confirm arrived
    ChannelClosed,
}

/// The outcome of a single publish
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmResult {
    /// The broker took responsibility for the message
    Acked,
    /// The message may have been lost
    Nacked(NackReason),
}

impl ConfirmResult {
    /// True if the delivery was acked
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Acked)
    }
}

/// A resolved delivery, as sent to the published subscription
#[derive(Clone, Debug, PartialEq)]
pub struct Confirmation {
    /// Sequence number of the publish
    pub delivery_tag: u64,
    /// How it was resolved
    pub outcome: ConfirmResult,
    /// The published body, for republishing after a nack
    pub payload: Bytes,
    /// Time from publish to resolution
    pub latency: Duration,
}

/// A delivery waiting for its confirm
#[derive(Debug)]
struct PendingDelivery {
    /// When the publish was written
    published_at: Instant,
    /// The published body
    payload: Bytes,
    /// Notified with the outcome, if the publisher asked for it
    waiter: Option<oneshot::Sender<ConfirmResult>>,
}

/// State behind the tracker lock
#[derive(Debug, Default)]
struct State {
    /// Outstanding deliveries keyed by sequence number
    pending: BTreeMap<u64, PendingDelivery>,
    /// Highest sequence number ever registered
    issued: u64,
    /// Deliveries nacked since the last [`ConfirmTracker::wait_for_confirms`]
    nacked_since_wait: usize,
    /// No more deliveries are accepted once the channel closed
    closed: bool,
}

/// Shared part of [`ConfirmTracker`]
#[derive(Debug, Default)]
struct Inner {
    /// Deliveries and counters
    state: Mutex<State>,
    /// Signalled whenever a delivery is resolved
    resolved: Notify,
}

/// Pending deliveries of one channel. Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct ConfirmTracker {
    #[doc(hidden)]
    inner: Arc<Inner>,
}

impl ConfirmTracker {
    /// Make an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the state. The state is consistent between statements,
    /// so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `sequence`. The optional `waiter` receives the
    /// outcome exactly once.
    ///
    /// # Errors
    /// [`Error::ChannelClosed`] once [`ConfirmTracker::fail_all`] ran
    pub fn register(
        &self,
        sequence: u64,
        payload: Bytes,
        waiter: Option<oneshot::Sender<ConfirmResult>>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ChannelClosed);
        }
        trace!(sequence, "Registering delivery");
        state.issued = state.issued.max(sequence);
        state.pending.insert(
            sequence,
            PendingDelivery {
                published_at: Instant::now(),
                payload,
                waiter,
            },
        );
        Ok(())
    }

    /// Drop a delivery that never made it onto the wire. Its waiter
    /// is dropped without a result
    pub fn forget(&self, sequence: u64) {
        {
            let mut state = self.lock();
            state.pending.remove(&sequence);
            if state.issued == sequence {
                state.issued = sequence.saturating_sub(1);
            }
        }
        self.inner.resolved.notify_waiters();
    }

    /// Apply a broker ack or nack for `tag`.
    ///
    /// With `multiple` every pending delivery up to and including
    /// `tag` is resolved; a `tag` of 0 with `multiple` resolves all of
    /// them. Tags that were never issued, or were already resolved,
    /// are ignored. Returns the resolved deliveries in sequence order.
    pub fn resolve(&self, tag: u64, multiple: bool, outcome: ConfirmResult) -> Vec<Confirmation> {
        let resolved: Vec<(u64, PendingDelivery)> = {
            let mut state = self.lock();
            if tag > state.issued || (tag == 0 && !multiple) {
                warn!(
                    tag,
                    issued = state.issued,
                    "Ignoring confirm for a delivery that was never published"
                );
                return Vec::new();
            }
            let resolved: Vec<_> = if !multiple {
                state.pending.remove_entry(&tag).into_iter().collect()
            } else if tag == 0 {
                std::mem::take(&mut state.pending).into_iter().collect()
            } else {
                // Nothing follows u64::MAX
                let rest = match tag.checked_add(1) {
                    Some(next) => state.pending.split_off(&next),
                    None => BTreeMap::new(),
                };
                std::mem::replace(&mut state.pending, rest)
                    .into_iter()
                    .collect()
            };
            if resolved.is_empty() {
                warn!(tag, multiple, "Ignoring confirm for already resolved deliveries");
                return Vec::new();
            }
            if !outcome.is_ack() {
                state.nacked_since_wait += resolved.len();
            }
            resolved
        };
        trace!(tag, multiple, count = resolved.len(), ?outcome, "Resolved deliveries");
        self.complete(resolved, outcome)
    }

    /// Resolve every pending delivery as
    /// `Nacked(ChannelClosed)` and refuse new ones. Called when the
    /// channel or its connection closes. A second call returns nothing
    pub fn fail_all(&self) -> Vec<Confirmation> {
        let resolved: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            let pending = std::mem::take(&mut state.pending);
            state.nacked_since_wait += pending.len();
            pending.into_iter().collect()
        };
        if !resolved.is_empty() {
            debug!(count = resolved.len(), "Failing unconfirmed deliveries");
        }
        self.complete(
            resolved,
            ConfirmResult::Nacked(NackReason::ChannelClosed),
        )
    }

    /// Notify the waiters of resolved deliveries. Runs outside the lock
    fn complete(
        &self,
        resolved: Vec<(u64, PendingDelivery)>,
        outcome: ConfirmResult,
    ) -> Vec<Confirmation> {
        let now = Instant::now();
        let confirmations = resolved
            .into_iter()
            .map(|(delivery_tag, delivery)| {
                if let Some(waiter) = delivery.waiter {
                    // The publisher may have stopped waiting
                    let _ = waiter.send(outcome);
                }
                Confirmation {
                    delivery_tag,
                    outcome,
                    payload: delivery.payload,
                    latency: now.saturating_duration_since(delivery.published_at),
                }
            })
            .collect();
        self.inner.resolved.notify_waiters();
        confirmations
    }

    /// Number of deliveries still waiting for a confirm
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Highest sequence number registered so far
    pub fn issued(&self) -> u64 {
        self.lock().issued
    }

    /// Wait until every delivery registered before this call is
    /// resolved. Deliveries registered while waiting are not waited
    /// for.
    ///
    /// # Errors
    /// [`Error::ConfirmFailed`] if any delivery was nacked, or failed
    /// because the channel closed, since the previous call
    pub fn wait_for_confirms(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let target = self.issued();
        let tracker = self.clone();
        async move { tracker.wait_until(target).await }
    }

    /// Wait until no delivery up to `target` is pending
    async fn wait_until(&self, target: u64) -> Result<()> {
        loop {
            let resolved = self.inner.resolved.notified();
            tokio::pin!(resolved);
            // Register before checking so a resolution between the
            // check and the await isn't missed
            resolved.as_mut().enable();
            {
                let mut state = self.lock();
                let done = state
                    .pending
                    .keys()
                    .next()
                    .map_or(true, |&oldest| oldest > target);
                if done {
                    let nacked = std::mem::take(&mut state.nacked_since_wait);
                    return if nacked == 0 {
                        Ok(())
                    } else {
                        Err(Error::ConfirmFailed { nacked })
                    };
                }
                trace!(
                    pending = state.pending.range(..=target).count(),
                    "Waiting for confirms"
                );
            }
            resolved.await;
        }
    }
}
