//! Notification subscriptions for broker signals
//!
//! Each kind of broker signal gets one [`Subscription`]. Asking the
//! sender for the same kind twice returns the same subscription, so
//! every consumer reads from one shared stream. Signals for a kind
//! nobody has asked for are dropped, except the closed signals, which
//! are kept so a late subscriber still learns why the link went away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

mod events;

pub use events::{Blocking, ClosedCause, ReturnedMessage};

use crate::tracker::Confirmation;

/// Shared part of a [`Subscription`]
#[derive(Debug)]
struct Shared<T> {
    /// Signal kind, for logging
    kind: &'static str,
    /// Sending side. `None` once terminated
    tx: Mutex<Option<UnboundedSender<T>>>,
    /// Receiving side, shared by all clones of the subscription
    rx: tokio::sync::Mutex<UnboundedReceiver<T>>,
    /// Somebody asked for this subscription
    claimed: AtomicBool,
    /// Buffer signals before the subscription is claimed
    latched: bool,
}

/// One stream of broker signals of a single kind. Clones read from
/// the same stream; each signal is received by exactly one reader.
#[derive(Debug)]
pub struct Subscription<T> {
    #[doc(hidden)]
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Subscription<T> {
    /// Make a new subscription for signals of `kind`
    fn new(kind: &'static str, latched: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                kind,
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                claimed: AtomicBool::new(false),
                latched,
            }),
        }
    }

    /// Receive the next signal. Returns `None` once the sender is
    /// closed and every buffered signal has been read
    pub async fn recv(&self) -> Option<T> {
        self.shared.rx.lock().await.recv().await
    }

    /// Receive without waiting.
    ///
    /// # Errors
    /// [`TryRecvError::Empty`] if no signal is buffered or another
    /// clone is currently waiting in [`Subscription::recv`],
    /// [`TryRecvError::Disconnected`] once the subscription is
    /// terminated and drained
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.shared.rx.try_lock() {
            Ok(mut rx) => rx.try_recv(),
            Err(_) => Err(TryRecvError::Empty),
        }
    }

    /// Receive from synchronous code.
    ///
    /// # Panics
    /// When called from inside an async runtime
    pub fn blocking_recv(&self) -> Option<T> {
        self.shared.rx.blocking_lock().blocking_recv()
    }

    /// True if both handles read from the same stream
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// True once the subscription was terminated
    pub fn is_terminated(&self) -> bool {
        self.sender().is_none()
    }

    /// Mark the subscription as wanted and hand out a reader
    pub(crate) fn claim(&self) -> Self {
        self.shared.claimed.store(true, Ordering::Release);
        self.clone()
    }

    /// A clone of the sending side, if still open
    fn sender(&self) -> Option<UnboundedSender<T>> {
        self.shared
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver a signal. Dropped if nobody claimed the subscription or
    /// it was terminated
    pub(crate) fn notify(&self, event: T) {
        if !self.shared.latched && !self.shared.claimed.load(Ordering::Acquire) {
            return;
        }
        match self.sender() {
            Some(tx) => {
                // The receiver lives in `shared`, so sending can't fail
                let _ = tx.send(event);
            }
            None => trace!(kind = self.shared.kind, "Dropping signal after termination"),
        }
    }

    /// Deliver a signal and then terminate. Only the first call
    /// delivers anything
    pub(crate) fn notify_final(&self, event: T) {
        let tx = self
            .shared
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(event);
            debug!(kind = self.shared.kind, "Subscription finished");
        }
    }

    /// Stop accepting signals. Readers drain what is buffered and then
    /// see the end of the stream. Repeated calls do nothing
    pub(crate) fn terminate(&self) {
        let tx = self
            .shared
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tx.is_some() {
            trace!(kind = self.shared.kind, "Subscription terminated");
        }
    }
}

/// All subscriptions of one sender, created together when it starts
#[derive(Debug)]
pub struct NotificationHub {
    /// Connection closed, with the cause
    pub(crate) connection_closed: Subscription<ClosedCause>,
    /// Connection blocked or unblocked by the broker
    pub(crate) connection_blocked: Subscription<Blocking>,
    /// Channel closed, with the cause
    pub(crate) channel_closed: Subscription<ClosedCause>,
    /// Consumer tags cancelled by the broker
    pub(crate) channel_cancelled: Subscription<String>,
    /// Flow control, `true` when the broker asks to pause
    pub(crate) channel_flow: Subscription<bool>,
    /// Raw `basic.ack` delivery tags
    pub(crate) confirm_ack: Subscription<u64>,
    /// Raw `basic.nack` delivery tags
    pub(crate) confirm_nack: Subscription<u64>,
    /// One entry per resolved delivery
    pub(crate) published: Subscription<Confirmation>,
    /// Mandatory messages returned by the broker
    pub(crate) returned: Subscription<ReturnedMessage>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    /// Make a full set of open subscriptions
    pub fn new() -> Self {
        Self {
            connection_closed: Subscription::new("connection_closed", true),
            connection_blocked: Subscription::new("connection_blocked", false),
            channel_closed: Subscription::new("channel_closed", true),
            channel_cancelled: Subscription::new("channel_cancelled", false),
            channel_flow: Subscription::new("channel_flow", false),
            confirm_ack: Subscription::new("confirm_ack", false),
            confirm_nack: Subscription::new("confirm_nack", false),
            published: Subscription::new("published", false),
            returned: Subscription::new("returned", false),
        }
    }

    /// Terminate every subscription
    pub fn terminate_all(&self) {
        debug!("Terminating notification subscriptions");
        self.connection_closed.terminate();
        self.terminate_connection_signals();
        self.channel_closed.terminate();
        self.terminate_channel_signals();
    }

    /// End the streams fed by the channel, except `channel_closed`
    pub(crate) fn terminate_channel_signals(&self) {
        self.channel_cancelled.terminate();
        self.channel_flow.terminate();
        self.confirm_ack.terminate();
        self.confirm_nack.terminate();
        self.published.terminate();
        self.returned.terminate();
    }

    /// End the streams fed by the connection, except `connection_closed`
    pub(crate) fn terminate_connection_signals(&self) {
        self.connection_blocked.terminate();
    }
}
