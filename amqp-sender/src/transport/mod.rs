//! The seam between the sender and an AMQP client library
//!
//! The sender only needs a handful of operations from the wire: open a
//! connection and a channel, switch on confirms, publish, close. These
//! are the [`Connector`], [`Transport`] and [`ChannelTransport`]
//! traits. Signals coming back from the broker are reported through
//! [`ConnectionEvents`] and [`ChannelEvents`], which the sender hands
//! to the implementation when opening each resource.
//!
//! The implementation for [`amqp_opener::Opener`] lives in
//! [`mod@amqprs`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use crate::error::BoxError;
use crate::link::Liveness;
use crate::message::Message;
use crate::notify::{Blocking, ClosedCause, NotificationHub, ReturnedMessage};
use crate::tracker::{ConfirmResult, ConfirmTracker, NackReason};

pub mod amqprs;

/// Opens connections to one broker
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The open connection
    type Transport: Transport;

    /// Open a connection. Broker signals for it must be reported to
    /// `events`
    async fn connect(&self, events: ConnectionEvents) -> Result<Self::Transport, BoxError>;
}

/// An open connection
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// A channel on this connection
    type Channel: ChannelTransport;

    /// Open a new channel. Broker signals for it must be reported to
    /// `events`
    async fn open_channel(&self, events: ChannelEvents) -> Result<Self::Channel, BoxError>;

    /// Close the connection
    async fn close(&self) -> Result<(), BoxError>;
}

/// An open channel
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    /// Channel number
    fn id(&self) -> u16;

    /// Send `confirm.select`. With `no_wait` don't wait for the reply
    async fn confirm_select(&self, no_wait: bool) -> Result<(), BoxError>;

    /// Send `basic.publish` and the message content
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<(), BoxError>;

    /// Close the channel
    async fn close(&self) -> Result<(), BoxError>;
}

/// Receives the broker signals of one channel
#[derive(Clone, Debug)]
pub struct ChannelEvents {
    /// Where signals are published
    hub: Arc<NotificationHub>,
    /// Deliveries published on this channel
    tracker: ConfirmTracker,
    /// Open/closed state of the channel
    liveness: Liveness,
}

impl ChannelEvents {
    /// Events for a new, open channel
    pub(crate) fn new(hub: Arc<NotificationHub>) -> Self {
        Self {
            hub,
            tracker: ConfirmTracker::new(),
            liveness: Liveness::default(),
        }
    }

    /// Deliveries published on this channel
    pub(crate) fn tracker(&self) -> &ConfirmTracker {
        &self.tracker
    }

    /// Open/closed state of the channel
    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// True until the channel closes
    pub fn is_open(&self) -> bool {
        self.liveness.is_open()
    }

    /// The broker sent `basic.ack`
    pub fn ack(&self, delivery_tag: u64, multiple: bool) {
        trace!(delivery_tag, multiple, "Received ack");
        self.hub.confirm_ack.notify(delivery_tag);
        self.resolve(delivery_tag, multiple, ConfirmResult::Acked);
    }

    /// The broker sent `basic.nack`
    pub fn nack(&self, delivery_tag: u64, multiple: bool) {
        warn!(delivery_tag, multiple, "Received nack");
        self.hub.confirm_nack.notify(delivery_tag);
        self.resolve(
            delivery_tag,
            multiple,
            ConfirmResult::Nacked(NackReason::Broker),
        );
    }

    /// Resolve tracked deliveries and announce each of them
    fn resolve(&self, delivery_tag: u64, multiple: bool, outcome: ConfirmResult) {
        for confirmation in self.tracker.resolve(delivery_tag, multiple, outcome) {
            self.hub.published.notify(confirmation);
        }
    }

    /// The broker returned a mandatory message
    pub fn returned(&self, message: ReturnedMessage) {
        warn!(
            reply_code = message.reply_code,
            reply_text = %message.reply_text,
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            "Message returned"
        );
        self.hub.returned.notify(message);
    }

    /// The broker sent `channel.flow`. `pause` is true when the broker
    /// asks the client to stop publishing
    pub fn flow(&self, pause: bool) {
        debug!(pause, "Flow control");
        self.hub.channel_flow.notify(pause);
    }

    /// The broker cancelled a consumer
    pub fn cancelled(&self, consumer_tag: String) {
        warn!(%consumer_tag, "Consumer cancelled");
        self.hub.channel_cancelled.notify(consumer_tag);
    }

    /// The channel closed. Every unconfirmed delivery fails and the
    /// channel's subscriptions end. Only the first call has any effect
    pub fn closed(&self, cause: ClosedCause) {
        if !self.liveness.mark_closed() {
            return;
        }
        match &cause {
            ClosedCause::Graceful => debug!("Channel closed"),
            other => error!(cause = %other, "Channel closed"),
        }
        for confirmation in self.tracker.fail_all() {
            self.hub.published.notify(confirmation);
        }
        self.hub.terminate_channel_signals();
        self.hub.channel_closed.notify_final(cause);
    }
}

/// Receives the broker signals of one connection
#[derive(Clone, Debug)]
pub struct ConnectionEvents {
    /// Where signals are published
    hub: Arc<NotificationHub>,
    /// Open/closed state of the connection
    liveness: Liveness,
    /// The channel opened on this connection, closed along with it
    channel: Arc<Mutex<Option<ChannelEvents>>>,
}

impl ConnectionEvents {
    /// Events for a new, open connection
    pub(crate) fn new(hub: Arc<NotificationHub>) -> Self {
        Self {
            hub,
            liveness: Liveness::default(),
            channel: Arc::default(),
        }
    }

    /// Open/closed state of the connection
    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Events for a channel on this connection. The channel is closed
    /// when the connection is
    pub(crate) fn channel_events(&self) -> ChannelEvents {
        let events = ChannelEvents::new(Arc::clone(&self.hub));
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(events.clone());
        events
    }

    /// True until the connection closes
    pub fn is_open(&self) -> bool {
        self.liveness.is_open()
    }

    /// The broker blocked publishing because of a resource alarm
    pub fn blocked(&self, reason: String) {
        warn!(%reason, "Connection blocked");
        self.hub.connection_blocked.notify(Blocking {
            active: true,
            reason: Some(reason),
        });
    }

    /// The resource alarm cleared
    pub fn unblocked(&self) {
        info!("Connection unblocked");
        self.hub.connection_blocked.notify(Blocking {
            active: false,
            reason: None,
        });
    }

    /// The connection closed. Its channel closes with the same cause
    /// and every subscription ends. Only the first call has any effect
    pub fn closed(&self, cause: ClosedCause) {
        if !self.liveness.mark_closed() {
            return;
        }
        match &cause {
            ClosedCause::Graceful => debug!("Connection closed"),
            other => error!(cause = %other, "Connection closed"),
        }
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            channel.closed(cause.clone());
        }
        self.hub.terminate_connection_signals();
        self.hub.connection_closed.notify_final(cause);
    }
}
