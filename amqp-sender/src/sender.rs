//! One connection, one confirm-mode channel, and the broker's signals

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};

use tokio::sync::{oneshot, Mutex};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use crate::channel::PublishChannel;
use crate::connection::TransportConnection;
use crate::error::{Error, Result};
use crate::message::{Message, PublishOptions, TimestampPolicy};
use crate::notify::{Blocking, ClosedCause, NotificationHub, ReturnedMessage, Subscription};
use crate::tracker::{Confirmation, ConfirmResult, NackReason};
use crate::transport::{Connector, Transport};

/// Channel type of a connector's connections
type ChannelOf<C> = <<C as Connector>::Transport as Transport>::Channel;

/// Everything created by [`Sender::start`]
struct Session<C: Connector> {
    /// Signal subscriptions
    hub: Arc<NotificationHub>,
    /// The broker connection
    connection: TransportConnection<C::Transport>,
    /// The publishing channel
    channel: PublishChannel<ChannelOf<C>>,
}

/// Where the sender is in its life
enum State<C: Connector> {
    /// Not started yet
    Idle,
    /// Connected and publishing
    Running(Arc<Session<C>>),
    /// Closed. The subscriptions stay readable
    Closed(Arc<NotificationHub>),
}

/// Publishes messages with confirms over a single connection and
/// channel.
///
/// A sender is used once: [`Sender::start`] connects, opens a channel
/// and switches on publisher confirms, [`Sender::close`] tears it all
/// down. Failures are reported, never retried; to reconnect, make a
/// new sender.
///
/// All methods take `&self`, so a sender can be shared between tasks
/// in an [`Arc`]. Concurrent publishes are written one at a time.
///
/// # Example
/// ```rust,no_run
/// # async fn run() -> miette::Result<()> {
/// use amqp_sender::{Message, Sender};
///
/// let opener = amqp_opener::ConnectionBuilder::new("amqp://127.0.0.1:5672/%2f").opener()?;
/// let sender = Sender::new(opener);
/// sender.start(false).await?;
/// let sequence = sender
///     .publish_simple("", "jobs", Message::from("hello"))
///     .await?;
/// assert_eq!(sequence, 1);
/// sender.wait_for_confirms().await?;
/// sender.close().await?;
/// # Ok(()) }
/// ```
pub struct Sender<C: Connector> {
    /// Opens the connection in [`Sender::start`]
    connector: C,
    /// Serializes start and close
    lifecycle: Mutex<()>,
    /// Current state
    state: RwLock<State<C>>,
}

/// A publish whose confirm can be awaited
#[derive(Debug)]
pub struct Delivery {
    /// Sequence number of the publish
    pub sequence: u64,
    /// Resolves once the broker confirms the publish
    pub confirm: PendingConfirm,
}

/// Future resolving to the outcome of one publish. If the sender goes
/// away first it resolves to `Nacked(ChannelClosed)`
#[derive(Debug)]
pub struct PendingConfirm {
    #[doc(hidden)]
    rx: oneshot::Receiver<ConfirmResult>,
}

impl Future for PendingConfirm {
    type Output = ConfirmResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(ConfirmResult::Nacked(NackReason::ChannelClosed)))
    }
}

impl<C: Connector> Sender<C> {
    /// Make a sender that connects with `connector`. Nothing happens
    /// until [`Sender::start`]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            lifecycle: Mutex::new(()),
            state: RwLock::new(State::Idle),
        }
    }

    /// Read the state. It's only ever replaced whole, so a poisoned
    /// lock still holds a valid state
    fn read_state(&self) -> RwLockReadGuard<'_, State<C>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the state
    fn write_state(&self) -> RwLockWriteGuard<'_, State<C>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect, open the channel and put it in confirm mode. With
    /// `confirm_no_wait` the broker's reply to `confirm.select` is not
    /// waited for.
    ///
    /// If any step fails, whatever was opened is closed again and the
    /// sender can be started again.
    ///
    /// # Errors
    /// - [`Error::AlreadyStarted`] if the sender was started before,
    ///   even if it has been closed since
    /// - [`Error::Connect`], [`Error::Channel`] or [`Error::Confirm`]
    ///   for the step that failed
    pub async fn start(&self, confirm_no_wait: bool) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !matches!(*self.read_state(), State::Idle) {
            return Err(Error::AlreadyStarted);
        }

        let hub = Arc::new(NotificationHub::new());
        let connection = TransportConnection::connect(&self.connector, Arc::clone(&hub)).await?;
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                close_quietly("connection", connection.close()).await;
                return Err(err);
            }
        };
        if let Err(err) = channel.enable_confirm_mode(confirm_no_wait).await {
            close_quietly("channel", channel.close()).await;
            close_quietly("connection", connection.close()).await;
            return Err(err);
        }

        info!(channel = channel.id(), "Sender started");
        *self.write_state() = State::Running(Arc::new(Session {
            hub,
            connection,
            channel,
        }));
        Ok(())
    }

    /// The running session
    fn session(&self) -> Result<Arc<Session<C>>> {
        match &*self.read_state() {
            State::Running(session) => Ok(Arc::clone(session)),
            State::Idle => Err(Error::NotStarted),
            State::Closed(_) => Err(Error::ChannelClosed),
        }
    }

    /// The subscriptions, running or closed
    fn hub(&self) -> Result<Arc<NotificationHub>> {
        match &*self.read_state() {
            State::Running(session) => Ok(Arc::clone(&session.hub)),
            State::Closed(hub) => Ok(Arc::clone(hub)),
            State::Idle => Err(Error::NotStarted),
        }
    }

    /// Publish a message and return its sequence number. The confirm
    /// is not waited for; it arrives on [`Sender::published`] or is
    /// collected by [`Sender::wait_for_confirms`].
    ///
    /// With [`TimestampPolicy::Now`] the message timestamp is set to
    /// the current time.
    ///
    /// # Errors
    /// - [`Error::NotStarted`] before [`Sender::start`]
    /// - [`Error::ChannelClosed`] after the channel closed
    /// - [`Error::InvalidPublish`] for an exchange or routing key
    ///   longer than 255 bytes
    /// - [`Error::Publish`] if the write failed. The sequence number is
    ///   not used up
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        mut message: Message,
        timestamp: TimestampPolicy,
    ) -> Result<u64> {
        let session = self.session()?;
        timestamp.apply(&mut message);
        session
            .channel
            .publish(exchange, routing_key, options, &message, None)
            .await
    }

    /// Publish without the mandatory flag, keeping the message's own
    /// timestamp. See [`Sender::publish`]
    pub async fn publish_simple(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<u64> {
        self.publish(
            exchange,
            routing_key,
            PublishOptions::default(),
            message,
            TimestampPolicy::CallerSupplied,
        )
        .await
    }

    /// Publish without the mandatory flag, stamped with the current
    /// time. See [`Sender::publish`]
    pub async fn publish_simple_now(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<u64> {
        self.publish(
            exchange,
            routing_key,
            PublishOptions::default(),
            message,
            TimestampPolicy::Now,
        )
        .await
    }

    /// Like [`Sender::publish`], but also returns a future for this
    /// publish's confirm.
    ///
    /// # Errors
    /// As [`Sender::publish`]
    pub async fn publish_with_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        mut message: Message,
        timestamp: TimestampPolicy,
    ) -> Result<Delivery> {
        let session = self.session()?;
        timestamp.apply(&mut message);
        let (tx, rx) = oneshot::channel();
        let sequence = session
            .channel
            .publish(exchange, routing_key, options, &message, Some(tx))
            .await?;
        Ok(Delivery {
            sequence,
            confirm: PendingConfirm { rx },
        })
    }

    /// Wait for the confirms of everything published so far.
    ///
    /// # Errors
    /// [`Error::ConfirmFailed`] if any delivery was nacked, or failed
    /// because the channel closed, since the previous call;
    /// [`Error::NotStarted`] or [`Error::ChannelClosed`] if there is no
    /// running channel
    pub async fn wait_for_confirms(&self) -> Result<()> {
        self.session()?.channel.wait_for_confirms().await
    }

    /// Number of publishes still waiting for a confirm
    ///
    /// # Errors
    /// [`Error::NotStarted`] or [`Error::ChannelClosed`] if there is no
    /// running channel
    pub fn unconfirmed(&self) -> Result<usize> {
        Ok(self.session()?.channel.unconfirmed())
    }

    /// True while both the connection and the channel are open
    pub fn is_open(&self) -> bool {
        self.session()
            .map(|session| session.connection.is_open() && session.channel.is_open())
            .unwrap_or(false)
    }

    /// Close the channel, then the connection, then end every
    /// subscription. Unconfirmed deliveries resolve as
    /// `Nacked(ChannelClosed)`.
    ///
    /// Every step runs even if an earlier one fails; the first failure
    /// is returned. Closing a sender that isn't running does nothing.
    ///
    /// # Errors
    /// [`Error::Close`] for the first resource that failed to close
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = match &*self.read_state() {
            State::Running(session) => Arc::clone(session),
            State::Idle | State::Closed(_) => return Ok(()),
        };
        debug!("Closing sender");

        let mut first_error = None;
        if let Err(err) = session.channel.close().await {
            warn!("Failed to close the channel: {}", err);
            first_error.get_or_insert(err);
        }
        if let Err(err) = session.connection.close().await {
            warn!("Failed to close the connection: {}", err);
            first_error.get_or_insert(err);
        }
        session.hub.terminate_all();
        *self.write_state() = State::Closed(Arc::clone(&session.hub));
        info!("Sender closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Connection closed, with the cause. Fires once; a subscriber that
    /// arrives late still sees it
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn connection_closed(&self) -> Result<Subscription<ClosedCause>> {
        Ok(self.hub()?.connection_closed.claim())
    }

    /// Connection blocked and unblocked by broker resource alarms
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn connection_blocked(&self) -> Result<Subscription<Blocking>> {
        Ok(self.hub()?.connection_blocked.claim())
    }

    /// Channel closed, with the cause. Fires once; a subscriber that
    /// arrives late still sees it
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn channel_closed(&self) -> Result<Subscription<ClosedCause>> {
        Ok(self.hub()?.channel_closed.claim())
    }

    /// Consumer tags cancelled by the broker
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn channel_cancelled(&self) -> Result<Subscription<String>> {
        Ok(self.hub()?.channel_cancelled.claim())
    }

    /// Flow control requests. `true` asks the publisher to pause,
    /// `false` to resume. The sender itself never pauses
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn channel_flow(&self) -> Result<Subscription<bool>> {
        Ok(self.hub()?.channel_flow.claim())
    }

    /// Delivery tags of every `basic.ack`, as sent by the broker
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn confirm_ack(&self) -> Result<Subscription<u64>> {
        Ok(self.hub()?.confirm_ack.claim())
    }

    /// Delivery tags of every `basic.nack`, as sent by the broker
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn confirm_nack(&self) -> Result<Subscription<u64>> {
        Ok(self.hub()?.confirm_nack.claim())
    }

    /// One [`Confirmation`] per publish, once it's acked, nacked or
    /// failed by a close
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn published(&self) -> Result<Subscription<Confirmation>> {
        Ok(self.hub()?.published.claim())
    }

    /// Mandatory messages the broker couldn't route
    ///
    /// # Errors
    /// [`Error::NotStarted`] before [`Sender::start`]
    pub fn returned(&self) -> Result<Subscription<ReturnedMessage>> {
        Ok(self.hub()?.returned.claim())
    }
}

/// Close a resource while unwinding a failed start. The original
/// error is the one reported
async fn close_quietly(what: &str, close: impl Future<Output = Result<()>>) {
    if let Err(err) = close.await {
        warn!("Failed to close the {} after a failed start: {}", what, err);
    }
}
