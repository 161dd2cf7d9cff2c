//! A channel in publisher confirm mode
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{oneshot, Mutex};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{Error, Result};
use crate::message::{Message, PublishOptions, MAX_SHORT_STR};
use crate::notify::ClosedCause;
use crate::tracker::{ConfirmResult, ConfirmTracker};
use crate::transport::{ChannelEvents, ChannelTransport};

/// State owned by whoever is writing to the channel
#[derive(Debug)]
struct WriteState {
    /// Sequence number of the next publish
    next: u64,
    /// `confirm.select` has been sent
    confirm_mode: bool,
}

/// A channel used only for publishing.
///
/// Publishes are written one at a time. The write lock also owns the
/// sequence counter, so sequence numbers follow the order in which
/// publishers got the lock and a failed write never uses one up.
pub struct PublishChannel<C: ChannelTransport> {
    /// The wire channel
    channel: C,
    /// Signals and pending deliveries of this channel
    events: ChannelEvents,
    /// Serializes writes
    write: Mutex<WriteState>,
    /// The immediate flag was already warned about
    warned_immediate: AtomicBool,
}

impl<C: ChannelTransport> PublishChannel<C> {
    /// Wrap an opened channel
    pub(crate) fn new(channel: C, events: ChannelEvents) -> Self {
        debug!(channel = channel.id(), "Channel open");
        Self {
            channel,
            events,
            write: Mutex::new(WriteState {
                next: 1,
                confirm_mode: false,
            }),
            warned_immediate: AtomicBool::new(false),
        }
    }

    /// Channel number
    pub fn id(&self) -> u16 {
        self.channel.id()
    }

    /// True until the channel is closed by either side
    pub fn is_open(&self) -> bool {
        self.events.is_open()
    }

    /// Put the channel in confirm mode. From here on every publish
    /// gets a sequence number, starting at 1. With `no_wait` the
    /// broker's reply isn't waited for, so a broker that refuses
    /// confirm mode closes the channel later instead of failing this
    /// call.
    ///
    /// # Errors
    /// [`Error::ChannelClosed`] if the channel is closed,
    /// [`Error::Confirm`] if the broker refused
    pub async fn enable_confirm_mode(&self, no_wait: bool) -> Result<()> {
        let mut write = self.write.lock().await;
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        if write.confirm_mode {
            return Ok(());
        }
        self.channel
            .confirm_select(no_wait)
            .await
            .map_err(|source| Error::Confirm { source })?;
        write.confirm_mode = true;
        write.next = 1;
        debug!(no_wait, "Confirm mode enabled");
        Ok(())
    }

    /// Publish `message` and return its sequence number without
    /// waiting for the broker to confirm it. `waiter`, if given,
    /// receives the outcome. Outside confirm mode nothing is tracked
    /// and the returned sequence number is 0.
    ///
    /// # Errors
    /// - [`Error::InvalidPublish`] if the exchange or routing key is
    ///   longer than 255 bytes
    /// - [`Error::ChannelClosed`] if the channel is closed
    /// - [`Error::Publish`] if the write failed
    #[instrument(skip(self, options, message, waiter), fields(channel = self.channel.id()))]
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        message: &Message,
        waiter: Option<oneshot::Sender<ConfirmResult>>,
    ) -> Result<u64> {
        check_short_str("exchange", exchange)?;
        check_short_str("routing key", routing_key)?;
        if options.immediate && !self.warned_immediate.swap(true, Ordering::Relaxed) {
            warn!("The immediate flag is not supported by RabbitMQ and will not be sent");
        }

        let mut write = self.write.lock().await;
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        let tracker = self.events.tracker();
        let unsent = if write.confirm_mode {
            // Track before writing, the ack can arrive before
            // basic_publish returns
            tracker.register(write.next, message.body().clone(), waiter)?;
            Unsent::new(tracker, write.next)
        } else {
            Unsent::untracked(tracker)
        };

        // Dropping `unsent` on error or cancellation frees the sequence
        self.channel
            .basic_publish(exchange, routing_key, options.mandatory, message)
            .await
            .map_err(|source| Error::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                source,
            })?;

        match unsent.sent() {
            Some(sequence) => {
                write.next += 1;
                trace!(sequence, "Published");
                Ok(sequence)
            }
            None => Ok(0),
        }
    }

    /// Number of publishes waiting for a confirm
    pub fn unconfirmed(&self) -> usize {
        self.events.tracker().pending()
    }

    /// Wait for the confirms of everything published so far.
    ///
    /// # Errors
    /// [`Error::ConfirmFailed`] if any delivery was nacked since the
    /// previous call
    pub async fn wait_for_confirms(&self) -> Result<()> {
        self.events.tracker().wait_for_confirms().await
    }

    /// Close the channel after any publish in progress finishes.
    /// Unconfirmed deliveries resolve as nacked. Closing an already
    /// closed channel does nothing.
    ///
    /// # Errors
    /// [`Error::Close`] if the transport failed to close cleanly. The
    /// channel counts as closed anyway
    pub async fn close(&self) -> Result<()> {
        let _write = self.write.lock().await;
        if !self.events.liveness().begin_close() {
            trace!("Channel already closed");
            return Ok(());
        }
        let result = self.channel.close().await.map_err(|source| Error::Close {
            what: "channel",
            source,
        });
        self.events.closed(ClosedCause::Graceful);
        result
    }
}

/// A registered delivery that isn't on the wire yet. Unless
/// [`Unsent::sent`] is called, dropping it removes the delivery from
/// the tracker again
struct Unsent<'a> {
    /// Where the delivery is registered
    tracker: &'a ConfirmTracker,
    /// The registered sequence number
    sequence: Option<u64>,
}

impl<'a> Unsent<'a> {
    /// Guard the registered `sequence`
    fn new(tracker: &'a ConfirmTracker, sequence: u64) -> Self {
        Self {
            tracker,
            sequence: Some(sequence),
        }
    }

    /// Nothing was registered
    fn untracked(tracker: &'a ConfirmTracker) -> Self {
        Self {
            tracker,
            sequence: None,
        }
    }

    /// The write finished, keep tracking
    fn sent(mut self) -> Option<u64> {
        self.sequence.take()
    }
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if let Some(sequence) = self.sequence.take() {
            debug!(sequence, "Publish did not complete, releasing its sequence number");
            self.tracker.forget(sequence);
        }
    }
}

/// Reject names AMQP can't encode
fn check_short_str(what: &str, value: &str) -> Result<()> {
    if value.len() > MAX_SHORT_STR {
        return Err(Error::InvalidPublish(format!(
            "{what} is {} bytes long, the limit is {MAX_SHORT_STR}",
            value.len()
        )));
    }
    Ok(())
}
