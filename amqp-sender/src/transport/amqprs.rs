//! Transport backed by the [`amqprs`](amqp_opener::amqprs) client
//!
//! Connections are opened by an [`amqp_opener::Opener`]. The broker's
//! callbacks are forwarded to the sender's event handles, and a
//! background task watches for network failures, which `amqprs`
//! reports separately from the callbacks.

use amqp_opener::amqprs::{
    callbacks::{ChannelCallback, ConnectionCallback},
    channel::{BasicPublishArguments, Channel, ConfirmSelectArguments},
    connection::Connection,
    error::Error as AmqpError,
    Ack, BasicProperties, Cancel, Close, CloseChannel, Nack, Return,
};
use amqp_opener::Opener;
use async_trait::async_trait;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use super::{ChannelEvents, ChannelTransport, ConnectionEvents, Connector, Transport};
use crate::error::BoxError;
use crate::message::Message;
use crate::notify::{ClosedCause, ReturnedMessage};

/// Result containing an amqprs error, as the callbacks return
type AmqpResult<T> = std::result::Result<T, AmqpError>;

/// An open `amqprs` connection
pub struct AmqprsConnection {
    #[doc(hidden)]
    connection: Connection,
}

/// An open `amqprs` channel
pub struct AmqprsChannel {
    #[doc(hidden)]
    channel: Channel,
}

#[async_trait]
impl Connector for Opener {
    type Transport = AmqprsConnection;

    async fn connect(&self, events: ConnectionEvents) -> Result<AmqprsConnection, BoxError> {
        let connection = self.open().await?;
        connection
            .register_callback(ConnectionSignals {
                events: events.clone(),
            })
            .await?;

        let watched = connection.clone();
        tokio::spawn(async move {
            if watched.listen_network_io_failure().await {
                events.closed(ClosedCause::Transport("network I/O failure".to_string()));
            }
        });
        Ok(AmqprsConnection { connection })
    }
}

#[async_trait]
impl Transport for AmqprsConnection {
    type Channel = AmqprsChannel;

    async fn open_channel(&self, events: ChannelEvents) -> Result<AmqprsChannel, BoxError> {
        let channel = self.connection.open_channel(None).await?;
        channel
            .register_callback(ChannelSignals { events })
            .await?;
        debug!(channel = channel.channel_id(), "Opened channel");
        Ok(AmqprsChannel { channel })
    }

    async fn close(&self) -> Result<(), BoxError> {
        if self.connection.is_open() {
            self.connection.clone().close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelTransport for AmqprsChannel {
    fn id(&self) -> u16 {
        self.channel.channel_id()
    }

    async fn confirm_select(&self, no_wait: bool) -> Result<(), BoxError> {
        self.channel
            .confirm_select(ConfirmSelectArguments { no_wait })
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<(), BoxError> {
        self.channel
            .basic_publish(
                message.properties(),
                message.body().to_vec(),
                BasicPublishArguments {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    mandatory,
                    immediate: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        if self.channel.is_open() {
            self.channel.clone().close().await?;
        }
        Ok(())
    }
}

/// Forwards connection callbacks to [`ConnectionEvents`]
struct ConnectionSignals {
    /// Destination of the signals
    events: ConnectionEvents,
}

#[async_trait]
impl ConnectionCallback for ConnectionSignals {
    async fn close(&mut self, connection: &Connection, close: Close) -> AmqpResult<()> {
        trace!("handle close request for connection {}", connection);
        self.events.closed(ClosedCause::Broker {
            code: close.reply_code(),
            text: close.reply_text().to_string(),
        });
        Ok(())
    }

    async fn blocked(&mut self, connection: &Connection, reason: String) {
        trace!("handle blocked notification for connection {}", connection);
        self.events.blocked(reason);
    }

    async fn unblocked(&mut self, connection: &Connection) {
        trace!("handle unblocked notification for connection {}", connection);
        self.events.unblocked();
    }
}

/// Forwards channel callbacks to [`ChannelEvents`]
struct ChannelSignals {
    /// Destination of the signals
    events: ChannelEvents,
}

#[async_trait]
impl ChannelCallback for ChannelSignals {
    async fn close(&mut self, channel: &Channel, close: CloseChannel) -> AmqpResult<()> {
        trace!("handle close request for channel {}", channel);
        self.events.closed(ClosedCause::Broker {
            code: close.reply_code(),
            text: close.reply_text().to_string(),
        });
        Ok(())
    }

    async fn cancel(&mut self, channel: &Channel, cancel: Cancel) -> AmqpResult<()> {
        trace!("handle cancel request on channel {}", channel);
        self.events.cancelled(cancel.consumer_tag().to_string());
        Ok(())
    }

    async fn flow(&mut self, channel: &Channel, active: bool) -> AmqpResult<bool> {
        trace!("handle flow request active={} for channel {}", active, channel);
        // Pausing is left to the subscriber; acknowledge the request as is
        self.events.flow(!active);
        Ok(active)
    }

    async fn publish_ack(&mut self, _channel: &Channel, ack: Ack) {
        self.events.ack(ack.delivery_tag(), ack.mutiple());
    }

    async fn publish_nack(&mut self, _channel: &Channel, nack: Nack) {
        self.events.nack(nack.delivery_tag(), nack.multiple());
    }

    async fn publish_return(
        &mut self,
        channel: &Channel,
        ret: Return,
        properties: BasicProperties,
        content: Vec<u8>,
    ) {
        trace!("handle publish return on channel {}", channel);
        self.events.returned(ReturnedMessage {
            reply_code: ret.reply_code(),
            reply_text: ret.reply_text().to_string(),
            exchange: ret.exchange().to_string(),
            routing_key: ret.routing_key().to_string(),
            properties,
            body: content.into(),
        });
    }
}
