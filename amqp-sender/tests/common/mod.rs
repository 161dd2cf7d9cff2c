//! In-memory broker for driving a [`amqp_sender::Sender`] in tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use amqp_sender::transport::{
    ChannelEvents, ChannelTransport, ConnectionEvents, Connector, Transport,
};
use amqp_sender::{BoxError, Message};
use async_trait::async_trait;
use bytes::Bytes;

/// One `basic.publish` seen by the broker
#[derive(Clone, Debug)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub body: Bytes,
    pub timestamp: Option<u64>,
}

/// What the broker saw, and how it should misbehave
#[derive(Default)]
struct BrokerState {
    connection: Option<ConnectionEvents>,
    channel: Option<ChannelEvents>,
    published: Vec<Published>,
    confirm_selects: Vec<bool>,
    channel_closes: usize,
    connection_closes: usize,
    refuse_connect: bool,
    refuse_channel: bool,
    refuse_confirms: bool,
    failing_publishes: usize,
    stalled_publishes: usize,
    fail_channel_close: bool,
}

/// A broker that records everything and only sends signals when told
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn refuse_connect(&self) {
        self.with(|s| s.refuse_connect = true);
    }

    pub fn refuse_channel(&self) {
        self.with(|s| s.refuse_channel = true);
    }

    pub fn refuse_confirms(&self) {
        self.with(|s| s.refuse_confirms = true);
    }

    /// Fail the next `n` publishes on the wire
    pub fn fail_publishes(&self, n: usize) {
        self.with(|s| s.failing_publishes = n);
    }

    /// The next `n` publishes never finish writing
    pub fn stall_publishes(&self, n: usize) {
        self.with(|s| s.stalled_publishes = n);
    }

    pub fn fail_channel_close(&self) {
        self.with(|s| s.fail_channel_close = true);
    }

    pub fn published(&self) -> Vec<Published> {
        self.with(|s| s.published.clone())
    }

    pub fn confirm_selects(&self) -> Vec<bool> {
        self.with(|s| s.confirm_selects.clone())
    }

    pub fn channel_closes(&self) -> usize {
        self.with(|s| s.channel_closes)
    }

    pub fn connection_closes(&self) -> usize {
        self.with(|s| s.connection_closes)
    }

    /// Signals for the open channel
    pub fn channel(&self) -> ChannelEvents {
        self.with(|s| s.channel.clone()).expect("no channel was opened")
    }

    /// Signals for the open connection
    pub fn connection(&self) -> ConnectionEvents {
        self.with(|s| s.connection.clone())
            .expect("no connection was opened")
    }

    pub fn ack(&self, tag: u64, multiple: bool) {
        self.channel().ack(tag, multiple);
    }

    pub fn nack(&self, tag: u64, multiple: bool) {
        self.channel().nack(tag, multiple);
    }
}

pub struct MockConnection {
    broker: MockBroker,
}

pub struct MockChannel {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockBroker {
    type Transport = MockConnection;

    async fn connect(&self, events: ConnectionEvents) -> Result<MockConnection, BoxError> {
        self.with(|s| -> Result<(), BoxError> {
            if s.refuse_connect {
                return Err("connection refused".into());
            }
            s.connection = Some(events);
            Ok(())
        })?;
        Ok(MockConnection {
            broker: self.clone(),
        })
    }
}

#[async_trait]
impl Transport for MockConnection {
    type Channel = MockChannel;

    async fn open_channel(&self, events: ChannelEvents) -> Result<MockChannel, BoxError> {
        self.broker.with(|s| -> Result<(), BoxError> {
            if s.refuse_channel {
                return Err("channel refused".into());
            }
            s.channel = Some(events);
            Ok(())
        })?;
        Ok(MockChannel {
            broker: self.broker.clone(),
        })
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.broker.with(|s| s.connection_closes += 1);
        Ok(())
    }
}

#[async_trait]
impl ChannelTransport for MockChannel {
    fn id(&self) -> u16 {
        1
    }

    async fn confirm_select(&self, no_wait: bool) -> Result<(), BoxError> {
        self.broker.with(|s| {
            if s.refuse_confirms {
                return Err("PRECONDITION_FAILED".into());
            }
            s.confirm_selects.push(no_wait);
            Ok(())
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<(), BoxError> {
        let stall = self.broker.with(|s| {
            let stall = s.stalled_publishes > 0;
            s.stalled_publishes = s.stalled_publishes.saturating_sub(1);
            stall
        });
        if stall {
            std::future::pending::<()>().await;
        }
        self.broker.with(|s| {
            if s.failing_publishes > 0 {
                s.failing_publishes -= 1;
                return Err("connection reset".into());
            }
            s.published.push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory,
                body: message.body().clone(),
                timestamp: message.timestamp(),
            });
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.broker.with(|s| {
            s.channel_closes += 1;
            if s.fail_channel_close {
                return Err("channel close timed out".into());
            }
            Ok(())
        })
    }
}
