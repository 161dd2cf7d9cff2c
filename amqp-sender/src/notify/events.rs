//! Payloads of the broker signals

use std::fmt;

use amqp_opener::amqprs::BasicProperties;
use bytes::Bytes;

/// Why a connection or channel closed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClosedCause {
    /// Closed by this side
    Graceful,
    /// The broker closed it
    Broker {
        /// AMQP reply code, e.g. 404 or 320
        code: u16,
        /// Explanation sent by the broker
        text: String,
    },
    /// The network connection failed
    Transport(String),
}

impl fmt::Display for ClosedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedCause::Graceful => write!(f, "closed by client"),
            ClosedCause::Broker { code, text } => write!(f, "closed by broker: {code} {text}"),
            ClosedCause::Transport(reason) => write!(f, "network failure: {reason}"),
        }
    }
}

/// Resource alarm state sent by the broker with
/// `connection.blocked`/`connection.unblocked`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blocking {
    /// Publishing is blocked
    pub active: bool,
    /// Reason given with `connection.blocked`
    pub reason: Option<String>,
}

/// A mandatory message the broker could not route
#[derive(Clone, Debug)]
pub struct ReturnedMessage {
    /// AMQP reply code, usually 312 (NO_ROUTE)
    pub reply_code: u16,
    /// Explanation sent by the broker
    pub reply_text: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Properties of the returned message
    pub properties: BasicProperties,
    /// Body of the returned message
    pub body: Bytes,
}
