//! Messages and the per-publish options
use std::time::{SystemTime, UNIX_EPOCH};

use amqp_opener::amqprs::{BasicProperties, FieldTable};
use bytes::Bytes;

/// Longest exchange name or routing key AMQP can carry (a `shortstr`)
pub(crate) const MAX_SHORT_STR: usize = 255;

/// Flags sent with `basic.publish`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to return the message instead of dropping it
    /// when no queue is bound for the routing key. Returns arrive on
    /// [`crate::Sender::returned`]
    pub mandatory: bool,

    /// Deprecated and rejected by RabbitMQ since 3.0. It is never sent
    /// to the broker; setting it logs a warning
    pub immediate: bool,
}

impl PublishOptions {
    /// Options with only the mandatory flag set
    pub fn mandatory() -> Self {
        Self {
            mandatory: true,
            immediate: false,
        }
    }
}

/// How to fill in the message timestamp when publishing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimestampPolicy {
    /// Publish whatever timestamp the message carries, possibly none
    #[default]
    CallerSupplied,
    /// Overwrite the timestamp with the current time
    Now,
}

impl TimestampPolicy {
    /// Apply the policy to the message about to be published
    pub(crate) fn apply(self, message: &mut Message) {
        if self == Self::Now {
            message.stamp_now();
        }
    }
}

/// A message body and its AMQP properties.
///
/// The body is reference counted, so cloning a message or keeping it
/// around until it is confirmed is cheap.
#[derive(Clone, Debug, Default)]
pub struct Message {
    /// Message body
    body: Bytes,
    /// MIME content type
    content_type: Option<String>,
    /// MIME content encoding
    content_encoding: Option<String>,
    /// Application headers
    headers: Option<FieldTable>,
    /// Delivery mode 2 when set
    persistent: bool,
    /// Priority, 0 to 9
    priority: Option<u8>,
    /// Application correlation id
    correlation_id: Option<String>,
    /// Address to reply to
    reply_to: Option<String>,
    /// Expiration, milliseconds as a string
    expiration: Option<String>,
    /// Application message id
    message_id: Option<String>,
    /// Seconds since the Unix epoch
    timestamp: Option<u64>,
    /// Message type name
    kind: Option<String>,
    /// Creating application
    app_id: Option<String>,
}

impl Message {
    /// A message with the given body and no properties
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// The message body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Timestamp in seconds since the Unix epoch, if set
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Whether the message will be published with delivery mode 2
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Set the content type, e.g. `application/json`
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Set the content encoding, e.g. `gzip`
    pub fn with_content_encoding(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_string());
        self
    }

    /// Set the application headers
    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Ask the broker to write the message to disk
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Set the message priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    /// Set the reply-to address
    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    /// Expire the message after `millis` milliseconds in a queue
    pub fn with_expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis.to_string());
        self
    }

    /// Set the message id
    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_string());
        self
    }

    /// Set the timestamp in seconds since the Unix epoch
    pub fn with_timestamp(mut self, seconds: u64) -> Self {
        self.timestamp = Some(seconds);
        self
    }

    /// Set the message type name
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    /// Set the application id
    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_string());
        self
    }

    /// Set the timestamp to the current time
    pub fn stamp_now(&mut self) {
        // A clock before 1970 publishes a zero timestamp
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.timestamp = Some(now);
    }

    /// The AMQP properties sent in the content header frame
    pub fn properties(&self) -> BasicProperties {
        let mut props = BasicProperties::default();
        if let Some(content_type) = &self.content_type {
            props.with_content_type(content_type);
        }
        if let Some(encoding) = &self.content_encoding {
            props.with_content_encoding(encoding);
        }
        if let Some(headers) = &self.headers {
            props.with_headers(headers.clone());
        }
        if self.persistent {
            props.with_persistence(true);
        }
        if let Some(priority) = self.priority {
            props.with_priority(priority);
        }
        if let Some(id) = &self.correlation_id {
            props.with_correlation_id(id);
        }
        if let Some(reply_to) = &self.reply_to {
            props.with_reply_to(reply_to);
        }
        if let Some(expiration) = &self.expiration {
            props.with_expiration(expiration);
        }
        if let Some(id) = &self.message_id {
            props.with_message_id(id);
        }
        if let Some(timestamp) = self.timestamp {
            props.with_timestamp(timestamp);
        }
        if let Some(kind) = &self.kind {
            props.with_message_type(kind);
        }
        if let Some(app_id) = &self.app_id {
            props.with_app_id(app_id);
        }
        props
    }
}

impl From<&str> for Message {
    fn from(body: &str) -> Self {
        Self::new(body.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_supplied_keeps_timestamp() {
        let mut message = Message::from("m1").with_timestamp(42);
        TimestampPolicy::CallerSupplied.apply(&mut message);
        assert_eq!(message.timestamp(), Some(42));

        let mut message = Message::from("m1");
        TimestampPolicy::CallerSupplied.apply(&mut message);
        assert_eq!(message.timestamp(), None);
    }

    #[test]
    fn now_overwrites_timestamp() {
        let mut message = Message::from("m1").with_timestamp(42);
        TimestampPolicy::Now.apply(&mut message);
        // 2020-01-01, well before any test run
        assert!(message.timestamp().unwrap_or_default() > 1_577_836_800);
    }

    #[test]
    fn body_is_shared() {
        let message = Message::new(b"payload".to_vec()).persistent();
        let copy = message.clone();
        assert_eq!(copy.body().as_ptr(), message.body().as_ptr());
        assert!(copy.is_persistent());
    }
}
