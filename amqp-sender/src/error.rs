//! Errors returned by the sender and its components

use miette::Diagnostic;
use thiserror::Error;

/// Boxed error returned by a [`crate::transport`] implementation. The
/// components wrap it in the matching [`Error`] variant
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type that returns an [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Types of errors that can occur while starting, publishing or
/// closing. Nothing is retried internally; every error is returned to
/// the caller of the failing operation
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// DNS, TCP, authentication or handshake failure while opening
    /// the connection
    #[error("Failed to connect to the broker")]
    #[diagnostic(code(amqp_sender::connect))]
    Connect {
        /// Error from the transport
        #[source]
        source: BoxError,
    },

    /// The broker refused to open the channel
    #[error("Failed to open a channel")]
    #[diagnostic(code(amqp_sender::channel))]
    Channel {
        /// Error from the transport
        #[source]
        source: BoxError,
    },

    /// `confirm.select` failed
    #[error("Failed to put the channel in confirm mode")]
    #[diagnostic(code(amqp_sender::confirm))]
    Confirm {
        /// Error from the transport
        #[source]
        source: BoxError,
    },

    /// The transport failed to send the publish. The sequence number
    /// was not consumed
    #[error("Failed to publish to exchange '{exchange}' with routing key '{routing_key}'")]
    Publish {
        /// Exchange of the failed publish
        exchange: String,
        /// Routing key of the failed publish
        routing_key: String,
        /// Error from the transport
        #[source]
        source: BoxError,
    },

    /// The publish arguments can't be encoded, for example an
    /// exchange name longer than 255 bytes
    #[error("Invalid publish: {0}")]
    #[diagnostic(
        code(amqp_sender::invalid_publish),
        help("Exchange names and routing keys are limited to 255 bytes")
    )]
    InvalidPublish(String),

    /// The channel was closed, either by [`crate::Sender::close`] or
    /// by the broker
    #[error("The channel is closed")]
    #[diagnostic(code(amqp_sender::closed))]
    ChannelClosed,

    /// The sender was used before [`crate::Sender::start`]
    #[error("The sender has not been started")]
    #[diagnostic(help("Call Sender::start first"))]
    NotStarted,

    /// [`crate::Sender::start`] was called more than once
    #[error("The sender has already been started")]
    AlreadyStarted,

    /// Closing the channel or connection failed. Closing still
    /// continues with the remaining resources
    #[error("Failed to close the {what}")]
    Close {
        /// Which resource failed to close
        what: &'static str,
        /// Error from the transport
        #[source]
        source: BoxError,
    },

    /// Some deliveries were nacked by the broker, or failed because
    /// the channel closed before they were confirmed
    #[error("{nacked} deliveries were not confirmed by the broker")]
    #[diagnostic(code(amqp_sender::confirm_failed))]
    ConfirmFailed {
        /// Number of failed deliveries since the last check
        nacked: usize,
    },
}
