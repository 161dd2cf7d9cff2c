//! Publish to RabbitMQ with publisher confirms.
//!
//! A [`Sender`] owns one connection and one channel in confirm mode.
//! Every publish gets a sequence number; the broker's acks and nacks
//! are matched back to those numbers by a [`ConfirmTracker`], and
//! every signal the broker sends (closes, flow control, resource
//! alarms, returned messages, confirms) is available as a
//! [`Subscription`].
//!
//! ```rust,no_run
//! # async fn run() -> miette::Result<()> {
//! use amqp_sender::{ConfirmResult, Message, PublishOptions, Sender, TimestampPolicy};
//!
//! let opener = amqp_opener::ConnectionBuilder::new("amqp://127.0.0.1:5672/%2f")
//!     .plain_auth("guest")
//!     .with_password("guest")
//!     .opener()?;
//! let sender = Sender::new(opener);
//! sender.start(false).await?;
//!
//! let returned = sender.returned()?;
//! let delivery = sender
//!     .publish_with_confirm(
//!         "amq.direct",
//!         "jobs",
//!         PublishOptions::mandatory(),
//!         Message::from("hello").persistent(),
//!         TimestampPolicy::Now,
//!     )
//!     .await?;
//! if delivery.confirm.await != ConfirmResult::Acked {
//!     eprintln!("message {} was lost", delivery.sequence);
//! }
//! if let Ok(message) = returned.try_recv() {
//!     eprintln!("no queue for {}", message.routing_key);
//! }
//! sender.close().await?;
//! # Ok(()) }
//! ```
//!
//! Nothing is retried or reconnected. Errors from the broker end up
//! on the subscriptions, errors from calls are returned from them.
//!
//! The wire is reached through the traits in [`transport`]; the
//! implementation for [`amqp_opener::Opener`] uses `amqprs`.
// clippy lints
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![warn(
    clippy::missing_docs_in_private_items,
    clippy::self_named_module_files,
    clippy::perf,
    clippy::missing_panics_doc,
    clippy::wildcard_imports,
    clippy::enum_glob_use
)]

mod channel;
mod connection;
mod error;
mod link;
mod message;
mod notify;
mod sender;
mod tracker;
pub mod transport;

pub use channel::PublishChannel;
pub use connection::TransportConnection;
pub use error::{BoxError, Error, Result};
pub use message::{Message, PublishOptions, TimestampPolicy};
pub use notify::{Blocking, ClosedCause, NotificationHub, ReturnedMessage, Subscription};
pub use sender::{Delivery, PendingConfirm, Sender};
pub use tracker::{ConfirmResult, ConfirmTracker, Confirmation, NackReason};

/// A sender connecting with an [`amqp_opener::Opener`]
pub type AmqpSender = Sender<amqp_opener::Opener>;
