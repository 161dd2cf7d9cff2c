//! Command line parser
use std::path::PathBuf;

use clap::Parser;

use amqp_sender::{Message, PublishOptions, TimestampPolicy};

/// Options applied to every published line
#[derive(Clone, Debug, clap::Args)]
pub(crate) struct PublishArgs {
    /// Exchange to publish to. The default exchange routes by queue name
    #[arg(long, default_value = "")]
    pub(crate) exchange: String,

    /// Routing key for every message
    #[arg(long, default_value = "")]
    pub(crate) routing_key: String,

    /// Have the broker return messages it can't route. Returned
    /// messages make the command fail
    #[arg(long)]
    pub(crate) mandatory: bool,

    /// Set the immediate flag. RabbitMQ doesn't support it, so it is
    /// only logged
    #[arg(long)]
    pub(crate) immediate: bool,

    /// Publish persistent messages (delivery mode 2)
    #[arg(long)]
    pub(crate) persistent: bool,

    /// Content type of the messages
    #[arg(long)]
    pub(crate) content_type: Option<String>,

    /// Stamp each message with the time it is published
    #[arg(long)]
    pub(crate) stamp_time: bool,
}

impl PublishArgs {
    /// Flags for `basic.publish`
    pub(crate) fn options(&self) -> PublishOptions {
        PublishOptions {
            mandatory: self.mandatory,
            immediate: self.immediate,
        }
    }

    /// How to timestamp messages
    pub(crate) fn timestamp(&self) -> TimestampPolicy {
        if self.stamp_time {
            TimestampPolicy::Now
        } else {
            TimestampPolicy::CallerSupplied
        }
    }

    /// Make a message from one line of input
    pub(crate) fn message(&self, line: String) -> Message {
        let mut message = Message::new(line);
        if let Some(content_type) = &self.content_type {
            message = message.with_content_type(content_type);
        }
        if self.persistent {
            message = message.persistent();
        }
        message
    }
}

/// Publish each line of the input to RabbitMQ and wait for the broker
/// to confirm it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// RabbitMQ connection options
    #[command(flatten)]
    pub(crate) rabbit: amqp_opener::ConnectionArgs,

    /// Options for the published messages
    #[command(flatten)]
    pub(crate) publish: PublishArgs,

    /// Don't wait for the broker to acknowledge confirm mode
    #[arg(long)]
    pub(crate) confirm_no_wait: bool,

    /// Wait for each message to be confirmed before sending the next
    #[arg(long)]
    pub(crate) sync: bool,

    /// Seconds to wait for outstanding confirms before giving up
    #[arg(long, default_value_t = 30)]
    pub(crate) confirm_timeout: u64,

    /// Read messages from this file instead of stdin
    #[arg(long)]
    pub(crate) input: Option<PathBuf>,

    /// File to write logs to. Will log to stderr if not given
    #[arg(long)]
    pub(crate) logfile: Option<PathBuf>,
}
