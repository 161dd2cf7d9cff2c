//! Publish lines of text to a `RabbitMQ` server with publisher confirms
//!
//! Usage:
//! ```text
//! amqp-send --rabbit-addr="amqp://rabbit.host/%2f" --exchange=logs --routing-key=app < messages.txt
//! ```
//!
//! Each line of the input (stdin, or `--input`) becomes one message.
//! Publishing doesn't wait for the broker unless `--sync` is given;
//! once the input ends every outstanding confirm is waited for, up to
//! `--confirm-timeout` seconds, and the connection is closed.
//!
//! The exit status is non-zero if the connection fails, the broker
//! nacks any message, or (with `--mandatory`) any message is returned
//! as unroutable. SIGINT and SIGTERM stop reading input; messages
//! already published are still waited for.
// Clippy lints
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::self_named_module_files)]
#![warn(clippy::perf)]
#![deny(missing_docs)]
#![warn(clippy::missing_panics_doc)]

use std::time::Duration;

use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use amqp_sender::{AmqpSender, Confirmation, ReturnedMessage, Sender, Subscription};

mod cli;

/// Log every delivery that wasn't acked and count them
async fn watch_confirms(published: Subscription<Confirmation>) -> usize {
    let mut failed = 0;
    while let Some(confirmation) = published.recv().await {
        if !confirmation.outcome.is_ack() {
            warn!(
                delivery_tag = confirmation.delivery_tag,
                outcome = ?confirmation.outcome,
                "Message not confirmed"
            );
            failed += 1;
        }
    }
    failed
}

/// Log every returned message and count them
async fn watch_returns(returned: Subscription<ReturnedMessage>) -> usize {
    let mut count = 0;
    while let Some(message) = returned.recv().await {
        error!(
            reply_code = message.reply_code,
            reply_text = %message.reply_text,
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            "Message returned by the broker"
        );
        count += 1;
    }
    count
}

/// Open the configured input as a stream of lines
async fn open_input(args: &cli::Args) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("Unable to open {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

/// Publish every line of the input until it ends or `cancel` fires.
/// Returns the number of messages published
async fn publish_lines(
    sender: &AmqpSender,
    args: &cli::Args,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut lines = open_input(args).await?.lines();
    let confirm_timeout = Duration::from_secs(args.confirm_timeout);
    let publish = &args.publish;
    let mut count = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stopping after {} messages", count);
                break;
            }
            line = lines.next_line() => line.into_diagnostic().wrap_err("Failed to read input")?,
        };
        let Some(line) = line else {
            break;
        };
        let message = publish.message(line);
        if args.sync {
            let delivery = sender
                .publish_with_confirm(
                    &publish.exchange,
                    &publish.routing_key,
                    publish.options(),
                    message,
                    publish.timestamp(),
                )
                .await?;
            let outcome = tokio::time::timeout(confirm_timeout, delivery.confirm)
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("No confirm for message {}", delivery.sequence))?;
            if !outcome.is_ack() {
                miette::bail!("Message {} was not confirmed: {:?}", delivery.sequence, outcome);
            }
        } else {
            sender
                .publish(
                    &publish.exchange,
                    &publish.routing_key,
                    publish.options(),
                    message,
                    publish.timestamp(),
                )
                .await?;
        }
        count += 1;
    }
    Ok(count)
}

/// Connect, publish the input and shut down
async fn tokio_main(args: cli::Args) -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());

    match &args.logfile {
        Some(file) => {
            let f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .into_diagnostic()
                .wrap_err_with(|| format!("Unable to open {}", file.display()))?;
            subscriber
                .with_writer(std::sync::Mutex::new(f))
                .with_ansi(false)
                .init();
        }
        None => {
            subscriber.with_writer(std::io::stderr).init();
        }
    };

    debug!("Got command line arguments {:?}", args);

    let opener = args.rabbit.connection_opener()?;
    let sender = Sender::new(opener);
    sender
        .start(args.confirm_no_wait)
        .await
        .wrap_err("Failed to start publishing")?;

    let confirms = tokio::spawn(watch_confirms(sender.published()?));
    let returns = tokio::spawn(watch_returns(sender.returned()?));

    let mut signals = Signals::new(TERM_SIGNALS).into_diagnostic()?;
    let cancel = CancellationToken::new();
    let for_sig = cancel.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            info!("Got signal {}. Shutting down", sig);
            for_sig.cancel();
        }
    });

    let published = publish_lines(&sender, &args, &cancel).await;
    let confirmed = match &published {
        Ok(_) => Some(
            tokio::time::timeout(
                Duration::from_secs(args.confirm_timeout),
                sender.wait_for_confirms(),
            )
            .await,
        ),
        Err(_) => None,
    };

    info!("Shutting down");
    let closed = sender.close().await;
    let failed = confirms.await.into_diagnostic()?;
    let returned = returns.await.into_diagnostic()?;

    let count = published?;
    match confirmed {
        Some(Err(_)) => miette::bail!(
            "Timed out after {}s waiting for confirms",
            args.confirm_timeout
        ),
        Some(Ok(result)) => result.wrap_err("Not every message was confirmed")?,
        None => {}
    }
    closed.wrap_err("Failed to shut down cleanly")?;
    if returned > 0 {
        miette::bail!("{} of {} messages were returned by the broker", returned, count);
    }
    if failed > 0 {
        miette::bail!("{} of {} messages were not confirmed", failed, count);
    }
    info!(count, "All messages confirmed");
    Ok(())
}

#[doc(hidden)]
fn main() -> Result<()> {
    let args = cli::Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    rt.block_on(tokio_main(args))
}
