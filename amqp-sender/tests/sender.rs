mod common;

use amqp_sender::{
    ClosedCause, ConfirmResult, Error, Message, NackReason, PublishOptions, ReturnedMessage,
    Sender, TimestampPolicy,
};
use std::time::Duration;

use bytes::Bytes;
use common::MockBroker;
use proptest::prelude::*;
use tokio::sync::mpsc::error::TryRecvError;

const CLOSED: ConfirmResult = ConfirmResult::Nacked(NackReason::ChannelClosed);
const NACKED: ConfirmResult = ConfirmResult::Nacked(NackReason::Broker);

/// A started sender on a fresh mock broker
async fn started() -> eyre::Result<(MockBroker, Sender<MockBroker>)> {
    let broker = MockBroker::new();
    let sender = Sender::new(broker.clone());
    sender.start(false).await?;
    Ok((broker, sender))
}

/// Publish `n` messages named m1, m2, ... to exchange "x", key "r"
async fn publish_n(sender: &Sender<MockBroker>, n: u64) -> eyre::Result<Vec<u64>> {
    let mut sequences = vec![];
    for i in 1..=n {
        sequences.push(
            sender
                .publish_simple("x", "r", Message::from(format!("m{i}").as_str()))
                .await?,
        );
    }
    Ok(sequences)
}

#[tokio::test]
async fn sequence_numbers_count_from_one() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    assert_eq!(broker.confirm_selects(), vec![false]);
    assert_eq!(publish_n(&sender, 5).await?, vec![1, 2, 3, 4, 5]);

    let published = broker.published();
    assert_eq!(published.len(), 5);
    assert_eq!(published[0].body, Bytes::from("m1"));
    assert_eq!(published[4].body, Bytes::from("m5"));
    assert!(published.iter().all(|p| p.exchange == "x" && p.routing_key == "r"));
    assert_eq!(sender.unconfirmed()?, 5);
    Ok(())
}

#[tokio::test]
async fn concurrent_publishes_get_distinct_sequences() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let sender = std::sync::Arc::new(sender);
    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.publish_simple("x", "r", Message::from("m")).await })
        })
        .collect();
    let mut sequences = vec![];
    for task in tasks {
        sequences.push(task.await??);
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
    assert_eq!(broker.published().len(), 20);
    Ok(())
}

#[tokio::test]
async fn publish_ack_close() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let acks = sender.confirm_ack()?;
    let published = sender.published()?;

    let sequence = sender
        .publish(
            "x",
            "r",
            PublishOptions::default(),
            Message::from("m1"),
            TimestampPolicy::CallerSupplied,
        )
        .await?;
    assert_eq!(sequence, 1);

    broker.ack(1, false);
    assert_eq!(acks.try_recv(), Ok(1));
    assert_eq!(acks.try_recv(), Err(TryRecvError::Empty));
    let confirmation = published.try_recv()?;
    assert_eq!(confirmation.delivery_tag, 1);
    assert_eq!(confirmation.outcome, ConfirmResult::Acked);
    assert_eq!(confirmation.payload, Bytes::from("m1"));

    sender.close().await?;
    // Terminated without another resolution of delivery 1
    assert_eq!(published.recv().await.map(|c| c.delivery_tag), None);
    assert_eq!(acks.recv().await, None);
    Ok(())
}

#[tokio::test]
async fn nack_then_multiple_ack() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let published = sender.published()?;
    let mut confirms = vec![];
    for body in ["m1", "m2", "m3"] {
        confirms.push(
            sender
                .publish_with_confirm(
                    "x",
                    "r",
                    PublishOptions::default(),
                    Message::from(body),
                    TimestampPolicy::CallerSupplied,
                )
                .await?,
        );
    }

    broker.nack(2, false);
    broker.ack(3, true);

    let outcomes: Vec<_> = std::iter::from_fn(|| published.try_recv().ok())
        .map(|c| (c.delivery_tag, c.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![(2, NACKED), (1, ConfirmResult::Acked), (3, ConfirmResult::Acked)]
    );

    let mut results = vec![];
    for delivery in confirms {
        results.push((delivery.sequence, delivery.confirm.await));
    }
    assert_eq!(
        results,
        vec![(1, ConfirmResult::Acked), (2, NACKED), (3, ConfirmResult::Acked)]
    );
    assert!(matches!(
        sender.wait_for_confirms().await,
        Err(Error::ConfirmFailed { nacked: 1 })
    ));
    Ok(())
}

#[tokio::test]
async fn nack_then_single_ack_leaves_first_pending() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    publish_n(&sender, 3).await?;
    broker.nack(2, false);
    broker.ack(3, false);
    assert_eq!(sender.unconfirmed()?, 1);

    let published = sender.published()?;
    sender.close().await?;
    let failed = published.try_recv()?;
    assert_eq!((failed.delivery_tag, failed.outcome), (1, CLOSED));
    Ok(())
}

#[tokio::test]
async fn close_fails_pending_exactly_once() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let published = sender.published()?;
    publish_n(&sender, 4).await?;
    broker.ack(2, false);
    assert_eq!(published.try_recv()?.delivery_tag, 2);

    sender.close().await?;
    let mut failed = vec![];
    while let Some(confirmation) = published.recv().await {
        assert_eq!(confirmation.outcome, CLOSED);
        failed.push(confirmation.delivery_tag);
    }
    assert_eq!(failed, vec![1, 3, 4]);

    // Late confirms change nothing
    broker.ack(4, true);
    assert_eq!(published.try_recv(), Err(TryRecvError::Disconnected));
    Ok(())
}

#[tokio::test]
async fn close_twice() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    sender.close().await?;
    sender.close().await?;
    assert_eq!(broker.channel_closes(), 1);
    assert_eq!(broker.connection_closes(), 1);
    assert!(!sender.is_open());
    Ok(())
}

#[tokio::test]
async fn close_reports_first_error_and_finishes() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let connection_closed = sender.connection_closed()?;
    broker.fail_channel_close();

    let err = sender.close().await.unwrap_err();
    assert!(matches!(err, Error::Close { what: "channel", .. }));
    assert_eq!(broker.connection_closes(), 1);
    assert_eq!(connection_closed.recv().await, Some(ClosedCause::Graceful));
    assert_eq!(connection_closed.recv().await, None);
    sender.close().await?;
    Ok(())
}

#[tokio::test]
async fn subscriptions_are_shared() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let first = sender.channel_flow()?;
    let second = sender.channel_flow()?;
    assert!(first.same_as(&second));

    broker.channel().flow(true);
    broker.channel().flow(false);
    assert_eq!(second.try_recv(), Ok(true));
    assert_eq!(first.try_recv(), Ok(false));
    assert_eq!(first.try_recv(), Err(TryRecvError::Empty));

    assert!(!sender.confirm_ack()?.same_as(&sender.confirm_nack()?));
    Ok(())
}

#[tokio::test]
async fn not_started() -> eyre::Result<()> {
    let sender = Sender::new(MockBroker::new());
    assert!(matches!(sender.published(), Err(Error::NotStarted)));
    assert!(matches!(sender.connection_closed(), Err(Error::NotStarted)));
    assert!(matches!(sender.returned(), Err(Error::NotStarted)));
    assert!(matches!(sender.unconfirmed(), Err(Error::NotStarted)));
    assert!(matches!(
        sender.publish_simple("x", "r", Message::from("m1")).await,
        Err(Error::NotStarted)
    ));
    // Nothing to close
    sender.close().await?;
    Ok(())
}

#[tokio::test]
async fn start_only_once() -> eyre::Result<()> {
    let (_broker, sender) = started().await?;
    assert!(matches!(sender.start(false).await, Err(Error::AlreadyStarted)));
    sender.close().await?;
    assert!(matches!(sender.start(false).await, Err(Error::AlreadyStarted)));
    assert!(matches!(
        sender.publish_simple("x", "r", Message::from("m1")).await,
        Err(Error::ChannelClosed)
    ));
    // Closed subscriptions can still be read
    assert_eq!(
        sender.channel_closed()?.try_recv(),
        Ok(ClosedCause::Graceful)
    );
    Ok(())
}

#[tokio::test]
async fn failed_start_cleans_up() -> eyre::Result<()> {
    let broker = MockBroker::new();
    broker.refuse_connect();
    let sender = Sender::new(broker.clone());
    assert!(matches!(sender.start(false).await, Err(Error::Connect { .. })));

    let broker = MockBroker::new();
    broker.refuse_confirms();
    let sender = Sender::new(broker.clone());
    assert!(matches!(sender.start(true).await, Err(Error::Confirm { .. })));
    assert_eq!(broker.channel_closes(), 1);
    assert_eq!(broker.connection_closes(), 1);
    assert!(matches!(sender.published(), Err(Error::NotStarted)));
    Ok(())
}

#[tokio::test]
async fn refused_channel_closes_connection() -> eyre::Result<()> {
    let broker = MockBroker::new();
    broker.refuse_channel();
    let sender = Sender::new(broker.clone());
    assert!(matches!(sender.start(false).await, Err(Error::Channel { .. })));
    assert_eq!(broker.connection_closes(), 1);
    Ok(())
}

#[tokio::test]
async fn invalid_publish_keeps_sequence() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let long_key = "k".repeat(256);
    assert!(matches!(
        sender
            .publish_simple("x", &long_key, Message::from("m1"))
            .await,
        Err(Error::InvalidPublish(_))
    ));
    broker.fail_publishes(1);
    assert!(matches!(
        sender.publish_simple("x", "r", Message::from("m1")).await,
        Err(Error::Publish { .. })
    ));
    assert_eq!(sender.unconfirmed()?, 0);
    assert_eq!(publish_n(&sender, 1).await?, vec![1]);
    assert_eq!(broker.published().len(), 1);
    Ok(())
}

#[tokio::test]
async fn timestamp_policy() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    sender
        .publish_simple("x", "r", Message::from("m1").with_timestamp(7))
        .await?;
    sender
        .publish_simple_now("x", "r", Message::from("m2").with_timestamp(7))
        .await?;
    sender
        .publish(
            "x",
            "r",
            PublishOptions {
                mandatory: true,
                immediate: true,
            },
            Message::from("m3"),
            TimestampPolicy::CallerSupplied,
        )
        .await?;

    let published = broker.published();
    assert_eq!(published[0].timestamp, Some(7));
    assert!(published[1].timestamp.unwrap_or_default() > 7);
    assert_eq!(published[2].timestamp, None);
    assert!(published[2].mandatory);
    Ok(())
}

#[tokio::test]
async fn broker_closes_channel() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let published = sender.published()?;
    publish_n(&sender, 2).await?;

    broker.channel().closed(ClosedCause::Broker {
        code: 406,
        text: "PRECONDITION_FAILED".to_string(),
    });
    assert!(!sender.is_open());
    assert_eq!(published.try_recv()?.outcome, CLOSED);
    assert_eq!(published.try_recv()?.outcome, CLOSED);
    assert!(matches!(
        sender.publish_simple("x", "r", Message::from("m3")).await,
        Err(Error::ChannelClosed)
    ));
    assert!(matches!(
        sender.wait_for_confirms().await,
        Err(Error::ConfirmFailed { nacked: 2 })
    ));

    // Subscribing after the fact still shows the cause
    let closed = sender.channel_closed()?;
    assert_eq!(
        closed.try_recv(),
        Ok(ClosedCause::Broker {
            code: 406,
            text: "PRECONDITION_FAILED".to_string()
        })
    );
    sender.close().await?;
    assert_eq!(broker.channel_closes(), 0);
    assert_eq!(broker.connection_closes(), 1);
    Ok(())
}

#[tokio::test]
async fn connection_failure_closes_channel() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let published = sender.published()?;
    publish_n(&sender, 1).await?;

    let cause = ClosedCause::Transport("connection reset by peer".to_string());
    broker.connection().closed(cause.clone());
    broker.connection().closed(ClosedCause::Graceful);

    assert_eq!(sender.connection_closed()?.try_recv(), Ok(cause.clone()));
    assert_eq!(sender.channel_closed()?.try_recv(), Ok(cause));
    assert_eq!(published.try_recv()?.outcome, CLOSED);
    Ok(())
}

#[tokio::test]
async fn connection_failure_ends_subscriptions() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let published = sender.published()?;
    let flow = sender.channel_flow()?;
    let acks = sender.confirm_ack()?;
    let blocked = sender.connection_blocked()?;
    let connection_closed = sender.connection_closed()?;
    publish_n(&sender, 1).await?;

    let cause = ClosedCause::Transport("reset".to_string());
    broker.connection().closed(cause.clone());

    assert_eq!(published.recv().await.map(|c| c.outcome), Some(CLOSED));
    assert_eq!(published.recv().await.map(|c| c.outcome), None);
    assert_eq!(flow.recv().await, None);
    assert_eq!(acks.recv().await, None);
    assert_eq!(blocked.recv().await, None);
    assert_eq!(connection_closed.recv().await, Some(cause));
    assert_eq!(connection_closed.recv().await, None);
    Ok(())
}

#[tokio::test]
async fn channel_close_keeps_connection_signals() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let returned = sender.returned()?;
    let blocked = sender.connection_blocked()?;

    broker.channel().closed(ClosedCause::Broker {
        code: 404,
        text: "NOT_FOUND".to_string(),
    });
    assert!(returned.recv().await.is_none());
    assert!(!blocked.is_terminated());
    broker.connection().blocked("disk alarm".to_string());
    assert!(blocked.try_recv()?.active);

    sender.close().await?;
    assert_eq!(blocked.recv().await, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelled_publish_frees_its_sequence() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    broker.stall_publishes(1);
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        sender.publish_simple("x", "r", Message::from("m1")),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(sender.unconfirmed()?, 0);
    tokio::time::timeout(Duration::from_secs(1), sender.wait_for_confirms()).await??;

    let sequence = sender
        .publish_simple("x", "r", Message::from("m2"))
        .await?;
    assert_eq!(sequence, 1);
    assert_eq!(sender.unconfirmed()?, 1);
    assert_eq!(broker.published().len(), 1);
    Ok(())
}

#[tokio::test]
async fn broker_signals_reach_subscribers() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let blocked = sender.connection_blocked()?;
    let cancelled = sender.channel_cancelled()?;
    let returned = sender.returned()?;

    broker.connection().blocked("low on memory".to_string());
    broker.connection().unblocked();
    broker.channel().cancelled("ctag-1".to_string());
    broker.channel().returned(ReturnedMessage {
        reply_code: 312,
        reply_text: "NO_ROUTE".to_string(),
        exchange: "x".to_string(),
        routing_key: "nowhere".to_string(),
        properties: Message::from("m1").properties(),
        body: Bytes::from("m1"),
    });

    let first = blocked.try_recv()?;
    assert!(first.active);
    assert_eq!(first.reason.as_deref(), Some("low on memory"));
    assert!(!blocked.try_recv()?.active);
    assert_eq!(cancelled.try_recv()?, "ctag-1");
    let message = returned.try_recv()?;
    assert_eq!(message.reply_code, 312);
    assert_eq!(message.routing_key, "nowhere");
    Ok(())
}

#[tokio::test]
async fn wait_for_confirms_after_acks() -> eyre::Result<()> {
    let (broker, sender) = started().await?;
    let sender = std::sync::Arc::new(sender);
    publish_n(&sender, 3).await?;
    let waiter = tokio::spawn({
        let sender = sender.clone();
        async move { sender.wait_for_confirms().await }
    });
    broker.ack(2, true);
    broker.ack(3, false);
    waiter.await??;
    assert_eq!(sender.unconfirmed()?, 0);
    Ok(())
}

proptest! {
    #[test]
    fn bulk_ack_boundary(n in 1u64..40, k in 0u64..40) {
        let k = k.min(n);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (acked, pending) = rt.block_on(async {
            let (broker, sender) = started().await.unwrap();
            let published = sender.published().unwrap();
            publish_n(&sender, n).await.unwrap();
            if k > 0 {
                broker.ack(k, true);
            }
            let acked: Vec<u64> = std::iter::from_fn(|| published.try_recv().ok())
                .map(|c| c.delivery_tag)
                .collect();
            (acked, sender.unconfirmed().unwrap())
        });
        prop_assert_eq!(acked, (1..=k).collect::<Vec<_>>());
        prop_assert_eq!(pending as u64, n - k);
    }
}
