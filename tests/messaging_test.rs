//! Delivery ordering and retry bounds on the in-memory transport

mod common;

use billing_pipeline::messaging::{
    handler_fn, Concurrency, DeadLetterReason, DeliveryProcessor, Envelope, HandlerError,
    InMemoryConfig, InMemoryDeadLetterSink, InMemoryTransport, MessageHeaders, MessageTransport,
    RetryPolicy, MESSAGE_KEY_HEADER,
};
use common::eventually;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn transport(policy: RetryPolicy) -> (InMemoryTransport, Arc<InMemoryDeadLetterSink>) {
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new(16));
    let processor = Arc::new(DeliveryProcessor::new(policy, dead_letters.clone()));
    let transport = InMemoryTransport::new(
        &InMemoryConfig {
            partitions: 3,
            ..Default::default()
        },
        processor,
    );
    (transport, dead_letters)
}

fn keyed(key: &str) -> MessageHeaders {
    MessageHeaders::new().with(MESSAGE_KEY_HEADER, key)
}

#[tokio::test]
async fn test_order_preserved_per_key_across_workers() {
    let (transport, _) = transport(RetryPolicy::fixed(3, Duration::from_millis(1)));
    let seen: Arc<Mutex<HashMap<String, Vec<u32>>>> = Arc::default();

    let recorder = seen.clone();
    let subscription = transport
        .subscribe(
            "billing-events",
            Concurrency::fixed(3),
            handler_fn(move |envelope: Envelope| {
                let recorder = recorder.clone();
                async move {
                    let key = envelope.message_key().unwrap_or_default().to_string();
                    let sequence: u32 = serde_json::from_slice(&envelope.payload)
                        .map_err(|e| HandlerError::deserialization(e.to_string()))?;
                    recorder.lock().entry(key).or_default().push(sequence);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let keys = ["T1", "T2", "T3", "T4", "T5"];
    for sequence in 0..40u32 {
        for key in keys {
            transport
                .publish(
                    "billing-events",
                    serde_json::to_vec(&sequence).unwrap(),
                    &keyed(key),
                )
                .await
                .unwrap();
        }
    }

    eventually(|| {
        let seen = seen.clone();
        async move {
            let seen = seen.lock();
            (seen.values().map(Vec::len).sum::<usize>() == 200).then_some(())
        }
    })
    .await;

    let seen = seen.lock();
    for key in keys {
        let expected: Vec<u32> = (0..40).collect();
        assert_eq!(seen[key], expected, "out of order for {key}");
    }
    drop(seen);
    subscription.shutdown().await;
}

#[tokio::test]
async fn test_retry_keeps_later_messages_behind() {
    let (transport, dead_letters) = transport(RetryPolicy::fixed(3, Duration::from_millis(5)));
    let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
    let failed_once = Arc::new(AtomicU32::new(0));

    let recorder = seen.clone();
    let failures = failed_once.clone();
    let subscription = transport
        .subscribe(
            "payment-events",
            Concurrency::fixed(1),
            handler_fn(move |envelope: Envelope| {
                let recorder = recorder.clone();
                let failures = failures.clone();
                async move {
                    let sequence: u32 = serde_json::from_slice(&envelope.payload)
                        .map_err(|e| HandlerError::deserialization(e.to_string()))?;
                    if sequence == 2 && failures.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(HandlerError::simulated("transient"));
                    }
                    recorder.lock().push(sequence);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    for sequence in 0..5u32 {
        transport
            .publish(
                "payment-events",
                serde_json::to_vec(&sequence).unwrap(),
                &keyed("T1"),
            )
            .await
            .unwrap();
    }

    eventually(|| {
        let seen = seen.clone();
        async move { (seen.lock().len() == 5).then_some(()) }
    })
    .await;

    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(failed_once.load(Ordering::SeqCst), 3);
    assert!(dead_letters.is_empty());
    subscription.shutdown().await;
}

#[tokio::test]
async fn test_deliveries_bounded_by_max_retries() {
    let (transport, dead_letters) = transport(RetryPolicy::fixed(2, Duration::from_millis(1)));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let subscription = transport
        .subscribe(
            "billing-events",
            Concurrency::fixed(1),
            handler_fn(move |envelope: Envelope| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::simulated(format!(
                        "attempt {} failed",
                        envelope.delivery.attempt
                    )))
                }
            }),
        )
        .await
        .unwrap();

    transport
        .publish("billing-events", b"{}".to_vec(), &keyed("T9"))
        .await
        .unwrap();

    let dead_letter = eventually(|| {
        let sink = dead_letters.clone();
        async move { sink.entries().into_iter().next() }
    })
    .await;

    assert_eq!(dead_letter.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(dead_letter.attempts, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    subscription.shutdown().await;
}

#[tokio::test]
async fn test_second_subscription_to_destination_rejected() {
    let (transport, _) = transport(RetryPolicy::fixed(0, Duration::from_millis(1)));
    let handler = handler_fn(|_envelope: Envelope| async { Ok(()) });

    let first = transport
        .subscribe("billing-events", Concurrency::fixed(2), handler.clone())
        .await
        .unwrap();
    assert_eq!(first.worker_count(), 2);
    assert!(transport
        .subscribe("billing-events", Concurrency::fixed(1), handler.clone())
        .await
        .is_err());

    first.shutdown().await;
    let again = transport
        .subscribe("billing-events", Concurrency::fixed(1), handler)
        .await
        .unwrap();
    again.shutdown().await;
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    let (transport, _) = transport(RetryPolicy::fixed(0, Duration::from_millis(1)));
    transport.close().await.unwrap();
    assert!(!transport.is_connected().await);
    assert!(transport
        .publish("billing-events", b"{}".to_vec(), &MessageHeaders::new())
        .await
        .is_err());
}
