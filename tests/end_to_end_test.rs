mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use eshop_event_bus::message::{Disposition, Envelope, JSON_CONTENT_TYPE};
use eshop_event_bus::rabbitmq::memory::AckKind;
use eshop_event_bus::rabbitmq::{Arguments, Consumer, InMemoryBroker, Producer, QueueOptions};
use serde_json::{json, Value};
use support::{connect, wait_until};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn checkout_event_reaches_the_ordering_consumer() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 0);

    let producer =
        Producer::new(connection.clone(), "order", "uat", "checkout", "topic").unwrap();
    let consumer =
        Arc::new(Consumer::new(connection.clone(), "order", "uat", "checkoutconsumer").unwrap());
    assert_eq!(producer.exchange_name(), "uat.exchange.topic.order.checkout");
    assert_eq!(consumer.queue_name(), "uat.queue.order.checkoutconsumer");

    let args = Arguments::new();
    connection
        .declare_exchange(
            producer.exchange_name(),
            producer.exchange_kind(),
            Default::default(),
            &args,
        )
        .await
        .unwrap();
    connection
        .declare_queue(consumer.queue_name(), QueueOptions::default(), &args)
        .await
        .unwrap();
    connection
        .bind_queue(consumer.queue_name(), producer.exchange_name(), "order.created", &args)
        .await
        .unwrap();

    let (received_tx, mut received_rx) = mpsc::unbounded_channel::<Envelope>();
    let cancellation = CancellationToken::new();
    let subscription = tokio::spawn({
        let consumer = consumer.clone();
        let cancellation = cancellation.clone();
        async move {
            consumer
                .subscribe(
                    move |envelope: Envelope| {
                        let received_tx = received_tx.clone();
                        async move {
                            received_tx.send(envelope)?;
                            Ok::<_, anyhow::Error>(Disposition::Ack)
                        }
                    },
                    50,
                    cancellation,
                )
                .await
        }
    });

    producer
        .publish_json("order.created", &json!({ "sku": "X1" }))
        .await
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.routing_key(), "order.created");
    assert_eq!(envelope.content_type(), Some(JSON_CONTENT_TYPE));
    assert!(envelope.message_id().is_some());
    assert!(envelope.creation_time().is_some());
    assert_eq!(envelope.deserialize_json::<Value>().unwrap(), json!({ "sku": "X1" }));

    wait_until("delivery acknowledged", || broker.acknowledgements().len() == 1).await;
    assert_eq!(broker.acknowledgements()[0].kind, AckKind::Ack);

    cancellation.cancel();
    subscription.await.unwrap().unwrap();

    producer.dispose().await;
    consumer.dispose().await;
    connection.dispose().await;
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn requeued_delivery_is_redelivered_before_it_is_acked() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 0);
    let producer =
        Producer::new(connection.clone(), "order", "uat", "checkout", "topic").unwrap();
    let consumer = Consumer::new(connection.clone(), "order", "uat", "checkoutconsumer").unwrap();

    let args = Arguments::new();
    connection
        .declare_exchange(
            producer.exchange_name(),
            producer.exchange_kind(),
            Default::default(),
            &args,
        )
        .await
        .unwrap();
    connection
        .declare_queue(consumer.queue_name(), QueueOptions::default(), &args)
        .await
        .unwrap();
    connection
        .bind_queue(consumer.queue_name(), producer.exchange_name(), "order.created", &args)
        .await
        .unwrap();

    for n in 1..=7 {
        producer
            .publish_json("order.created", &json!({ "n": n }))
            .await
            .unwrap();
    }

    // The seventh message is rejected with requeue the first time it is seen.
    let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
    let handler_seen = seen.clone();
    consumer
        .subscribe_once(
            move |envelope: Envelope| {
                let seen = handler_seen.clone();
                async move {
                    let n = envelope.deserialize_json::<Value>()?["n"].as_u64().unwrap_or_default();
                    let mut seen = seen.lock().unwrap();
                    let first_time = !seen.contains(&n);
                    seen.push(n);
                    Ok::<_, anyhow::Error>(if n == 7 && first_time {
                        Disposition::NackRequeue
                    } else {
                        Disposition::Ack
                    })
                }
            },
            1,
        )
        .await
        .unwrap();

    wait_until("all messages settled", || broker.acknowledgements().len() == 8).await;

    let acknowledgements = broker.acknowledgements();
    let requeue = acknowledgements
        .iter()
        .position(|a| a.delivery_tag == 7)
        .unwrap();
    assert_eq!(acknowledgements[requeue].kind, AckKind::Nack { requeue: true });
    assert!(acknowledgements[requeue + 1..]
        .iter()
        .any(|a| a.delivery_tag == 8 && a.kind == AckKind::Ack));

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 7]);
    assert_eq!(broker.queue_depth(consumer.queue_name()), 0);
}
