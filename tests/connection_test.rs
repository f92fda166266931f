mod support;

use eshop_event_bus::rabbitmq::{
    Arguments, BusError, ExchangeKind, ExchangeOptions, InMemoryBroker, QueueOptions,
};
use support::{connect, wait_until};

#[tokio::test]
async fn disposed_connection_is_never_resurrected() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 5);

    assert!(connection.try_connect().await);
    assert!(connection.is_connected());
    let attempts = broker.connect_attempts();

    connection.dispose().await;
    assert!(!connection.is_connected());
    assert!(connection.is_disposed());
    assert_eq!(broker.open_connections(), 0);

    assert!(!connection.try_connect().await);
    let err = connection.create_channel().await.err().unwrap();
    assert!(matches!(err, BusError::ConnectionUnavailable(_)));

    broker.kill_connections();
    tokio::task::yield_now().await;
    assert_eq!(broker.connect_attempts(), attempts);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 0);

    connection.dispose().await;
    connection.dispose().await;

    assert!(connection.is_disposed());
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn backoff_doubles_until_the_budget_is_spent() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let (connection, sleeper) = connect(&broker, 5);

    assert!(!connection.try_connect().await);
    assert_eq!(sleeper.seconds(), vec![2, 4, 8, 16, 32]);
    assert_eq!(broker.connect_attempts(), 6);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn channel_creation_fails_explicitly_when_unreachable() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let (connection, sleeper) = connect(&broker, 2);

    let err = connection.create_channel().await.err().unwrap();
    assert!(matches!(err, BusError::ConnectionUnavailable(_)));
    assert_eq!(sleeper.seconds(), vec![2, 4]);
}

#[tokio::test]
async fn transient_connect_failures_are_retried() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(2);
    let (connection, sleeper) = connect(&broker, 5);

    assert!(connection.try_connect().await);
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(sleeper.seconds(), vec![2, 4]);
}

#[tokio::test]
async fn reconnects_after_shutdown() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 5);
    assert!(connection.try_connect().await);

    broker.kill_connections();

    wait_until("reconnect after shutdown", || {
        broker.connect_attempts() == 2 && connection.is_connected()
    })
    .await;
    assert_eq!(broker.open_connections(), 1);
    connection.create_channel().await.unwrap();
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn reconnects_after_blocked_notification() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 5);
    assert!(connection.try_connect().await);

    broker.block_connections();

    wait_until("reconnect after blocked", || broker.connect_attempts() == 2).await;
    wait_until("old connection closed", || {
        broker.open_connections() == 1 && connection.is_connected()
    })
    .await;
}

#[tokio::test]
async fn reconnects_after_callback_exception() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 5);
    assert!(connection.try_connect().await);

    broker.raise_callback_error();

    wait_until("reconnect after callback exception", || broker.connect_attempts() == 2).await;
    wait_until("old connection closed", || {
        broker.open_connections() == 1 && connection.is_connected()
    })
    .await;
}

#[tokio::test]
async fn concurrent_callers_share_one_connection() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 5);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move { connection.create_channel().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn topology_declarations_are_idempotent() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 0);
    let args = Arguments::new();

    for _ in 0..2 {
        connection
            .declare_exchange(
                "uat.exchange.topic.order.checkout",
                ExchangeKind::Topic,
                ExchangeOptions::default(),
                &args,
            )
            .await
            .unwrap();
        let queue = connection
            .declare_queue("uat.queue.order.checkoutconsumer", QueueOptions::default(), &args)
            .await
            .unwrap();
        assert_eq!(queue.name, "uat.queue.order.checkoutconsumer");
        connection
            .bind_queue(
                "uat.queue.order.checkoutconsumer",
                "uat.exchange.topic.order.checkout",
                "order.created",
                &args,
            )
            .await
            .unwrap();
    }

    assert_eq!(broker.exchange_count(), 1);
    assert_eq!(broker.queue_count(), 1);
    assert_eq!(broker.exchange_kind("uat.exchange.topic.order.checkout"), Some(ExchangeKind::Topic));
}

#[tokio::test]
async fn binding_to_a_missing_exchange_fails() {
    let broker = InMemoryBroker::new();
    let (connection, _) = connect(&broker, 0);
    let args = Arguments::new();

    connection
        .declare_queue("uat.queue.order.checkoutconsumer", QueueOptions::default(), &args)
        .await
        .unwrap();
    let err = connection
        .bind_queue("uat.queue.order.checkoutconsumer", "nowhere", "order.created", &args)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Channel(_)));
}
