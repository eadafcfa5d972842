use super::*;
use crate::message::CorrelationId;
use std::sync::atomic::AtomicUsize;

#[test]
fn test_topic_matches_exact() {
    assert!(topic_matches("sum", "sum"));
    assert!(!topic_matches("sum", "sub"));
}

#[test]
fn test_topic_matches_star_is_one_word() {
    assert!(topic_matches("say.*", "say.hello"));
    assert!(!topic_matches("say.*", "say"));
    assert!(!topic_matches("say.*", "say.hello.world"));
    assert!(!topic_matches("say.*", "sayhello"));
}

#[test]
fn test_topic_matches_hash_is_any_suffix() {
    assert!(topic_matches("#", "anything.at.all"));
    assert!(topic_matches("say.#", "say"));
    assert!(topic_matches("say.#", "say.hello.world"));
    assert!(topic_matches("#.stat", "worker.7.stat"));
    assert!(!topic_matches("say.#", "shout.hello"));
}

async fn open(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
    broker.connect().await.unwrap()
}

fn counting_handler() -> (Arc<dyn DeliveryHandler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handler = move |_delivery: Delivery| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    };
    (Arc::new(handler), count)
}

#[tokio::test]
async fn test_publish_without_exchange_fails() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;

    let result = conn
        .publish("missing", "sum", b"[]".to_vec(), PublishOptions::json())
        .await;
    assert!(matches!(result, Err(RpcError::Publish(_))));
}

#[tokio::test]
async fn test_exchange_redeclare_with_different_options_fails() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;

    conn.declare_exchange("rpc", &ExchangeOptions::default())
        .await
        .unwrap();
    let result = conn
        .declare_exchange(
            "rpc",
            &ExchangeOptions {
                durable: false,
                auto_delete: true,
            },
        )
        .await;
    assert!(matches!(result, Err(RpcError::Topology(_))));
}

#[tokio::test]
async fn test_buffered_until_consumer_attaches() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;
    conn.declare_exchange("rpc", &ExchangeOptions::default())
        .await
        .unwrap();
    conn.declare_queue("foo", &QueueOptions::default())
        .await
        .unwrap();
    conn.bind_queue("foo", "rpc", "foo").await.unwrap();

    conn.publish("rpc", "foo", b"[1,2]".to_vec(), PublishOptions::json())
        .await
        .unwrap();
    assert_eq!(broker.buffered("foo"), 1);

    let (handler, count) = counting_handler();
    conn.subscribe("foo", handler).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.buffered("foo"), 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_round_robin_between_consumers() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;
    conn.declare_exchange("rpc", &ExchangeOptions::default())
        .await
        .unwrap();
    conn.declare_queue("work", &QueueOptions::default())
        .await
        .unwrap();
    conn.bind_queue("work", "rpc", "work").await.unwrap();

    let (first, first_count) = counting_handler();
    let (second, second_count) = counting_handler();
    conn.subscribe("work", first).await.unwrap();
    conn.subscribe("work", second).await.unwrap();

    for _ in 0..4 {
        conn.publish("rpc", "work", b"{}".to_vec(), PublishOptions::json())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first_count.load(Ordering::SeqCst), 2);
    assert_eq!(second_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_delivery_carries_correlation_metadata() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;
    conn.declare_exchange("rpc", &ExchangeOptions::default())
        .await
        .unwrap();
    conn.declare_queue("sum", &QueueOptions::default())
        .await
        .unwrap();
    conn.bind_queue("sum", "rpc", "sum").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |delivery: Delivery| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(delivery);
        }
    };
    conn.subscribe("sum", Arc::new(handler)).await.unwrap();

    let options = PublishOptions::request(CorrelationId::from("c-1"), "replies");
    conn.publish("rpc", "sum", b"[1,2]".to_vec(), options)
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.info.routing_key, "sum");
    assert_eq!(delivery.info.exchange, "rpc");
    assert_eq!(delivery.info.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(delivery.info.reply_to.as_deref(), Some("replies"));
    assert_eq!(delivery.info.size, 5);
}

#[tokio::test]
async fn test_close_drops_exclusive_queues() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;
    conn.declare_queue(
        "mine",
        &QueueOptions {
            exclusive: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    conn.declare_queue("shared", &QueueOptions::default())
        .await
        .unwrap();

    conn.close().await.unwrap();

    assert!(!broker.queue_exists("mine"));
    assert!(broker.queue_exists("shared"));
    assert!(conn.declare_queue("again", &QueueOptions::default()).await.is_err());
}

#[tokio::test]
async fn test_unbind_missing_queue_is_not_found() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;
    conn.declare_exchange("rpc", &ExchangeOptions::default())
        .await
        .unwrap();

    let result = conn.unbind_queue("ghost", "rpc", "ghost").await;
    assert!(matches!(result, Err(RpcError::Topology(_))));
}

#[tokio::test]
async fn test_fail_connect_switch() {
    let broker = MemoryBroker::new();
    broker.set_fail_connect(true);
    assert!(broker.connect().await.is_err());

    broker.set_fail_connect(false);
    assert!(broker.connect().await.is_ok());
    assert_eq!(broker.stats().connections, 1);
}

#[tokio::test]
async fn test_panicking_handler_keeps_consuming() {
    let broker = MemoryBroker::new();
    let conn = open(&broker).await;
    conn.declare_queue("jobs", &QueueOptions::default())
        .await
        .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handler = move |delivery: Delivery| {
        let seen = seen.clone();
        async move {
            if delivery.payload == b"0" {
                panic!("handler blew up");
            }
            seen.fetch_add(1, Ordering::SeqCst);
        }
    };
    conn.subscribe("jobs", Arc::new(handler)).await.unwrap();

    conn.declare_exchange("rpc", &ExchangeOptions::default())
        .await
        .unwrap();
    conn.bind_queue("jobs", "rpc", "jobs").await.unwrap();
    for payload in [b"0", b"1"] {
        conn.publish("rpc", "jobs", payload.to_vec(), PublishOptions::json())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(broker.consumer_count("jobs"), 1);
}

#[tokio::test]
async fn test_close_keeps_auto_delete_queues_it_never_consumed() {
    let broker = MemoryBroker::new();
    let owner = open(&broker).await;
    let other = open(&broker).await;
    owner
        .declare_exchange("rpc", &ExchangeOptions::default())
        .await
        .unwrap();

    let auto_delete = QueueOptions {
        auto_delete: true,
        ..Default::default()
    };
    owner.declare_queue("idle", &auto_delete).await.unwrap();
    other.declare_queue("watched", &auto_delete).await.unwrap();
    let (handler, _count) = counting_handler();
    other.subscribe("watched", handler).await.unwrap();

    other.close().await.unwrap();

    assert!(broker.exchange_exists("rpc"));
    assert_eq!(broker.queue_names(), vec!["idle".to_string()]);
}
