//! Broker contract: FIFO lists, score-ordered pops, TTL'd set-if-absent,
//! at-most-once pub/sub, and the ancillary set/hash indices.

use std::time::Duration;

use serde_json::json;
use trg_store::QueueBroker;
use trg_store_memory::MemoryBroker;

#[tokio::test]
async fn list_queue_is_fifo() {
    let broker = MemoryBroker::new();
    broker.push_work("q", &json!({"n": 1})).await.unwrap();
    broker.push_work("q", &json!({"n": 2})).await.unwrap();
    broker.push_work("q", &json!({"n": 3})).await.unwrap();

    assert_eq!(broker.pop_work("q").await.unwrap().unwrap()["n"], 1);
    assert_eq!(broker.pop_work("q").await.unwrap().unwrap()["n"], 2);
    assert_eq!(broker.pop_work("q").await.unwrap().unwrap()["n"], 3);
    assert!(broker.pop_work("q").await.unwrap().is_none());
}

#[tokio::test]
async fn blocking_pop_returns_early_work_and_times_out_empty() {
    let broker = MemoryBroker::new();
    broker.push_work("q", &json!("item")).await.unwrap();
    let got = broker
        .pop_work_blocking("q", Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(got.unwrap(), json!("item"));

    let start = std::time::Instant::now();
    let none = broker
        .pop_work_blocking("q", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(none.is_none());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn priority_pop_is_highest_score_first() {
    let broker = MemoryBroker::new();
    broker.priority_add("z", "low", 3.0).await.unwrap();
    broker.priority_add("z", "high", 9.0).await.unwrap();
    broker.priority_add("z", "mid", 6.0).await.unwrap();
    assert_eq!(broker.priority_len("z").await.unwrap(), 3);

    assert_eq!(broker.priority_pop_max("z").await.unwrap().unwrap(), "high");
    assert_eq!(broker.priority_pop_max("z").await.unwrap().unwrap(), "mid");
    assert_eq!(broker.priority_pop_max("z").await.unwrap().unwrap(), "low");
    assert!(broker.priority_pop_max("z").await.unwrap().is_none());
}

#[tokio::test]
async fn re_adding_a_member_updates_its_score() {
    let broker = MemoryBroker::new();
    broker.priority_add("z", "g1", 5.0).await.unwrap();
    broker.priority_add("z", "g1", 2.0).await.unwrap();
    broker.priority_add("z", "g2", 4.0).await.unwrap();
    assert_eq!(broker.priority_len("z").await.unwrap(), 2);
    assert_eq!(broker.priority_pop_max("z").await.unwrap().unwrap(), "g2");
}

#[tokio::test]
async fn set_nx_excludes_second_writer_until_expiry() {
    let broker = MemoryBroker::new();
    assert!(broker
        .set_nx_ttl("lock", "holder-1", Duration::from_millis(40))
        .await
        .unwrap());
    assert!(!broker
        .set_nx_ttl("lock", "holder-2", Duration::from_millis(40))
        .await
        .unwrap());
    assert_eq!(
        broker.get_value("lock").await.unwrap().as_deref(),
        Some("holder-1")
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(broker.get_value("lock").await.unwrap().is_none());
    assert!(broker
        .set_nx_ttl("lock", "holder-2", Duration::from_millis(40))
        .await
        .unwrap());
}

#[tokio::test]
async fn explicit_delete_releases_a_key() {
    let broker = MemoryBroker::new();
    broker
        .set_nx_ttl("k", "v", Duration::from_secs(60))
        .await
        .unwrap();
    broker.delete_value("k").await.unwrap();
    assert!(broker.get_value("k").await.unwrap().is_none());
}

#[tokio::test]
async fn pubsub_reaches_current_subscribers_only() {
    let broker = MemoryBroker::new();

    // Published before anyone subscribes: dropped.
    broker.publish("ch", &json!({"seq": 0})).await.unwrap();

    let mut rx = broker.subscribe("ch").await.unwrap();
    broker.publish("ch", &json!({"seq": 1})).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got["seq"], 1);

    // Nothing older was retained.
    assert!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn sets_and_hashes_hold_ancillary_state() {
    let broker = MemoryBroker::new();

    broker.set_add("agents", "a1").await.unwrap();
    broker.set_add("agents", "a2").await.unwrap();
    broker.set_add("agents", "a1").await.unwrap();
    assert_eq!(broker.set_members("agents").await.unwrap(), vec!["a1", "a2"]);
    broker.set_remove("agents", "a1").await.unwrap();
    assert_eq!(broker.set_members("agents").await.unwrap(), vec!["a2"]);

    broker.hash_set("desc", "g1", "{}").await.unwrap();
    assert_eq!(
        broker.hash_get("desc", "g1").await.unwrap().as_deref(),
        Some("{}")
    );
    assert!(broker.hash_get("desc", "g2").await.unwrap().is_none());
    broker.hash_delete("desc", "g1").await.unwrap();
    assert!(broker.hash_get("desc", "g1").await.unwrap().is_none());
}
