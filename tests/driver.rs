mod common;

use std::sync::Arc;
use std::time::Duration;

use konsumer::client::TopicPartition;
use konsumer::config::DriverConfig;
use konsumer::driver::{ConsumerDriver, DriverError, Requester};
use maplit::{btreemap, btreeset};
use rdkafka::error::KafkaError;

use common::{init_tracing, record, wait_until, ScriptedClient, ScriptedState};

fn config() -> DriverConfig {
    DriverConfig {
        poll_timeout_ms: 5,
        poll_interval_ms: 5,
        ..Default::default()
    }
}

fn spawn_scripted() -> (ConsumerDriver, Arc<ScriptedState>) {
    let state = Arc::new(ScriptedState::default());
    let client_state = Arc::clone(&state);
    let driver = ConsumerDriver::spawn_with(config(), move || Ok(ScriptedClient::new(client_state)))
        .expect("driver spawns");

    (driver, state)
}

#[tokio::test]
async fn test_requested_records_reach_the_requester() {
    init_tracing();
    let (driver, state) = spawn_scripted();
    let t0 = TopicPartition::new("orders", 0);

    driver.assign(btreeset! { t0.clone() }).unwrap();
    state.queue(&t0, vec![record(&t0, 0), record(&t0, 1)]);

    let (requester, mut rx) = Requester::new();
    driver
        .request_messages(&requester, btreeset! { t0.clone() })
        .unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("a batch arrives")
        .expect("channel open")
        .expect("not a driver error");

    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.records[0].topic_partition(), t0);
    assert_eq!(batch.records[0].offset, 0);
    assert_eq!(batch.records[1].offset, 1);

    driver.shutdown().unwrap();
}

#[tokio::test]
async fn test_commit_round_trip() {
    let (driver, _state) = spawn_scripted();
    let t0 = TopicPartition::new("orders", 0);

    let committed = driver.commit(btreemap! { t0.clone() => 42 }).await.unwrap();

    assert_eq!(committed, btreemap! { t0 => 42 });

    driver.shutdown().unwrap();
}

#[tokio::test]
async fn test_subscribed_partitions_stay_quiet_until_requested() {
    init_tracing();
    let (driver, state) = spawn_scripted();
    let x0 = TopicPartition::new("events", 0);

    driver.subscribe(vec!["events".into()], ()).unwrap();
    state.schedule_rebalance_assign(&[x0.clone()]);
    state.queue(&x0, vec![record(&x0, 7)]);

    // Let a few ticks pass. If the auto-pause did not hold the new
    // partition back, an idle poll would return its records and the driver
    // would die on the invariant check, failing the request below.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (requester, mut rx) = Requester::new();
    driver
        .request_messages(&requester, btreeset! { x0 })
        .unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("a batch arrives")
        .expect("channel open")
        .expect("not a driver error");

    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.records[0].offset, 7);

    driver.shutdown().unwrap();
}

#[tokio::test]
async fn test_stop_refuses_new_work() {
    let (driver, state) = spawn_scripted();

    driver.stop();
    wait_until(|| state.is_closed()).await;

    let (requester, _rx) = Requester::new();
    let refused = driver.request_messages(&requester, btreeset! { TopicPartition::new("orders", 0) });
    assert!(matches!(refused, Err(DriverError::Stopping)));

    let refused = driver
        .commit(btreemap! { TopicPartition::new("orders", 0) => 1 })
        .await;
    assert!(matches!(refused, Err(DriverError::Stopping)));
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_driver() {
    let (driver, state) = spawn_scripted();

    drop(driver);

    wait_until(|| state.is_closed()).await;
}

#[tokio::test]
async fn test_client_factory_failure_surfaces_from_spawn() {
    let result = ConsumerDriver::spawn_with(config(), || {
        Err::<ScriptedClient, _>(KafkaError::ClientCreation("no brokers".to_string()))
    });

    assert!(matches!(result, Err(DriverError::Client(_))));
}
