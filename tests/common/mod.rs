use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use konsumer::client::{
    CommitCallback, ConsumerClient, PartitionControl, RebalanceListener, Record, TopicPartition,
};
use rdkafka::error::KafkaResult;

/// Shared state of a [`ScriptedClient`]. Tests keep the `Arc` and feed the
/// script from the outside while the driver owns the client itself.
#[derive(Default)]
pub struct ScriptedState {
    assignment: Mutex<BTreeSet<TopicPartition>>,
    paused: Mutex<BTreeSet<TopicPartition>>,
    queued: Mutex<BTreeMap<TopicPartition, Vec<Record>>>,
    listener: Mutex<Option<Box<dyn RebalanceListener>>>,
    pending_commits: Mutex<Vec<(BTreeMap<TopicPartition, i64>, CommitCallback)>>,
    pending_rebalance: Mutex<Vec<TopicPartition>>,
    closed: AtomicBool,
}

impl ScriptedState {
    pub fn queue(&self, partition: &TopicPartition, records: Vec<Record>) {
        self.queued
            .lock()
            .unwrap()
            .entry(partition.clone())
            .or_default()
            .extend(records);
    }

    pub fn schedule_rebalance_assign(&self, partitions: &[TopicPartition]) {
        self.pending_rebalance
            .lock()
            .unwrap()
            .extend(partitions.iter().cloned());
    }

    /// Whether the driver has dropped (and thereby closed) its client.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A consumer client driven entirely by a test script: records are queued
/// per partition, commits succeed and complete on the next poll, and
/// scripted rebalance events run through the installed listener from
/// inside poll, the way a real client would run them.
pub struct ScriptedClient {
    state: Arc<ScriptedState>,
}

impl ScriptedClient {
    pub fn new(state: Arc<ScriptedState>) -> Self {
        Self { state }
    }
}

impl Drop for ScriptedClient {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

impl PartitionControl for ScriptedClient {
    fn pause(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        self.state
            .paused
            .lock()
            .unwrap()
            .extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        let mut paused = self.state.paused.lock().unwrap();
        for partition in partitions {
            paused.remove(partition);
        }
        Ok(())
    }
}

impl ConsumerClient for ScriptedClient {
    fn assign(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        *self.state.assignment.lock().unwrap() = partitions.iter().cloned().collect();
        Ok(())
    }

    fn seek(&self, _partition: &TopicPartition, _offset: i64) -> KafkaResult<()> {
        Ok(())
    }

    fn subscribe(
        &self,
        _topics: &[String],
        listener: Box<dyn RebalanceListener>,
    ) -> KafkaResult<()> {
        *self.state.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    fn subscribe_pattern(
        &self,
        _pattern: &str,
        listener: Box<dyn RebalanceListener>,
    ) -> KafkaResult<()> {
        *self.state.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    fn assignment(&self) -> KafkaResult<Vec<TopicPartition>> {
        Ok(self.state.assignment.lock().unwrap().iter().cloned().collect())
    }

    fn poll(&self, _timeout: Duration) -> KafkaResult<Vec<Record>> {
        let assigned: Vec<TopicPartition> = self
            .state
            .pending_rebalance
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        if !assigned.is_empty() {
            self.state
                .assignment
                .lock()
                .unwrap()
                .extend(assigned.iter().cloned());
            if let Some(listener) = self.state.listener.lock().unwrap().as_mut() {
                listener.on_assigned(self, &assigned);
            }
        }

        for (offsets, on_complete) in self.state.pending_commits.lock().unwrap().drain(..) {
            on_complete(Ok(offsets));
        }

        let assignment = self.state.assignment.lock().unwrap().clone();
        let paused = self.state.paused.lock().unwrap().clone();
        let mut queued = self.state.queued.lock().unwrap();

        // A real client only ever produces records for partitions it has
        // been assigned and that are not paused
        let ready: Vec<TopicPartition> = queued
            .keys()
            .filter(|partition| assignment.contains(*partition) && !paused.contains(*partition))
            .cloned()
            .collect();

        let mut records = Vec::new();
        for partition in ready {
            if let Some(mut batch) = queued.remove(&partition) {
                records.append(&mut batch);
            }
        }

        Ok(records)
    }

    fn commit(&self, offsets: &BTreeMap<TopicPartition, i64>, on_complete: CommitCallback) {
        self.state
            .pending_commits
            .lock()
            .unwrap()
            .push((offsets.clone(), on_complete));
    }
}

pub fn record(partition: &TopicPartition, offset: i64) -> Record {
    Record {
        topic: partition.topic.clone(),
        partition: partition.partition,
        offset,
        key: None,
        payload: Some(format!("payload-{offset}").into_bytes()),
        timestamp: None,
    }
}

/// Polls `condition` until it holds or a couple of seconds have passed.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("condition not met within 2s");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
