use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};

use crate::config::DriverConfig;

/// How many records a single batch poll may drain from the client before
/// handing control back to the driver loop.
const MAX_POLL_RECORDS: usize = 500;

/// How long a seek may wait for the fetcher to pick up the new position.
const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

/// A topic shard, identified by topic name and partition index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// An owned record fetched from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker or producer timestamp, when one was attached
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl From<&BorrowedMessage<'_>> for Record {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp: message.timestamp().to_millis(),
        }
    }
}

/// Completion of one asynchronous offset commit. Carries the offsets the
/// broker acknowledged, or the error it answered with.
pub type CommitCallback = Box<dyn FnOnce(KafkaResult<BTreeMap<TopicPartition, i64>>) + Send>;

/// The pause/resume surface a rebalance listener is allowed to touch while
/// its callback runs inside `poll`.
pub trait PartitionControl {
    fn pause(&self, partitions: &[TopicPartition]) -> KafkaResult<()>;
    fn resume(&self, partitions: &[TopicPartition]) -> KafkaResult<()>;
}

/// Hooks invoked when the group coordinator moves partitions between the
/// members of a consumer group. Callbacks run on the thread calling `poll`.
pub trait RebalanceListener: Send {
    fn on_assigned(&mut self, client: &dyn PartitionControl, partitions: &[TopicPartition]);
    fn on_revoked(&mut self, client: &dyn PartitionControl, partitions: &[TopicPartition]);
}

impl RebalanceListener for () {
    fn on_assigned(&mut self, _client: &dyn PartitionControl, _partitions: &[TopicPartition]) {}

    fn on_revoked(&mut self, _client: &dyn PartitionControl, _partitions: &[TopicPartition]) {}
}

/// Operations the driver needs from a Kafka consumer.
///
/// Implementations guarantee that rebalance listeners and commit callbacks
/// only ever fire from inside [`ConsumerClient::poll`], on the calling
/// thread, and that [`ConsumerClient::commit`] completes its callback
/// exactly once even when the commit cannot be issued. The driver creates
/// the client on its own thread and never shares it, so implementations do
/// not need to be `Send`.
pub trait ConsumerClient: PartitionControl {
    /// Replaces the assignment with exactly `partitions`. Partitions that
    /// were already assigned must keep their current fetch position.
    fn assign(&self, partitions: &[TopicPartition]) -> KafkaResult<()>;

    fn seek(&self, partition: &TopicPartition, offset: i64) -> KafkaResult<()>;

    fn subscribe(&self, topics: &[String], listener: Box<dyn RebalanceListener>)
        -> KafkaResult<()>;

    fn subscribe_pattern(
        &self,
        pattern: &str,
        listener: Box<dyn RebalanceListener>,
    ) -> KafkaResult<()>;

    fn assignment(&self) -> KafkaResult<Vec<TopicPartition>>;

    /// Fetches whatever is ready within `timeout`, driving any pending
    /// callbacks along the way. Paused partitions must not produce records.
    fn poll(&self, timeout: Duration) -> KafkaResult<Vec<Record>>;

    /// Starts an asynchronous commit of `offsets`. The outcome is reported
    /// through `on_complete` during a later `poll`.
    fn commit(&self, offsets: &BTreeMap<TopicPartition, i64>, on_complete: CommitCallback);
}

/// Consumer context wired into the `rdkafka` client. Holds the installed
/// rebalance listener and the callbacks of commits still in flight;
/// librdkafka reports async commits in the order they were issued, so a
/// FIFO is enough to match completions back up.
#[derive(Default)]
struct DriverContext {
    listener: Mutex<Option<Box<dyn RebalanceListener>>>,
    pending_commits: Mutex<VecDeque<CommitCallback>>,
}

impl ClientContext for DriverContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => tracing::error!("librdkafka: {} {}", fac, log_message),
            RDKafkaLogLevel::Warning => tracing::warn!("librdkafka: {} {}", fac, log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                tracing::info!("librdkafka: {} {}", fac, log_message)
            }
            RDKafkaLogLevel::Debug => tracing::debug!("librdkafka: {} {}", fac, log_message),
        }
    }
}

impl ConsumerContext for DriverContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(list) = rebalance {
            let partitions = partitions_from_list(list);
            tracing::debug!("rebalance revoked {} partition(s)", partitions.len());

            if let Some(listener) = self
                .listener
                .lock()
                .expect("rebalance listener lock poisoned")
                .as_mut()
            {
                listener.on_revoked(&AssignedPartitions(consumer), &partitions);
            }
        }
    }

    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let partitions = partitions_from_list(list);
                tracing::debug!("rebalance assigned {} partition(s)", partitions.len());

                if let Some(listener) = self
                    .listener
                    .lock()
                    .expect("rebalance listener lock poisoned")
                    .as_mut()
                {
                    listener.on_assigned(&AssignedPartitions(consumer), &partitions);
                }
            }
            Rebalance::Error(error) => tracing::error!(%error, "rebalance failed"),
            Rebalance::Revoke(_) => (),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        let Some(on_complete) = self
            .pending_commits
            .lock()
            .expect("pending commit lock poisoned")
            .pop_front()
        else {
            tracing::warn!("commit completed with no pending callback");
            return;
        };

        on_complete(result.map(|()| offsets_from_list(offsets)));
    }
}

/// Lets a rebalance listener pause partitions on the consumer that is
/// currently running its callback.
struct AssignedPartitions<'a>(&'a BaseConsumer<DriverContext>);

impl PartitionControl for AssignedPartitions<'_> {
    fn pause(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        self.0.pause(&partition_list(partitions))
    }

    fn resume(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        self.0.resume(&partition_list(partitions))
    }
}

/// Production client over an `rdkafka` [`BaseConsumer`].
pub struct RdClient {
    consumer: BaseConsumer<DriverContext>,
}

impl RdClient {
    pub fn new(config: &DriverConfig) -> KafkaResult<Self> {
        if !config.properties.contains_key("bootstrap.servers") {
            return Err(KafkaError::ClientCreation(
                "consumer properties must provide bootstrap.servers".to_string(),
            ));
        }

        let mut client_config = ClientConfig::new();
        client_config.extend(config.properties.clone());
        // The driver owns offset management; auto-commit would race it
        client_config.set("enable.auto.commit", "false");
        client_config.set("enable.partition.eof", "false");

        let consumer: BaseConsumer<DriverContext> =
            client_config.create_with_context(DriverContext::default())?;

        Ok(Self { consumer })
    }

    fn context(&self) -> &DriverContext {
        self.consumer.context()
    }
}

impl PartitionControl for RdClient {
    fn pause(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        self.consumer.pause(&partition_list(partitions))
    }

    fn resume(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        self.consumer.resume(&partition_list(partitions))
    }
}

impl ConsumerClient for RdClient {
    fn assign(&self, partitions: &[TopicPartition]) -> KafkaResult<()> {
        // Assigning with an invalid offset rewinds a retained partition to
        // its committed offset; carry the current fetch position over so
        // repeated assigns never replay records.
        let positions = self.consumer.position()?;

        let mut list = TopicPartitionList::new();
        for partition in partitions {
            let position = positions
                .find_partition(&partition.topic, partition.partition)
                .map(|elem| elem.offset());

            match position {
                Some(Offset::Offset(offset)) => {
                    list.add_partition_offset(
                        &partition.topic,
                        partition.partition,
                        Offset::Offset(offset),
                    )?;
                }
                _ => {
                    list.add_partition(&partition.topic, partition.partition);
                }
            }
        }

        self.consumer.assign(&list)
    }

    fn seek(&self, partition: &TopicPartition, offset: i64) -> KafkaResult<()> {
        self.consumer.seek(
            &partition.topic,
            partition.partition,
            Offset::Offset(offset),
            SEEK_TIMEOUT,
        )
    }

    fn subscribe(
        &self,
        topics: &[String],
        listener: Box<dyn RebalanceListener>,
    ) -> KafkaResult<()> {
        *self
            .context()
            .listener
            .lock()
            .expect("rebalance listener lock poisoned") = Some(listener);

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)
    }

    fn subscribe_pattern(
        &self,
        pattern: &str,
        listener: Box<dyn RebalanceListener>,
    ) -> KafkaResult<()> {
        *self
            .context()
            .listener
            .lock()
            .expect("rebalance listener lock poisoned") = Some(listener);

        let pattern = pattern_subscription(pattern);
        self.consumer.subscribe(&[pattern.as_str()])
    }

    fn assignment(&self) -> KafkaResult<Vec<TopicPartition>> {
        Ok(partitions_from_list(&self.consumer.assignment()?))
    }

    fn poll(&self, timeout: Duration) -> KafkaResult<Vec<Record>> {
        let mut records = Vec::new();
        let mut wait = timeout;

        while records.len() < MAX_POLL_RECORDS {
            match self.consumer.poll(wait) {
                None => break,
                Some(Ok(message)) => records.push(Record::from(&message)),
                // Reaching the end of a partition is not an error here
                Some(Err(KafkaError::PartitionEOF(_))) => (),
                Some(Err(error)) => return Err(error),
            }

            // Only the first iteration may block; afterwards we just drain
            // whatever is already sitting in the local queue
            wait = Duration::ZERO;
        }

        Ok(records)
    }

    fn commit(&self, offsets: &BTreeMap<TopicPartition, i64>, on_complete: CommitCallback) {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            if let Err(error) = list.add_partition_offset(
                &partition.topic,
                partition.partition,
                Offset::Offset(*offset),
            ) {
                on_complete(Err(error));
                return;
            }
        }

        self.context()
            .pending_commits
            .lock()
            .expect("pending commit lock poisoned")
            .push_back(on_complete);

        if let Err(error) = self.consumer.commit(&list, CommitMode::Async) {
            // librdkafka never saw this commit, so no callback will arrive
            // for it; complete the one we just queued ourselves
            let on_complete = self
                .context()
                .pending_commits
                .lock()
                .expect("pending commit lock poisoned")
                .pop_back();

            if let Some(on_complete) = on_complete {
                on_complete(Err(error));
            }
        }
    }
}

/// librdkafka reads a leading `^` as a regex subscription.
fn pattern_subscription(pattern: &str) -> String {
    if pattern.starts_with('^') {
        pattern.to_owned()
    } else {
        format!("^{pattern}")
    }
}

fn partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for partition in partitions {
        list.add_partition(&partition.topic, partition.partition);
    }
    list
}

fn partitions_from_list(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn offsets_from_list(list: &TopicPartitionList) -> BTreeMap<TopicPartition, i64> {
    list.elements()
        .iter()
        .filter_map(|elem| match elem.offset() {
            Offset::Offset(offset) => {
                Some((TopicPartition::new(elem.topic(), elem.partition()), offset))
            }
            _ => None,
        })
        .collect()
}
