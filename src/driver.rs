use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rdkafka::error::KafkaError;
use tokio::sync::{mpsc as async_mpsc, oneshot};

use crate::client::{
    CommitCallback, ConsumerClient, PartitionControl, RdClient, RebalanceListener, Record,
    TopicPartition,
};
use crate::config::DriverConfig;

/// Rounds of the bounded spin that expedites in-flight commit callbacks
/// when there is no fetch demand. Keeping the budget small keeps the
/// mailbox responsive; anything left over completes on a later tick.
const COMMIT_SPIN_ROUNDS: usize = 10;

/// Pause between spin rounds.
const COMMIT_SPIN_PAUSE: Duration = Duration::from_micros(10);

/// Timeout of the single last-resort poll once the spin budget is spent.
const COMMIT_SPIN_FINAL_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The client failed during assign, subscribe or poll. Fatal: the
    /// driver terminates and its owner decides whether to start a new one.
    #[error("kafka client error: {0}")]
    Client(#[from] KafkaError),
    /// The broker rejected an offset commit. Reported to the committer
    /// only; the driver keeps running and never retries.
    #[error("offset commit failed: {0}")]
    Commit(#[source] KafkaError),
    /// Work arrived after `stop`, or after every handle was dropped.
    #[error("consumer driver is stopping")]
    Stopping,
    /// Records showed up for a partition nobody asked for. Either a driver
    /// bug or a client that does not honor pause flags.
    #[error("poll contract violated: {0}")]
    Invariant(String),
    #[error("failed to spawn driver thread: {0}")]
    Spawn(#[from] io::Error),
}

/// One batch of records delivered to a requester. A requester receives at
/// most one batch per poll cycle; inside it, each requested partition's
/// records appear contiguously and in broker order.
#[derive(Debug)]
pub struct Messages {
    pub records: Vec<Record>,
}

pub type MessagesReceiver = async_mpsc::UnboundedReceiver<Result<Messages, DriverError>>;

/// Identity of one downstream partition-stream. Cloning preserves the
/// identity, so a stage re-issues demand under the same id. Dropping the
/// receiving half withdraws all of the requester's outstanding demand.
#[derive(Debug, Clone)]
pub struct Requester {
    id: String,
    reply_tx: async_mpsc::UnboundedSender<Result<Messages, DriverError>>,
}

impl Requester {
    pub fn new() -> (Self, MessagesReceiver) {
        let (reply_tx, reply_rx) = async_mpsc::unbounded_channel();
        let requester = Self {
            id: nanoid::nanoid!(),
            reply_tx,
        };

        (requester, reply_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

type CommitReply = oneshot::Sender<Result<BTreeMap<TopicPartition, i64>, DriverError>>;

enum Command {
    Assign(BTreeSet<TopicPartition>),
    AssignWithOffsets(BTreeMap<TopicPartition, i64>),
    Subscribe {
        topics: Vec<String>,
        listener: Box<dyn RebalanceListener>,
    },
    SubscribePattern {
        pattern: String,
        listener: Box<dyn RebalanceListener>,
    },
    RequestMessages {
        requester: Requester,
        partitions: BTreeSet<TopicPartition>,
    },
    Commit {
        offsets: BTreeMap<TopicPartition, i64>,
        reply: CommitReply,
    },
    Stop,
}

/// Handle to a consumer driver.
///
/// The driver owns one Kafka client on a dedicated thread and multiplexes
/// fetching and committing across any number of requesters. All methods
/// enqueue onto its mailbox; the thread processes one message at a time,
/// which is the only synchronization the client ever needs.
///
/// Dropping the last handle stops the driver the same way [`stop`] does.
///
/// [`stop`]: ConsumerDriver::stop
pub struct ConsumerDriver {
    mailbox: mpsc::Sender<Command>,
    worker: Option<thread::JoinHandle<Result<(), DriverError>>>,
}

impl ConsumerDriver {
    /// Starts a driver over the default `rdkafka` client.
    pub fn spawn(config: DriverConfig) -> Result<Self, DriverError> {
        let client_config = config.clone();
        Self::spawn_with(config, move || RdClient::new(&client_config))
    }

    /// Starts a driver with a caller-provided client factory. The factory
    /// runs on the driver thread, which stays the only thread to ever
    /// touch the client.
    pub fn spawn_with<C, F>(config: DriverConfig, create_client: F) -> Result<Self, DriverError>
    where
        C: ConsumerClient + 'static,
        F: FnOnce() -> Result<C, KafkaError> + Send + 'static,
    {
        let (mailbox_tx, mailbox_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name(config.dispatcher.clone())
            .spawn(move || {
                let client = match create_client() {
                    Ok(client) => {
                        let _ = ready_tx.send(Ok(()));
                        client
                    }
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return Ok(());
                    }
                };

                DriverWorker::new(client, config).run(mailbox_rx)
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                mailbox: mailbox_tx,
                worker: Some(worker),
            }),
            Ok(Err(error)) => Err(DriverError::Client(error)),
            Err(_) => Err(DriverError::Invariant(
                "driver thread died during startup".to_string(),
            )),
        }
    }

    /// Adds `partitions` to the client assignment. Additive: partitions
    /// already assigned keep their fetch position, new ones start at the
    /// broker default.
    pub fn assign(&self, partitions: BTreeSet<TopicPartition>) -> Result<(), DriverError> {
        self.send(Command::Assign(partitions))
    }

    /// Adds the partitions in `offsets` to the assignment, then seeks each
    /// one to its given offset.
    pub fn assign_with_offsets(
        &self,
        offsets: BTreeMap<TopicPartition, i64>,
    ) -> Result<(), DriverError> {
        self.send(Command::AssignWithOffsets(offsets))
    }

    /// Replaces the subscription with `topics`. Partitions the group
    /// coordinator hands out are paused before `listener` observes them
    /// and stay paused until a requester asks for their records.
    pub fn subscribe(
        &self,
        topics: Vec<String>,
        listener: impl RebalanceListener + 'static,
    ) -> Result<(), DriverError> {
        self.send(Command::Subscribe {
            topics,
            listener: Box::new(listener),
        })
    }

    /// Like [`subscribe`], matching topics against a regex instead.
    ///
    /// [`subscribe`]: ConsumerDriver::subscribe
    pub fn subscribe_pattern(
        &self,
        pattern: impl Into<String>,
        listener: impl RebalanceListener + 'static,
    ) -> Result<(), DriverError> {
        self.send(Command::SubscribePattern {
            pattern: pattern.into(),
            listener: Box::new(listener),
        })
    }

    /// Registers one-shot demand for `partitions`. The first batch
    /// delivered for a partition consumes its demand; re-issue to keep
    /// consuming. A later request for a partition replaces the earlier
    /// requester.
    pub fn request_messages(
        &self,
        requester: &Requester,
        partitions: BTreeSet<TopicPartition>,
    ) -> Result<(), DriverError> {
        self.send(Command::RequestMessages {
            requester: requester.clone(),
            partitions,
        })
    }

    /// Commits `offsets`, resolving once the broker acknowledged or
    /// rejected them. Failed commits are reported, never retried.
    pub async fn commit(
        &self,
        offsets: BTreeMap<TopicPartition, i64>,
    ) -> Result<BTreeMap<TopicPartition, i64>, DriverError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Commit {
            offsets,
            reply: reply_tx,
        })?;

        reply_rx.await.map_err(|_| DriverError::Stopping)?
    }

    /// Asks the driver to stop. In-flight commits are drained first; new
    /// requests and commits are refused with [`DriverError::Stopping`]
    /// meanwhile.
    pub fn stop(&self) {
        let _ = self.mailbox.send(Command::Stop);
    }

    /// Stops the driver and blocks until its thread has terminated,
    /// surfacing the error that killed it, if any.
    pub fn shutdown(mut self) -> Result<(), DriverError> {
        let _ = self.mailbox.send(Command::Stop);

        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| DriverError::Invariant("driver thread panicked".to_string()))?,
            None => Ok(()),
        }
    }

    fn send(&self, command: Command) -> Result<(), DriverError> {
        self.mailbox.send(command).map_err(|_| DriverError::Stopping)
    }
}

#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Terminate,
}

struct DriverWorker<C> {
    client: C,
    config: DriverConfig,
    /// Outstanding demand, at most one requester per partition.
    requests: BTreeMap<TopicPartition, Requester>,
    /// Commits issued minus commit callbacks fired. The callbacks run
    /// inside `poll` on this very thread; the atomic satisfies the borrow
    /// checker, not another thread.
    commits_in_flight: Arc<AtomicUsize>,
    stop_in_progress: bool,
}

impl<C: ConsumerClient> DriverWorker<C> {
    fn new(client: C, config: DriverConfig) -> Self {
        Self {
            client,
            config,
            requests: BTreeMap::new(),
            commits_in_flight: Arc::new(AtomicUsize::new(0)),
            stop_in_progress: false,
        }
    }

    fn run(mut self, mailbox: mpsc::Receiver<Command>) -> Result<(), DriverError> {
        tracing::debug!(
            dispatcher = %self.config.dispatcher,
            "consumer driver started"
        );

        let result = self.run_loop(&mailbox);
        match &result {
            Ok(()) => tracing::debug!("consumer driver stopped"),
            Err(error) => tracing::error!(%error, "consumer driver terminated"),
        }

        // Dropping the worker drops the client, which closes the underlying
        // consumer on this thread, once, on every exit path
        result
    }

    fn run_loop(&mut self, mailbox: &mpsc::Receiver<Command>) -> Result<(), DriverError> {
        let mut next_tick = Instant::now() + self.config.poll_interval();

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());

            match mailbox.recv_timeout(wait) {
                Ok(command) => {
                    if self.handle_command(command)? == Flow::Terminate {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    next_tick = Instant::now() + self.config.poll_interval();
                    if self.poll_cycle()? == Flow::Terminate {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Every handle is gone; finish like an explicit stop
                    tracing::debug!("all driver handles dropped, stopping");
                    self.stop_in_progress = true;

                    loop {
                        if self.poll_cycle()? == Flow::Terminate {
                            return Ok(());
                        }
                        thread::sleep(self.config.poll_interval());
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Result<Flow, DriverError> {
        if self.stop_in_progress {
            return Ok(self.reject_while_stopping(command));
        }

        match command {
            Command::Assign(partitions) => {
                self.assign(&partitions)?;
                Ok(Flow::Continue)
            }
            Command::AssignWithOffsets(offsets) => {
                let partitions: BTreeSet<TopicPartition> = offsets.keys().cloned().collect();
                self.assign(&partitions)?;
                // Seeks apply on top of the assignment just installed
                for (partition, offset) in &offsets {
                    self.client.seek(partition, *offset)?;
                }
                Ok(Flow::Continue)
            }
            Command::Subscribe { topics, listener } => {
                self.client
                    .subscribe(&topics, Box::new(AutoPause { inner: listener }))?;
                Ok(Flow::Continue)
            }
            Command::SubscribePattern { pattern, listener } => {
                self.client
                    .subscribe_pattern(&pattern, Box::new(AutoPause { inner: listener }))?;
                Ok(Flow::Continue)
            }
            Command::RequestMessages {
                requester,
                partitions,
            } => {
                for partition in partitions {
                    // Latest requester wins
                    self.requests.insert(partition, requester.clone());
                }
                self.poll_cycle()
            }
            Command::Commit { offsets, reply } => {
                self.commit(offsets, reply);
                // Poll right away so the completion can start landing
                self.poll_cycle()
            }
            Command::Stop => {
                if self.commits_in_flight() == 0 {
                    Ok(Flow::Terminate)
                } else {
                    tracing::debug!(
                        pending = self.commits_in_flight(),
                        "stopping once in-flight commits complete"
                    );
                    self.stop_in_progress = true;
                    Ok(Flow::Continue)
                }
            }
        }
    }

    fn reject_while_stopping(&mut self, command: Command) -> Flow {
        match command {
            Command::Assign(_) => tracing::warn!("ignoring assign while stopping"),
            Command::AssignWithOffsets(_) => {
                tracing::warn!("ignoring assign-with-offsets while stopping")
            }
            Command::Subscribe { .. } => tracing::warn!("ignoring subscribe while stopping"),
            Command::SubscribePattern { .. } => {
                tracing::warn!("ignoring subscribe-pattern while stopping")
            }
            Command::RequestMessages { requester, .. } => {
                let _ = requester.reply_tx.send(Err(DriverError::Stopping));
            }
            Command::Commit { reply, .. } => {
                let _ = reply.send(Err(DriverError::Stopping));
            }
            Command::Stop => (),
        }

        Flow::Continue
    }

    fn assign(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<(), DriverError> {
        // Assignment only ever grows through this message; the client keeps
        // the position of partitions it already owns
        let mut union: BTreeSet<TopicPartition> =
            self.client.assignment()?.into_iter().collect();
        union.extend(partitions.iter().cloned());

        let union: Vec<TopicPartition> = union.into_iter().collect();
        self.client.assign(&union)?;

        Ok(())
    }

    fn commit(&mut self, offsets: BTreeMap<TopicPartition, i64>, reply: CommitReply) {
        self.commits_in_flight.fetch_add(1, Ordering::SeqCst);

        let in_flight = Arc::clone(&self.commits_in_flight);
        let on_complete: CommitCallback = Box::new(move |result| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = reply.send(result.map_err(DriverError::Commit));
        });

        self.client.commit(&offsets, on_complete);
    }

    /// One pass of the poll engine: reconcile pause flags against current
    /// demand, then either fetch for the requested partitions or idle-poll
    /// so callbacks keep making progress.
    fn poll_cycle(&mut self) -> Result<Flow, DriverError> {
        self.purge_dead_requesters();

        let to_fetch: BTreeSet<TopicPartition> = self.requests.keys().cloned().collect();

        // An assigned partition fetches on the next poll iff somebody is
        // waiting for its records
        let (resume, pause): (Vec<TopicPartition>, Vec<TopicPartition>) = self
            .client
            .assignment()?
            .into_iter()
            .partition(|partition| to_fetch.contains(partition));
        if !pause.is_empty() {
            self.client.pause(&pause)?;
        }
        if !resume.is_empty() {
            self.client.resume(&resume)?;
        }

        if to_fetch.is_empty() {
            self.drive_commits()?;
        } else {
            self.fetch_and_dispatch(&to_fetch)?;
        }

        if self.stop_in_progress && self.commits_in_flight() == 0 {
            return Ok(Flow::Terminate);
        }

        Ok(Flow::Continue)
    }

    fn purge_dead_requesters(&mut self) {
        self.requests.retain(|partition, requester| {
            if requester.reply_tx.is_closed() {
                tracing::debug!(%partition, "dropping demand of a vanished requester");
                false
            } else {
                true
            }
        });
    }

    /// Polls without fetch demand. The client still has to be driven so
    /// rebalance and commit callbacks make progress; every partition is
    /// paused at this point, so any record coming back means pausing did
    /// not hold.
    fn drive_commits(&self) -> Result<(), DriverError> {
        self.expect_no_records(self.client.poll(Duration::ZERO)?)?;

        if self.commits_in_flight() == 0 {
            return Ok(());
        }

        for _ in 0..COMMIT_SPIN_ROUNDS {
            thread::sleep(COMMIT_SPIN_PAUSE);
            self.expect_no_records(self.client.poll(Duration::ZERO)?)?;

            if self.commits_in_flight() == 0 {
                return Ok(());
            }
        }

        self.expect_no_records(self.client.poll(COMMIT_SPIN_FINAL_POLL)?)?;

        Ok(())
    }

    fn fetch_and_dispatch(&mut self, to_fetch: &BTreeSet<TopicPartition>) -> Result<(), DriverError> {
        let records = self.client.poll(self.config.poll_timeout())?;
        if records.is_empty() {
            return Ok(());
        }

        let mut by_partition: BTreeMap<TopicPartition, Vec<Record>> = BTreeMap::new();
        for record in records {
            let partition = record.topic_partition();
            if !to_fetch.contains(&partition) {
                return Err(DriverError::Invariant(format!(
                    "poll returned records for unrequested partition {partition}"
                )));
            }
            by_partition.entry(partition).or_default().push(record);
        }

        // One batch per requester per cycle; walking `requests` in
        // partition order keeps each partition's records contiguous and in
        // broker order inside the batch
        let mut batches: BTreeMap<String, (Requester, Vec<Record>)> = BTreeMap::new();
        let mut delivered = Vec::new();
        for (partition, requester) in &self.requests {
            if let Some(records) = by_partition.remove(partition) {
                let batch = batches
                    .entry(requester.id.clone())
                    .or_insert_with(|| (requester.clone(), Vec::new()));
                batch.1.extend(records);
                delivered.push(partition.clone());
            }
        }

        for (requester, records) in batches.into_values() {
            if requester.reply_tx.send(Ok(Messages { records })).is_err() {
                tracing::debug!(
                    requester = %requester.id,
                    "requester vanished before delivery"
                );
            }
        }

        // Delivery consumes the demand; partitions that produced nothing
        // keep theirs and are fetched again next cycle
        for partition in delivered {
            self.requests.remove(&partition);
        }

        Ok(())
    }

    fn expect_no_records(&self, records: Vec<Record>) -> Result<(), DriverError> {
        if records.is_empty() {
            Ok(())
        } else {
            Err(DriverError::Invariant(format!(
                "poll returned {} record(s) while no partition was requested",
                records.len()
            )))
        }
    }

    fn commits_in_flight(&self) -> usize {
        self.commits_in_flight.load(Ordering::SeqCst)
    }
}

/// Wraps the subscriber's rebalance listener so a freshly assigned
/// partition never fetches before a requester asks for it: the pause goes
/// to the client first, then the inner listener runs.
struct AutoPause {
    inner: Box<dyn RebalanceListener>,
}

impl RebalanceListener for AutoPause {
    fn on_assigned(&mut self, client: &dyn PartitionControl, partitions: &[TopicPartition]) {
        if let Err(error) = client.pause(partitions) {
            tracing::error!(%error, "failed to pause newly assigned partitions");
        }

        self.inner.on_assigned(client, partitions);
    }

    fn on_revoked(&mut self, client: &dyn PartitionControl, partitions: &[TopicPartition]) {
        self.inner.on_revoked(client, partitions);
    }
}
