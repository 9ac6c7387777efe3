//! The listener container: one dedicated task driving poll, dispatch and
//! commit for one consumer handle.
//!
//! # Concurrency
//! The consumer handle is touched by exactly one task for the container's
//! whole lifetime. Foreign threads reach the loop only through channels
//! (acknowledgments, seeks) and the consumer's thread-safe waker, which
//! `stop` uses to interrupt a blocked poll.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use redrive_broker::{
    BrokerError, CommitMode, ConsumerWaker, OffsetMap, PollOutcome, RecordConsumer,
    TransactionalProducer,
};
use redrive_common::{
    clock::{Clock, SystemClock},
    internal,
    record::{Record, TopicPartition},
};
use redrive_tracing::traced;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    acks::{Acknowledgment, AckItem, AckRequest, highest_offsets},
    after_rollback::{AfterRollbackProcessor, SeekAfterRollbackProcessor},
    error_handler::{ContainerOps, ErrorHandler, HandleOutcome, LoggingErrorHandler},
    events::ContainerEvent,
    listener::{ListenerKind, SeekAwareListener},
    offsets::OffsetLedger,
    properties::{AckMode, ContainerProperties},
    seeks::{SeekHandle, SeekRequest, SeekTarget},
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ContainerState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container is already running")]
    AlreadyRunning,

    #[error("cannot use record ack mode with a batch listener")]
    RecordAckWithBatchListener,

    #[error("auto-commit cannot be combined with ack mode {0:?}")]
    AutoCommitConflict(AckMode),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Hosts one listener against one consumer handle.
pub struct ListenerContainer {
    properties: ContainerProperties,
    listener: ListenerKind,
    listener_id: String,
    error_handler: Arc<dyn ErrorHandler>,
    after_rollback: Arc<dyn AfterRollbackProcessor>,
    transactional: Option<Arc<dyn TransactionalProducer>>,
    seek_aware: Option<Arc<dyn SeekAwareListener>>,
    clock: Arc<dyn Clock>,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    last_poll: Arc<AtomicI64>,
    events_tx: broadcast::Sender<ContainerEvent>,
    ack_tx: mpsc::UnboundedSender<AckRequest>,
    ack_rx: Option<mpsc::UnboundedReceiver<AckRequest>>,
    seek_tx: mpsc::UnboundedSender<SeekRequest>,
    seek_rx: Option<mpsc::UnboundedReceiver<SeekRequest>>,
    waker: Option<Arc<dyn ConsumerWaker>>,
    worker: Option<JoinHandle<()>>,
}

impl ListenerContainer {
    #[must_use]
    pub fn new(properties: ContainerProperties, listener: ListenerKind) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (seek_tx, seek_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let listener_id = properties
            .listener_id
            .clone()
            .unwrap_or_else(|| format!("container-{}", ulid::Ulid::new()));
        Self {
            properties,
            listener,
            listener_id,
            error_handler: Arc::new(LoggingErrorHandler),
            after_rollback: Arc::new(SeekAfterRollbackProcessor),
            transactional: None,
            seek_aware: None,
            clock: Arc::new(SystemClock),
            state: Arc::new(AtomicU8::new(ContainerState::Stopped.as_u8())),
            running: Arc::new(AtomicBool::new(false)),
            last_poll: Arc::new(AtomicI64::new(0)),
            events_tx,
            ack_tx,
            ack_rx: Some(ack_rx),
            seek_tx,
            seek_rx: Some(seek_rx),
            waker: None,
            worker: None,
        }
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    #[must_use]
    pub fn with_after_rollback_processor(
        mut self,
        processor: Arc<dyn AfterRollbackProcessor>,
    ) -> Self {
        self.after_rollback = processor;
        self
    }

    /// Run every record (or batch) inside a transaction on this producer,
    /// committing offsets through it.
    #[must_use]
    pub fn with_transactional_producer(mut self, producer: Arc<dyn TransactionalProducer>) -> Self {
        self.transactional = Some(producer);
        self
    }

    #[must_use]
    pub fn with_seek_aware_listener(mut self, listener: Arc<dyn SeekAwareListener>) -> Self {
        self.seek_aware = Some(listener);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    #[must_use]
    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events_tx.subscribe()
    }

    /// Handle for queueing seeks from any thread; applied before the next
    /// poll.
    #[must_use]
    pub fn seek_handle(&self) -> SeekHandle {
        SeekHandle::new(self.seek_tx.clone())
    }

    /// Subscribe the consumer and hand it to a freshly spawned polling task.
    ///
    /// # Errors
    /// [`ContainerError::AlreadyRunning`], configuration conflicts, or the
    /// subscribe failure.
    #[traced(timing(precision = "ms"))]
    pub fn start(&mut self, mut consumer: Box<dyn RecordConsumer>) -> Result<(), ContainerError> {
        if self.is_running() {
            return Err(ContainerError::AlreadyRunning);
        }
        if self.listener.is_batch() && self.properties.ack_mode == AckMode::Record {
            return Err(ContainerError::RecordAckWithBatchListener);
        }
        if self.properties.auto_commit && self.properties.ack_mode.is_manual() {
            return Err(ContainerError::AutoCommitConflict(self.properties.ack_mode));
        }

        self.state
            .store(ContainerState::Starting.as_u8(), Ordering::SeqCst);

        consumer.subscribe(&self.properties.topics)?;
        self.waker = Some(consumer.waker());
        self.running.store(true, Ordering::SeqCst);
        self.last_poll
            .store(self.clock.now_millis(), Ordering::SeqCst);

        // Fresh channels on restart; the old receivers died with the
        // previous worker.
        if self.ack_rx.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.ack_tx = tx;
            self.ack_rx = Some(rx);
        }
        if self.seek_rx.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.seek_tx = tx;
            self.seek_rx = Some(rx);
        }

        let worker = ListenerWorker {
            properties: self.properties.clone(),
            listener: self.listener.clone(),
            listener_id: self.listener_id.clone(),
            error_handler: Arc::clone(&self.error_handler),
            after_rollback: Arc::clone(&self.after_rollback),
            transactional: self.transactional.clone(),
            seek_aware: self.seek_aware.clone(),
            clock: Arc::clone(&self.clock),
            consumer,
            ledger: OffsetLedger::new(),
            committed_watermarks: HashMap::new(),
            pending_seeks: Vec::new(),
            ack_tx: self.ack_tx.clone(),
            ack_rx: self.ack_rx.take().unwrap_or_else(|| {
                // unreachable: replenished above
                mpsc::unbounded_channel().1
            }),
            seek_tx: self.seek_tx.clone(),
            seek_rx: self.seek_rx.take().unwrap_or_else(|| {
                mpsc::unbounded_channel().1
            }),
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
            last_poll: Arc::clone(&self.last_poll),
            events_tx: self.events_tx.clone(),
            count_since_commit: 0,
            last_time_commit: Instant::now(),
            fatal: false,
        };
        self.worker = Some(tokio::spawn(worker.run()));

        self.state
            .store(ContainerState::Running.as_u8(), Ordering::SeqCst);
        let _ = self.events_tx.send(ContainerEvent::Started {
            listener_id: self.listener_id.clone(),
        });
        internal!(level = INFO, "Listener container {} started", self.listener_id);
        Ok(())
    }

    /// Stop the polling task: flip the running flag, wake the blocked poll,
    /// and wait (bounded) for the final commit and shutdown. Idempotent.
    #[traced(timing(precision = "ms"))]
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            if let Some(worker) = self.worker.take() {
                let _ = worker.await;
            }
            return;
        }
        self.state
            .store(ContainerState::Stopping.as_u8(), Ordering::SeqCst);
        if let Some(waker) = &self.waker {
            waker.wake();
        }

        if let Some(worker) = self.worker.take() {
            let timeout = Duration::from_millis(self.properties.shutdown_timeout_ms);
            if tokio::time::timeout(timeout, worker).await.is_err() {
                internal!(
                    level = WARN,
                    "Listener container {} did not stop within {}ms",
                    self.listener_id,
                    self.properties.shutdown_timeout_ms
                );
            }
        }

        self.state
            .store(ContainerState::Stopped.as_u8(), Ordering::SeqCst);
        let _ = self.events_tx.send(ContainerEvent::Stopped {
            listener_id: self.listener_id.clone(),
        });
        internal!(level = INFO, "Listener container {} stopped", self.listener_id);
    }
}

enum DispatchFlow {
    Continue,
    Stop,
}

struct ListenerWorker {
    properties: ContainerProperties,
    listener: ListenerKind,
    listener_id: String,
    error_handler: Arc<dyn ErrorHandler>,
    after_rollback: Arc<dyn AfterRollbackProcessor>,
    transactional: Option<Arc<dyn TransactionalProducer>>,
    seek_aware: Option<Arc<dyn SeekAwareListener>>,
    clock: Arc<dyn Clock>,
    consumer: Box<dyn RecordConsumer>,
    ledger: OffsetLedger,
    /// Highest committed next-offset per partition; commits never regress.
    committed_watermarks: HashMap<TopicPartition, i64>,
    pending_seeks: Vec<SeekRequest>,
    ack_tx: mpsc::UnboundedSender<AckRequest>,
    ack_rx: mpsc::UnboundedReceiver<AckRequest>,
    seek_tx: mpsc::UnboundedSender<SeekRequest>,
    seek_rx: mpsc::UnboundedReceiver<SeekRequest>,
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    last_poll: Arc<AtomicI64>,
    events_tx: broadcast::Sender<ContainerEvent>,
    count_since_commit: u32,
    last_time_commit: Instant,
    fatal: bool,
}

impl ListenerWorker {
    async fn run(mut self) {
        self.apply_initial_offsets();
        let monitor = self.spawn_monitor();

        let mut last_receive = Instant::now();
        let mut last_alert = last_receive;

        while self.running.load(Ordering::SeqCst) {
            if !self.properties.auto_commit && self.properties.ack_mode != AckMode::Record {
                self.process_commits().await;
            }
            self.apply_seeks();

            let timeout = Duration::from_millis(self.properties.poll_timeout_ms);
            match self.consumer.poll(timeout).await {
                Ok(outcome) => {
                    self.last_poll
                        .store(self.clock.now_millis(), Ordering::SeqCst);
                    self.handle_rebalance(&outcome).await;
                    if self.fatal {
                        break;
                    }

                    if outcome.records.is_empty() {
                        if let Some(idle_ms) = self.properties.idle_event_interval_ms {
                            let idle = Duration::from_millis(idle_ms);
                            let now = Instant::now();
                            if now > last_receive + idle && now > last_alert + idle {
                                last_alert = now;
                                let _ = self.events_tx.send(ContainerEvent::Idle {
                                    listener_id: self.listener_id.clone(),
                                    idle_for: now - last_receive,
                                });
                                self.invoke_idle_seek_hook();
                            }
                        }
                    } else {
                        tracing::debug!(count = outcome.records.len(), "Received records");
                        last_receive = Instant::now();
                        self.dispatch(outcome.records).await;
                    }
                }
                Err(error) if error.is_wakeup() => {
                    // Woken to observe the running flag; nothing to do.
                }
                Err(error) if error.is_fatal() => {
                    internal!(level = ERROR, "No offset and no reset policy: {error}");
                    self.fatal = true;
                    break;
                }
                Err(error) => {
                    internal!(level = ERROR, "Consumer poll error: {error}");
                }
            }
        }

        if !self.fatal && self.transactional.is_none() {
            self.commit_pending_acks().await;
        }
        if self.fatal {
            self.running.store(false, Ordering::SeqCst);
            self.state
                .store(ContainerState::Stopped.as_u8(), Ordering::SeqCst);
            let _ = self.events_tx.send(ContainerEvent::Stopped {
                listener_id: self.listener_id.clone(),
            });
        }
        monitor.abort();
        internal!(level = INFO, "Consumer for {} stopped", self.listener_id);
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let last_poll = Arc::clone(&self.last_poll);
        let clock = Arc::clone(&self.clock);
        let events = self.events_tx.clone();
        let listener_id = self.listener_id.clone();
        let poll_timeout_ms = self.properties.poll_timeout_ms;
        let threshold = self.properties.no_poll_threshold;
        let interval = Duration::from_secs(self.properties.monitor_interval_secs.max(1));

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // Skip the immediate first tick
            timer.tick().await;
            loop {
                timer.tick().await;
                let since_ms = clock
                    .now_millis()
                    .saturating_sub(last_poll.load(Ordering::SeqCst));
                #[allow(clippy::cast_precision_loss)]
                let ratio = since_ms as f64 / poll_timeout_ms.max(1) as f64;
                if ratio > threshold {
                    let _ = events.send(ContainerEvent::NonResponsiveConsumer {
                        listener_id: listener_id.clone(),
                        time_since_last_poll: Duration::from_millis(
                            u64::try_from(since_ms).unwrap_or(0),
                        ),
                    });
                }
            }
        })
    }

    fn apply_initial_offsets(&mut self) {
        for initial in self.properties.initial_offsets.clone() {
            let partition = TopicPartition::new(initial.topic.clone(), initial.partition);
            let result = self.seek_initial(&partition, initial.offset, initial.relative_to_current);
            match result {
                Ok(()) => {
                    tracing::debug!(%partition, offset = initial.offset, "Applied initial offset");
                }
                Err(error) => {
                    internal!(level = ERROR, "Failed to set initial offset for {partition}: {error}");
                }
            }
        }
    }

    fn seek_initial(
        &mut self,
        partition: &TopicPartition,
        offset: i64,
        relative_to_current: bool,
    ) -> Result<(), BrokerError> {
        if relative_to_current {
            let position = self.consumer.position(partition)?;
            return self.consumer.seek(partition, (position + offset).max(0));
        }
        if offset >= 0 {
            return self.consumer.seek(partition, offset);
        }
        // Negative absolute offsets count back from the end of the log
        self.consumer.seek_to_end(partition)?;
        let end = self.consumer.position(partition)?;
        self.consumer.seek(partition, (end + offset).max(0))
    }

    async fn handle_rebalance(&mut self, outcome: &PollOutcome) {
        if !outcome.revoked.is_empty() {
            internal!(
                level = INFO,
                "Partitions revoked: {:?}, committing pending acknowledgments",
                outcome.revoked
            );
            // The listener may have acked records we have not flushed yet.
            self.commit_pending_acks().await;
        }

        if outcome.assigned.is_empty() {
            return;
        }
        tracing::debug!(assigned = ?outcome.assigned, "Partitions assigned");

        if !self.properties.auto_commit {
            // Commit initial positions so a reset elsewhere cannot rewind
            // these partitions. Best-effort except for a missing reset
            // policy, which is fatal.
            let mut commits = OffsetMap::new();
            for partition in &outcome.assigned {
                match self.consumer.position(partition) {
                    Ok(position) => {
                        commits.insert(partition.clone(), position);
                    }
                    Err(error) if error.is_fatal() => {
                        internal!(level = ERROR, "No offset and no reset policy: {error}");
                        self.fatal = true;
                        return;
                    }
                    Err(error) => {
                        internal!(level = WARN, "Could not read position of {partition}: {error}");
                    }
                }
            }
            if let Err(error) = self.commit_offsets(commits).await {
                internal!(level = WARN, "Commit on assignment failed: {error}");
            }
        }

        if let Some(seek_aware) = self.seek_aware.clone() {
            let positions = self.positions_for(&outcome.assigned);
            seek_aware.on_partitions_assigned(&positions, &SeekHandle::new(self.seek_tx.clone()));
        }
    }

    fn invoke_idle_seek_hook(&mut self) {
        if let Some(seek_aware) = self.seek_aware.clone() {
            let assignment = self.consumer.assignment();
            let positions = self.positions_for(&assignment);
            seek_aware.on_idle_container(&positions, &SeekHandle::new(self.seek_tx.clone()));
        }
    }

    fn positions_for(&mut self, partitions: &[TopicPartition]) -> HashMap<TopicPartition, i64> {
        let mut positions = HashMap::new();
        for partition in partitions {
            if let Ok(position) = self.consumer.position(partition) {
                positions.insert(partition.clone(), position);
            }
        }
        positions
    }

    fn apply_seeks(&mut self) {
        let mut requests = std::mem::take(&mut self.pending_seeks);
        while let Ok(request) = self.seek_rx.try_recv() {
            requests.push(request);
        }
        for request in requests {
            tracing::trace!(?request, "Applying seek");
            let result = match request.target {
                SeekTarget::Offset(offset) => self.consumer.seek(&request.partition, offset),
                SeekTarget::Beginning => self.consumer.seek_to_beginning(&request.partition),
                SeekTarget::End => self.consumer.seek_to_end(&request.partition),
            };
            if let Err(error) = result {
                internal!(level = ERROR, "Seek failed for {}: {error}", request.partition);
            }
        }
    }

    async fn dispatch(&mut self, records: Vec<Record>) {
        if self.listener.is_batch() {
            self.invoke_batch(&records).await;
        } else {
            self.invoke_records(&records).await;
        }
    }

    async fn invoke_records(&mut self, records: &[Record]) {
        for index in 0..records.len() {
            let record = &records[index];
            let remaining = &records[index + 1..];
            let flow = if let Some(producer) = self.transactional.clone() {
                self.invoke_record_in_transaction(&producer, record, remaining)
                    .await
            } else {
                self.invoke_record(record, remaining, None).await
            };
            if matches!(flow, DispatchFlow::Stop) {
                break;
            }
        }
    }

    async fn invoke_record(
        &mut self,
        record: &Record,
        remaining: &[Record],
        producer: Option<&Arc<dyn TransactionalProducer>>,
    ) -> DispatchFlow {
        tracing::trace!(record = %record, "Processing record");
        let ack = self.acknowledgment_for(record);
        let result = match self.listener.clone() {
            ListenerKind::Record(listener) => listener.on_record(record).await,
            ListenerKind::AckingRecord(listener) => listener.on_record(record, ack).await,
            ListenerKind::Batch(_) | ListenerKind::AckingBatch(_) => return DispatchFlow::Continue,
        };

        match result {
            Ok(()) => {
                self.ack_current(record, producer).await;
                DispatchFlow::Continue
            }
            Err(error) => {
                if self.properties.ack_on_error
                    && !self.properties.auto_commit
                    && producer.is_none()
                {
                    self.ledger.add_record(record);
                }
                let handler = Arc::clone(&self.error_handler);
                let mut ops = ContainerOps::new(&mut self.ledger, &mut self.pending_seeks);
                match handler.handle(&error, record, remaining, &mut ops).await {
                    HandleOutcome::Handled => {
                        if let Some(producer) = producer {
                            self.send_offsets_to_transaction(producer).await;
                        }
                        self.flush_recovered_commits().await;
                        DispatchFlow::Continue
                    }
                    HandleOutcome::Retried => DispatchFlow::Stop,
                }
            }
        }
    }

    async fn invoke_record_in_transaction(
        &mut self,
        producer: &Arc<dyn TransactionalProducer>,
        record: &Record,
        remaining: &[Record],
    ) -> DispatchFlow {
        if let Err(error) = producer.begin_transaction().await {
            internal!(level = ERROR, "Could not begin transaction: {error}");
            return DispatchFlow::Stop;
        }

        let flow = self.invoke_record(record, remaining, Some(producer)).await;
        match flow {
            DispatchFlow::Continue => {
                if let Err(error) = producer.commit_transaction().await {
                    internal!(level = ERROR, "Transaction commit failed: {error}");
                    self.rollback(producer, record, remaining).await;
                    return DispatchFlow::Stop;
                }
                DispatchFlow::Continue
            }
            DispatchFlow::Stop => {
                self.rollback(producer, record, remaining).await;
                DispatchFlow::Stop
            }
        }
    }

    async fn rollback(
        &mut self,
        producer: &Arc<dyn TransactionalProducer>,
        record: &Record,
        remaining: &[Record],
    ) {
        if let Err(error) = producer.abort_transaction().await {
            internal!(level = ERROR, "Transaction abort failed: {error}");
        }
        internal!(level = ERROR, "Transaction rolled back for {record}");
        let mut unprocessed = Vec::with_capacity(remaining.len() + 1);
        unprocessed.push(record.clone());
        unprocessed.extend_from_slice(remaining);
        let processor = Arc::clone(&self.after_rollback);
        let mut ops = ContainerOps::new(&mut self.ledger, &mut self.pending_seeks);
        processor.process(&unprocessed, &mut ops).await;
    }

    async fn invoke_batch(&mut self, records: &[Record]) {
        if records.is_empty() {
            return;
        }
        if let Some(producer) = self.transactional.clone() {
            if let Err(error) = producer.begin_transaction().await {
                internal!(level = ERROR, "Could not begin transaction: {error}");
                return;
            }
            match self.do_invoke_batch(records, Some(&producer)).await {
                DispatchFlow::Continue => {
                    if let Err(error) = producer.commit_transaction().await {
                        internal!(level = ERROR, "Transaction commit failed: {error}");
                        self.rollback_batch(&producer, records).await;
                    }
                }
                DispatchFlow::Stop => self.rollback_batch(&producer, records).await,
            }
        } else {
            let _ = self.do_invoke_batch(records, None).await;
        }
    }

    async fn rollback_batch(
        &mut self,
        producer: &Arc<dyn TransactionalProducer>,
        records: &[Record],
    ) {
        if let Err(error) = producer.abort_transaction().await {
            internal!(level = ERROR, "Transaction abort failed: {error}");
        }
        internal!(level = ERROR, "Transaction rolled back for batch of {}", records.len());
        let processor = Arc::clone(&self.after_rollback);
        let mut ops = ContainerOps::new(&mut self.ledger, &mut self.pending_seeks);
        processor.process(records, &mut ops).await;
    }

    async fn do_invoke_batch(
        &mut self,
        records: &[Record],
        producer: Option<&Arc<dyn TransactionalProducer>>,
    ) -> DispatchFlow {
        let ack = self
            .properties
            .ack_mode
            .is_manual()
            .then(|| Acknowledgment::batch(records, self.ack_tx.clone()));
        let result = match self.listener.clone() {
            ListenerKind::Batch(listener) => listener.on_batch(records).await,
            ListenerKind::AckingBatch(listener) => listener.on_batch(records, ack).await,
            ListenerKind::Record(_) | ListenerKind::AckingRecord(_) => {
                return DispatchFlow::Continue;
            }
        };

        match result {
            Ok(()) => {
                if !self.properties.ack_mode.is_manual() && !self.properties.auto_commit {
                    self.track_highest(records);
                    if let Some(producer) = producer {
                        self.send_offsets_to_transaction(producer).await;
                    }
                }
                DispatchFlow::Continue
            }
            Err(error) => {
                if self.properties.ack_on_error
                    && !self.properties.auto_commit
                    && producer.is_none()
                {
                    self.track_highest(records);
                }
                let handler = Arc::clone(&self.error_handler);
                let mut ops = ContainerOps::new(&mut self.ledger, &mut self.pending_seeks);
                match handler.handle_batch(&error, records, &mut ops).await {
                    HandleOutcome::Handled => {
                        // Partial failure does not block progress once the
                        // handler accepted responsibility.
                        self.track_highest(records);
                        if let Some(producer) = producer {
                            self.send_offsets_to_transaction(producer).await;
                        }
                        self.flush_recovered_commits().await;
                        DispatchFlow::Continue
                    }
                    HandleOutcome::Retried => DispatchFlow::Stop,
                }
            }
        }
    }

    fn track_highest(&mut self, records: &[Record]) {
        for item in highest_offsets(records) {
            self.ledger.add(&item);
        }
    }

    fn acknowledgment_for(&self, record: &Record) -> Option<Acknowledgment> {
        self.properties
            .ack_mode
            .is_manual()
            .then(|| Acknowledgment::single(AckItem::from(record), self.ack_tx.clone()))
    }

    /// Post-success offset tracking per ack mode (the manual modes leave it
    /// to the listener).
    async fn ack_current(
        &mut self,
        record: &Record,
        producer: Option<&Arc<dyn TransactionalProducer>>,
    ) {
        match self.properties.ack_mode {
            AckMode::Record => {
                if producer.is_none() {
                    let commits =
                        OffsetMap::from([(record.topic_partition(), record.offset + 1)]);
                    if let Err(error) = self.commit_offsets(commits).await {
                        internal!(level = ERROR, "Record commit failed: {error}");
                    }
                } else {
                    self.ledger.add_record(record);
                }
            }
            AckMode::Manual | AckMode::ManualImmediate => {}
            _ => {
                if !self.properties.auto_commit {
                    self.ledger.add_record(record);
                }
            }
        }
        if let Some(producer) = producer {
            self.send_offsets_to_transaction(producer).await;
        }
    }

    async fn send_offsets_to_transaction(&mut self, producer: &Arc<dyn TransactionalProducer>) {
        self.handle_acks().await;
        let commits = self.ledger.build_commits();
        if commits.is_empty() {
            return;
        }
        if let Err(error) = producer
            .send_offsets_to_transaction(&commits, &self.properties.group_id)
            .await
        {
            internal!(level = ERROR, "Send offsets to transaction failed: {error}");
        }
    }

    /// Drain the ack channel: immediate mode commits on the spot and
    /// signals completion, the rest lands in the ledger.
    async fn handle_acks(&mut self) {
        loop {
            let request = match self.ack_rx.try_recv() {
                Ok(request) => request,
                Err(_) => break,
            };
            self.count_since_commit = self
                .count_since_commit
                .saturating_add(u32::try_from(request.items.len()).unwrap_or(u32::MAX));
            if self.properties.ack_mode == AckMode::ManualImmediate {
                let mut commits = OffsetMap::new();
                for item in &request.items {
                    let partition = item.topic_partition();
                    let next = item.offset + 1;
                    let entry = commits.entry(partition).or_insert(next);
                    if next > *entry {
                        *entry = next;
                    }
                }
                let result = self
                    .commit_offsets(commits)
                    .await
                    .map_err(|error| crate::acks::AckError::Commit(error.to_string()));
                if let Some(completion) = request.completion {
                    let _ = completion.send(result);
                }
            } else {
                for item in &request.items {
                    self.ledger.add(item);
                }
                if let Some(completion) = request.completion {
                    let _ = completion.send(Ok(()));
                }
            }
        }
    }

    /// The per-iteration commit pass: drain acks, then commit according to
    /// the ack mode's deadline rules.
    async fn process_commits(&mut self) {
        self.handle_acks().await;
        match self.properties.ack_mode {
            AckMode::ManualImmediate => {}
            AckMode::Batch | AckMode::Manual | AckMode::Record => {
                self.commit_if_necessary().await;
                self.count_since_commit = 0;
            }
            AckMode::Count => {
                if self.count_since_commit >= self.properties.ack_count {
                    tracing::debug!(
                        count = self.count_since_commit,
                        "Committing: count exceeds configured limit"
                    );
                    self.commit_if_necessary().await;
                    self.count_since_commit = 0;
                }
            }
            AckMode::Time => {
                if self.ack_time_elapsed() {
                    self.commit_if_necessary().await;
                    self.last_time_commit = Instant::now();
                }
            }
            AckMode::CountTime => {
                if self.ack_time_elapsed() || self.count_since_commit >= self.properties.ack_count
                {
                    self.commit_if_necessary().await;
                    self.last_time_commit = Instant::now();
                    self.count_since_commit = 0;
                }
            }
        }
    }

    fn ack_time_elapsed(&self) -> bool {
        self.last_time_commit.elapsed() >= Duration::from_millis(self.properties.ack_time_ms)
    }

    /// Flush commits the error handler queued while a manual ack mode is in
    /// charge; other modes flush on the normal schedule.
    async fn flush_recovered_commits(&mut self) {
        if self.properties.ack_mode.is_manual() && !self.ledger.is_empty() {
            self.commit_if_necessary().await;
        }
    }

    async fn commit_if_necessary(&mut self) {
        let commits = self.ledger.build_commits();
        if commits.is_empty() {
            return;
        }
        if let Err(error) = self.commit_offsets(commits).await {
            internal!(level = ERROR, "Commit failed: {error}");
        }
    }

    async fn commit_pending_acks(&mut self) {
        self.handle_acks().await;
        self.commit_if_necessary().await;
    }

    async fn commit_offsets(&mut self, mut commits: OffsetMap) -> Result<(), BrokerError> {
        commits.retain(|partition, offset| {
            self.committed_watermarks
                .get(partition)
                .map_or(true, |watermark| *offset > *watermark)
        });
        if commits.is_empty() {
            return Ok(());
        }
        let mode = if self.properties.sync_commits {
            CommitMode::Sync
        } else {
            CommitMode::Async
        };
        tracing::debug!(?commits, "Committing");
        match self.consumer.commit(&commits, mode).await {
            Ok(()) => {
                for (partition, offset) in commits {
                    self.committed_watermarks.insert(partition, offset);
                }
                Ok(())
            }
            Err(error) if error.is_wakeup() => {
                tracing::debug!("Woken up during commit");
                Ok(())
            }
            Err(error) => {
                internal!(level = ERROR, "Commit failed: {error}");
                Err(error)
            }
        }
    }
}
