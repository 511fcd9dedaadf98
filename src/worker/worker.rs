//! The main consumption loop and the reclaim loop.
//!
//! Both loops share one [`Worker`] and therefore one processor, event log and
//! store. Nothing in-process serializes them: an entry is only ever owned by one
//! consumer at a time because the event log's pending-entry ownership says so.
//!
//! # Infrastructure faults
//!
//! When the processor returns a [`ProcessError`] the entry is left pending and
//! `retry:<entry_id>` is incremented in the store. Once that count exceeds
//! `processing_retry_ceiling` the entry is written to the dead sink, acked, and
//! the counter deleted.
//!
//! # Entries that are not yet due
//!
//! The main loop holds a retry copy read before its `next_ts` in a
//! [`DeferredEntries`] queue, still pending in the group, and shortens its
//! blocking reads so it wakes when the earliest held entry is due. A hold never
//! lasts longer than half of `reclaim_idle`; an entry still not due by then goes
//! through the processor, which appends it again unchanged. The loop therefore
//! appends at most one copy per hold period instead of re-reading its own copy
//! in a tight cycle.
//!
//! # Shutdown
//!
//! Cancellation interrupts an idle blocking read or an inter-pass sleep, never
//! an entry being processed. [`WorkerHandle::shutdown`] cancels and waits for
//! both loops. Held entries stay pending and are picked up by a reclaim pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::config::WorkerConfig;
use super::deferred::DeferredEntries;
use super::handler::EventHandler;
use super::processor::{ProcessError, ProcessOutcome, Processor};
use crate::clock::Clock;
use crate::eventlog::{EventLog, LogEntry, LogError};
use crate::metrics::Metrics;
use crate::queue::{DeadLetter, EventEnvelope};
use crate::store::{DEFAULT_RETRY_COUNTER_TTL, KeyValueStore};

/// What happened to an entry after an infrastructure fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Still pending; `faults` is the entry's fault count so far.
    LeftPending { faults: i64 },
    /// Moved to the dead sink and acked.
    DeadLettered,
}

/// The result of handling one entry from either loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Processed(ProcessOutcome),
    Faulted(Escalation),
    /// The fault could not even be recorded; the entry stays pending.
    Unrecorded,
}

/// Liveness of one loop.
#[derive(Debug, Default)]
pub struct LoopHealth {
    running: AtomicBool,
    last_heartbeat_ms: AtomicI64,
}

impl LoopHealth {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Unix milliseconds of the loop's last iteration, or 0 if it never ran.
    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    fn beat(&self, now_ms: i64) {
        self.last_heartbeat_ms.store(now_ms, Ordering::Release);
    }

    fn start(&self, now_ms: i64) -> RunningGuard<'_> {
        self.beat(now_ms);
        self.running.store(true, Ordering::Release);
        RunningGuard(self)
    }
}

/// Clears the running flag when a loop exits, including by panic.
struct RunningGuard<'a>(&'a LoopHealth);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Liveness of both worker loops.
#[derive(Debug, Default)]
pub struct WorkerHealth {
    pub main: LoopHealth,
    pub reclaim: LoopHealth,
}

impl WorkerHealth {
    /// True while both loops are running.
    pub fn is_alive(&self) -> bool {
        self.main.is_running() && self.reclaim.is_running()
    }
}

/// Owns the two spawned loops.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    main: JoinHandle<()>,
    reclaim: JoinHandle<()>,
    health: Arc<WorkerHealth>,
}

impl WorkerHandle {
    pub fn health(&self) -> Arc<WorkerHealth> {
        Arc::clone(&self.health)
    }

    /// A token that stops both loops when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels both loops and waits for them to finish their current entry.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.main.await {
            error!(error = %e, "Main consumption loop ended abnormally");
        }
        if let Err(e) = self.reclaim.await {
            error!(error = %e, "Reclaim loop ended abnormally");
        }
    }
}

/// Consumes the event log on behalf of one consumer.
pub struct Worker<L, S, H> {
    processor: Processor<L, S, H>,
    log: Arc<L>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    config: WorkerConfig,
}

impl<L, S, H> Worker<L, S, H>
where
    L: EventLog + 'static,
    S: KeyValueStore + 'static,
    H: EventHandler + 'static,
{
    pub fn new(
        log: Arc<L>,
        store: Arc<S>,
        handler: Arc<H>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: WorkerConfig,
    ) -> Self {
        let processor = Processor::new(
            Arc::clone(&log),
            Arc::clone(&store),
            handler,
            Arc::clone(&clock),
            metrics.clone(),
            &config,
        );
        Worker {
            processor,
            log,
            store,
            clock,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Creates the consumer group if it does not exist yet.
    pub async fn init(&self) -> Result<(), LogError> {
        self.log
            .ensure_group(&self.config.stream, &self.config.group)
            .await
    }

    /// Performs one blocking group read and handles every returned entry in
    /// order. Returns how many entries were read.
    ///
    /// Unlike the main loop, nothing is held back: an entry that is not yet due
    /// is appended again straight away.
    pub async fn consume_batch(&self) -> Result<usize, LogError> {
        let entries = self.read_batch(self.config.block_timeout).await?;
        for entry in &entries {
            self.handle_entry(entry).await;
        }
        Ok(entries.len())
    }

    /// Claims idle pending entries and handles each one. Returns how many were
    /// claimed.
    pub async fn reclaim_batch(&self) -> Result<usize, LogError> {
        let entries = self
            .log
            .auto_claim(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.reclaim_idle,
                self.config.reclaim_batch,
            )
            .await?;
        if !entries.is_empty() {
            info!(count = entries.len(), "Reclaimed idle pending entries");
        }
        for entry in &entries {
            self.handle_entry(entry).await;
        }
        Ok(entries.len())
    }

    async fn read_batch(&self, block: Duration) -> Result<Vec<LogEntry>, LogError> {
        self.log
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.read_count,
                block,
            )
            .await
    }

    /// When the main loop should next look at `entry`, if it is not yet due.
    ///
    /// Capped at half of `reclaim_idle` from now. Undecodable entries are never
    /// held; the processor dead-letters them.
    fn release_at(&self, entry: &LogEntry, now_ms: i64) -> Option<i64> {
        let envelope = EventEnvelope::from_fields(&entry.fields).ok()?;
        let due = envelope.next_ts.filter(|&due| due > now_ms)?;
        let limit = i64::try_from((self.config.reclaim_idle / 2).as_millis()).unwrap_or(i64::MAX);
        Some(due.min(now_ms.saturating_add(limit)))
    }

    /// Runs the processor on one entry and escalates any infrastructure fault.
    pub async fn handle_entry(&self, entry: &LogEntry) -> Disposition {
        match self.processor.process(entry).await {
            Ok(outcome) => {
                self.metrics.entry_processed(outcome.as_str());
                Disposition::Processed(outcome)
            }
            Err(fault) => {
                self.metrics.infra_fault();
                error!(entry_id = %entry.id, error = %fault, "Infrastructure fault while processing entry");
                match self.escalate(entry, &fault).await {
                    Ok(escalation) => Disposition::Faulted(escalation),
                    Err(e) => {
                        error!(entry_id = %entry.id, error = %e, "Could not record processing fault");
                        Disposition::Unrecorded
                    }
                }
            }
        }
    }

    /// Counts a fault against the entry and dead-letters it past the ceiling.
    async fn escalate(&self, entry: &LogEntry, fault: &ProcessError) -> Result<Escalation, ProcessError> {
        let key = entry.id.retry_key();
        let faults = self
            .store
            .incr_with_ttl(&key, DEFAULT_RETRY_COUNTER_TTL)
            .await?;

        if faults <= i64::from(self.config.processing_retry_ceiling) {
            warn!(entry_id = %entry.id, faults, "Leaving entry pending for reclaim");
            return Ok(Escalation::LeftPending { faults });
        }

        let letter = DeadLetter::processing_error(&entry.fields, fault);
        self.log
            .append(&self.config.dead_stream, &letter.to_fields())
            .await?;
        self.log
            .ack(&self.config.stream, &self.config.group, &entry.id)
            .await?;
        self.store.delete(&key).await?;
        self.metrics.dead_lettered(letter.reason.as_str());
        error!(entry_id = %entry.id, faults, "Entry moved to dead sink");
        Ok(Escalation::DeadLettered)
    }

    /// Spawns both loops onto the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let worker = Arc::new(self);
        let shutdown = CancellationToken::new();
        let health = Arc::new(WorkerHealth::default());

        let main = tokio::spawn(Arc::clone(&worker).run_main(shutdown.clone(), Arc::clone(&health)));
        let reclaim = tokio::spawn(worker.run_reclaim(shutdown.clone(), Arc::clone(&health)));

        WorkerHandle {
            shutdown,
            main,
            reclaim,
            health,
        }
    }

    #[instrument(skip_all, fields(consumer = %self.config.consumer))]
    async fn run_main(self: Arc<Self>, shutdown: CancellationToken, health: Arc<WorkerHealth>) {
        let _running = health.main.start(self.clock.now_millis());
        info!(stream = %self.config.stream, group = %self.config.group, "Main consumption loop started");

        let mut deferred = DeferredEntries::new();

        loop {
            health.main.beat(self.clock.now_millis());

            for entry in deferred.take_released(self.clock.now_millis()) {
                self.handle_entry(&entry).await;
            }

            let block = deferred.wait(self.clock.now_millis(), self.config.block_timeout);
            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                read = self.read_batch(block) => read,
            };

            match read {
                Ok(entries) => {
                    if !entries.is_empty() {
                        debug!(count = entries.len(), "Read batch");
                    }
                    for entry in entries {
                        match self.release_at(&entry, self.clock.now_millis()) {
                            Some(release_at) => {
                                debug!(entry_id = %entry.id, release_at, "Holding entry until due");
                                deferred.hold(entry, release_at);
                            }
                            None => {
                                self.handle_entry(&entry).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Group read failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.read_error_backoff) => {}
                    }
                }
            }
        }

        info!(held = deferred.len(), "Main consumption loop stopped");
    }

    #[instrument(skip_all, fields(consumer = %self.config.consumer))]
    async fn run_reclaim(self: Arc<Self>, shutdown: CancellationToken, health: Arc<WorkerHealth>) {
        let _running = health.reclaim.start(self.clock.now_millis());
        info!(idle_secs = self.config.reclaim_idle.as_secs(), "Reclaim loop started");

        loop {
            health.reclaim.beat(self.clock.now_millis());

            if let Err(e) = self.reclaim_batch().await {
                error!(error = %e, "Reclaim pass failed");
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reclaim_interval) => {}
            }
        }

        info!("Reclaim loop stopped");
    }
}
