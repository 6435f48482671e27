//! Session aggregator: turns live intake events into submissions.
//!
//! One aggregator owns the field mapping for one session. Packets are
//! applied strictly in arrival order; every successful mutation snapshots
//! the mapping and hands it to the pipeline on a background task, so event
//! handling never waits on disk or network.
//!
//! # Lifecycle
//!
//! ```text
//! start ──► flush (leftovers from earlier sessions)
//!   │       ticker: flush every interval
//!   ▼
//! packets ─► apply ─► snapshot ─► spawn save_and_send
//!   │
//! disconnect ─► stop ticker ─► final snapshot ─► final flush ─► await (bounded)
//! ```
//!
//! A snapshot whose dispatch is still running when the shutdown grace
//! expires is aborted and appended to the dead-letter queue directly, so
//! nothing captured in a session is left outside the redelivery path.

pub mod ticker;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::core::{DispatchOutcome, DispatchReport, FlushReport, IntakePipeline};
use crate::domain::{DataPacket, FieldMap, IntakeEvent, Participant, Submission};

pub use ticker::{FlushTicker, TickerTotals};

/// Result of a background task spawned by the aggregator
#[derive(Debug)]
enum Background {
    Dispatch(DispatchReport),
    Flush(Option<FlushReport>),
}

/// Counters describing a finished session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Packets that mutated the field mapping
    pub events_applied: usize,

    /// Packets dropped as malformed
    pub events_dropped: usize,

    /// Snapshots handed to the pipeline
    pub dispatched: usize,

    /// Snapshots delivered (or skipped with no endpoint)
    pub delivered: usize,

    /// Snapshots moved to the dead-letter queue
    pub queued: usize,

    /// Snapshots that could not even be queued
    pub queue_failed: usize,

    /// Dead-letter flush passes run by this session
    pub flushes: usize,

    /// Queued records delivered by those flush passes
    pub redelivered: usize,

    /// Snapshots queued directly at teardown because their dispatch
    /// outlived the shutdown grace
    pub requeued: usize,

    /// Background tasks still running when the shutdown grace expired
    pub unfinished: usize,
}

impl SessionSummary {
    fn record(&mut self, result: Background) {
        match result {
            Background::Dispatch(report) => match report.outcome {
                DispatchOutcome::Delivered { .. } => self.delivered += 1,
                DispatchOutcome::Queued { .. } => self.queued += 1,
                DispatchOutcome::QueueFailed { .. } => self.queue_failed += 1,
            },
            Background::Flush(report) => {
                self.flushes += 1;
                if let Some(report) = report {
                    self.redelivered += report.delivered;
                }
            }
        }
    }
}

/// A snapshot whose save-and-send has not returned yet
struct InFlight {
    submission: Submission,
    abort: Option<AbortHandle>,
}

type InFlightMap = Mutex<BTreeMap<u64, InFlight>>;

fn lock_in_flight(map: &InFlightMap) -> MutexGuard<'_, BTreeMap<u64, InFlight>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the live field mapping for one session
pub struct SessionAggregator {
    session_id: Uuid,
    fields: FieldMap,
    participant: Option<Participant>,
    pipeline: Arc<IntakePipeline>,
    settings: SessionSettings,
    background: JoinSet<Background>,
    in_flight: Arc<InFlightMap>,
    next_dispatch: u64,
    summary: SessionSummary,
}

impl SessionAggregator {
    pub fn new(pipeline: Arc<IntakePipeline>, settings: SessionSettings) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            fields: FieldMap::new(),
            participant: None,
            pipeline,
            settings,
            background: JoinSet::new(),
            in_flight: Arc::new(Mutex::new(BTreeMap::new())),
            next_dispatch: 0,
            summary: SessionSummary::default(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Current field mapping
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Most recently observed participant
    pub fn participant(&self) -> Option<&Participant> {
        self.participant.as_ref()
    }

    /// Background tasks not yet collected
    pub fn pending_tasks(&self) -> usize {
        self.background.len()
    }

    /// Apply one incoming packet. Malformed packets are dropped and leave
    /// the mapping untouched. Returns whether the packet was applied.
    pub fn handle_packet(&mut self, packet: DataPacket) -> bool {
        self.reap_finished();

        let event = match IntakeEvent::parse(&packet.data) {
            Ok(event) => event,
            Err(e) => {
                debug!(session = %self.session_id, error = %e, "Dropping malformed packet");
                self.summary.events_dropped += 1;
                return false;
            }
        };

        if let Some(participant) = packet.participant {
            self.participant = Some(participant);
        }

        self.apply_event(event);
        true
    }

    /// Apply a parsed event and dispatch a snapshot if fields remain
    pub fn apply_event(&mut self, event: IntakeEvent) {
        debug!(session = %self.session_id, kind = event.kind.as_str(), "Applying intake event");
        event.apply(&mut self.fields);
        self.summary.events_applied += 1;
        self.dispatch_snapshot();
    }

    /// Clone the live mapping into a submission; `None` while it is empty
    pub fn snapshot(&self) -> Option<Submission> {
        if self.fields.is_empty() {
            return None;
        }

        let submission = Submission::new(self.fields.clone());
        Some(match &self.participant {
            Some(participant) => submission.with_participant(participant),
            None => submission,
        })
    }

    /// Snapshot and hand off to the pipeline without waiting
    fn dispatch_snapshot(&mut self) -> bool {
        let Some(submission) = self.snapshot() else {
            return false;
        };

        let seq = self.next_dispatch;
        self.next_dispatch += 1;
        lock_in_flight(&self.in_flight).insert(
            seq,
            InFlight {
                submission: submission.clone(),
                abort: None,
            },
        );

        let pipeline = Arc::clone(&self.pipeline);
        let in_flight = Arc::clone(&self.in_flight);
        let handle = self.background.spawn(async move {
            let report = pipeline.save_and_send(submission).await;
            lock_in_flight(&in_flight).remove(&seq);
            Background::Dispatch(report)
        });

        // The task may already have finished and removed its entry
        if let Some(entry) = lock_in_flight(&self.in_flight).get_mut(&seq) {
            entry.abort = Some(handle);
        }

        self.summary.dispatched += 1;
        true
    }

    /// Abort dispatches that have not returned and queue their snapshots.
    ///
    /// A dispatch aborted right after its own enqueue leaves a duplicate
    /// line; receivers deduplicate by idempotency key.
    async fn requeue_stranded(&mut self) {
        let stranded = std::mem::take(&mut *lock_in_flight(&self.in_flight));

        for entry in stranded.into_values() {
            if let Some(abort) = entry.abort {
                abort.abort();
            }

            match self.pipeline.dead_letters().enqueue(&entry.submission).await {
                Ok(()) => self.summary.requeued += 1,
                Err(e) => error!(
                    session = %self.session_id,
                    queue = %self.pipeline.dead_letters().path().display(),
                    error = %e,
                    "Failed to queue unfinished snapshot"
                ),
            }
        }
    }

    /// Start a dead-letter flush pass without waiting
    fn dispatch_flush(&mut self) {
        let pipeline = Arc::clone(&self.pipeline);
        self.background
            .spawn(async move { Background::Flush(pipeline.flush().await) });
    }

    /// Collect finished background tasks
    fn reap_finished(&mut self) {
        while let Some(result) = self.background.try_join_next() {
            match result {
                Ok(done) => self.summary.record(done),
                Err(e) => warn!(session = %self.session_id, error = %e, "Background task failed"),
            }
        }
    }

    /// Drive a whole session: packets are consumed until the channel closes
    /// (participant disconnect), then the session is torn down.
    #[instrument(skip_all, fields(session = %self.session_id))]
    pub async fn run(mut self, mut packets: mpsc::Receiver<DataPacket>) -> SessionSummary {
        info!("Session started");

        self.dispatch_flush();
        let ticker = FlushTicker::spawn(Arc::clone(&self.pipeline), self.settings.flush_interval());

        while let Some(packet) = packets.recv().await {
            self.handle_packet(packet);
        }

        let periodic = ticker.stop().await;
        let mut summary = self.finish().await;
        summary.flushes += periodic.passes;
        summary.redelivered += periodic.redelivered;

        info!(
            applied = summary.events_applied,
            dropped = summary.events_dropped,
            dispatched = summary.dispatched,
            queued = summary.queued,
            requeued = summary.requeued,
            redelivered = summary.redelivered,
            "Session ended"
        );

        summary
    }

    /// Teardown: final snapshot if fields remain, final flush, then wait
    /// for background work up to the shutdown grace period. Snapshots still
    /// being dispatched after that are queued here before returning.
    pub async fn finish(mut self) -> SessionSummary {
        self.dispatch_snapshot();
        self.dispatch_flush();

        let deadline = Instant::now() + self.settings.shutdown_grace();

        loop {
            match time::timeout_at(deadline, self.background.join_next()).await {
                Ok(Some(Ok(done))) => self.summary.record(done),
                Ok(Some(Err(e))) => {
                    warn!(session = %self.session_id, error = %e, "Background task failed")
                }
                Ok(None) => break,
                Err(_) => {
                    self.summary.unfinished = self.background.len();
                    warn!(
                        session = %self.session_id,
                        pending = self.summary.unfinished,
                        "Shutdown grace expired, queueing unfinished snapshots"
                    );
                    self.requeue_stranded().await;
                    self.background.detach_all();
                    break;
                }
            }
        }

        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn aggregator(temp: &TempDir) -> SessionAggregator {
        let config = ResolvedConfig::in_dir(temp.path());
        let pipeline = Arc::new(IntakePipeline::from_config(&config));
        SessionAggregator::new(pipeline, config.session)
    }

    #[tokio::test]
    async fn test_snapshot_empty_is_none() {
        let temp = TempDir::new().unwrap();
        let agg = aggregator(&temp);
        assert!(agg.snapshot().is_none());
        agg.finish().await;
    }

    #[tokio::test]
    async fn test_participant_attached_to_snapshot() {
        let temp = TempDir::new().unwrap();
        let mut agg = aggregator(&temp);

        let packet = DataPacket::new(r#"{"type": "intake.update", "fields": {"name": "Jane"}}"#)
            .from_participant(Participant::new("PA_1", "jane"));
        assert!(agg.handle_packet(packet));

        let snapshot = agg.snapshot().unwrap();
        assert_eq!(snapshot.participant_id(), Some("PA_1"));
        assert_eq!(snapshot.participant_identity(), Some("jane"));
        assert_eq!(snapshot.fields().get("name"), Some(&json!("Jane")));

        let summary = agg.finish().await;
        // One dispatch for the update, one for teardown
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.delivered, 2);
    }

    #[tokio::test]
    async fn test_malformed_packet_dropped() {
        let temp = TempDir::new().unwrap();
        let mut agg = aggregator(&temp);

        assert!(!agg.handle_packet(DataPacket::new("{oops")));
        assert!(agg.fields().is_empty());

        let summary = agg.finish().await;
        assert_eq!(summary.events_dropped, 1);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.flushes, 1);
    }
}
