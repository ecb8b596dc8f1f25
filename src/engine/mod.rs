mod autopilot;
mod availability;
mod delay;
mod error;
mod lease;
mod mutations;
mod queries;
mod rebalance;
mod reminders;
mod store;
mod window;
#[cfg(test)]
mod tests;

pub use autopilot::{AutopilotTask, CycleOutcome, CyclePlan, TaskKind, TaskReason, plan_cycle, variance_minutes};
pub use availability::{
    Availability, ConstraintSet, ProviderConstraints, SLOT_STEP_MS, SearchHorizon, SlotRequest,
    merge_overlapping, subtract_intervals,
};
pub use delay::{Assessment, DelayReport, NoticeKind, Transition, Trigger, assess, threshold_minutes};
pub use error::EngineError;
pub use lease::LEASE_STALE_MS;
pub use mutations::{DEFAULT_DURATION_MINUTES, NewAppointment, ProviderProfile};
pub use rebalance::{AtRisk, HealthStatus, REASSIGN_AFTER_MINUTES, Reassignment, SystemHealth};
pub use reminders::{REMINDER_EARLIEST_MS, REMINDER_LATEST_MS, reminder_due};
pub use store::Store;
pub use window::{BusyReason, ClosedReason, DayContext, MIN_LEAD_MS, WindowCheck, is_free};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::sinks::{AuditSink, LogAuditSink, LogMessageSink, MessageSink};
use crate::wal::Wal;

use delay::CrisisAlert;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

/// Who asked for a lifecycle change. Recorded in audit metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSource {
    Manual,
    Autopilot,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionSource::Manual => "manual",
            ActionSource::Autopilot => "autopilot",
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends: wait for one, drain whatever else is
/// already queued, fsync once, answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

pub struct Engine {
    store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    messages: Arc<dyn MessageSink>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    /// Last crisis alert per provider, for throttling.
    crisis_alerts: DashMap<Ulid, CrisisAlert>,
    /// Appointments already escalated to admins, with the instant it happened.
    escalated: DashMap<Ulid, Ms>,
    /// One autopilot cycle at a time per business.
    cycle_guards: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serializes lease check-and-renew.
    lease_gate: Mutex<()>,
    /// Writers share it; compaction takes it exclusively so no event lands
    /// between the snapshot and the swap.
    persist_gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            notify,
            messages: Arc::new(LogMessageSink),
            audit: Arc::new(LogAuditSink),
            clock: Arc::new(SystemClock),
            crisis_alerts: DashMap::new(),
            escalated: DashMap::new(),
            cycle_guards: DashMap::new(),
            lease_gate: Mutex::new(()),
            persist_gate: RwLock::new(()),
        };

        for event in &events {
            engine.store.replay(event);
        }
        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                businesses = engine.store.business_count(),
                providers = engine.store.provider_count(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    pub fn with_sinks(mut self, messages: Arc<dyn MessageSink>, audit: Arc<dyn AuditSink>) -> Self {
        self.messages = messages;
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify for an event scoped to one provider.
    async fn persist_for_provider(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        let _gate = self.persist_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_to_provider(ps, event);
        self.notify.send(ps.provider.id, event);
        Ok(())
    }

    /// WAL-append + apply + notify for an event that lives at map level.
    async fn persist_global(&self, channel: Ulid, event: &Event) -> Result<(), EngineError> {
        let _gate = self.persist_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply(event);
        self.notify.send(channel, event);
        Ok(())
    }

    /// WAL-append + apply + notify for an event moving an appointment between providers.
    async fn persist_reassignment(
        &self,
        from: &mut ProviderState,
        to: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        let _gate = self.persist_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_reassignment(from, to, event);
        self.notify.send(from.provider.id, event);
        self.notify.send(to.provider.id, event);
        Ok(())
    }

    pub(crate) fn provider_state(&self, id: &Ulid) -> Result<SharedProviderState, EngineError> {
        self.store.provider(id).ok_or(EngineError::NotFound(*id))
    }

    pub(crate) fn business_record(&self, id: &Ulid) -> Result<Business, EngineError> {
        self.store.business(id).ok_or(EngineError::NotFound(*id))
    }

    /// Lookup appointment → provider, acquire that provider's write lock.
    async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let provider_id = self
            .store
            .provider_for(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let state = self.provider_state(&provider_id)?;
        Ok(state.write_owned().await)
    }

    /// Lock two providers in id order.
    async fn lock_pair(
        &self,
        a: Ulid,
        b: Ulid,
    ) -> Result<(OwnedRwLockWriteGuard<ProviderState>, OwnedRwLockWriteGuard<ProviderState>), EngineError> {
        if a == b {
            return Err(EngineError::InvalidInput("source and target provider are the same"));
        }
        let state_a = self.provider_state(&a)?;
        let state_b = self.provider_state(&b)?;
        if a < b {
            let ga = state_a.write_owned().await;
            let gb = state_b.write_owned().await;
            Ok((ga, gb))
        } else {
            let gb = state_b.write_owned().await;
            let ga = state_a.write_owned().await;
            Ok((ga, gb))
        }
    }

    fn audit_action(&self, name: &str, payload: serde_json::Value, source: ActionSource) {
        self.audit.log_event(
            name,
            payload,
            json!({ "source": source.as_str(), "at": self.now_ms() }),
        );
    }

    // ── Compaction ───────────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as one upsert per live entity. Returns `None` when a
    /// provider was mid-write and the attempt should be retried later.
    pub async fn compact_wal(&self) -> Result<Option<usize>, EngineError> {
        let _gate = self.persist_gate.write().await;
        let Some(events) = self.store.try_snapshot() else {
            return Ok(None);
        };
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(Some(count))
    }
}
