//! Lifecycle autopilot: start due sessions and end finished ones so the
//! schedule tracks reality without anyone pressing buttons.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use ulid::Ulid;

use crate::calendar::LocalDay;
use crate::config::AutopilotConfig;
use crate::model::*;
use crate::observability::{AUTOPILOT_CYCLES_TOTAL, AUTOPILOT_TASKS_TOTAL};

use super::{ActionSource, Engine, EngineError};

/// Sessions overdue by more than this are closed as stuck.
pub const STUCK_MINUTES: u32 = 120;
/// How far ahead a free provider may pick up their next client.
pub const EARLY_START_MINUTES: Ms = 5;

/// Stable per-appointment jitter in -2..=6 minutes, so not every session
/// ends exactly on the minute.
pub fn variance_minutes(id: &Ulid) -> i64 {
    let sum: u64 = id.to_string().bytes().map(u64::from).sum();
    (sum % 9) as i64 - 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Start,
    End,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Start => "start",
            TaskKind::End => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskReason {
    Due,
    EarlyStart,
    Stuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutopilotTask {
    pub kind: TaskKind,
    pub reason: TaskReason,
    pub appointment_id: Ulid,
    pub provider_id: Ulid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePlan {
    pub ends: Vec<AutopilotTask>,
    pub starts: Vec<AutopilotTask>,
}

impl CyclePlan {
    pub fn is_empty(&self) -> bool {
        self.ends.is_empty() && self.starts.is_empty()
    }

    /// Ends first, then starts.
    pub fn tasks(&self) -> impl Iterator<Item = &AutopilotTask> {
        self.ends.iter().chain(self.starts.iter())
    }
}

/// Decide what one cycle does. `appointments` are the business's pending
/// and active appointments for today, in any order.
pub fn plan_cycle(appointments: &[Appointment], now: Ms, early_start: bool) -> CyclePlan {
    let mut plan = CyclePlan::default();
    let mut busy: HashSet<Ulid> = HashSet::new();

    for a in appointments.iter().filter(|a| a.status == AppointmentStatus::Active) {
        busy.insert(a.provider_id);
        let Some(expected_end) = a.expected_end() else { continue };
        if now < expected_end + variance_minutes(&a.id) * MINUTE_MS {
            continue;
        }
        let reason = if minutes_between(expected_end, now) > STUCK_MINUTES {
            TaskReason::Stuck
        } else {
            TaskReason::Due
        };
        plan.ends.push(AutopilotTask {
            kind: TaskKind::End,
            reason,
            appointment_id: a.id,
            provider_id: a.provider_id,
        });
    }

    let mut pending: Vec<&Appointment> = appointments
        .iter()
        .filter(|a| a.status == AppointmentStatus::Pending)
        .collect();
    pending.sort_by_key(|a| a.scheduled_start);

    // Only each provider's earliest pending appointment is considered.
    let mut considered: HashSet<Ulid> = HashSet::new();
    for a in pending {
        if busy.contains(&a.provider_id) || !considered.insert(a.provider_id) {
            continue;
        }
        let reason = if a.scheduled_start <= now {
            TaskReason::Due
        } else if early_start && a.scheduled_start - now <= EARLY_START_MINUTES * MINUTE_MS {
            TaskReason::EarlyStart
        } else {
            continue;
        };
        plan.starts.push(AutopilotTask {
            kind: TaskKind::Start,
            reason,
            appointment_id: a.id,
            provider_id: a.provider_id,
        });
    }

    plan
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another instance holds the lease.
    Standby,
    /// A cycle for this business is already running.
    Overlapping,
    Ran {
        ended: usize,
        started: usize,
        failed: usize,
        reminded: usize,
        suggested: usize,
        reassigned: usize,
    },
}

impl Engine {
    /// One autopilot pass over a business. Does nothing unless this instance
    /// holds (or can take) the business lease.
    pub async fn run_autopilot_cycle(
        &self,
        business_id: Ulid,
        instance_id: &str,
        config: &AutopilotConfig,
    ) -> Result<CycleOutcome, EngineError> {
        let business = self.business_record(&business_id)?;
        if !self.try_acquire_lease(business_id, instance_id).await? {
            metrics::counter!(AUTOPILOT_CYCLES_TOTAL, "role" => "standby").increment(1);
            return Ok(CycleOutcome::Standby);
        }

        let guard = Arc::clone(self.cycle_guards.entry(business_id).or_default().value());
        let Ok(_running) = guard.try_lock() else {
            return Ok(CycleOutcome::Overlapping);
        };
        metrics::counter!(AUTOPILOT_CYCLES_TOTAL, "role" => "leader").increment(1);

        let now = self.now_ms();
        let day = LocalDay::of(now, business.utc_offset_minutes);
        let mut today = Vec::new();
        for provider_id in self.store.provider_ids(&business_id) {
            let state = self.provider_state(&provider_id)?;
            let ps = state.read().await;
            today.extend(
                ps.starting_within(&day.span())
                    .filter(|a| matches!(a.status, AppointmentStatus::Pending | AppointmentStatus::Active))
                    .cloned(),
            );
        }

        let plan = plan_cycle(&today, now, config.early_start);
        let (mut ended, mut started, mut failed) = (0, 0, 0);
        for (i, task) in plan.tasks().enumerate() {
            if i > 0 && !config.pacing.is_zero() {
                tokio::time::sleep(config.pacing).await;
            }
            if task.reason == TaskReason::Stuck {
                tracing::warn!(appointment = %task.appointment_id, "closing stuck session");
            }
            let result = match task.kind {
                TaskKind::End => self.end_appointment(task.appointment_id, ActionSource::Autopilot).await,
                TaskKind::Start => self.start_appointment(task.appointment_id, ActionSource::Autopilot).await,
            };
            match result {
                Ok(_) => {
                    metrics::counter!(AUTOPILOT_TASKS_TOTAL, "kind" => task.kind.as_str(), "status" => "ok")
                        .increment(1);
                    match task.kind {
                        TaskKind::End => ended += 1,
                        TaskKind::Start => started += 1,
                    }
                }
                Err(e) => {
                    metrics::counter!(AUTOPILOT_TASKS_TOTAL, "kind" => task.kind.as_str(), "status" => "error")
                        .increment(1);
                    tracing::warn!(appointment = %task.appointment_id, "autopilot {} failed: {e}", task.kind.as_str());
                    failed += 1;
                }
            }
        }

        let reminded = self.send_reminders(&business).await?;

        let (suggested, reassigned) = match business.rebalance_mode {
            RebalanceMode::Off => (0, 0),
            RebalanceMode::Suggest => {
                let proposals = self.smart_reassignments(business_id).await?;
                for r in &proposals {
                    self.audit_action(
                        "REASSIGNMENT_SUGGESTED",
                        json!({
                            "appointment_id": r.appointment_id.to_string(),
                            "from_provider": r.from_provider.to_string(),
                            "to_provider": r.to_provider.to_string(),
                            "delay_minutes": r.delay_minutes,
                        }),
                        ActionSource::Autopilot,
                    );
                }
                (proposals.len(), 0)
            }
            RebalanceMode::Apply => {
                let applied = self
                    .apply_reassignments(business_id, None, ActionSource::Autopilot)
                    .await?;
                (0, applied.len())
            }
        };

        if !plan.is_empty() || reminded > 0 || reassigned > 0 {
            tracing::info!(business = %business_id, ended, started, failed, reminded, reassigned, "autopilot cycle");
        }
        Ok(CycleOutcome::Ran {
            ended,
            started,
            failed,
            reminded,
            suggested,
            reassigned,
        })
    }
}
