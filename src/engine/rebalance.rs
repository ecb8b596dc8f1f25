//! Workload rebalancing: manual shifts, smart reassignment of delayed
//! appointments, escalation and system health.

use serde_json::json;
use ulid::Ulid;

use crate::calendar::{LocalDay, format_hhmm};
use crate::model::*;
use crate::observability::REASSIGNMENTS_TOTAL;

use super::window::{DayContext, is_free};
use super::{ActionSource, Engine, EngineError};

/// Pending appointments later than this are candidates for reassignment.
pub const REASSIGN_AFTER_MINUTES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    pub appointment_id: Ulid,
    pub from_provider: Ulid,
    pub to_provider: Ulid,
    pub scheduled_start: Ms,
    pub delay_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// An appointment whose provider's queue runs past their remaining shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtRisk {
    pub appointment_id: Ulid,
    pub provider_id: Ulid,
    pub scheduled_start: Ms,
    pub queue_minutes: u64,
    pub capacity_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemHealth {
    pub business_id: Ulid,
    pub status: HealthStatus,
    pub online_providers: usize,
    pub capacity_minutes: u64,
    pub load_minutes: u64,
    /// `None` when there is no capacity to compare against.
    pub load_pct: Option<u32>,
    pub at_risk: Vec<AtRisk>,
}

/// A provider and their appointments on one local day.
#[derive(Debug, Clone)]
pub struct DaySnapshot {
    pub provider: Provider,
    pub appointments: Vec<Appointment>,
}

fn takes_slot(a: &Appointment) -> bool {
    matches!(a.status, AppointmentStatus::Pending | AppointmentStatus::Active)
}

/// Skills a candidate must hold to take `apt`. Without explicit requirements
/// a treatment that names a skill offered in the business requires that skill.
fn effective_skills(apt: &Appointment, snapshots: &[DaySnapshot]) -> Vec<String> {
    if !apt.required_skills.is_empty() {
        return apt.required_skills.clone();
    }
    match apt.treatment.as_deref() {
        Some(t) if snapshots.iter().any(|s| s.provider.skill(t).is_some()) => vec![t.to_string()],
        _ => Vec::new(),
    }
}

/// Propose a new provider for every pending appointment more than
/// `REASSIGN_AFTER_MINUTES` late. Returns the proposals and the ids no
/// provider could take.
pub fn plan_reassignments(snapshots: &[DaySnapshot], day: LocalDay) -> (Vec<Reassignment>, Vec<Ulid>) {
    let mut contexts: Vec<Option<DayContext>> = snapshots
        .iter()
        .map(|s| {
            (s.provider.online && s.provider.active)
                .then(|| DayContext::build(&s.provider, &s.appointments, day, None, takes_slot))
        })
        .collect();

    let mut delayed: Vec<&Appointment> = snapshots
        .iter()
        .flat_map(|s| s.appointments.iter())
        .filter(|a| a.status == AppointmentStatus::Pending && a.delay_minutes > REASSIGN_AFTER_MINUTES)
        .collect();
    delayed.sort_by_key(|a| a.scheduled_start);

    let mut proposals = Vec::new();
    let mut stranded = Vec::new();
    for apt in delayed {
        let required = effective_skills(apt, snapshots);
        let found = snapshots.iter().zip(contexts.iter_mut()).find(|(s, ctx)| {
            s.provider.id != apt.provider_id
                && s.provider.has_skills(&required)
                && ctx
                    .as_ref()
                    .is_some_and(|c| is_free(c, apt.span(), None).is_free())
        });
        match found {
            Some((s, Some(ctx))) => {
                ctx.occupied.push(apt.span());
                ctx.occupied.sort_by_key(|o| o.start);
                proposals.push(Reassignment {
                    appointment_id: apt.id,
                    from_provider: apt.provider_id,
                    to_provider: s.provider.id,
                    scheduled_start: apt.scheduled_start,
                    delay_minutes: apt.delay_minutes,
                });
            }
            _ => stranded.push(apt.id),
        }
    }
    (proposals, stranded)
}

/// Minutes a provider can still work on `day` after `now`.
fn remaining_capacity(ctx: &DayContext, now: Ms) -> u64 {
    let Some(shift) = ctx.shift else { return 0 };
    let from = shift.start.max(now);
    if from >= shift.end {
        return 0;
    }
    let remaining = Span::new(from, shift.end);
    let on_break: Ms = ctx
        .breaks
        .iter()
        .filter(|b| b.overlaps(&remaining))
        .map(|b| b.end.min(remaining.end) - b.start.max(remaining.start))
        .sum();
    ((remaining.duration_ms() - on_break).max(0) / MINUTE_MS) as u64
}

/// Remaining work of an appointment as seen at `now`.
fn load_minutes(a: &Appointment, now: Ms) -> u64 {
    match (a.status, a.expected_end()) {
        (AppointmentStatus::Active, Some(end)) => minutes_between(now, end) as u64,
        _ => a.duration_minutes as u64,
    }
}

pub fn assess_health(business: &Business, snapshots: &[DaySnapshot], day: LocalDay, now: Ms) -> SystemHealth {
    let mut capacity = 0u64;
    let mut load = 0u64;
    let mut online = 0usize;
    let mut at_risk = Vec::new();

    for s in snapshots.iter().filter(|s| s.provider.online && s.provider.active) {
        online += 1;
        let ctx = DayContext::build(&s.provider, &s.appointments, day, None, takes_slot);
        let provider_capacity = remaining_capacity(&ctx, now);
        capacity += provider_capacity;

        let mut queue = 0u64;
        for a in s.appointments.iter().filter(|a| takes_slot(a)) {
            let minutes = load_minutes(a, now);
            queue += minutes;
            load += minutes;
            if a.status == AppointmentStatus::Pending && queue > provider_capacity {
                at_risk.push(AtRisk {
                    appointment_id: a.id,
                    provider_id: s.provider.id,
                    scheduled_start: a.scheduled_start,
                    queue_minutes: queue,
                    capacity_minutes: provider_capacity,
                });
            }
        }
    }

    let load_pct = (capacity > 0).then(|| (load * 100 / capacity).min(u32::MAX as u64) as u32);
    let status = match load_pct {
        _ if online == 0 => HealthStatus::Critical,
        None if load > 0 => HealthStatus::Critical,
        None => HealthStatus::Healthy,
        Some(pct) if pct >= business.critical_pct => HealthStatus::Critical,
        Some(pct) if pct > business.warning_pct => HealthStatus::Warning,
        Some(_) => HealthStatus::Healthy,
    };

    SystemHealth {
        business_id: business.id,
        status,
        online_providers: online,
        capacity_minutes: capacity,
        load_minutes: load,
        load_pct,
        at_risk,
    }
}

impl Engine {
    /// Copy every provider of a business with their appointments on `day`.
    async fn day_snapshots(&self, business_id: &Ulid, day: LocalDay) -> Result<Vec<DaySnapshot>, EngineError> {
        let mut snapshots = Vec::new();
        for provider_id in self.store.provider_ids(business_id) {
            let state = self.provider_state(&provider_id)?;
            let guard = state.read().await;
            snapshots.push(DaySnapshot {
                provider: guard.provider.clone(),
                appointments: guard.starting_within(&day.span()).cloned().collect(),
            });
        }
        Ok(snapshots)
    }

    /// Reassign a pending appointment to another provider without a
    /// feasibility check, then recompute both providers' day.
    pub async fn shift_appointment(
        &self,
        appointment_id: Ulid,
        to_provider: Ulid,
        source: ActionSource,
    ) -> Result<(), EngineError> {
        self.reassign(appointment_id, to_provider, source, "manual").await
    }

    async fn reassign(
        &self,
        appointment_id: Ulid,
        to_provider: Ulid,
        source: ActionSource,
        mode: &'static str,
    ) -> Result<(), EngineError> {
        let from_id = self
            .store
            .provider_for(&appointment_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        let (mut from, mut to) = self.lock_pair(from_id, to_provider).await?;
        let apt = from
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        if apt.status != AppointmentStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: appointment_id,
                from: apt.status,
                to: AppointmentStatus::Shifted,
            });
        }
        if to.provider.business_id != apt.business_id {
            return Err(EngineError::InvalidInput("target provider belongs to another business"));
        }
        if !to.provider.active {
            return Err(EngineError::Inactive(to_provider));
        }

        let business = self.business_record(&apt.business_id)?;
        let day = LocalDay::of(apt.scheduled_start, business.utc_offset_minutes);
        let event = Event::AppointmentReassigned {
            id: appointment_id,
            from_provider: from_id,
            to_provider,
        };
        self.persist_reassignment(&mut from, &mut to, &event).await?;
        let staged_from = self.recalculate_locked(&mut from, day).await?;
        let staged_to = self.recalculate_locked(&mut to, day).await?;
        let (from_provider, to_provider_rec) = (from.provider.clone(), to.provider.clone());
        drop(from);
        drop(to);

        metrics::counter!(REASSIGNMENTS_TOTAL, "mode" => mode).increment(1);
        tracing::info!(appointment = %appointment_id, from = %from_id, to = %to_provider, mode, "appointment reassigned");
        self.audit_action(
            "APPOINTMENT_SHIFTED",
            json!({
                "appointment_id": appointment_id.to_string(),
                "from_provider": from_id.to_string(),
                "to_provider": to_provider.to_string(),
                "mode": mode,
            }),
            source,
        );
        self.announce_reassignment(&business, &apt, &from_provider, &to_provider_rec)
            .await;
        self.dispatch_notices(&business, &from_provider, &staged_from).await;
        self.dispatch_notices(&business, &to_provider_rec, &staged_to).await;
        Ok(())
    }

    /// Tell the client and both providers about a move. Failures are logged.
    pub(super) async fn announce_reassignment(
        &self,
        business: &Business,
        apt: &Appointment,
        from: &Provider,
        to: &Provider,
    ) {
        let at = format_hhmm(apt.scheduled_start, business.utc_offset_minutes);
        let mut outbox: Vec<(String, String)> = Vec::new();
        if let Some(client) = self.store.client(&apt.client_id)
            && client.opted_in
            && let Some(contact) = client.contact
        {
            outbox.push((
                contact,
                format!("Hi {}, your {at} appointment will now be with {}.", client.name, to.name),
            ));
        }
        if let Some(contact) = &from.contact {
            outbox.push((contact.clone(), format!("Your {at} appointment has been moved to {}.", to.name)));
        }
        if let Some(contact) = &to.contact {
            outbox.push((contact.clone(), format!("You have taken over the {at} appointment from {}.", from.name)));
        }
        for (destination, text) in outbox {
            if let Err(e) = self.messages.send_message(&destination, &text).await {
                tracing::warn!(appointment = %apt.id, "reassignment notice failed: {e}");
            }
        }
    }

    /// Proposals for today's badly delayed appointments. Appointments no one
    /// can take are escalated to the business admins, once each.
    pub async fn smart_reassignments(&self, business_id: Ulid) -> Result<Vec<Reassignment>, EngineError> {
        let business = self.business_record(&business_id)?;
        let day = LocalDay::of(self.now_ms(), business.utc_offset_minutes);
        let snapshots = self.day_snapshots(&business_id, day).await?;
        self.prune_escalations(&snapshots);
        let (proposals, stranded) = plan_reassignments(&snapshots, day);

        for id in stranded {
            let Some(apt) = snapshots
                .iter()
                .flat_map(|s| s.appointments.iter())
                .find(|a| a.id == id)
            else {
                continue;
            };
            self.escalate(&business, apt).await;
        }
        Ok(proposals)
    }

    /// Forget escalations from earlier days and for sessions that are no
    /// longer waiting.
    fn prune_escalations(&self, snapshots: &[DaySnapshot]) {
        let now = self.now_ms();
        self.escalated.retain(|_, at| now - *at < DAY_MS);
        for a in snapshots.iter().flat_map(|s| s.appointments.iter()) {
            if a.status != AppointmentStatus::Pending {
                self.escalated.remove(&a.id);
            }
        }
    }

    async fn escalate(&self, business: &Business, apt: &Appointment) {
        let now = self.now_ms();
        if self.escalated.insert(apt.id, now).is_some() {
            return;
        }
        let text = format!(
            "{}: the {} appointment is {} mins late and no other provider is free to take it.",
            business.name,
            format_hhmm(apt.scheduled_start, business.utc_offset_minutes),
            apt.delay_minutes
        );
        for admin in &business.admin_contacts {
            if let Err(e) = self.messages.send_message(admin, &text).await {
                tracing::warn!(appointment = %apt.id, "escalation delivery failed: {e}");
            }
        }
        self.audit.log_event(
            "DELAY_ESCALATED",
            json!({
                "business_id": business.id.to_string(),
                "appointment_id": apt.id.to_string(),
                "delay_minutes": apt.delay_minutes,
            }),
            json!({ "at": now }),
        );
    }

    /// Apply current proposals, all of them or only the selected
    /// appointments. Proposals that no longer apply are skipped.
    pub async fn apply_reassignments(
        &self,
        business_id: Ulid,
        selection: Option<&[Ulid]>,
        source: ActionSource,
    ) -> Result<Vec<Reassignment>, EngineError> {
        let proposals = self.smart_reassignments(business_id).await?;
        let mut applied = Vec::new();
        for r in proposals {
            if selection.is_some_and(|ids| !ids.contains(&r.appointment_id)) {
                continue;
            }
            match self.reassign(r.appointment_id, r.to_provider, source, "smart").await {
                Ok(()) => applied.push(r),
                Err(e) => tracing::warn!(appointment = %r.appointment_id, "reassignment skipped: {e}"),
            }
        }
        Ok(applied)
    }

    pub async fn system_health(&self, business_id: Ulid) -> Result<SystemHealth, EngineError> {
        let business = self.business_record(&business_id)?;
        let now = self.now_ms();
        let day = LocalDay::of(now, business.utc_offset_minutes);
        let snapshots = self.day_snapshots(&business_id, day).await?;
        Ok(assess_health(&business, &snapshots, day, now))
    }
}
