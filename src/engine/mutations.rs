use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{Availability, ProviderConstraints, SearchHorizon};
use super::delay::{DelayReport, Transition, Trigger, plan_trigger};
use super::window::{DayContext, is_free};
use super::{ActionSource, Engine, EngineError};

/// Default session length when neither the request nor a skill says otherwise.
pub const DEFAULT_DURATION_MINUTES: u32 = 30;

/// How far ahead a rejected booking looks for an alternative.
const SUGGESTION_DAYS: u32 = 7;

/// Booking request. `duration_minutes: None` resolves from the provider's
/// skill matching `treatment`, then the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub provider_id: Ulid,
    pub scheduled_start: Ms,
    pub duration_minutes: Option<u32>,
    pub treatment: Option<String>,
    pub required_skills: Vec<String>,
}

/// The editable profile of a provider. Hours, breaks and skills have their
/// own operations and survive a profile update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub contact: Option<String>,
    pub buffer_minutes: u16,
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_contact(contact: Option<&str>) -> Result<(), EngineError> {
    if contact.is_some_and(|c| c.len() > MAX_CONTACT_LEN) {
        return Err(EngineError::LimitExceeded("contact too long"));
    }
    Ok(())
}

pub(super) fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::InvalidInput("timestamp out of range"));
    }
    Ok(())
}

fn validate_minute_range(start: u16, end: u32) -> Result<(), EngineError> {
    if end > 24 * 60 || u32::from(start) >= end {
        return Err(EngineError::InvalidInput("invalid minute range"));
    }
    Ok(())
}

impl Engine {
    // ── Businesses & clients ─────────────────────────────────

    pub async fn upsert_business(&self, business: Business) -> Result<(), EngineError> {
        validate_name(&business.name)?;
        if business.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(EngineError::InvalidInput("utc offset out of range"));
        }
        if business.admin_contacts.len() > MAX_ADMIN_CONTACTS {
            return Err(EngineError::LimitExceeded("too many admin contacts"));
        }
        for contact in &business.admin_contacts {
            validate_contact(Some(contact))?;
        }
        if business.warning_pct == 0 || business.warning_pct > business.critical_pct {
            return Err(EngineError::InvalidInput("warning band must be positive and not above critical"));
        }
        if self.store.business(&business.id).is_none() && self.store.business_count() >= MAX_BUSINESSES {
            return Err(EngineError::LimitExceeded("too many businesses"));
        }

        let channel = business.id;
        self.persist_global(channel, &Event::BusinessUpserted(business))
            .await
    }

    pub async fn upsert_client(&self, client: Client) -> Result<(), EngineError> {
        validate_name(&client.name)?;
        validate_contact(client.contact.as_deref())?;
        self.business_record(&client.business_id)?;
        if let Some(existing) = self.store.client(&client.id)
            && existing.business_id != client.business_id
        {
            return Err(EngineError::InvalidInput("client belongs to another business"));
        }
        let channel = client.business_id;
        self.persist_global(channel, &Event::ClientUpserted(client)).await
    }

    // ── Providers ────────────────────────────────────────────

    /// Create a provider, or update the profile of an existing one.
    pub async fn upsert_provider(&self, profile: ProviderProfile) -> Result<(), EngineError> {
        validate_name(&profile.name)?;
        validate_contact(profile.contact.as_deref())?;
        if profile.buffer_minutes > MAX_BUFFER_MINUTES {
            return Err(EngineError::LimitExceeded("buffer too long"));
        }
        self.business_record(&profile.business_id)?;

        if self.store.contains_provider(&profile.id) {
            return self
                .update_provider(profile.id, |p| {
                    if p.business_id != profile.business_id {
                        return Err(EngineError::InvalidInput("provider belongs to another business"));
                    }
                    p.name = profile.name;
                    p.contact = profile.contact;
                    p.buffer = BufferPolicy::minutes(profile.buffer_minutes);
                    Ok(())
                })
                .await;
        }

        if self.store.provider_count() >= MAX_PROVIDERS {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        let mut provider = Provider::new(profile.id, profile.business_id, profile.name);
        provider.contact = profile.contact;
        provider.buffer = BufferPolicy::minutes(profile.buffer_minutes);
        self.persist_global(provider.id, &Event::ProviderUpserted(provider))
            .await
    }

    /// Clone-modify-persist under the provider's write lock.
    async fn update_provider(
        &self,
        id: Ulid,
        change: impl FnOnce(&mut Provider) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let state = self.provider_state(&id)?;
        let mut guard = state.write().await;
        let mut provider = guard.provider.clone();
        change(&mut provider)?;
        if provider == guard.provider {
            return Ok(());
        }
        self.persist_for_provider(&mut guard, &Event::ProviderUpserted(provider))
            .await
    }

    /// Providers are never hard-deleted.
    pub async fn deactivate_provider(&self, id: Ulid) -> Result<(), EngineError> {
        self.update_provider(id, |p| {
            p.active = false;
            p.online = false;
            Ok(())
        })
        .await?;
        tracing::info!(provider = %id, "provider deactivated");
        Ok(())
    }

    pub async fn set_presence(&self, id: Ulid, online: bool) -> Result<(), EngineError> {
        self.update_provider(id, |p| {
            if online && !p.active {
                return Err(EngineError::Inactive(p.id));
            }
            p.online = online;
            Ok(())
        })
        .await
    }

    pub async fn set_working_hours(&self, provider_id: Ulid, hours: WorkingHours) -> Result<(), EngineError> {
        if hours.weekday > 6 {
            return Err(EngineError::InvalidInput("weekday must be 0..=6"));
        }
        validate_minute_range(hours.start_minute, u32::from(hours.end_minute))?;
        self.update_provider(provider_id, |p| {
            p.set_hours(hours);
            Ok(())
        })
        .await
    }

    pub async fn add_break(&self, provider_id: Ulid, brk: Break) -> Result<(), EngineError> {
        if brk.weekday > 6 {
            return Err(EngineError::InvalidInput("weekday must be 0..=6"));
        }
        if brk.duration_minutes == 0 {
            return Err(EngineError::InvalidInput("break duration must be positive"));
        }
        validate_minute_range(
            brk.start_minute,
            u32::from(brk.start_minute) + u32::from(brk.duration_minutes),
        )?;
        if brk.label.as_ref().is_some_and(|l| l.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("break label too long"));
        }
        self.update_provider(provider_id, |p| {
            if p.breaks.iter().any(|b| b.id == brk.id) {
                return Err(EngineError::AlreadyExists(brk.id));
            }
            if p.breaks.len() >= MAX_BREAKS_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("too many breaks"));
            }
            p.breaks.push(brk);
            Ok(())
        })
        .await
    }

    /// Returns the provider the break belonged to.
    pub async fn remove_break(&self, break_id: Ulid) -> Result<Ulid, EngineError> {
        for entry in self.store.businesses() {
            for provider_id in self.store.provider_ids(&entry.id) {
                let state = self.provider_state(&provider_id)?;
                let owns = state.read().await.provider.breaks.iter().any(|b| b.id == break_id);
                if owns {
                    self.update_provider(provider_id, |p| {
                        p.breaks.retain(|b| b.id != break_id);
                        Ok(())
                    })
                    .await?;
                    return Ok(provider_id);
                }
            }
        }
        Err(EngineError::NotFound(break_id))
    }

    /// Add a skill or replace the overrides of an existing one (same code, any case).
    pub async fn upsert_skill(&self, provider_id: Ulid, skill: Skill) -> Result<(), EngineError> {
        if skill.code.is_empty() {
            return Err(EngineError::InvalidInput("skill code must not be empty"));
        }
        if skill.code.len() > MAX_SKILL_CODE_LEN {
            return Err(EngineError::LimitExceeded("skill code too long"));
        }
        if skill.duration_minutes.is_some_and(|d| d == 0 || d > MAX_APPOINTMENT_MINUTES) {
            return Err(EngineError::InvalidInput("skill duration out of range"));
        }
        self.update_provider(provider_id, |p| {
            let count = p.skills.len();
            match p.skills.iter_mut().find(|s| s.code.eq_ignore_ascii_case(&skill.code)) {
                Some(existing) => *existing = skill,
                None if count >= MAX_SKILLS_PER_PROVIDER => {
                    return Err(EngineError::LimitExceeded("too many skills"));
                }
                None => p.skills.push(skill),
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_skill(&self, provider_id: Ulid, code: &str) -> Result<(), EngineError> {
        self.update_provider(provider_id, |p| {
            p.skills.retain(|s| !s.code.eq_ignore_ascii_case(code));
            Ok(())
        })
        .await
    }

    // ── Booking ──────────────────────────────────────────────

    /// Book a pending appointment. Rejects windows that are not free,
    /// carrying the next slot in the error.
    pub async fn book_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        validate_timestamp(req.scheduled_start)?;
        if req.required_skills.len() > MAX_REQUIRED_SKILLS {
            return Err(EngineError::LimitExceeded("too many required skills"));
        }
        if req.treatment.as_ref().is_some_and(|t| t.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("treatment name too long"));
        }
        if self.store.provider_for(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let state = self.provider_state(&req.provider_id)?;
        let mut guard = state.write().await;
        let provider = &guard.provider;
        if !provider.active {
            return Err(EngineError::Inactive(provider.id));
        }
        let business = self.business_record(&provider.business_id)?;
        let client = self
            .store
            .client(&req.client_id)
            .ok_or(EngineError::NotFound(req.client_id))?;
        if client.business_id != business.id {
            return Err(EngineError::InvalidInput("client belongs to another business"));
        }
        if !provider.has_skills(&req.required_skills) {
            return Err(EngineError::InvalidInput("provider lacks a required skill"));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many appointments on provider"));
        }

        let duration_minutes = req
            .duration_minutes
            .or_else(|| {
                req.treatment
                    .as_deref()
                    .and_then(|t| provider.skill(t))
                    .and_then(|s| s.duration_minutes)
            })
            .unwrap_or(DEFAULT_DURATION_MINUTES);
        if duration_minutes == 0 || duration_minutes > MAX_APPOINTMENT_MINUTES {
            return Err(EngineError::InvalidInput("duration out of range"));
        }

        let appointment = Appointment {
            id: req.id,
            business_id: business.id,
            client_id: client.id,
            provider_id: provider.id,
            scheduled_start: req.scheduled_start,
            duration_minutes,
            treatment: req.treatment,
            required_skills: req.required_skills,
            status: AppointmentStatus::Pending,
            actual_start: None,
            actual_end: None,
            delay_minutes: 0,
            notifications_sent: 0,
            reminder_sent: false,
            shifted_from_id: None,
        };

        let now = self.now_ms();
        let horizon = SearchHorizon::Days(SUGGESTION_DAYS);
        let search = Span::new(appointment.scheduled_start, appointment.scheduled_start + horizon.span_ms());
        let constraints = ProviderConstraints::capture(&guard, business.utc_offset_minutes, search);
        let check = constraints.check(appointment.span(), Some(now));
        if !check.is_free() {
            let suggested = constraints.next_slot(appointment.scheduled_start, duration_minutes, horizon, now);
            return Err(EngineError::Unavailable(Availability::from_check(check, suggested)));
        }

        self.persist_for_provider(&mut guard, &Event::AppointmentBooked(appointment.clone()))
            .await?;
        Ok(appointment)
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// pending → active. Starting an active appointment again is a no-op.
    pub async fn start_appointment(&self, id: Ulid, source: ActionSource) -> Result<Transition, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let apt = guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))?;
        match apt.status {
            AppointmentStatus::Pending => {}
            AppointmentStatus::Active => return Ok(Transition::AlreadyApplied),
            from => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from,
                    to: AppointmentStatus::Active,
                });
            }
        }

        let business = self.business_record(&apt.business_id)?;
        let now = self.now_ms();
        let plan = plan_trigger(&guard, &apt, Trigger::Start { at: now }, business.utc_offset_minutes);
        let event = Event::AppointmentStarted {
            id,
            provider_id: guard.provider.id,
            actual_start: now,
            delay_minutes: plan.trigger_delay,
            ripple: plan.updates(),
        };
        self.persist_for_provider(&mut guard, &event).await?;
        let provider = guard.provider.clone();
        drop(guard);

        self.audit_action(
            "APPOINTMENT_STARTED",
            json!({ "appointment_id": id.to_string(), "delay_minutes": plan.trigger_delay }),
            source,
        );
        let notices = self.after_ripple(&business, &provider, id, &plan).await;
        Ok(Transition::Applied(DelayReport {
            appointment_id: id,
            delay_minutes: plan.trigger_delay,
            assessment: plan.assessment,
            rippled: plan.staged.len(),
            notices,
        }))
    }

    /// active → completed. Ending a completed appointment again is a no-op.
    pub async fn end_appointment(&self, id: Ulid, source: ActionSource) -> Result<Transition, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let apt = guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))?;
        match apt.status {
            AppointmentStatus::Active => {}
            AppointmentStatus::Completed => return Ok(Transition::AlreadyApplied),
            from => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from,
                    to: AppointmentStatus::Completed,
                });
            }
        }

        let business = self.business_record(&apt.business_id)?;
        let now = self.now_ms();
        let plan = plan_trigger(&guard, &apt, Trigger::End { at: now }, business.utc_offset_minutes);
        let event = Event::AppointmentEnded {
            id,
            provider_id: guard.provider.id,
            actual_end: now,
            delay_minutes: plan.trigger_delay,
            ripple: plan.updates(),
        };
        self.persist_for_provider(&mut guard, &event).await?;
        let provider = guard.provider.clone();
        drop(guard);

        self.audit_action(
            "APPOINTMENT_COMPLETED",
            json!({ "appointment_id": id.to_string(), "delay_minutes": plan.trigger_delay }),
            source,
        );
        let notices = self.after_ripple(&business, &provider, id, &plan).await;
        Ok(Transition::Applied(DelayReport {
            appointment_id: id,
            delay_minutes: plan.trigger_delay,
            assessment: plan.assessment,
            rippled: plan.staged.len(),
            notices,
        }))
    }

    /// Close a pending appointment as cancelled, no-show or shifted.
    /// Repeating the same close is a no-op.
    pub async fn close_appointment(
        &self,
        id: Ulid,
        reason: CloseReason,
        source: ActionSource,
    ) -> Result<(), EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let apt = guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))?;
        let to = reason.status();
        if apt.status == to {
            return Ok(());
        }
        if apt.status != AppointmentStatus::Pending {
            return Err(EngineError::InvalidTransition { id, from: apt.status, to });
        }

        let event = Event::AppointmentClosed {
            id,
            provider_id: guard.provider.id,
            status: to,
        };
        self.persist_for_provider(&mut guard, &event).await?;
        drop(guard);

        self.audit_action(
            "APPOINTMENT_CLOSED",
            json!({ "appointment_id": id.to_string(), "status": to.as_str() }),
            source,
        );
        Ok(())
    }

    // ── Transfers ────────────────────────────────────────────

    pub async fn request_transfer(
        &self,
        id: Ulid,
        appointment_id: Ulid,
        receiver_id: Ulid,
    ) -> Result<TransferRequest, EngineError> {
        if self.store.transfer(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let sender_id = self
            .store
            .provider_for(&appointment_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        if sender_id == receiver_id {
            return Err(EngineError::InvalidInput("cannot transfer to the current provider"));
        }

        let apt = {
            let state = self.provider_state(&sender_id)?;
            let guard = state.read().await;
            guard
                .appointment(appointment_id)
                .cloned()
                .ok_or(EngineError::NotFound(appointment_id))?
        };
        if apt.status != AppointmentStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: appointment_id,
                from: apt.status,
                to: AppointmentStatus::Pending,
            });
        }
        let receiver = self.provider_state(&receiver_id)?.read().await.provider.clone();
        if !receiver.active {
            return Err(EngineError::Inactive(receiver_id));
        }
        if receiver.business_id != apt.business_id {
            return Err(EngineError::InvalidInput("receiver belongs to another business"));
        }
        let pending = self
            .store
            .transfers_for(&appointment_id)
            .into_iter()
            .filter(|t| t.status == TransferStatus::Pending)
            .count();
        if pending >= MAX_PENDING_TRANSFERS_PER_APPOINTMENT {
            return Err(EngineError::LimitExceeded("too many pending transfers"));
        }

        let request = TransferRequest {
            id,
            appointment_id,
            sender_id,
            receiver_id,
            status: TransferStatus::Pending,
            created_at: self.now_ms(),
        };
        self.persist_global(receiver_id, &Event::TransferRequested(request.clone()))
            .await?;
        Ok(request)
    }

    /// Accept or reject a pending transfer. Accepting moves the appointment
    /// and rejects every other pending request for it.
    pub async fn resolve_transfer(&self, id: Ulid, accept: bool, source: ActionSource) -> Result<(), EngineError> {
        let request = self.store.transfer(&id).ok_or(EngineError::NotFound(id))?;
        if request.status != TransferStatus::Pending {
            return Err(EngineError::InvalidInput("transfer already resolved"));
        }

        if !accept {
            self.persist_global(request.receiver_id, &Event::TransferRejected { id })
                .await?;
            self.audit_action("TRANSFER_REJECTED", json!({ "transfer_id": id.to_string() }), source);
            return Ok(());
        }

        let from_id = self
            .store
            .provider_for(&request.appointment_id)
            .ok_or(EngineError::NotFound(request.appointment_id))?;
        let (mut from, mut to) = self.lock_pair(from_id, request.receiver_id).await?;
        // A sibling accept may have resolved this request or moved the
        // appointment while the locks were contended.
        if self.store.transfer(&id).is_none_or(|t| t.status != TransferStatus::Pending) {
            return Err(EngineError::InvalidInput("transfer already resolved"));
        }
        if self.store.provider_for(&request.appointment_id) != Some(from_id) {
            return Err(EngineError::InvalidInput("appointment moved while resolving transfer"));
        }
        let apt = from
            .appointment(request.appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(request.appointment_id))?;
        if apt.status != AppointmentStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: apt.id,
                from: apt.status,
                to: AppointmentStatus::Pending,
            });
        }
        if !to.provider.active {
            return Err(EngineError::Inactive(to.provider.id));
        }
        if !to.provider.has_skills(&apt.required_skills) {
            return Err(EngineError::InvalidInput("receiver lacks a required skill"));
        }

        let business = self.business_record(&apt.business_id)?;
        let day = crate::calendar::LocalDay::of(apt.scheduled_start, business.utc_offset_minutes);
        let ctx = DayContext::build(&to.provider, &to.appointments, day, None, |a| {
            matches!(a.status, AppointmentStatus::Pending | AppointmentStatus::Active)
        });
        let check = is_free(&ctx, apt.span(), None);
        if !check.is_free() {
            let constraints = ProviderConstraints::capture(&to, business.utc_offset_minutes, apt.span());
            let suggested = constraints.next_slot(
                apt.scheduled_start,
                apt.duration_minutes,
                SearchHorizon::SameDay,
                self.now_ms(),
            );
            return Err(EngineError::Unavailable(Availability::from_check(check, suggested)));
        }

        let rejected: Vec<Ulid> = self
            .store
            .transfers_for(&apt.id)
            .into_iter()
            .filter(|t| t.id != id && t.status == TransferStatus::Pending)
            .map(|t| t.id)
            .collect();
        let event = Event::TransferAccepted {
            id,
            appointment_id: apt.id,
            from_provider: from_id,
            to_provider: request.receiver_id,
            rejected,
        };
        self.persist_reassignment(&mut from, &mut to, &event).await?;
        let staged_from = self.recalculate_locked(&mut from, day).await?;
        let staged_to = self.recalculate_locked(&mut to, day).await?;
        let (from_provider, to_provider) = (from.provider.clone(), to.provider.clone());
        drop(from);
        drop(to);

        metrics::counter!(crate::observability::REASSIGNMENTS_TOTAL, "mode" => "transfer").increment(1);
        self.audit_action(
            "TRANSFER_ACCEPTED",
            json!({
                "transfer_id": id.to_string(),
                "appointment_id": apt.id.to_string(),
                "from_provider": from_id.to_string(),
                "to_provider": request.receiver_id.to_string(),
            }),
            source,
        );
        self.announce_reassignment(&business, &apt, &from_provider, &to_provider)
            .await;
        self.dispatch_notices(&business, &from_provider, &staged_from).await;
        self.dispatch_notices(&business, &to_provider, &staged_to).await;
        Ok(())
    }
}
