use ulid::Ulid;

use crate::calendar::LocalDay;
use crate::limits::*;
use crate::model::*;

use super::availability::{Availability, ConstraintSet, ProviderConstraints, SearchHorizon, SlotRequest};
use super::mutations::validate_timestamp;
use super::{Engine, EngineError};

fn validate_duration(duration_minutes: u32) -> Result<(), EngineError> {
    if duration_minutes == 0 || duration_minutes > MAX_APPOINTMENT_MINUTES {
        return Err(EngineError::InvalidInput("duration out of range"));
    }
    Ok(())
}

fn validate_search(after: Ms, duration_minutes: u32, horizon: SearchHorizon) -> Result<(), EngineError> {
    validate_timestamp(after)?;
    validate_duration(duration_minutes)?;
    if horizon == SearchHorizon::Days(0) {
        return Err(EngineError::InvalidInput("search horizon must be at least one day"));
    }
    Ok(())
}

impl Engine {
    // ── Entity reads ─────────────────────────────────────────

    pub fn get_business(&self, id: &Ulid) -> Option<Business> {
        self.store.business(id)
    }

    pub fn list_businesses(&self) -> Vec<Business> {
        self.store.businesses()
    }

    pub fn get_client(&self, id: &Ulid) -> Option<Client> {
        self.store.client(id)
    }

    pub async fn get_provider(&self, id: &Ulid) -> Result<Provider, EngineError> {
        let state = self.provider_state(id)?;
        let guard = state.read().await;
        Ok(guard.provider.clone())
    }

    /// Providers of a business in listing order, deactivated ones included.
    pub async fn list_providers(&self, business_id: &Ulid) -> Result<Vec<Provider>, EngineError> {
        self.business_record(business_id)?;
        let mut providers = Vec::new();
        for id in self.store.provider_ids(business_id) {
            providers.push(self.get_provider(&id).await?);
        }
        Ok(providers)
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Result<Appointment, EngineError> {
        let provider_id = self.store.provider_for(id).ok_or(EngineError::NotFound(*id))?;
        let state = self.provider_state(&provider_id)?;
        let guard = state.read().await;
        guard.appointment(*id).cloned().ok_or(EngineError::NotFound(*id))
    }

    /// A provider's appointments, optionally limited to the local day containing `day`.
    pub async fn list_appointments(&self, provider_id: &Ulid, day: Option<Ms>) -> Result<Vec<Appointment>, EngineError> {
        let state = self.provider_state(provider_id)?;
        let guard = state.read().await;
        let Some(instant) = day else {
            return Ok(guard.appointments.clone());
        };
        validate_timestamp(instant)?;
        let business = self.business_record(&guard.provider.business_id)?;
        let window = LocalDay::of(instant, business.utc_offset_minutes).span();
        Ok(guard.starting_within(&window).cloned().collect())
    }

    /// Every provider's appointments on one local day of a business, by start time.
    pub async fn business_day(&self, business_id: &Ulid, day: Ms) -> Result<Vec<Appointment>, EngineError> {
        validate_timestamp(day)?;
        let business = self.business_record(business_id)?;
        let window = LocalDay::of(day, business.utc_offset_minutes).span();
        let mut all = Vec::new();
        for id in self.store.provider_ids(business_id) {
            let state = self.provider_state(&id)?;
            let guard = state.read().await;
            all.extend(guard.starting_within(&window).cloned());
        }
        all.sort_by_key(|a| a.scheduled_start);
        Ok(all)
    }

    pub fn list_transfers(&self, appointment_id: &Ulid) -> Vec<TransferRequest> {
        self.store.transfers_for(appointment_id)
    }

    // ── Availability ─────────────────────────────────────────

    /// Snapshot one provider's constraints around `window`.
    pub async fn provider_constraints(&self, provider_id: &Ulid, window: Span) -> Result<ProviderConstraints, EngineError> {
        let state = self.provider_state(provider_id)?;
        let guard = state.read().await;
        let business = self.business_record(&guard.provider.business_id)?;
        Ok(ProviderConstraints::capture(&guard, business.utc_offset_minutes, window))
    }

    /// Available, busy or closed, with the next free slot when not available.
    pub async fn check_availability(
        &self,
        provider_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    ) -> Result<Availability, EngineError> {
        validate_timestamp(start)?;
        validate_duration(duration_minutes)?;
        let candidate = Span::new(start, start + duration_minutes as Ms * MINUTE_MS);
        let horizon = SearchHorizon::SameDay;
        let constraints = self
            .provider_constraints(&provider_id, Span::new(start, start + horizon.span_ms()))
            .await?;
        if !constraints.provider.active {
            return Ok(Availability::Closed { suggested: None });
        }
        let now = self.now_ms();
        let check = constraints.check(candidate, Some(now));
        if check.is_free() {
            return Ok(Availability::Available);
        }
        let suggested = constraints.next_slot(start, duration_minutes, horizon, now);
        Ok(Availability::from_check(check, suggested))
    }

    pub async fn find_next_slot(
        &self,
        provider_id: Ulid,
        after: Ms,
        duration_minutes: u32,
        horizon: SearchHorizon,
    ) -> Result<Option<Ms>, EngineError> {
        validate_search(after, duration_minutes, horizon)?;
        let constraints = self
            .provider_constraints(&provider_id, Span::new(after, after + horizon.span_ms()))
            .await?;
        if !constraints.provider.active {
            return Ok(None);
        }
        Ok(constraints.next_slot(after, duration_minutes, horizon, self.now_ms()))
    }

    /// Many next-slot searches over one captured constraint set. Results are
    /// positional; unknown or inactive providers yield `None`.
    pub async fn batch_find_slots(&self, requests: &[SlotRequest]) -> Result<Vec<Option<Ms>>, EngineError> {
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut set = ConstraintSet::new();
        for r in requests {
            validate_search(r.after, r.duration_minutes, r.horizon)?;
            if set.contains(&r.provider_id) {
                continue;
            }
            let (lo, hi) = requests
                .iter()
                .filter(|o| o.provider_id == r.provider_id)
                .fold((Ms::MAX, Ms::MIN), |(lo, hi), o| {
                    (lo.min(o.after), hi.max(o.after + o.horizon.span_ms()))
                });
            match self.provider_constraints(&r.provider_id, Span::new(lo, hi)).await {
                Ok(c) if c.provider.active => set.insert(c),
                Ok(_) | Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(set.find_slots(requests, self.now_ms()))
    }

    /// Open time of a provider inside `[start, end)`.
    pub async fn free_windows(&self, provider_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        validate_timestamp(start)?;
        validate_timestamp(end)?;
        if end <= start {
            return Err(EngineError::InvalidInput("end must be after start"));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let query = Span::new(start, end);
        let constraints = self.provider_constraints(&provider_id, query).await?;
        if !constraints.provider.active {
            return Ok(Vec::new());
        }
        Ok(constraints.free_windows(query))
    }
}
