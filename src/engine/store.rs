use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedProviderState;

/// Entity maps and indexes behind the engine. Appointments live inside their
/// provider's state; everything else is keyed directly.
pub struct Store {
    businesses: DashMap<Ulid, Business>,
    providers: DashMap<Ulid, SharedProviderState>,
    /// Providers of a business in creation order (the listing order).
    business_providers: DashMap<Ulid, Vec<Ulid>>,
    clients: DashMap<Ulid, Client>,
    transfers: DashMap<Ulid, TransferRequest>,
    appointment_to_provider: DashMap<Ulid, Ulid>,
    leases: DashMap<Ulid, Lease>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            businesses: DashMap::new(),
            providers: DashMap::new(),
            business_providers: DashMap::new(),
            clients: DashMap::new(),
            transfers: DashMap::new(),
            appointment_to_provider: DashMap::new(),
            leases: DashMap::new(),
        }
    }

    // ── Businesses ───────────────────────────────────────────

    pub fn business(&self, id: &Ulid) -> Option<Business> {
        self.businesses.get(id).map(|e| e.value().clone())
    }

    pub fn businesses(&self) -> Vec<Business> {
        let mut all: Vec<Business> = self.businesses.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|b| b.id);
        all
    }

    pub fn business_count(&self) -> usize {
        self.businesses.len()
    }

    // ── Providers ────────────────────────────────────────────

    pub fn provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn contains_provider(&self, id: &Ulid) -> bool {
        self.providers.contains_key(id)
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Provider ids of a business in listing order.
    pub fn provider_ids(&self, business_id: &Ulid) -> Vec<Ulid> {
        self.business_providers
            .get(business_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn insert_provider(&self, provider: Provider) {
        let (id, business_id) = (provider.id, provider.business_id);
        self.providers
            .insert(id, Arc::new(RwLock::new(ProviderState::new(provider))));
        self.business_providers.entry(business_id).or_default().push(id);
    }

    pub fn provider_for(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_provider
            .get(appointment_id)
            .map(|e| *e.value())
    }

    // ── Clients ──────────────────────────────────────────────

    pub fn client(&self, id: &Ulid) -> Option<Client> {
        self.clients.get(id).map(|e| e.value().clone())
    }

    // ── Transfers ────────────────────────────────────────────

    pub fn transfer(&self, id: &Ulid) -> Option<TransferRequest> {
        self.transfers.get(id).map(|e| e.value().clone())
    }

    pub fn transfers_for(&self, appointment_id: &Ulid) -> Vec<TransferRequest> {
        let mut found: Vec<TransferRequest> = self
            .transfers
            .iter()
            .filter(|e| e.value().appointment_id == *appointment_id)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|t| t.id);
        found
    }

    // ── Leases ───────────────────────────────────────────────

    pub fn lease(&self, business_id: &Ulid) -> Option<Lease> {
        self.leases.get(business_id).map(|e| e.value().clone())
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that touches no provider state.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::BusinessUpserted(b) => {
                self.businesses.insert(b.id, b.clone());
            }
            Event::ClientUpserted(c) => {
                self.clients.insert(c.id, c.clone());
            }
            Event::ProviderUpserted(p) if !self.contains_provider(&p.id) => {
                self.insert_provider(p.clone());
            }
            Event::TransferRequested(t) => {
                self.transfers.insert(t.id, t.clone());
            }
            Event::TransferRejected { id } => {
                if let Some(mut t) = self.transfers.get_mut(id) {
                    t.status = TransferStatus::Rejected;
                }
            }
            Event::LeaseRenewed {
                business_id,
                holder,
                renewed_at,
            } => {
                self.leases.insert(
                    *business_id,
                    Lease {
                        holder: holder.clone(),
                        renewed_at: *renewed_at,
                    },
                );
            }
            _ => {}
        }
    }

    /// Apply an event to a provider's state. Caller holds the write lock.
    pub fn apply_to_provider(&self, ps: &mut ProviderState, event: &Event) {
        match event {
            Event::ProviderUpserted(p) => ps.provider = p.clone(),
            Event::AppointmentBooked(a) => {
                self.appointment_to_provider.insert(a.id, ps.provider.id);
                ps.insert_appointment(a.clone());
            }
            Event::AppointmentStarted {
                id,
                actual_start,
                delay_minutes,
                ripple,
                ..
            } => {
                if let Some(a) = ps.appointment_mut(*id) {
                    a.status = AppointmentStatus::Active;
                    a.actual_start = Some(*actual_start);
                    a.delay_minutes = *delay_minutes;
                }
                apply_delays(ps, ripple);
            }
            Event::AppointmentEnded {
                id,
                actual_end,
                delay_minutes,
                ripple,
                ..
            } => {
                if let Some(a) = ps.appointment_mut(*id) {
                    a.status = AppointmentStatus::Completed;
                    a.actual_end = Some(*actual_end);
                    a.delay_minutes = *delay_minutes;
                }
                apply_delays(ps, ripple);
            }
            Event::AppointmentClosed { id, status, .. } => {
                if let Some(a) = ps.appointment_mut(*id) {
                    a.status = *status;
                }
            }
            Event::DelaysRecalculated { updates, .. } => apply_delays(ps, updates),
            Event::ReminderSent { id, .. } => {
                if let Some(a) = ps.appointment_mut(*id) {
                    a.reminder_sent = true;
                }
            }
            _ => {}
        }
    }

    /// Move an appointment between two locked providers.
    pub fn apply_reassignment(&self, from: &mut ProviderState, to: &mut ProviderState, event: &Event) {
        let appointment_id = match event {
            Event::AppointmentReassigned { id, .. } => *id,
            Event::TransferAccepted {
                id,
                appointment_id,
                rejected,
                ..
            } => {
                if let Some(mut t) = self.transfers.get_mut(id) {
                    t.status = TransferStatus::Accepted;
                }
                for sibling in rejected {
                    if let Some(mut t) = self.transfers.get_mut(sibling) {
                        t.status = TransferStatus::Rejected;
                    }
                }
                *appointment_id
            }
            _ => return,
        };

        if let Some(mut apt) = from.remove_appointment(appointment_id) {
            apt.provider_id = to.provider.id;
            apt.shifted_from_id = Some(from.provider.id);
            apt.status = AppointmentStatus::Pending;
            self.appointment_to_provider.insert(apt.id, to.provider.id);
            to.insert_appointment(apt);
        }
    }

    /// Apply a replayed event. Replay runs before the engine is shared, so
    /// every lock is uncontended.
    pub fn replay(&self, event: &Event) {
        match event {
            Event::AppointmentReassigned {
                from_provider,
                to_provider,
                ..
            }
            | Event::TransferAccepted {
                from_provider,
                to_provider,
                ..
            } => {
                let (Some(from), Some(to)) = (self.provider(from_provider), self.provider(to_provider))
                else {
                    tracing::warn!("replay: reassignment references unknown provider");
                    return;
                };
                let (Ok(mut from), Ok(mut to)) = (from.try_write(), to.try_write()) else {
                    tracing::warn!("replay: provider lock contended");
                    return;
                };
                self.apply_reassignment(&mut from, &mut to, event);
            }
            other => match event_provider_id(other) {
                Some(provider_id) if self.contains_provider(&provider_id) => {
                    let Some(state) = self.provider(&provider_id) else { return };
                    let Ok(mut guard) = state.try_write() else {
                        tracing::warn!("replay: provider lock contended");
                        return;
                    };
                    self.apply_to_provider(&mut guard, other);
                }
                _ => self.apply(other),
            },
        }
    }

    /// One upsert per live entity, or `None` if a provider is locked for writing.
    pub fn try_snapshot(&self) -> Option<Vec<Event>> {
        let mut events: Vec<Event> = self
            .businesses()
            .into_iter()
            .map(Event::BusinessUpserted)
            .collect();

        let mut provider_ids: Vec<Ulid> = Vec::new();
        for business in self.businesses() {
            provider_ids.extend(self.provider_ids(&business.id));
        }
        // Providers whose business was never registered.
        let mut orphans: Vec<Ulid> = self
            .providers
            .iter()
            .map(|e| *e.key())
            .filter(|id| !provider_ids.contains(id))
            .collect();
        orphans.sort();
        provider_ids.extend(orphans);

        let mut appointments = Vec::new();
        for id in provider_ids {
            let state = self.provider(&id)?;
            let guard = state.try_read().ok()?;
            events.push(Event::ProviderUpserted(guard.provider.clone()));
            appointments.extend(guard.appointments.iter().cloned().map(Event::AppointmentBooked));
        }

        let mut clients: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        clients.sort_by_key(|c| c.id);
        events.extend(clients.into_iter().map(Event::ClientUpserted));
        events.extend(appointments);

        let mut transfers: Vec<TransferRequest> =
            self.transfers.iter().map(|e| e.value().clone()).collect();
        transfers.sort_by_key(|t| t.id);
        events.extend(transfers.into_iter().map(Event::TransferRequested));

        let mut leases: Vec<(Ulid, Lease)> = self
            .leases
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        leases.sort_by_key(|(id, _)| *id);
        events.extend(leases.into_iter().map(|(business_id, lease)| Event::LeaseRenewed {
            business_id,
            holder: lease.holder,
            renewed_at: lease.renewed_at,
        }));

        Some(events)
    }
}

fn apply_delays(ps: &mut ProviderState, updates: &[DelayUpdate]) {
    for u in updates {
        if let Some(a) = ps.appointment_mut(u.appointment_id) {
            a.delay_minutes = u.delay_minutes;
            a.notifications_sent = u.notifications_sent;
        }
    }
}

/// The provider whose state an event mutates, for provider-scoped events.
fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ProviderUpserted(p) => Some(p.id),
        Event::AppointmentBooked(a) => Some(a.provider_id),
        Event::AppointmentStarted { provider_id, .. }
        | Event::AppointmentEnded { provider_id, .. }
        | Event::AppointmentClosed { provider_id, .. }
        | Event::DelaysRecalculated { provider_id, .. }
        | Event::ReminderSent { provider_id, .. } => Some(*provider_id),
        _ => None,
    }
}
