//! Pre-appointment reminders sent once, shortly before a session starts.

use ulid::Ulid;

use crate::calendar::format_hhmm;
use crate::model::*;
use crate::observability::NOTIFICATIONS_TOTAL;

use super::{Engine, EngineError};

/// Reminders go out for sessions starting between these two offsets from now.
pub const REMINDER_EARLIEST_MS: Ms = 25 * MINUTE_MS;
pub const REMINDER_LATEST_MS: Ms = 35 * MINUTE_MS;

/// Pending, not yet reminded, never told about a delay, and inside the window.
pub fn reminder_due(apt: &Appointment, now: Ms) -> bool {
    apt.status == AppointmentStatus::Pending
        && !apt.reminder_sent
        && apt.notifications_sent == 0
        && (now + REMINDER_EARLIEST_MS..=now + REMINDER_LATEST_MS).contains(&apt.scheduled_start)
}

struct Reminder {
    appointment_id: Ulid,
    destination: String,
    text: String,
}

impl Engine {
    /// Mark and send every due reminder for a business. Returns how many were
    /// attempted. Clients without a contact or consent are skipped unmarked.
    pub async fn send_reminders(&self, business: &Business) -> Result<usize, EngineError> {
        let now = self.now_ms();
        let mut outbox = Vec::new();
        for provider_id in self.store.provider_ids(&business.id) {
            let state = self.provider_state(&provider_id)?;
            let mut guard = state.write().await;
            let due: Vec<Appointment> = guard
                .appointments
                .iter()
                .filter(|a| reminder_due(a, now))
                .cloned()
                .collect();
            for apt in due {
                let Some(client) = self.store.client(&apt.client_id).filter(|c| c.opted_in) else {
                    continue;
                };
                let Some(destination) = client.contact.clone() else { continue };
                let event = Event::ReminderSent { id: apt.id, provider_id };
                self.persist_for_provider(&mut guard, &event).await?;
                outbox.push(Reminder {
                    appointment_id: apt.id,
                    destination,
                    text: format!(
                        "Hi {}, your appointment with {} is coming up at {}.",
                        client.name,
                        guard.provider.name,
                        format_hhmm(apt.scheduled_start, business.utc_offset_minutes)
                    ),
                });
            }
        }

        for r in &outbox {
            let status = match self.messages.send_message(&r.destination, &r.text).await {
                Ok(()) => "sent",
                Err(e) => {
                    tracing::warn!(appointment = %r.appointment_id, "reminder delivery failed: {e}");
                    "failed"
                }
            };
            metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => "reminder", "status" => status).increment(1);
        }
        Ok(outbox.len())
    }
}
