//! Delay propagation: how lateness at one session spreads to the rest of a
//! provider's day, and who gets told about it.

use dashmap::mapref::entry::Entry;
use serde_json::json;
use ulid::Ulid;

use crate::calendar::{LocalDay, format_hhmm};
use crate::model::*;
use crate::observability::{CRISIS_ALERTS_TOTAL, DELAY_EVALUATIONS_TOTAL, NOTIFICATIONS_TOTAL, RIPPLE_UPDATES_TOTAL};

use super::{Engine, EngineError};

/// Changes smaller than this are noise and never stored or announced.
pub const NOISE_MINUTES: u32 = 2;
pub const MIN_THRESHOLD_MINUTES: u32 = 10;
pub const LATE_NOTICE_MINUTES: u32 = 10;
pub const RECOVERED_NOTICE_MINUTES: u32 = 5;
pub const MAX_NOTICES: u8 = 2;
pub const CRISIS_MINUTES: u32 = 15;
pub const CRISIS_COOLDOWN_MS: Ms = 30 * MINUTE_MS;
pub const CRISIS_ESCALATION_MINUTES: u32 = 15;
/// An overrunning session re-ripples each time it slips this much further.
pub const OVERRUN_STEP_MINUTES: u32 = 10;

/// Lateness that counts as significant for a session of this length.
pub fn threshold_minutes(duration_minutes: u32) -> u32 {
    (duration_minutes / 4).max(MIN_THRESHOLD_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start { at: Ms },
    End { at: Ms },
}

impl Trigger {
    pub fn at(&self) -> Ms {
        match self {
            Trigger::Start { at } | Trigger::End { at } => *at,
        }
    }

    /// Whole minutes late against the schedule.
    pub fn raw_delay(&self, apt: &Appointment) -> u32 {
        match self {
            Trigger::Start { at } => minutes_between(apt.scheduled_start, *at),
            Trigger::End { at } => minutes_between(apt.scheduled_end(), *at),
        }
    }

    /// When the provider is expected to be free again.
    pub fn projected_free(&self, apt: &Appointment) -> Ms {
        match self {
            Trigger::Start { at } => at + apt.duration_ms(),
            Trigger::End { at } => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Within two minutes of the stored delay.
    Noise,
    /// Later than before but under the threshold.
    Minor,
    Significant,
    /// Less late than before; ripples regardless of threshold.
    CatchingUp,
}

impl Assessment {
    pub fn ripples(&self) -> bool {
        matches!(self, Assessment::Significant | Assessment::CatchingUp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Assessment::Noise => "noise",
            Assessment::Minor => "minor",
            Assessment::Significant => "significant",
            Assessment::CatchingUp => "catching_up",
        }
    }
}

pub fn assess(raw_delay: u32, previous: u32, duration_minutes: u32) -> Assessment {
    if raw_delay.abs_diff(previous) < NOISE_MINUTES {
        Assessment::Noise
    } else if raw_delay < previous {
        Assessment::CatchingUp
    } else if raw_delay > threshold_minutes(duration_minutes) {
        Assessment::Significant
    } else {
        Assessment::Minor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    RunningLate,
    BackOnSchedule,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::RunningLate => "running_late",
            NoticeKind::BackOnSchedule => "back_on_schedule",
        }
    }
}

/// Which client notice, if any, a delay change earns.
pub fn notice_for(previous: u32, current: u32, sent: u8) -> Option<NoticeKind> {
    if sent >= MAX_NOTICES {
        None
    } else if previous < LATE_NOTICE_MINUTES && current >= LATE_NOTICE_MINUTES {
        Some(NoticeKind::RunningLate)
    } else if previous >= LATE_NOTICE_MINUTES && current < RECOVERED_NOTICE_MINUTES {
        Some(NoticeKind::BackOnSchedule)
    } else {
        None
    }
}

/// One downstream appointment whose delay moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDelay {
    pub appointment_id: Ulid,
    pub client_id: Ulid,
    pub scheduled_start: Ms,
    pub previous: u32,
    pub current: u32,
    /// Attempt counter after this change, including any notice below.
    pub notifications_sent: u8,
    pub notice: Option<NoticeKind>,
}

impl StagedDelay {
    pub fn update(&self) -> DelayUpdate {
        DelayUpdate {
            appointment_id: self.appointment_id,
            delay_minutes: self.current,
            notifications_sent: self.notifications_sent,
        }
    }
}

/// Single forward pass over `pending` (ascending start): each appointment
/// starts when the previous one is projected to finish, or on time.
pub fn ripple<'a>(
    pending: impl IntoIterator<Item = &'a Appointment>,
    mut projected_free: Ms,
) -> Vec<StagedDelay> {
    let mut staged = Vec::new();
    for apt in pending {
        let delay = minutes_between(apt.scheduled_start, projected_free);
        if delay.abs_diff(apt.delay_minutes) >= NOISE_MINUTES {
            let notice = notice_for(apt.delay_minutes, delay, apt.notifications_sent);
            staged.push(StagedDelay {
                appointment_id: apt.id,
                client_id: apt.client_id,
                scheduled_start: apt.scheduled_start,
                previous: apt.delay_minutes,
                current: delay,
                notifications_sent: apt.notifications_sent + u8::from(notice.is_some()),
                notice,
            });
        }
        projected_free = apt.scheduled_start + delay as Ms * MINUTE_MS + apt.duration_ms();
    }
    staged
}

/// Pending appointments later the same local day, trigger excluded.
pub fn downstream<'a>(
    ps: &'a ProviderState,
    trigger: &'a Appointment,
    utc_offset_minutes: i32,
) -> impl Iterator<Item = &'a Appointment> {
    let day_end = LocalDay::of(trigger.scheduled_start, utc_offset_minutes).end();
    ps.appointments
        .iter()
        .skip_while(move |a| a.scheduled_start < trigger.scheduled_start)
        .take_while(move |a| a.scheduled_start < day_end)
        .filter(move |a| a.id != trigger.id && a.status == AppointmentStatus::Pending)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipplePlan {
    pub trigger_delay: u32,
    pub assessment: Assessment,
    pub staged: Vec<StagedDelay>,
}

impl RipplePlan {
    pub fn updates(&self) -> Vec<DelayUpdate> {
        self.staged.iter().map(StagedDelay::update).collect()
    }
}

/// Evaluate a start/end against the stored delay and stage the ripple.
pub fn plan_trigger(
    ps: &ProviderState,
    apt: &Appointment,
    trigger: Trigger,
    utc_offset_minutes: i32,
) -> RipplePlan {
    let trigger_delay = trigger.raw_delay(apt);
    let assessment = assess(trigger_delay, apt.delay_minutes, apt.duration_minutes);
    let staged = if assessment.ripples() {
        ripple(downstream(ps, apt, utc_offset_minutes), trigger.projected_free(apt))
    } else {
        Vec::new()
    };
    RipplePlan {
        trigger_delay,
        assessment,
        staged,
    }
}

/// End-lateness of an active session that has run past its threshold and
/// slipped at least `OVERRUN_STEP_MINUTES` beyond its stored delay.
pub fn overrun_delay(apt: &Appointment, now: Ms) -> Option<u32> {
    if apt.status != AppointmentStatus::Active {
        return None;
    }
    let overrun = minutes_between(apt.expected_end()?, now);
    if overrun <= threshold_minutes(apt.duration_minutes) {
        return None;
    }
    let late = minutes_between(apt.scheduled_end(), now);
    (late >= apt.delay_minutes + OVERRUN_STEP_MINUTES).then_some(late)
}

/// Recompute every pending appointment on `day` from the provider's current
/// position: the running session's expected end, or `now`.
pub fn recalculate_day(ps: &ProviderState, day: LocalDay, now: Ms) -> Vec<StagedDelay> {
    let window = day.span();
    let seed = ps
        .starting_within(&window)
        .filter(|a| a.status == AppointmentStatus::Active)
        .filter_map(Appointment::expected_end)
        .max()
        .map_or(now, |end| end.max(now));
    let pending = ps
        .starting_within(&window)
        .filter(|a| a.status == AppointmentStatus::Pending);
    ripple(pending, seed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrisisAlert {
    pub sent_at: Ms,
    pub delay_minutes: u32,
}

/// Crisis alerts are throttled per provider unless the delay escalates.
pub fn crisis_due(last: Option<&CrisisAlert>, delay_minutes: u32, now: Ms) -> bool {
    if delay_minutes < CRISIS_MINUTES {
        return false;
    }
    match last {
        None => true,
        Some(last) => {
            now - last.sent_at >= CRISIS_COOLDOWN_MS
                || delay_minutes >= last.delay_minutes + CRISIS_ESCALATION_MINUTES
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayReport {
    pub appointment_id: Ulid,
    pub delay_minutes: u32,
    pub assessment: Assessment,
    /// Downstream appointments whose delay changed.
    pub rippled: usize,
    pub notices: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(DelayReport),
    /// The appointment was already in the requested state.
    AlreadyApplied,
}

// ── Engine side effects ──────────────────────────────────────────

fn notice_text(
    kind: NoticeKind,
    client: Option<&Client>,
    provider: &Provider,
    staged: &StagedDelay,
    utc_offset_minutes: i32,
) -> String {
    let greeting = client.map_or_else(|| "Hi".to_string(), |c| format!("Hi {}", c.name));
    let booked_at = format_hhmm(staged.scheduled_start, utc_offset_minutes);
    match kind {
        NoticeKind::RunningLate => {
            let expected = staged.scheduled_start + staged.current as Ms * MINUTE_MS;
            format!(
                "{greeting}, {} is running about {} mins late. Your {booked_at} appointment is now scheduled for {}.",
                provider.name,
                staged.current,
                format_hhmm(expected, utc_offset_minutes)
            )
        }
        NoticeKind::BackOnSchedule => format!(
            "{greeting}, good news: {} is back on schedule. Your {booked_at} appointment is on time.",
            provider.name
        ),
    }
}

impl Engine {
    /// Deliver the notices a ripple staged. Counters were already persisted,
    /// so failures are only logged.
    pub(super) async fn dispatch_notices(
        &self,
        business: &Business,
        provider: &Provider,
        staged: &[StagedDelay],
    ) -> usize {
        let mut attempted = 0;
        for s in staged {
            let Some(kind) = s.notice else { continue };
            attempted += 1;
            let client = self.store.client(&s.client_id);
            let text = notice_text(kind, client.as_ref(), provider, s, business.utc_offset_minutes);

            let direct = client
                .as_ref()
                .filter(|c| c.opted_in)
                .and_then(|c| c.contact.clone());
            let (destination, text) = match (direct, provider.contact.as_ref()) {
                (Some(contact), _) => (contact, text),
                (None, Some(provider_contact)) => {
                    let who = client.as_ref().map_or("a client", |c| c.name.as_str());
                    (
                        provider_contact.clone(),
                        format!("Could not reach {who} directly. Please pass on: {text}"),
                    )
                }
                (None, None) => {
                    tracing::warn!(appointment = %s.appointment_id, "no destination for {} notice", kind.as_str());
                    metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind.as_str(), "status" => "undeliverable")
                        .increment(1);
                    continue;
                }
            };

            match self.messages.send_message(&destination, &text).await {
                Ok(()) => {
                    metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind.as_str(), "status" => "sent")
                        .increment(1);
                }
                Err(e) => {
                    tracing::warn!(appointment = %s.appointment_id, "notice delivery failed: {e}");
                    metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind.as_str(), "status" => "failed")
                        .increment(1);
                }
            }
        }
        attempted
    }

    /// Alert business admins about a provider who is badly behind, subject to throttling.
    pub(super) async fn maybe_crisis_alert(
        &self,
        business: &Business,
        provider: &Provider,
        appointment_id: Ulid,
        delay_minutes: u32,
    ) -> bool {
        if delay_minutes < CRISIS_MINUTES {
            return false;
        }
        let now = self.now_ms();
        let alert = CrisisAlert { sent_at: now, delay_minutes };
        let due = match self.crisis_alerts.entry(provider.id) {
            Entry::Occupied(mut e) => {
                let due = crisis_due(Some(e.get()), delay_minutes, now);
                if due {
                    e.insert(alert);
                }
                due
            }
            Entry::Vacant(e) => {
                e.insert(alert);
                true
            }
        };
        if !due {
            metrics::counter!(CRISIS_ALERTS_TOTAL, "status" => "suppressed").increment(1);
            return false;
        }

        let text = format!(
            "Crisis at {}: {} is running {} mins behind. Consider reassigning upcoming appointments.",
            business.name, provider.name, delay_minutes
        );
        for admin in &business.admin_contacts {
            if let Err(e) = self.messages.send_message(admin, &text).await {
                tracing::warn!(business = %business.id, "crisis alert delivery failed: {e}");
            }
        }
        self.audit.log_event(
            "CRISIS_ALERT",
            json!({
                "business_id": business.id.to_string(),
                "provider_id": provider.id.to_string(),
                "appointment_id": appointment_id.to_string(),
                "delay_minutes": delay_minutes,
            }),
            json!({ "at": now }),
        );
        metrics::counter!(CRISIS_ALERTS_TOTAL, "status" => "sent").increment(1);
        tracing::warn!(provider = %provider.id, delay_minutes, "crisis alert sent");
        true
    }

    /// Post-commit work for a start/end/overrun: notices, then the crisis check.
    pub(super) async fn after_ripple(
        &self,
        business: &Business,
        provider: &Provider,
        appointment_id: Ulid,
        plan: &RipplePlan,
    ) -> usize {
        metrics::counter!(DELAY_EVALUATIONS_TOTAL, "outcome" => plan.assessment.as_str()).increment(1);
        if !plan.assessment.ripples() {
            return 0;
        }
        metrics::counter!(RIPPLE_UPDATES_TOTAL).increment(plan.staged.len() as u64);
        let notices = self.dispatch_notices(business, provider, &plan.staged).await;
        self.maybe_crisis_alert(business, provider, appointment_id, plan.trigger_delay)
            .await;
        notices
    }

    /// Re-run the day plan for a locked provider and persist what moved.
    pub(super) async fn recalculate_locked(
        &self,
        ps: &mut ProviderState,
        day: LocalDay,
    ) -> Result<Vec<StagedDelay>, EngineError> {
        let staged = recalculate_day(ps, day, self.now_ms());
        if !staged.is_empty() {
            let event = Event::DelaysRecalculated {
                provider_id: ps.provider.id,
                updates: staged.iter().map(StagedDelay::update).collect(),
            };
            self.persist_for_provider(ps, &event).await?;
            metrics::counter!(RIPPLE_UPDATES_TOTAL).increment(staged.len() as u64);
        }
        Ok(staged)
    }

    /// Find active sessions that are overrunning and push their lateness
    /// down the rest of the day. Returns how many sessions were handled.
    pub async fn scan_overruns(&self, business_id: Ulid) -> Result<usize, EngineError> {
        let business = self.business_record(&business_id)?;
        let mut handled = 0;

        for provider_id in self.store.provider_ids(&business_id) {
            let state = self.provider_state(&provider_id)?;
            let mut guard = state.write().await;
            let now = self.now_ms();

            let Some((apt, late)) = guard
                .appointments
                .iter()
                .find_map(|a| overrun_delay(a, now).map(|late| (a.clone(), late)))
            else {
                continue;
            };

            let staged = ripple(downstream(&guard, &apt, business.utc_offset_minutes), now);
            let mut updates = vec![DelayUpdate {
                appointment_id: apt.id,
                delay_minutes: late,
                notifications_sent: apt.notifications_sent,
            }];
            updates.extend(staged.iter().map(StagedDelay::update));
            let event = Event::DelaysRecalculated { provider_id, updates };
            self.persist_for_provider(&mut guard, &event).await?;
            let provider = guard.provider.clone();
            drop(guard);

            tracing::info!(appointment = %apt.id, late, rippled = staged.len(), "session overrun");
            metrics::counter!(crate::observability::OVERRUNS_TOTAL).increment(1);
            let plan = RipplePlan {
                trigger_delay: late,
                assessment: Assessment::Significant,
                staged,
            };
            self.after_ripple(&business, &provider, apt.id, &plan).await;
            handled += 1;
        }

        Ok(handled)
    }
}
