use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Whole minutes from `from` to `to`, floored, never negative.
pub fn minutes_between(from: Ms, to: Ms) -> u32 {
    ((to - from).max(0) / MINUTE_MS) as u32
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Business ─────────────────────────────────────────────────────

/// What the autopilot does with smart reassignment proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RebalanceMode {
    #[default]
    Off,
    Suggest,
    Apply,
}

impl RebalanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceMode::Off => "off",
            RebalanceMode::Suggest => "suggest",
            RebalanceMode::Apply => "apply",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Some(RebalanceMode::Off),
            "suggest" => Some(RebalanceMode::Suggest),
            "apply" => Some(RebalanceMode::Apply),
            _ => None,
        }
    }
}

pub const DEFAULT_WARNING_PCT: u32 = 80;
pub const DEFAULT_CRITICAL_PCT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: Ulid,
    pub name: String,
    /// Local time = UTC + offset.
    pub utc_offset_minutes: i32,
    /// Crisis and escalation recipients.
    pub admin_contacts: Vec<String>,
    pub rebalance_mode: RebalanceMode,
    pub warning_pct: u32,
    pub critical_pct: u32,
}

impl Business {
    pub fn new(id: Ulid, name: impl Into<String>, utc_offset_minutes: i32) -> Self {
        Self {
            id,
            name: name.into(),
            utc_offset_minutes,
            admin_contacts: Vec::new(),
            rebalance_mode: RebalanceMode::Off,
            warning_pct: DEFAULT_WARNING_PCT,
            critical_pct: DEFAULT_CRITICAL_PCT,
        }
    }
}

// ── Provider ─────────────────────────────────────────────────────

/// Weekly shift for one weekday (0 = Sunday). Minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub weekday: u8,
    pub start_minute: u16,
    pub end_minute: u16,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Break {
    pub id: Ulid,
    pub weekday: u8,
    pub label: Option<String>,
    pub start_minute: u16,
    pub duration_minutes: u16,
}

/// Cleanup time appended after every appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferPolicy {
    pub enabled: bool,
    pub minutes: u16,
}

impl BufferPolicy {
    pub fn minutes(minutes: u16) -> Self {
        Self { enabled: minutes > 0, minutes }
    }

    pub fn as_ms(&self) -> Ms {
        if self.enabled {
            self.minutes as Ms * MINUTE_MS
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub code: String,
    /// Overrides the default duration when this skill's treatment is booked.
    pub duration_minutes: Option<u32>,
    pub price_cents: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub contact: Option<String>,
    pub hours: Vec<WorkingHours>,
    pub breaks: Vec<Break>,
    pub buffer: BufferPolicy,
    pub skills: Vec<Skill>,
    pub online: bool,
    pub active: bool,
}

impl Provider {
    pub fn new(id: Ulid, business_id: Ulid, name: impl Into<String>) -> Self {
        Self {
            id,
            business_id,
            name: name.into(),
            contact: None,
            hours: Vec::new(),
            breaks: Vec::new(),
            buffer: BufferPolicy::default(),
            skills: Vec::new(),
            online: true,
            active: true,
        }
    }

    /// The active shift for a weekday, if any.
    pub fn hours_for(&self, weekday: u8) -> Option<&WorkingHours> {
        self.hours
            .iter()
            .find(|h| h.weekday == weekday && h.active && h.end_minute > h.start_minute)
    }

    pub fn breaks_for(&self, weekday: u8) -> impl Iterator<Item = &Break> {
        self.breaks
            .iter()
            .filter(move |b| b.weekday == weekday && b.duration_minutes > 0)
    }

    /// True if every code in `required` is among this provider's skills.
    pub fn has_skills(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|code| self.skills.iter().any(|s| s.code.eq_ignore_ascii_case(code)))
    }

    pub fn skill(&self, code: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.code.eq_ignore_ascii_case(code))
    }

    /// Replace the working-hours record for a weekday.
    pub fn set_hours(&mut self, hours: WorkingHours) {
        self.hours.retain(|h| h.weekday != hours.weekday);
        self.hours.push(hours);
        self.hours.sort_by_key(|h| h.weekday);
    }
}

// ── Client ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub contact: Option<String>,
    pub opted_in: bool,
}

// ── Appointment ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    NoShow,
    Shifted,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Active => "active",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::Shifted => "shifted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(AppointmentStatus::Pending),
            "active" => Some(AppointmentStatus::Active),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            "no_show" | "noshow" => Some(AppointmentStatus::NoShow),
            "shifted" => Some(AppointmentStatus::Shifted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed
                | AppointmentStatus::Cancelled
                | AppointmentStatus::NoShow
                | AppointmentStatus::Shifted
        )
    }

    /// Statuses that hold the provider's time and count against double-booking.
    pub fn occupies_slot(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Pending | AppointmentStatus::Active | AppointmentStatus::Completed
        )
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub business_id: Ulid,
    pub client_id: Ulid,
    pub provider_id: Ulid,
    pub scheduled_start: Ms,
    pub duration_minutes: u32,
    pub treatment: Option<String>,
    pub required_skills: Vec<String>,
    pub status: AppointmentStatus,
    pub actual_start: Option<Ms>,
    pub actual_end: Option<Ms>,
    pub delay_minutes: u32,
    pub notifications_sent: u8,
    pub reminder_sent: bool,
    pub shifted_from_id: Option<Ulid>,
}

impl Appointment {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn scheduled_end(&self) -> Ms {
        self.scheduled_start + self.duration_ms()
    }

    pub fn span(&self) -> Span {
        Span::new(self.scheduled_start, self.scheduled_end())
    }

    /// Instant the current session is expected to finish.
    pub fn expected_end(&self) -> Option<Ms> {
        self.actual_start.map(|s| s + self.duration_ms())
    }
}

/// Terminal outcomes an admin can assign to a pending appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Cancelled,
    NoShow,
    /// Client postponed.
    Shifted,
}

impl CloseReason {
    pub fn status(&self) -> AppointmentStatus {
        match self {
            CloseReason::Cancelled => AppointmentStatus::Cancelled,
            CloseReason::NoShow => AppointmentStatus::NoShow,
            CloseReason::Shifted => AppointmentStatus::Shifted,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match AppointmentStatus::parse(s)? {
            AppointmentStatus::Cancelled => Some(CloseReason::Cancelled),
            AppointmentStatus::NoShow => Some(CloseReason::NoShow),
            AppointmentStatus::Shifted => Some(CloseReason::Shifted),
            _ => None,
        }
    }
}

// ── Transfers ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Accepted,
    Rejected,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Accepted => "accepted",
            TransferStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub sender_id: Ulid,
    pub receiver_id: Ulid,
    pub status: TransferStatus,
    pub created_at: Ms,
}

// ── Leadership ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub renewed_at: Ms,
}

// ── Provider state ───────────────────────────────────────────────

/// A provider and its appointments, kept together behind one lock.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub provider: Provider,
    /// All appointments, sorted by `scheduled_start`.
    pub appointments: Vec<Appointment>,
}

impl ProviderState {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by scheduled start. Ties keep insertion order.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.scheduled_start <= appointment.scheduled_start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose scheduled start falls inside `window`.
    pub fn starting_within(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        let lo = self
            .appointments
            .partition_point(|a| a.scheduled_start < window.start);
        let hi = self
            .appointments
            .partition_point(|a| a.scheduled_start < window.end);
        self.appointments[lo..hi].iter()
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// One staged delay change produced by a ripple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayUpdate {
    pub appointment_id: Ulid,
    pub delay_minutes: u32,
    pub notifications_sent: u8,
}

/// Flat event types, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessUpserted(Business),
    ProviderUpserted(Provider),
    ClientUpserted(Client),
    AppointmentBooked(Appointment),
    AppointmentStarted {
        id: Ulid,
        provider_id: Ulid,
        actual_start: Ms,
        delay_minutes: u32,
        ripple: Vec<DelayUpdate>,
    },
    AppointmentEnded {
        id: Ulid,
        provider_id: Ulid,
        actual_end: Ms,
        delay_minutes: u32,
        ripple: Vec<DelayUpdate>,
    },
    AppointmentClosed {
        id: Ulid,
        provider_id: Ulid,
        status: AppointmentStatus,
    },
    DelaysRecalculated {
        provider_id: Ulid,
        updates: Vec<DelayUpdate>,
    },
    AppointmentReassigned {
        id: Ulid,
        from_provider: Ulid,
        to_provider: Ulid,
    },
    TransferRequested(TransferRequest),
    TransferAccepted {
        id: Ulid,
        appointment_id: Ulid,
        from_provider: Ulid,
        to_provider: Ulid,
        rejected: Vec<Ulid>,
    },
    TransferRejected {
        id: Ulid,
    },
    ReminderSent {
        id: Ulid,
        provider_id: Ulid,
    },
    LeaseRenewed {
        business_id: Ulid,
        holder: String,
        renewed_at: Ms,
    },
}

impl Event {
    /// Name used for LISTEN payloads and audit records.
    pub fn name(&self) -> &'static str {
        match self {
            Event::BusinessUpserted(_) => "business_upserted",
            Event::ProviderUpserted(_) => "provider_upserted",
            Event::ClientUpserted(_) => "client_upserted",
            Event::AppointmentBooked(_) => "appointment_booked",
            Event::AppointmentStarted { .. } => "appointment_started",
            Event::AppointmentEnded { .. } => "appointment_ended",
            Event::AppointmentClosed { .. } => "appointment_closed",
            Event::DelaysRecalculated { .. } => "delays_recalculated",
            Event::AppointmentReassigned { .. } => "appointment_reassigned",
            Event::TransferRequested(_) => "transfer_requested",
            Event::TransferAccepted { .. } => "transfer_accepted",
            Event::TransferRejected { .. } => "transfer_rejected",
            Event::ReminderSent { .. } => "reminder_sent",
            Event::LeaseRenewed { .. } => "lease_renewed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(Span::new(0, 400).contains_span(&a));
        assert!(!a.contains_span(&b));
    }

    #[test]
    fn minutes_between_floors_and_clamps() {
        assert_eq!(minutes_between(0, 59_999), 0);
        assert_eq!(minutes_between(0, 60_000), 1);
        assert_eq!(minutes_between(0, 25 * MINUTE_MS + 30_000), 25);
        assert_eq!(minutes_between(10 * MINUTE_MS, 0), 0);
    }

    #[test]
    fn status_classification() {
        assert!(AppointmentStatus::Pending.occupies_slot());
        assert!(AppointmentStatus::Completed.occupies_slot());
        assert!(!AppointmentStatus::Cancelled.occupies_slot());
        assert!(AppointmentStatus::NoShow.is_terminal());
        assert!(!AppointmentStatus::Active.is_terminal());
        assert_eq!(AppointmentStatus::parse("no_show"), Some(AppointmentStatus::NoShow));
        assert_eq!(CloseReason::parse("active"), None);
        assert_eq!(CloseReason::parse("shifted"), Some(CloseReason::Shifted));
    }

    #[test]
    fn buffer_policy_disabled_is_zero() {
        let off = BufferPolicy { enabled: false, minutes: 15 };
        assert_eq!(off.as_ms(), 0);
        assert_eq!(BufferPolicy::minutes(15).as_ms(), 15 * MINUTE_MS);
    }

    #[test]
    fn provider_skill_superset() {
        let mut p = Provider::new(Ulid::new(), Ulid::new(), "Dana");
        p.skills.push(Skill { code: "color".into(), duration_minutes: Some(90), price_cents: None });
        p.skills.push(Skill { code: "cut".into(), duration_minutes: None, price_cents: None });
        assert!(p.has_skills(&[]));
        assert!(p.has_skills(&["COLOR".into()]));
        assert!(!p.has_skills(&["color".into(), "perm".into()]));
    }

    fn apt(start: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            business_id: Ulid::nil(),
            client_id: Ulid::nil(),
            provider_id: Ulid::nil(),
            scheduled_start: start,
            duration_minutes: 30,
            treatment: None,
            required_skills: Vec::new(),
            status: AppointmentStatus::Pending,
            actual_start: None,
            actual_end: None,
            delay_minutes: 0,
            notifications_sent: 0,
            reminder_sent: false,
            shifted_from_id: None,
        }
    }

    #[test]
    fn provider_state_keeps_appointments_sorted() {
        let mut ps = ProviderState::new(Provider::new(Ulid::new(), Ulid::new(), "Ari"));
        let late = apt(3 * HOUR_MS);
        let early = apt(HOUR_MS);
        let tie = apt(HOUR_MS);
        ps.insert_appointment(late.clone());
        ps.insert_appointment(early.clone());
        ps.insert_appointment(tie.clone());
        let ids: Vec<Ulid> = ps.appointments.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![early.id, tie.id, late.id]);

        let window = Span::new(0, 2 * HOUR_MS);
        assert_eq!(ps.starting_within(&window).count(), 2);

        assert_eq!(ps.remove_appointment(early.id).map(|a| a.id), Some(early.id));
        assert!(ps.appointment(early.id).is_none());
    }
}
