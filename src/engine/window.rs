//! Time-window model: is a provider free for a candidate interval?
//!
//! Everything here is pure. Callers assemble a [`DayContext`] from provider
//! state and pass `now` explicitly.

use ulid::Ulid;

use crate::calendar::LocalDay;
use crate::model::*;

/// Minimum gap between "now" and a same-day slot start.
pub const MIN_LEAD_MS: Ms = 15 * MINUTE_MS;

/// Everything that constrains one provider on one local day.
#[derive(Debug, Clone)]
pub struct DayContext {
    pub day: LocalDay,
    /// Active shift, or `None` when the provider does not work this weekday.
    pub shift: Option<Span>,
    /// Absolute break intervals, sorted.
    pub breaks: Vec<Span>,
    pub buffer_ms: Ms,
    /// Scheduled (unbuffered) intervals of other appointments, sorted.
    pub occupied: Vec<Span>,
}

impl DayContext {
    /// Build the context for `day`. Only appointments accepted by `occupies`
    /// are treated as taken; `exclude` skips one appointment (the one being placed).
    pub fn build<'a>(
        provider: &Provider,
        appointments: impl IntoIterator<Item = &'a Appointment>,
        day: LocalDay,
        exclude: Option<Ulid>,
        occupies: impl Fn(&Appointment) -> bool,
    ) -> Self {
        let weekday = day.weekday();
        let shift = provider.hours_for(weekday).map(|h| {
            Span::new(
                day.at_minute(h.start_minute as u32),
                day.at_minute(h.end_minute as u32),
            )
        });
        let mut breaks: Vec<Span> = provider
            .breaks_for(weekday)
            .map(|b| {
                let start = day.at_minute(b.start_minute as u32);
                Span::new(start, start + b.duration_minutes as Ms * MINUTE_MS)
            })
            .collect();
        breaks.sort_by_key(|s| s.start);

        let day_span = day.span();
        let mut occupied: Vec<Span> = appointments
            .into_iter()
            .filter(|a| Some(a.id) != exclude && occupies(a))
            .filter(|a| day_span.contains_instant(a.scheduled_start))
            .map(|a| a.span())
            .collect();
        occupied.sort_by_key(|s| s.start);

        Self {
            day,
            shift,
            breaks,
            buffer_ms: provider.buffer.as_ms(),
            occupied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// No active working hours on this weekday.
    DayOff,
    /// The candidate does not fit inside the shift.
    OutsideShift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// Starts in the past or inside the minimum lead time.
    PastOrTooSoon { earliest: Ms },
    /// Overlaps a break ending at `until`.
    Break { until: Ms },
    /// Collides with a booking whose buffered end is `until`.
    Booked { until: Ms },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCheck {
    Free,
    Closed(ClosedReason),
    Busy(BusyReason),
}

impl WindowCheck {
    pub fn is_free(&self) -> bool {
        matches!(self, WindowCheck::Free)
    }
}

/// Decide whether `candidate` is free in `ctx`.
///
/// `now` enables the past/lead-time rule; pass `None` when placing an
/// appointment that is already on the books (reassignment).
pub fn is_free(ctx: &DayContext, candidate: Span, now: Option<Ms>) -> WindowCheck {
    let Some(shift) = ctx.shift else {
        return WindowCheck::Closed(ClosedReason::DayOff);
    };
    if !shift.contains_span(&candidate) {
        return WindowCheck::Closed(ClosedReason::OutsideShift);
    }

    if let Some(now) = now {
        let earliest = if ctx.day.contains(now) { now + MIN_LEAD_MS } else { now };
        if candidate.start < earliest {
            return WindowCheck::Busy(BusyReason::PastOrTooSoon { earliest });
        }
    }

    if let Some(b) = ctx.breaks.iter().find(|b| b.overlaps(&candidate)) {
        return WindowCheck::Busy(BusyReason::Break { until: b.end });
    }

    let inflated = Span::new(candidate.start, candidate.end + ctx.buffer_ms);
    for other in &ctx.occupied {
        let other = Span::new(other.start, other.end + ctx.buffer_ms);
        if inflated.overlaps(&other) {
            return WindowCheck::Busy(BusyReason::Booked { until: other.end });
        }
    }

    WindowCheck::Free
}
