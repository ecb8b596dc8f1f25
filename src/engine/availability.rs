use std::collections::HashMap;

use ulid::Ulid;

use crate::calendar::{LocalDay, ceil_to};
use crate::limits::MAX_SEARCH_DAYS;
use crate::model::*;

use super::window::{BusyReason, ClosedReason, DayContext, WindowCheck, is_free};

/// Slot grid used by the next-slot search.
pub const SLOT_STEP_MS: Ms = 5 * MINUTE_MS;

/// Tri-state answer for a candidate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Busy { suggested: Option<Ms> },
    Closed { suggested: Option<Ms> },
}

impl Availability {
    pub fn suggested(&self) -> Option<Ms> {
        match self {
            Availability::Available => None,
            Availability::Busy { suggested } | Availability::Closed { suggested } => *suggested,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Busy { .. } => "busy",
            Availability::Closed { .. } => "closed",
        }
    }

    pub(crate) fn from_check(check: WindowCheck, suggested: Option<Ms>) -> Self {
        match check {
            WindowCheck::Free => Availability::Available,
            WindowCheck::Busy(_) => Availability::Busy { suggested },
            WindowCheck::Closed(_) => Availability::Closed { suggested },
        }
    }
}

/// How far ahead a next-slot search may look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchHorizon {
    /// 12 hours from the search start.
    SameDay,
    /// Whole days, capped at `MAX_SEARCH_DAYS`.
    Days(u32),
}

impl SearchHorizon {
    pub fn span_ms(&self) -> Ms {
        match self {
            SearchHorizon::SameDay => 12 * HOUR_MS,
            SearchHorizon::Days(n) => (*n).min(MAX_SEARCH_DAYS) as Ms * DAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRequest {
    pub provider_id: Ulid,
    pub after: Ms,
    pub duration_minutes: u32,
    pub horizon: SearchHorizon,
}

/// A read-only snapshot of one provider's schedule constraints.
#[derive(Debug, Clone)]
pub struct ProviderConstraints {
    pub provider: Provider,
    pub utc_offset_minutes: i32,
    /// Slot-occupying appointments around the captured window.
    pub bookings: Vec<Appointment>,
}

impl ProviderConstraints {
    /// Copy what a search over `window` needs out of locked provider state.
    pub fn capture(state: &ProviderState, utc_offset_minutes: i32, window: Span) -> Self {
        let padded = Span::new(window.start - DAY_MS, window.end + DAY_MS);
        Self {
            provider: state.provider.clone(),
            utc_offset_minutes,
            bookings: state
                .starting_within(&padded)
                .filter(|a| a.status.occupies_slot())
                .cloned()
                .collect(),
        }
    }

    pub fn day(&self, instant: Ms) -> LocalDay {
        LocalDay::of(instant, self.utc_offset_minutes)
    }

    pub fn day_context(&self, day: LocalDay, exclude: Option<Ulid>) -> DayContext {
        DayContext::build(&self.provider, &self.bookings, day, exclude, |_| true)
    }

    pub fn check(&self, candidate: Span, now: Option<Ms>) -> WindowCheck {
        is_free(&self.day_context(self.day(candidate.start), None), candidate, now)
    }

    /// First 5-minute-aligned start at or after `after` where a session of
    /// `duration_minutes` fits. Blocked candidates jump straight past whatever
    /// blocked them; closed days jump to the next local midnight.
    pub fn next_slot(
        &self,
        after: Ms,
        duration_minutes: u32,
        horizon: SearchHorizon,
        now: Ms,
    ) -> Option<Ms> {
        if duration_minutes == 0 {
            return None;
        }
        let duration = duration_minutes as Ms * MINUTE_MS;
        let limit = after + horizon.span_ms();
        let mut cursor = ceil_to(after, SLOT_STEP_MS);
        let mut ctx: Option<DayContext> = None;

        while cursor < limit {
            let day = self.day(cursor);
            if ctx.as_ref().is_none_or(|c| c.day != day) {
                ctx = Some(self.day_context(day, None));
            }
            let Some(current) = ctx.as_ref() else { break };

            let jump_to = match is_free(current, Span::new(cursor, cursor + duration), Some(now)) {
                WindowCheck::Free => return Some(cursor),
                WindowCheck::Closed(ClosedReason::OutsideShift) => match current.shift {
                    Some(shift) if cursor < shift.start => shift.start,
                    _ => day.next().start(),
                },
                WindowCheck::Closed(ClosedReason::DayOff) => day.next().start(),
                WindowCheck::Busy(BusyReason::PastOrTooSoon { earliest }) => earliest,
                WindowCheck::Busy(BusyReason::Break { until })
                | WindowCheck::Busy(BusyReason::Booked { until }) => until,
            };
            cursor = ceil_to(jump_to.max(cursor + SLOT_STEP_MS), SLOT_STEP_MS);
        }
        None
    }

    /// Open time inside `query`: shifts minus breaks minus buffered bookings.
    pub fn free_windows(&self, query: Span) -> Vec<Span> {
        let mut free = Vec::new();
        let mut day = self.day(query.start);
        while day.start() < query.end {
            let ctx = self.day_context(day, None);
            if let Some(shift) = ctx.shift {
                let start = shift.start.max(query.start);
                let end = shift.end.min(query.end);
                if start < end {
                    let mut blocked: Vec<Span> = ctx.breaks.clone();
                    blocked.extend(
                        ctx.occupied
                            .iter()
                            .map(|o| Span::new(o.start, o.end + ctx.buffer_ms)),
                    );
                    blocked.sort_by_key(|s| s.start);
                    let blocked = merge_overlapping(&blocked);
                    free.extend(subtract_intervals(&[Span::new(start, end)], &blocked));
                }
            }
            day = day.next();
        }
        free
    }
}

/// Constraints for many providers, captured once and searched many times.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    providers: HashMap<Ulid, ProviderConstraints>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, constraints: ProviderConstraints) {
        self.providers.insert(constraints.provider.id, constraints);
    }

    pub fn get(&self, provider_id: &Ulid) -> Option<&ProviderConstraints> {
        self.providers.get(provider_id)
    }

    pub fn contains(&self, provider_id: &Ulid) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Run every request against the captured constraints. Unknown providers yield `None`.
    pub fn find_slots(&self, requests: &[SlotRequest], now: Ms) -> Vec<Option<Ms>> {
        requests
            .iter()
            .map(|r| {
                self.get(&r.provider_id).and_then(|c| {
                    c.next_slot(r.after, r.duration_minutes, r.horizon, now)
                })
            })
            .collect()
    }
}

// ── Interval arithmetic ──────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for &span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut first = 0;

    for b in base {
        let mut cursor = b.start;
        while first < to_remove.len() && to_remove[first].end <= cursor {
            first += 1;
        }
        for r in to_remove[first..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
