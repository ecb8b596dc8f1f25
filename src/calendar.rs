//! Local calendar math over Unix milliseconds.
//!
//! A business has a fixed UTC offset; local days, weekdays and minute-of-day
//! values are derived from it without a timezone database.

use crate::model::{DAY_MS, MINUTE_MS, Ms, Span};

/// One local calendar day of a business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDay {
    /// Days since 1970-01-01 in local time.
    pub epoch_day: i64,
    offset_ms: Ms,
}

impl LocalDay {
    pub fn of(instant: Ms, utc_offset_minutes: i32) -> Self {
        let offset_ms = utc_offset_minutes as Ms * MINUTE_MS;
        Self {
            epoch_day: (instant + offset_ms).div_euclid(DAY_MS),
            offset_ms,
        }
    }

    /// 0 = Sunday .. 6 = Saturday. 1970-01-01 was a Thursday.
    pub fn weekday(&self) -> u8 {
        (self.epoch_day + 4).rem_euclid(7) as u8
    }

    /// UTC instant of local midnight.
    pub fn start(&self) -> Ms {
        self.epoch_day * DAY_MS - self.offset_ms
    }

    pub fn end(&self) -> Ms {
        self.start() + DAY_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start(), self.end())
    }

    pub fn contains(&self, instant: Ms) -> bool {
        self.span().contains_instant(instant)
    }

    /// UTC instant of a local minute-of-day on this day.
    pub fn at_minute(&self, minute: u32) -> Ms {
        self.start() + minute as Ms * MINUTE_MS
    }

    pub fn next(&self) -> Self {
        Self {
            epoch_day: self.epoch_day + 1,
            offset_ms: self.offset_ms,
        }
    }
}

pub fn minute_of_day(instant: Ms, utc_offset_minutes: i32) -> u32 {
    let local = instant + utc_offset_minutes as Ms * MINUTE_MS;
    (local.rem_euclid(DAY_MS) / MINUTE_MS) as u32
}

/// Local wall-clock time as `HH:MM`.
pub fn format_hhmm(instant: Ms, utc_offset_minutes: i32) -> String {
    let minute = minute_of_day(instant, utc_offset_minutes);
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Round up to the next multiple of `step`. Already-aligned instants are unchanged.
pub fn ceil_to(instant: Ms, step: Ms) -> Ms {
    let rem = instant.rem_euclid(step);
    if rem == 0 { instant } else { instant + step - rem }
}
