//! Quota reset schedules
//!
//! Providers reset daily quotas at different instants. Gemini resets at
//! midnight Pacific time; gateways usually use rolling windows instead.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Offset, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

const SECONDS_PER_HOUR: i32 = 3600;
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Computes when an exhausted credential gets its quota back.
pub trait ResetSchedule: Send + Sync + fmt::Debug {
    /// Time left until the next reset instant, measured from `now`.
    fn until_next_reset(&self, now: DateTime<Utc>) -> Duration;
}

/// Fixed daily reset at `hour:00` in a given UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct DailyReset {
    hour: u32,
    offset: FixedOffset,
}

impl DailyReset {
    /// Daily reset at `hour:00` local time for `utc_offset_hours`.
    ///
    /// Out-of-range values are wrapped into a valid hour and offset.
    #[must_use]
    pub fn new(hour: u32, utc_offset_hours: i32) -> Self {
        let offset_secs = utc_offset_hours.clamp(-23, 23) * SECONDS_PER_HOUR;
        let offset = FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix());
        Self {
            hour: hour % 24,
            offset,
        }
    }

    /// Midnight Pacific (UTC-8), the Gemini free tier reset.
    #[must_use]
    pub fn pacific_midnight() -> Self {
        Self::new(0, -8)
    }
}

impl ResetSchedule for DailyReset {
    fn until_next_reset(&self, now: DateTime<Utc>) -> Duration {
        let local = now.with_timezone(&self.offset);
        let Some(reset_today) = local.date_naive().and_hms_opt(self.hour, 0, 0) else {
            return DAY;
        };
        let Some(mut next) = self.offset.from_local_datetime(&reset_today).single() else {
            return DAY;
        };
        if next <= local {
            next += ChronoDuration::days(1);
        }
        (next - local).to_std().unwrap_or(DAY)
    }
}

/// Quota comes back a fixed time after exhaustion.
#[derive(Debug, Clone, Copy)]
pub struct RollingWindow(pub Duration);

impl ResetSchedule for RollingWindow {
    fn until_next_reset(&self, _now: DateTime<Utc>) -> Duration {
        self.0
    }
}
