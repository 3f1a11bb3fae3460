use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;

/// Trading session expressed in minutes from midnight, US/Eastern.
///
/// Timer-driven refreshes are suppressed outside the session when the user
/// enables `trading_hours_only`; manual refreshes always run. The check is a
/// pure function of the supplied timestamp so it can be exercised without a
/// real clock. Holidays are not modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    pub open_minutes: u32,
    pub close_minutes: u32,
}

impl Default for ActiveHours {
    /// Regular NYSE/NASDAQ session, 09:30 to 16:00 Eastern.
    fn default() -> Self {
        Self {
            open_minutes: 9 * 60 + 30,
            close_minutes: 16 * 60,
        }
    }
}

impl ActiveHours {
    /// Session that never opens; timer ticks are always suppressed.
    pub fn closed() -> Self {
        Self {
            open_minutes: 0,
            close_minutes: 0,
        }
    }

    /// Session covering the whole day, weekends included.
    pub fn always_open() -> Self {
        Self {
            open_minutes: 0,
            close_minutes: 24 * 60,
        }
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        if *self == Self::always_open() {
            return true;
        }

        let eastern = now.with_timezone(&New_York);
        if matches!(eastern.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let minutes = eastern.hour() * 60 + eastern.minute();
        minutes >= self.open_minutes && minutes < self.close_minutes
    }
}
