use std::time::Duration;

use slumber_core::Timestamp;
use slumber_index::Filter;

/// Inclusive `created_at` bounds applied to feed queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeWindow {
    /// The previous Monday-to-Sunday week (UTC) relative to `now`
    pub fn last_calendar_week(now: Timestamp) -> Option<Self> {
        let now = now.to_offset_date_time()?;
        let days_into_week = i64::from(now.weekday().number_days_from_monday());
        let this_monday = now
            .date()
            .checked_sub(time::Duration::days(days_into_week))?;
        let last_monday = this_monday.checked_sub(time::Duration::weeks(1))?;

        let from = Timestamp::from_offset_date_time(last_monday.midnight().assume_utc())?;
        let to = Timestamp::from_offset_date_time(this_monday.midnight().assume_utc())?
            .saturating_sub(Duration::from_millis(1));
        Some(Self { from, to })
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.from <= ts && ts <= self.to
    }

    pub(crate) fn to_filter(self) -> Filter {
        Filter::range(
            "created_at",
            Some(self.from.to_string()),
            Some(self.to.to_string()),
        )
    }
}
