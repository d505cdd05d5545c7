//! Business-hours policy in a fixed local offset.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Timelike, Utc, Weekday};

use crate::config::BusinessHoursConfig;

/// Opening hours evaluated in one canonical timezone.
///
/// A fixed offset is enough for Jakarta (UTC+07:00 all year). Every check
/// converts the UTC instant to that offset first, so the host timezone
/// never leaks into the decision.
#[derive(Debug, Clone)]
pub struct BusinessHours {
    offset: FixedOffset,
    open_hour: u32,
    close_hour: u32,
    days: Vec<Weekday>,
}

impl BusinessHours {
    pub fn from_config(config: &BusinessHoursConfig) -> Self {
        let offset =
            FixedOffset::east_opt(config.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self {
            offset,
            open_hour: config.open_hour,
            close_hour: config.close_hour,
            days: config.days.clone(),
        }
    }

    /// Whether `now` falls inside opening hours. Opening is inclusive,
    /// closing exclusive.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset);
        self.days.contains(&local.weekday())
            && local.hour() >= self.open_hour
            && local.hour() < self.close_hour
    }

    /// Calendar date in local time. Daily limits roll over at local midnight.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Next local midnight, as a UTC instant.
    pub fn next_local_midnight(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = self.local_date(now).succ_opt().unwrap_or(NaiveDate::MAX);
        let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
        (midnight - self.offset).and_utc()
    }
}
