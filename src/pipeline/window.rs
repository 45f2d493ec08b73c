// src/pipeline/window.rs

//! Daily time-of-day windows and schedules, in local time.

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};

use crate::error::{AppError, Result};
use crate::models::WindowConfig;

/// A daily window `[start, stop)`, possibly crossing midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: NaiveTime,
    stop: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, stop: NaiveTime) -> Result<Self> {
        if start == stop {
            return Err(AppError::validation("window start and stop are equal"));
        }
        Ok(Self { start, stop })
    }

    pub fn from_config(config: &WindowConfig) -> Result<Self> {
        Self::new(
            time_of_day(config.start_hour, config.start_minute)?,
            time_of_day(config.stop_hour, config.stop_minute)?,
        )
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.stop {
            self.start <= time && time < self.stop
        } else {
            time >= self.start || time < self.stop
        }
    }
}

pub fn time_of_day(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| AppError::validation(format!("{hour:02}:{minute:02} is not a time of day")))
}

/// The first occurrence of `at` strictly after `now`.
pub fn next_daily_run(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn t(hour: u32, minute: u32) -> NaiveTime {
        time_of_day(hour, minute).unwrap()
    }

    #[test]
    fn test_daytime_window() {
        let window = TimeWindow::new(t(9, 0), t(17, 30)).unwrap();
        assert!(window.contains(t(9, 0)));
        assert!(window.contains(t(12, 0)));
        assert!(!window.contains(t(17, 30)));
        assert!(!window.contains(t(3, 0)));
    }

    #[test]
    fn test_window_crossing_midnight() {
        let window = TimeWindow::new(t(22, 0), t(6, 0)).unwrap();
        assert!(window.contains(t(23, 15)));
        assert!(window.contains(t(0, 30)));
        assert!(!window.contains(t(6, 0)));
        assert!(!window.contains(t(12, 0)));
    }

    #[test]
    fn test_invalid_windows() {
        assert!(TimeWindow::new(t(5, 0), t(5, 0)).is_err());
        assert!(time_of_day(24, 0).is_err());
    }

    #[test]
    fn test_next_daily_run() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let before = day.and_time(t(1, 0));
        assert_eq!(next_daily_run(before, t(2, 0)), day.and_time(t(2, 0)));

        let after = day.and_time(t(3, 0));
        let tomorrow = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        assert_eq!(next_daily_run(after, t(2, 0)), tomorrow.and_time(t(2, 0)));
        assert_eq!(next_daily_run(day.and_time(t(2, 0)), t(2, 0)), tomorrow.and_time(t(2, 0)));
    }
}
