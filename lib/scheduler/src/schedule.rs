//! Recurrence math for schedule triggers.
//!
//! All times are UTC. A fire time is always strictly after the reference
//! instant, so a schedule never fires twice for the same slot.

use crate::error::ScheduleError;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use taskflow_workflow::trigger::{Frequency, Recurrence};

/// A validated recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    recurrence: Recurrence,
}

impl Schedule {
    /// Validates a recurrence.
    ///
    /// # Errors
    ///
    /// Returns an error if a monthly day is outside 1..=31.
    pub fn new(recurrence: Recurrence) -> Result<Self, ScheduleError> {
        match recurrence.frequency {
            Frequency::Monthly { day } if !(1..=31).contains(&day) => {
                Err(ScheduleError::InvalidDay { day })
            }
            _ => Ok(Self { recurrence }),
        }
    }

    /// Returns the recurrence.
    #[must_use]
    pub fn recurrence(&self) -> Recurrence {
        self.recurrence
    }

    /// Calculates the first fire time strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the date arithmetic overflows.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let today = after.date_naive();
        let next = match self.recurrence.frequency {
            Frequency::Daily => (0..=1)
                .filter_map(|offset| today.checked_add_days(Days::new(offset)))
                .map(|date| self.at(date))
                .find(|candidate| *candidate > after),
            Frequency::Weekly { weekday } => {
                let ahead = (7 + weekday.num_days_from_monday()
                    - today.weekday().num_days_from_monday())
                    % 7;
                [ahead, ahead + 7]
                    .into_iter()
                    .filter_map(|offset| today.checked_add_days(Days::new(u64::from(offset))))
                    .map(|date| self.at(date))
                    .find(|candidate| *candidate > after)
            }
            Frequency::Monthly { day } => (0..=2)
                .filter_map(|offset| month_day(today, offset, day))
                .map(|date| self.at(date))
                .find(|candidate| *candidate > after),
        };

        next.ok_or_else(|| ScheduleError::EvaluationFailed {
            reason: format!("no fire time after {after}"),
        })
    }

    fn at(&self, date: NaiveDate) -> DateTime<Utc> {
        date.and_time(self.recurrence.at).and_utc()
    }
}

/// Returns `day` of the month `offset` months after `today`'s, clamped to
/// the last day of that month.
fn month_day(today: NaiveDate, offset: u32, day: u32) -> Option<NaiveDate> {
    let first = today.with_day(1)?.checked_add_months(Months::new(offset))?;
    let last = first
        .checked_add_months(Months::new(1))?
        .pred_opt()?
        .day();
    first.with_day(day.min(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime, TimeZone, Weekday};

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn daily_fires_later_today_or_tomorrow() {
        let schedule = Schedule::new(Recurrence::daily(nine())).unwrap();

        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 8, 0)).unwrap(),
            utc(2025, 3, 10, 9, 0)
        );
        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 9, 0)).unwrap(),
            utc(2025, 3, 11, 9, 0)
        );
        assert_eq!(
            schedule.next_after(utc(2025, 12, 31, 23, 59)).unwrap(),
            utc(2026, 1, 1, 9, 0)
        );
    }

    #[test]
    fn daily_next_fire_is_within_a_day_and_after_now() {
        let schedule = Schedule::new(Recurrence::daily(nine())).unwrap();
        let mut now = utc(2025, 1, 1, 0, 0);
        while now < utc(2025, 1, 3, 0, 0) {
            let next = schedule.next_after(now).unwrap();
            assert!(next > now, "{next} is not after {now}");
            assert!(next - now <= Duration::hours(24), "{next} is too far from {now}");
            now += Duration::minutes(37);
        }

        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::hours(24));
    }

    #[test]
    fn weekly_fires_on_the_weekday() {
        let schedule = Schedule::new(Recurrence::weekly(Weekday::Mon, nine())).unwrap();

        // 2025-03-12 is a Wednesday.
        assert_eq!(
            schedule.next_after(utc(2025, 3, 12, 12, 0)).unwrap(),
            utc(2025, 3, 17, 9, 0)
        );
        // Monday after the slot moves a week ahead.
        assert_eq!(
            schedule.next_after(utc(2025, 3, 17, 10, 0)).unwrap(),
            utc(2025, 3, 24, 9, 0)
        );
        assert_eq!(
            schedule.next_after(utc(2025, 3, 17, 8, 0)).unwrap(),
            utc(2025, 3, 17, 9, 0)
        );
    }

    #[test]
    fn monthly_clamps_to_month_length() {
        let schedule = Schedule::new(Recurrence::monthly(31, nine())).unwrap();

        assert_eq!(
            schedule.next_after(utc(2025, 2, 1, 0, 0)).unwrap(),
            utc(2025, 2, 28, 9, 0)
        );
        assert_eq!(
            schedule.next_after(utc(2025, 2, 28, 10, 0)).unwrap(),
            utc(2025, 3, 31, 9, 0)
        );
        assert_eq!(
            schedule.next_after(utc(2024, 2, 10, 0, 0)).unwrap(),
            utc(2024, 2, 29, 9, 0)
        );
    }

    #[test]
    fn monthly_day_must_exist_in_some_month() {
        assert_eq!(
            Schedule::new(Recurrence::monthly(0, nine())),
            Err(ScheduleError::InvalidDay { day: 0 })
        );
        assert!(Schedule::new(Recurrence::monthly(32, nine())).is_err());
    }
}
