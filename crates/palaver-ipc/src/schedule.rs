use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use palaver_core::config::Schedule;

/// Next UTC fire time for `schedule` strictly after `from`.
///
/// `None` means the schedule is exhausted (a `Once` whose instant has
/// passed) or the configured time is invalid.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => (*at > from).then_some(*at),

        Schedule::Interval { every_secs } => {
            Some(from + Duration::seconds((*every_secs).max(1) as i64))
        }

        Schedule::Daily { hour, minute } => {
            let candidate = at_time(from, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }

        Schedule::Weekly { day, hour, minute } => {
            // 0 = Monday, matching chrono's num_days_from_monday.
            let today = from.weekday().num_days_from_monday() as i64;
            let target = (*day as i64).clamp(0, 6);
            let days_ahead = (target - today).rem_euclid(7);

            let candidate = at_time(from + Duration::days(days_ahead), *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }
    }
}

fn at_time(day: DateTime<Utc>, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        day.year(),
        day.month(),
        day.day(),
        hour as u32,
        minute as u32,
        0,
    )
    .single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn once_fires_only_in_the_future() {
        let at = utc(2026, 3, 1, 12, 0);
        let s = Schedule::Once { at };
        assert_eq!(compute_next_run(&s, utc(2026, 3, 1, 11, 0)), Some(at));
        assert_eq!(compute_next_run(&s, at), None);
    }

    #[test]
    fn interval_adds_seconds() {
        let from = utc(2026, 3, 1, 12, 0);
        let s = Schedule::Interval { every_secs: 90 };
        assert_eq!(compute_next_run(&s, from), Some(from + Duration::seconds(90)));
    }

    #[test]
    fn daily_rolls_over_after_time_passed() {
        let s = Schedule::Daily { hour: 9, minute: 30 };
        assert_eq!(
            compute_next_run(&s, utc(2026, 3, 1, 8, 0)),
            Some(utc(2026, 3, 1, 9, 30))
        );
        assert_eq!(
            compute_next_run(&s, utc(2026, 3, 1, 9, 30)),
            Some(utc(2026, 3, 2, 9, 30))
        );
    }

    #[test]
    fn weekly_finds_next_weekday() {
        // 2026-03-04 is a Wednesday.
        let wed = utc(2026, 3, 4, 10, 0);
        let monday = Schedule::Weekly { day: 0, hour: 8, minute: 0 };
        assert_eq!(compute_next_run(&monday, wed), Some(utc(2026, 3, 9, 8, 0)));

        let wed_later = Schedule::Weekly { day: 2, hour: 18, minute: 0 };
        assert_eq!(compute_next_run(&wed_later, wed), Some(utc(2026, 3, 4, 18, 0)));

        let wed_earlier = Schedule::Weekly { day: 2, hour: 6, minute: 0 };
        assert_eq!(compute_next_run(&wed_earlier, wed), Some(utc(2026, 3, 11, 6, 0)));
    }

    #[test]
    fn invalid_time_yields_none() {
        let s = Schedule::Daily { hour: 25, minute: 0 };
        assert_eq!(compute_next_run(&s, utc(2026, 3, 1, 0, 0)), None);
    }
}
