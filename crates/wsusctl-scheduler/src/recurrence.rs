//! Next-run computation for task schedules.
//!
//! `advance` is pure: it steps from the previous due time, never from the
//! wall clock, so a slow run cannot push the cadence. Only `first_run` and
//! the catch-up in `advance_past` look at "now".

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};

use crate::tasks::{Frequency, TaskSchedule};

pub const DEFAULT_INTERVAL_MINUTES: u32 = 60;

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

fn within_end(schedule: &TaskSchedule, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule.end_date {
        Some(end) if t.date_naive() > end => None,
        _ => Some(t),
    }
}

fn interval(schedule: &TaskSchedule) -> Duration {
    let minutes = schedule
        .interval_minutes
        .unwrap_or(DEFAULT_INTERVAL_MINUTES)
        .max(1);
    Duration::minutes(minutes as i64)
}

fn weekdays(schedule: &TaskSchedule) -> Vec<Weekday> {
    if schedule.days_of_week.is_empty() {
        return vec![schedule.start_date.weekday()];
    }
    let mut days = schedule.days_of_week.clone();
    days.sort_by_key(|d| d.num_days_from_monday());
    days.dedup();
    days
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// `day` in the given month, clamped to its last day.
fn monthly_on(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)))
}

fn monthly_day(schedule: &TaskSchedule) -> u32 {
    schedule
        .day_of_month
        .unwrap_or_else(|| schedule.start_date.day())
}

/// First occurrence on or after the start date.
fn anchor(schedule: &TaskSchedule) -> Option<DateTime<Utc>> {
    let start = schedule.start_date;
    let date = match schedule.frequency {
        Frequency::Once | Frequency::Daily | Frequency::Interval => start,
        Frequency::Weekly => {
            let days = weekdays(schedule);
            start
                .iter_days()
                .take(7)
                .find(|d| days.contains(&d.weekday()))?
        }
        Frequency::Monthly => {
            let day = monthly_day(schedule);
            let candidate = monthly_on(start.year(), start.month(), day)?;
            if candidate >= start {
                candidate
            } else {
                let (y, m) = next_month(start.year(), start.month());
                monthly_on(y, m, day)?
            }
        }
    };
    Some(at(date, schedule.time_of_day))
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

/// Due time for a newly armed task: the first occurrence not before `now`.
///
/// A Once task whose moment has already passed is still returned so it
/// fires a single time.
pub fn first_run(schedule: &TaskSchedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let anchor = anchor(schedule)?;
    if schedule.frequency == Frequency::Once || anchor >= now {
        return within_end(schedule, anchor);
    }
    advance_past(schedule, anchor, now)
}

/// The occurrence after `from`. `None` for Once or past the end date.
pub fn advance(schedule: &TaskSchedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = match schedule.frequency {
        Frequency::Once => return None,
        Frequency::Daily => from + Duration::days(1),
        Frequency::Interval => from + interval(schedule),
        Frequency::Weekly => {
            let days = weekdays(schedule);
            if days.len() <= 1 {
                from + Duration::days(7)
            } else {
                let date = from
                    .date_naive()
                    .iter_days()
                    .skip(1)
                    .take(7)
                    .find(|d| days.contains(&d.weekday()))?;
                at(date, from.time())
            }
        }
        Frequency::Monthly => {
            let (y, m) = next_month(from.year(), from.month());
            at(monthly_on(y, m, monthly_day(schedule))?, from.time())
        }
    };
    within_end(schedule, next)
}

/// First occurrence after `from` that is strictly later than `now`.
///
/// Used after an overdue run: missed occurrences are skipped rather than
/// replayed.
pub fn advance_past(
    schedule: &TaskSchedule,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut next = advance(schedule, from)?;
    if next > now {
        return Some(next);
    }

    let fixed_step = match schedule.frequency {
        Frequency::Daily => Some(Duration::days(1)),
        Frequency::Interval => Some(interval(schedule)),
        Frequency::Weekly if weekdays(schedule).len() <= 1 => Some(Duration::days(7)),
        _ => None,
    };

    if let Some(step) = fixed_step {
        let behind = (now - next).num_seconds();
        let steps = behind / step.num_seconds() + 1;
        next += Duration::seconds(step.num_seconds() * steps);
        return within_end(schedule, next);
    }

    while next <= now {
        next = advance(schedule, next)?;
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(frequency: Frequency) -> TaskSchedule {
        TaskSchedule {
            frequency,
            time_of_day: NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            days_of_week: Vec::new(),
            day_of_month: None,
            start_date: NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
            end_date: None,
            interval_minutes: None,
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_weekly_advances_exactly_seven_days() {
        let s = schedule(Frequency::Weekly);
        let t = utc(2026, 3, 4, 2, 30);
        assert_eq!(advance(&s, t), Some(t + Duration::days(7)));
    }

    #[test]
    fn test_daily_interval_and_once() {
        let t = utc(2026, 3, 4, 2, 30);
        assert_eq!(advance(&schedule(Frequency::Daily), t), Some(utc(2026, 3, 5, 2, 30)));

        let mut s = schedule(Frequency::Interval);
        assert_eq!(advance(&s, t), Some(utc(2026, 3, 4, 3, 30)));
        s.interval_minutes = Some(15);
        assert_eq!(advance(&s, t), Some(utc(2026, 3, 4, 2, 45)));

        assert_eq!(advance(&schedule(Frequency::Once), t), None);
    }

    #[test]
    fn test_monthly_clamps_without_drift() {
        let mut s = schedule(Frequency::Monthly);
        s.day_of_month = Some(31);
        let jan = utc(2026, 1, 31, 2, 30);
        let feb = advance(&s, jan).unwrap();
        assert_eq!(feb, utc(2026, 2, 28, 2, 30));
        assert_eq!(advance(&s, feb), Some(utc(2026, 3, 31, 2, 30)));

        let dec = utc(2026, 12, 31, 2, 30);
        assert_eq!(advance(&s, dec), Some(utc(2027, 1, 31, 2, 30)));
    }

    #[test]
    fn test_weekly_multiple_days_steps_to_next_listed_day() {
        let mut s = schedule(Frequency::Weekly);
        s.days_of_week = vec![Weekday::Fri, Weekday::Mon];
        // 2026-03-06 is a Friday.
        let fri = utc(2026, 3, 6, 2, 30);
        let mon = advance(&s, fri).unwrap();
        assert_eq!(mon, utc(2026, 3, 9, 2, 30));
        assert_eq!(advance(&s, mon), Some(utc(2026, 3, 13, 2, 30)));
    }

    #[test]
    fn test_end_date_stops_recurrence() {
        let mut s = schedule(Frequency::Daily);
        s.end_date = NaiveDate::from_ymd_opt(2026, 3, 5);
        let t = utc(2026, 3, 4, 2, 30);
        let next = advance(&s, t).unwrap();
        assert_eq!(advance(&s, next), None);
    }

    #[test]
    fn test_first_run_aligns_to_schedule() {
        let mut s = schedule(Frequency::Weekly);
        s.days_of_week = vec![Weekday::Sat];
        // Before the start: first Saturday on or after 2026-03-04.
        let first = first_run(&s, utc(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(first, utc(2026, 3, 7, 2, 30));

        // Long after the start: the next Saturday after now.
        let first = first_run(&s, utc(2026, 4, 1, 12, 0)).unwrap();
        assert_eq!(first, utc(2026, 4, 4, 2, 30));

        let mut m = schedule(Frequency::Monthly);
        m.day_of_month = Some(1);
        assert_eq!(first_run(&m, utc(2026, 1, 1, 0, 0)), Some(utc(2026, 4, 1, 2, 30)));
    }

    #[test]
    fn test_once_in_the_past_still_fires() {
        let s = schedule(Frequency::Once);
        let now = utc(2026, 6, 1, 0, 0);
        assert_eq!(first_run(&s, now), Some(utc(2026, 3, 4, 2, 30)));
    }

    #[test]
    fn test_advance_past_catches_up_once() {
        let s = schedule(Frequency::Daily);
        let due = utc(2026, 3, 4, 2, 30);
        let now = utc(2026, 3, 10, 9, 0);
        assert_eq!(advance_past(&s, due, now), Some(utc(2026, 3, 11, 2, 30)));

        let mut m = schedule(Frequency::Monthly);
        m.day_of_month = Some(4);
        assert_eq!(advance_past(&m, due, now), Some(utc(2026, 4, 4, 2, 30)));

        // Not overdue: behaves like advance.
        let w = schedule(Frequency::Weekly);
        assert_eq!(advance_past(&w, due, due), advance(&w, due));
    }
}
