//! When a job fires.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use super::error::JobError;

#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed period, anchored on the previous scheduled time.
    Interval(Duration),
    /// Calendar expression (`sec min hour day-of-month month day-of-week [year]`), UTC.
    Cron {
        expression: String,
        schedule: Box<Schedule>,
    },
}

impl Trigger {
    pub fn every(period: Duration) -> Self {
        Trigger::Interval(period)
    }

    pub fn cron(expression: &str) -> Result<Self, JobError> {
        let schedule = Schedule::from_str(expression).map_err(|e| JobError::InvalidCron {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;
        Ok(Trigger::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// Once a day at `hour:minute` UTC.
    pub fn daily_at(hour: u32, minute: u32) -> Result<Self, JobError> {
        Self::cron(&format!("0 {} {} * * *", minute, hour))
    }

    /// First fire time for a job registered at `now`.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(period) => Some(now + to_chrono(*period)),
            Trigger::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }

    /// Next fire time strictly after `now`, given the previous scheduled time.
    ///
    /// Interval triggers stay on the `anchor + k * period` grid, so a backlog
    /// of missed periods collapses into the single fire that is already due.
    pub fn next_after(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(period) => {
                if anchor > now {
                    return Some(anchor);
                }
                let period_ms = period_millis(*period);
                let behind_ms = (now - anchor).num_milliseconds();
                let steps = behind_ms / period_ms + 1;
                Some(anchor + chrono::Duration::milliseconds(steps * period_ms))
            }
            Trigger::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Interval(period) => format!("interval[{}s]", period.as_secs_f64()),
            Trigger::Cron { expression, .. } => format!("cron[{}]", expression),
        }
    }
}

fn period_millis(period: Duration) -> i64 {
    (period.as_millis() as i64).max(1)
}

fn to_chrono(period: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(period_millis(period))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn interval_first_run_is_one_period_out() {
        let trigger = Trigger::every(Duration::from_secs(900));
        assert_eq!(trigger.first_run(at(12, 0, 0)), Some(at(12, 15, 0)));
    }

    #[test]
    fn interval_next_follows_anchor() {
        let trigger = Trigger::every(Duration::from_secs(900));
        assert_eq!(trigger.next_after(at(12, 15, 0), at(12, 15, 0)), Some(at(12, 30, 0)));
        assert_eq!(trigger.next_after(at(12, 15, 0), at(12, 15, 3)), Some(at(12, 30, 0)));
    }

    #[test]
    fn interval_backlog_is_skipped() {
        let trigger = Trigger::every(Duration::from_secs(900));
        // three and a half periods late
        let next = trigger.next_after(at(12, 15, 0), at(13, 7, 30)).unwrap();
        assert_eq!(next, at(13, 15, 0));
        assert!(next > at(13, 7, 30));
    }

    #[test]
    fn interval_anchor_in_future_is_kept() {
        let trigger = Trigger::every(Duration::from_secs(60));
        assert_eq!(trigger.next_after(at(12, 5, 0), at(12, 0, 0)), Some(at(12, 5, 0)));
    }

    #[test]
    fn daily_cron_picks_next_matching_time() {
        let trigger = Trigger::daily_at(1, 0).unwrap();
        assert_eq!(
            trigger.first_run(at(0, 30, 0)),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 1, 0, 0).unwrap())
        );
        assert_eq!(
            trigger.first_run(at(1, 0, 0)),
            Some(Utc.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap())
        );
    }

    #[test]
    fn cron_after_missed_days_fires_once() {
        let trigger = Trigger::daily_at(1, 0).unwrap();
        let next = trigger
            .next_after(at(1, 0, 0) - chrono::Duration::days(3), at(9, 0, 0))
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap());
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let err = Trigger::cron("not a schedule").unwrap_err();
        assert!(matches!(err, JobError::InvalidCron { .. }));
    }

    #[test]
    fn description_names_the_kind() {
        assert_eq!(Trigger::every(Duration::from_secs(1800)).describe(), "interval[1800s]");
        assert_eq!(Trigger::cron("0 0 1 * * *").unwrap().describe(), "cron[0 0 1 * * *]");
    }
}
