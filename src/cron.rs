//! Five-field cron expressions and the trigger scheduler built on them.
//!
//! Expressions are evaluated in UTC. The supported grammar is the common
//! five-field form (`minute hour day-of-month month day-of-week`) with `*`,
//! comma lists, `a-b` ranges, and `/n` steps. Day-of-week accepts 0-7 with
//! both 0 and 7 meaning Sunday.

use chrono::{DateTime, Datelike, Days, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::Error;
use crate::registry::JobRegistry;
use crate::schema::JobRecord;
use crate::storage::JobStore;

/// A parsed five-field cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    // `*` in the day fields changes their combination semantics, so the
    // parsed sets alone are not enough.
    dom_star: bool,
    dow_star: bool,
}

impl CronSchedule {
    /// Parse a five-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Configuration(format!(
                "cron expression {expression:?} must have 5 fields, found {}",
                fields.len()
            )));
        }

        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let days_of_month = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;
        let mut days_of_week = parse_field(fields[4], 0, 7)?;
        if days_of_week.remove(&7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_star: fields[2] == "*",
            dow_star: fields[4] == "*",
        })
    }

    fn matches_day(&self, date: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        // Standard cron: when both day fields are restricted, either one
        // matching fires the schedule.
        match (self.dom_star, self.dow_star) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// The first occurrence strictly after `after`, or `None` if nothing
    /// matches within roughly the next four years (a degenerate expression
    /// such as `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (after + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let horizon = start.checked_add_days(Days::new(366 * 4))?;

        let mut candidate = start;
        while candidate < horizon {
            if !self.months.contains(&candidate.month()) {
                // Jump to the first minute of the next month.
                let (year, month) = if candidate.month() == 12 {
                    (candidate.year() + 1, 1)
                } else {
                    (candidate.year(), candidate.month() + 1)
                };
                candidate = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.matches_day(candidate) {
                let next_day = candidate.date_naive().checked_add_days(Days::new(1))?;
                candidate = Utc.from_utc_datetime(&next_day.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate.with_minute(0)? + chrono::Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&candidate.minute()) {
                candidate += chrono::Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse one cron field into its allowed values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, Error> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| bad_field(field, "step is not a number"))?;
                if step == 0 {
                    return Err(bad_field(field, "step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else {
            match range.split_once('-') {
                Some((lo, hi)) => (
                    parse_bound(lo, field)?,
                    parse_bound(hi, field)?,
                ),
                None => {
                    let value = parse_bound(range, field)?;
                    (value, value)
                }
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(bad_field(
                field,
                &format!("values must be within {min}-{max}"),
            ));
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    if values.is_empty() {
        return Err(bad_field(field, "no values"));
    }
    Ok(values)
}

fn parse_bound(raw: &str, field: &str) -> Result<u32, Error> {
    raw.parse()
        .map_err(|_| bad_field(field, "value is not a number"))
}

fn bad_field(field: &str, reason: &str) -> Error {
    Error::Configuration(format!("invalid cron field {field:?}: {reason}"))
}

/// Evaluates due cron triggers against a store and enqueues job records.
///
/// Stateless between passes: all bookkeeping (`next_run_at`, `last_run_at`,
/// `last_job_id`) lives on the trigger rows, so any number of processes can
/// run a scheduler over the same store.
pub struct CronScheduler<S, Context> {
    store: S,
    registry: Arc<JobRegistry<Context>>,
}

impl<S, Context> CronScheduler<S, Context>
where
    S: JobStore,
    Context: Clone + Send + 'static,
{
    /// Build a scheduler over a store and the registry used to validate
    /// trigger params before enqueueing.
    pub fn new(store: S, registry: Arc<JobRegistry<Context>>) -> Self {
        Self { store, registry }
    }

    /// Evaluate every due trigger once, as of `now`. Returns how many job
    /// records were enqueued.
    ///
    /// A trigger seen for the first time (no `next_run_at` yet) is only
    /// initialized, not fired; it starts firing from its next occurrence.
    /// Bad rows are never fatal to the pass: an unparseable expression
    /// disables the trigger, params that no longer validate skip it and
    /// advance its next occurrence.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let due = self.store.due_cron_jobs(now).await?;
        let mut enqueued = 0_usize;

        for trigger in due {
            let schedule = match CronSchedule::parse(&trigger.cron_expression) {
                Ok(schedule) => schedule,
                Err(error) => {
                    warn!(
                        %error,
                        cron.id = %trigger.id,
                        job = %trigger.job_name,
                        "disabling cron trigger with invalid expression"
                    );
                    // Without a parseable expression there is no next
                    // occurrence to advance to, so the row would stay due
                    // on every pass. Turn it off instead.
                    self.store.disable_cron_job(&trigger.id).await?;
                    continue;
                }
            };
            let next_run_at = schedule.next_after(now);

            if trigger.next_run_at.is_none() {
                self.store
                    .record_cron_trigger(&trigger.id, None, None, next_run_at)
                    .await?;
                continue;
            }

            if let Err(error) = self.registry.check_params(&trigger.job_name, &trigger.params) {
                warn!(
                    %error,
                    cron.id = %trigger.id,
                    job = %trigger.job_name,
                    "skipping cron trigger with invalid params"
                );
                // Advance the trigger anyway so a bad row cannot wedge the
                // scheduler into retrying it every pass.
                self.store
                    .record_cron_trigger(&trigger.id, None, Some(now), next_run_at)
                    .await?;
                continue;
            }

            let mut record = JobRecord::pending(&trigger.job_name, trigger.params.clone());
            record.correlation_id = Some(trigger.id.clone());
            let record = self.store.insert(record).await?;
            info!(
                cron.id = %trigger.id,
                job = %trigger.job_name,
                job.id = %record.id,
                "cron trigger enqueued job"
            );

            self.store
                .record_cron_trigger(&trigger.id, Some(record.id), Some(now), next_run_at)
                .await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_err!(CronSchedule::parse("* * * *"));
        assert_err!(CronSchedule::parse("* * * * * *"));
        assert_err!(CronSchedule::parse(""));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert_err!(CronSchedule::parse("60 * * * *"));
        assert_err!(CronSchedule::parse("* 24 * * *"));
        assert_err!(CronSchedule::parse("* * 0 * *"));
        assert_err!(CronSchedule::parse("* * * 13 *"));
        assert_err!(CronSchedule::parse("* * * * 8"));
        assert_err!(CronSchedule::parse("*/0 * * * *"));
    }

    #[test]
    fn accepts_common_forms() {
        assert_ok!(CronSchedule::parse("* * * * *"));
        assert_ok!(CronSchedule::parse("0 0 * * *"));
        assert_ok!(CronSchedule::parse("*/15 * * * *"));
        assert_ok!(CronSchedule::parse("0 9-17 * * 1-5"));
        assert_ok!(CronSchedule::parse("30 4 1,15 * *"));
        assert_ok!(CronSchedule::parse("0 0 * * 7"));
    }

    #[test]
    fn daily_midnight_advances_to_the_next_day() {
        let schedule = CronSchedule::parse("0 0 * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 12, 30)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 0, 0));
    }

    #[test]
    fn step_minutes_round_up_within_the_hour() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 12, 16)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 12, 30));
        let wrapped = schedule.next_after(at(2026, 3, 10, 12, 45)).unwrap();
        assert_eq!(wrapped, at(2026, 3, 10, 13, 0));
    }

    #[test]
    fn weekday_schedule_skips_the_weekend() {
        // 2026-03-13 is a Friday.
        let schedule = CronSchedule::parse("0 9 * * 1-5").unwrap();
        let next = schedule.next_after(at(2026, 3, 13, 10, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 16, 9, 0));
    }

    #[test]
    fn sunday_accepts_both_spellings() {
        // 2026-03-15 is a Sunday.
        let zero = CronSchedule::parse("0 0 * * 0").unwrap();
        let seven = CronSchedule::parse("0 0 * * 7").unwrap();
        let after = at(2026, 3, 10, 0, 0);
        assert_eq!(zero.next_after(after), Some(at(2026, 3, 15, 0, 0)));
        assert_eq!(seven.next_after(after), Some(at(2026, 3, 15, 0, 0)));
    }

    #[test]
    fn month_rollover() {
        let schedule = CronSchedule::parse("0 0 1 * *").unwrap();
        let next = schedule.next_after(at(2026, 12, 20, 8, 0)).unwrap();
        assert_eq!(next, at(2027, 1, 1, 0, 0));
    }

    #[test]
    fn restricted_day_fields_are_or_combined() {
        // Day-of-month 15 OR Friday; 2026-03-13 is a Friday before the 15th.
        let schedule = CronSchedule::parse("0 0 15 * 5").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 13, 0, 0));
    }

    #[test]
    fn impossible_dates_return_none() {
        let schedule = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(schedule.next_after(at(2026, 1, 1, 0, 0)), None);
    }
}
