use crate::{
  errors::CoreError,
  jobs::job::{CrawlerSchedule, ScheduleType},
};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Upper bound on schedule iteration; a cron/timezone pair that produces
/// nothing inside this window is treated as never firing.
const MAX_CANDIDATES: usize = 10_000;

/// Accepts standard 5-field cron expressions; the seconds field the parser
/// wants is pinned to 0.
pub fn parse_cron(expression: &str) -> Result<Schedule, CoreError> {
  let trimmed = expression.trim();
  let normalized = if trimmed.split_whitespace().count() == 5 {
    format!("0 {}", trimmed)
  } else {
    trimmed.to_string()
  };
  Schedule::from_str(&normalized)
    .map_err(|e| CoreError::InvalidInput(format!("bad cron expression '{}': {}", expression, e)))
}

pub fn parse_timezone(timezone: &str) -> Result<Tz, CoreError> {
  timezone
    .parse::<Tz>()
    .map_err(|_| CoreError::InvalidInput(format!("unknown timezone: {}", timezone)))
}

/// Next firing instant strictly after `after`, in UTC.
///
/// The cron fields are evaluated against wall-clock time in `tz` and the
/// matching instant is converted to UTC. Local times erased by a DST gap
/// advance to the next instant that exists; ambiguous local times in a DST
/// overlap resolve to the earlier instant.
pub fn next_fire(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let local_naive = after.with_timezone(&tz).naive_local();
  let cursor = Utc.from_utc_datetime(&local_naive);
  for candidate in schedule.after(&cursor).take(MAX_CANDIDATES) {
    let naive = candidate.naive_utc();
    let resolved = match tz.from_local_datetime(&naive) {
      chrono::LocalResult::Single(dt) => Some(dt),
      chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest),
      chrono::LocalResult::None => {
        // DST gap: slide forward until the wall clock exists again.
        (1..=180).find_map(|minutes| {
          tz.from_local_datetime(&(naive + TimeDelta::minutes(minutes)))
            .earliest()
        })
      }
    };
    if let Some(dt) = resolved {
      let utc = dt.with_timezone(&Utc);
      if utc > after {
        return Some(utc);
      }
    }
  }
  None
}

/// The next `count` firing instants, strictly increasing in UTC.
pub fn upcoming(
  schedule: &Schedule,
  tz: Tz,
  after: DateTime<Utc>,
  count: usize,
) -> Vec<DateTime<Utc>> {
  let mut results = Vec::with_capacity(count);
  let mut cursor = after;
  for _ in 0..count {
    match next_fire(schedule, tz, cursor) {
      Some(next) => {
        results.push(next);
        cursor = next;
      }
      None => break,
    }
  }
  results
}

/// Distance between the next two fires; drives the trigger TTL.
pub fn period(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<TimeDelta> {
  let fires = upcoming(schedule, tz, after, 2);
  match fires.as_slice() {
    [first, second] => Some(*second - *first),
    _ => None,
  }
}

pub fn validate_schedule(schedule: &CrawlerSchedule) -> Result<(), CoreError> {
  parse_timezone(&schedule.timezone)?;
  match schedule.schedule_type {
    ScheduleType::Recurring => {
      let expression = schedule.cron_expression.as_deref().ok_or_else(|| {
        CoreError::InvalidInput("recurring schedule requires a cron expression".to_string())
      })?;
      parse_cron(expression)?;
      Ok(())
    }
    ScheduleType::OneTime => {
      if let Some(expression) = schedule.cron_expression.as_deref() {
        parse_cron(expression)?;
      }
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::NaiveDate;

  fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(
      &NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, 0)
        .unwrap(),
    )
  }

  #[test]
  fn test_parse_five_field_expressions() {
    assert!(parse_cron("* * * * *").is_ok());
    assert!(parse_cron("*/5 * * * *").is_ok());
    assert!(parse_cron("0 9 * * 1-5").is_ok());
    assert!(parse_cron("not a cron").is_err());
    assert!(parse_cron("99 * * * *").is_err());
  }

  #[test]
  fn test_every_minute_in_utc_fires_once_per_minute() {
    let schedule = parse_cron("* * * * *").unwrap();
    let start = utc(2024, 3, 1, 12, 0);
    let fires = upcoming(&schedule, chrono_tz::UTC, start, 10);
    assert_eq!(fires.len(), 10);
    for (index, fire) in fires.iter().enumerate() {
      assert_eq!(*fire - start, TimeDelta::minutes(index as i64 + 1));
    }
  }

  #[test]
  fn test_fires_are_strictly_increasing() {
    let schedule = parse_cron("*/5 * * * *").unwrap();
    let tz: Tz = "America/Sao_Paulo".parse().unwrap();
    let fires = upcoming(&schedule, tz, utc(2024, 6, 1, 0, 0), 20);
    assert_eq!(fires.len(), 20);
    for window in fires.windows(2) {
      assert!(window[0] < window[1]);
    }
  }

  #[test]
  fn test_cron_evaluated_in_configured_zone() {
    // 09:00 in New York is 14:00 UTC while EST is not in DST.
    let schedule = parse_cron("0 9 * * *").unwrap();
    let tz: Tz = "America/New_York".parse().unwrap();
    let fire = next_fire(&schedule, tz, utc(2024, 1, 10, 0, 0)).unwrap();
    assert_eq!(fire, utc(2024, 1, 10, 14, 0));
  }

  #[test]
  fn test_dst_gap_advances_to_next_valid_instant() {
    // US spring-forward 2024-03-10: 02:30 EST does not exist; the fire
    // slides to 03:00 EDT, i.e. 07:00 UTC.
    let schedule = parse_cron("30 2 * * *").unwrap();
    let tz: Tz = "America/New_York".parse().unwrap();
    let fire = next_fire(&schedule, tz, utc(2024, 3, 10, 0, 0)).unwrap();
    assert_eq!(fire, utc(2024, 3, 10, 7, 0));
  }

  #[test]
  fn test_dst_overlap_chooses_earlier_instant() {
    // US fall-back 2024-11-03: 01:30 occurs twice; the earlier (EDT)
    // instant is 05:30 UTC.
    let schedule = parse_cron("30 1 * * *").unwrap();
    let tz: Tz = "America/New_York".parse().unwrap();
    let fire = next_fire(&schedule, tz, utc(2024, 11, 3, 0, 0)).unwrap();
    assert_eq!(fire, utc(2024, 11, 3, 5, 30));
  }

  #[test]
  fn test_period_matches_cron_cadence() {
    let schedule = parse_cron("*/5 * * * *").unwrap();
    let period = period(&schedule, chrono_tz::UTC, utc(2024, 3, 1, 12, 1)).unwrap();
    assert_eq!(period, TimeDelta::minutes(5));
  }

  #[test]
  fn test_validate_schedule() {
    let schedule = CrawlerSchedule {
      schedule_type: ScheduleType::Recurring,
      cron_expression: Some("*/5 * * * *".to_string()),
      timezone: "America/Sao_Paulo".to_string(),
      next_runs: vec![],
    };
    assert!(validate_schedule(&schedule).is_ok());

    let schedule = CrawlerSchedule {
      schedule_type: ScheduleType::Recurring,
      cron_expression: None,
      timezone: "UTC".to_string(),
      next_runs: vec![],
    };
    assert!(validate_schedule(&schedule).is_err());

    let schedule = CrawlerSchedule {
      schedule_type: ScheduleType::OneTime,
      cron_expression: None,
      timezone: "Mars/Olympus_Mons".to_string(),
      next_runs: vec![],
    };
    assert!(validate_schedule(&schedule).is_err());
  }
}
