// Cron evaluation for time-based schedules
//
// Expressions use the `cron` crate syntax with second precision
// (`sec min hour day-of-month month day-of-week [year]`).

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire time strictly after `after`, evaluated in `timezone`
///
/// `None` when the expression has no future occurrence.
pub fn next_fire_time(
    schedule: &CronSchedule,
    timezone: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&timezone))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_valid_cron_expression() {
        assert!(parse_cron_expression("0 0 12 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        let result = parse_cron_expression("every day at noon");
        assert!(matches!(
            result,
            Err(ScheduleError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn test_next_fire_time_respects_timezone() {
        let schedule = parse_cron_expression("0 0 12 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let utc_noon = next_fire_time(&schedule, chrono_tz::UTC, after).unwrap();
        assert_eq!(utc_noon, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());

        // Noon in Ho Chi Minh City (UTC+7) is 05:00 UTC
        let hcm_noon = next_fire_time(&schedule, chrono_tz::Asia::Ho_Chi_Minh, after).unwrap();
        assert_eq!(hcm_noon, Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_time_is_strictly_after() {
        let schedule = parse_cron_expression("0 * * * * * *").unwrap();
        let at_minute = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let next = next_fire_time(&schedule, default_timezone(), at_minute).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap());
    }

    #[test]
    fn test_expired_expression_has_no_next_fire() {
        let schedule = parse_cron_expression("0 0 0 1 1 * 2020").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(next_fire_time(&schedule, default_timezone(), after).is_none());
    }
}
