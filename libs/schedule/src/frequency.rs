//! Update frequency specification and next-occurrence computation.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a frequency string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrequencyParseError {
    #[error("empty frequency string")]
    Empty,

    #[error("unknown frequency kind: {0}")]
    UnknownKind(String),

    #[error("frequency '{kind}' expects {expected} arguments, got {got}")]
    WrongArity {
        kind: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid time '{0}', expected HH:mm:ss")]
    InvalidTime(String),

    #[error("invalid date '{0}', expected MM/dd/yyyy")]
    InvalidDate(String),

    #[error("invalid day of week: {0}")]
    InvalidDayOfWeek(String),

    #[error("invalid day of month: {0}")]
    InvalidDayOfMonth(String),

    #[error("invalid week ordinal '{0}', expected 1..=4")]
    InvalidWeekOrdinal(String),

    #[error("invalid minutes: {0}")]
    InvalidMinutes(String),
}

/// Day-of-month selector for monthly schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonthlyDay {
    /// A fixed calendar day, 1..=31. Months too short for it use their last day.
    Day(u32),
    /// The last calendar day of the month.
    Last,
}

/// How often the agent runs an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    /// Scheduling disabled.
    None,
    /// A single occurrence at a fixed instant.
    Once { date: NaiveDate, time: NaiveTime },
    /// Every `minutes` minutes from now.
    Hourly { minutes: i64 },
    /// Every day at `time`.
    Daily { time: NaiveTime },
    /// Every week on `day` at `time`.
    Weekly { day: Weekday, time: NaiveTime },
    /// Every month on `day` at `time`.
    Monthly { day: MonthlyDay, time: NaiveTime },
    /// The `ordinal`-th `day` of every month at `time`, ordinal 1..=4.
    MonthlyByWeekAndDay {
        ordinal: u32,
        day: Weekday,
        time: NaiveTime,
    },
}

impl std::str::FromStr for Frequency {
    type Err = FrequencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let (kind, args) = parts.split_first().ok_or(FrequencyParseError::Empty)?;
        if kind.is_empty() {
            return Err(FrequencyParseError::Empty);
        }

        let arity = |expected: usize| -> Result<(), FrequencyParseError> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(FrequencyParseError::WrongArity {
                    kind: kind.to_string(),
                    expected,
                    got: args.len(),
                })
            }
        };

        match *kind {
            "None" => {
                arity(0)?;
                Ok(Self::None)
            }
            "Once" => {
                arity(2)?;
                Ok(Self::Once {
                    date: parse_date(args[0])?,
                    time: parse_time(args[1])?,
                })
            }
            "Hourly" => {
                arity(1)?;
                let minutes: i64 = args[0]
                    .parse()
                    .map_err(|_| FrequencyParseError::InvalidMinutes(args[0].to_string()))?;
                if minutes <= 0 {
                    return Err(FrequencyParseError::InvalidMinutes(args[0].to_string()));
                }
                Ok(Self::Hourly { minutes })
            }
            "Daily" => {
                arity(1)?;
                Ok(Self::Daily {
                    time: parse_time(args[0])?,
                })
            }
            "Weekly" => {
                arity(2)?;
                Ok(Self::Weekly {
                    day: parse_weekday(args[0])?,
                    time: parse_time(args[1])?,
                })
            }
            "Monthly" => {
                arity(2)?;
                Ok(Self::Monthly {
                    day: parse_monthly_day(args[0])?,
                    time: parse_time(args[1])?,
                })
            }
            "MonthlyByWeekAndDay" => {
                arity(3)?;
                let ordinal: u32 = args[0]
                    .parse()
                    .map_err(|_| FrequencyParseError::InvalidWeekOrdinal(args[0].to_string()))?;
                if !(1..=4).contains(&ordinal) {
                    return Err(FrequencyParseError::InvalidWeekOrdinal(args[0].to_string()));
                }
                Ok(Self::MonthlyByWeekAndDay {
                    ordinal,
                    day: parse_weekday(args[1])?,
                    time: parse_time(args[2])?,
                })
            }
            other => Err(FrequencyParseError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Once { date, time } => {
                write!(f, "Once,{},{}", date.format("%m/%d/%Y"), time.format("%H:%M:%S"))
            }
            Self::Hourly { minutes } => write!(f, "Hourly,{}", minutes),
            Self::Daily { time } => write!(f, "Daily,{}", time.format("%H:%M:%S")),
            Self::Weekly { day, time } => {
                write!(f, "Weekly,{},{}", weekday_name(*day), time.format("%H:%M:%S"))
            }
            Self::Monthly { day, time } => {
                let day = match day {
                    MonthlyDay::Day(d) => d.to_string(),
                    MonthlyDay::Last => "Last".to_string(),
                };
                write!(f, "Monthly,{},{}", day, time.format("%H:%M:%S"))
            }
            Self::MonthlyByWeekAndDay { ordinal, day, time } => write!(
                f,
                "MonthlyByWeekAndDay,{},{},{}",
                ordinal,
                weekday_name(*day),
                time.format("%H:%M:%S")
            ),
        }
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, FrequencyParseError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .map_err(|_| FrequencyParseError::InvalidTime(s.to_string()))
}

fn parse_date(s: &str) -> Result<NaiveDate, FrequencyParseError> {
    NaiveDate::parse_from_str(s, "%m/%d/%Y")
        .map_err(|_| FrequencyParseError::InvalidDate(s.to_string()))
}

fn parse_weekday(s: &str) -> Result<Weekday, FrequencyParseError> {
    s.parse()
        .map_err(|_| FrequencyParseError::InvalidDayOfWeek(s.to_string()))
}

fn parse_monthly_day(s: &str) -> Result<MonthlyDay, FrequencyParseError> {
    if s.eq_ignore_ascii_case("Last") {
        return Ok(MonthlyDay::Last);
    }
    let day: u32 = s
        .parse()
        .map_err(|_| FrequencyParseError::InvalidDayOfMonth(s.to_string()))?;
    if !(1..=31).contains(&day) {
        return Err(FrequencyParseError::InvalidDayOfMonth(s.to_string()));
    }
    Ok(MonthlyDay::Day(day))
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Compute the next occurrence of `freq` strictly derived from `now`.
///
/// Returns `None` when scheduling is disabled (`Frequency::None`, or a
/// one-shot whose instant already passed).
pub fn next_schedule(freq: &Frequency, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match freq {
        Frequency::None => None,
        Frequency::Once { date, time } => {
            let instant = Utc.from_utc_datetime(&date.and_time(*time));
            (instant > now).then_some(instant)
        }
        Frequency::Hourly { minutes } => Some(now + Duration::minutes(*minutes)),
        Frequency::Daily { time } => {
            let today = Utc.from_utc_datetime(&now.date_naive().and_time(*time));
            if today > now {
                Some(today)
            } else {
                Some(today + Duration::days(1))
            }
        }
        Frequency::Weekly { day, time } => {
            let today = now.date_naive();
            let days_ahead =
                (day.num_days_from_monday() + 7 - today.weekday().num_days_from_monday()) % 7;
            let candidate =
                Utc.from_utc_datetime(&(today + Duration::days(days_ahead as i64)).and_time(*time));
            if candidate >= now {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }
        Frequency::Monthly { day, time } => {
            let mut year = now.year();
            let mut month = now.month();
            loop {
                let date = monthly_date(year, month, *day);
                let candidate = Utc.from_utc_datetime(&date.and_time(*time));
                if candidate >= now {
                    return Some(candidate);
                }
                (year, month) = next_month(year, month);
            }
        }
        Frequency::MonthlyByWeekAndDay { ordinal, day, time } => {
            let mut year = now.year();
            let mut month = now.month();
            loop {
                if let Some(date) = nth_weekday_of_month(year, month, *ordinal, *day) {
                    let candidate = Utc.from_utc_datetime(&date.and_time(*time));
                    if candidate >= now {
                        return Some(candidate);
                    }
                }
                (year, month) = next_month(year, month);
            }
        }
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Number of days in the given month.
fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = next_month(year, month);
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month is always valid");
    first_of_next.pred_opt().map(|d| d.day()).unwrap_or(28)
}

/// Resolve a monthly day selector within a concrete month.
fn monthly_date(year: i32, month: u32, day: MonthlyDay) -> NaiveDate {
    let last = days_in_month(year, month);
    let day = match day {
        MonthlyDay::Last => last,
        MonthlyDay::Day(d) => d.min(last),
    };
    NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is always valid")
}

/// The `n`-th occurrence of `day` within a month, if the month has one.
fn nth_weekday_of_month(year: i32, month: u32, n: u32, day: Weekday) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (day.num_days_from_monday() + 7 - first.weekday().num_days_from_monday()) % 7;
    let date = first + Duration::days(offset as i64 + (n as i64 - 1) * 7);
    (date.month() == month).then_some(date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_default_frequency() {
        let freq: Frequency = "Weekly,Wednesday,7:00:00".parse().unwrap();
        assert_eq!(
            freq,
            Frequency::Weekly {
                day: Weekday::Wed,
                time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            }
        );
    }

    #[test]
    fn test_parse_with_spaces() {
        let freq: Frequency = "Monthly, Last, 23:30:00".parse().unwrap();
        assert_eq!(
            freq,
            Frequency::Monthly {
                day: MonthlyDay::Last,
                time: NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<Frequency>().is_err());
        assert!("Fortnightly,7:00:00".parse::<Frequency>().is_err());
        assert!("Weekly,Wednesday".parse::<Frequency>().is_err());
        assert!("Weekly,Wendsday,7:00:00".parse::<Frequency>().is_err());
        assert!("Daily,25:00:00".parse::<Frequency>().is_err());
        assert!("Hourly,0".parse::<Frequency>().is_err());
        assert!("Hourly,-5".parse::<Frequency>().is_err());
        assert!("Monthly,32,7:00:00".parse::<Frequency>().is_err());
        assert!("MonthlyByWeekAndDay,5,Friday,7:00:00".parse::<Frequency>().is_err());
        assert!("Once,25/12/2026,7:00:00".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for s in [
            "None",
            "Once,12/25/2026,19:00:00",
            "Hourly,30",
            "Daily,07:00:00",
            "Weekly,Wednesday,07:00:00",
            "Monthly,15,07:00:00",
            "Monthly,Last,07:00:00",
            "MonthlyByWeekAndDay,2,Friday,07:00:00",
        ] {
            let freq: Frequency = s.parse().unwrap();
            let reparsed: Frequency = freq.to_string().parse().unwrap();
            assert_eq!(freq, reparsed, "{s}");
        }
    }

    #[test]
    fn test_none_is_disabled() {
        assert_eq!(next_schedule(&Frequency::None, Utc::now()), None);
    }

    #[test]
    fn test_once_future_and_past() {
        let freq: Frequency = "Once,06/15/2026,12:00:00".parse().unwrap();
        assert_eq!(
            next_schedule(&freq, at("2026-06-01T00:00:00Z")),
            Some(at("2026-06-15T12:00:00Z"))
        );
        assert_eq!(next_schedule(&freq, at("2026-06-15T12:00:00Z")), None);
        assert_eq!(next_schedule(&freq, at("2026-07-01T00:00:00Z")), None);
    }

    #[test]
    fn test_hourly_is_relative() {
        let freq: Frequency = "Hourly,45".parse().unwrap();
        let now = at("2026-03-01T10:00:00Z");
        assert_eq!(next_schedule(&freq, now), Some(at("2026-03-01T10:45:00Z")));
    }

    #[test]
    fn test_daily_today_and_tomorrow() {
        let freq: Frequency = "Daily,07:00:00".parse().unwrap();
        assert_eq!(
            next_schedule(&freq, at("2026-03-01T06:00:00Z")),
            Some(at("2026-03-01T07:00:00Z"))
        );
        assert_eq!(
            next_schedule(&freq, at("2026-03-01T07:00:00Z")),
            Some(at("2026-03-02T07:00:00Z"))
        );
    }

    #[test]
    fn test_weekly_same_day_boundary() {
        // 2026-03-04 is a Wednesday.
        let freq: Frequency = "Weekly,Wednesday,7:00:00".parse().unwrap();
        assert_eq!(
            next_schedule(&freq, at("2026-03-02T00:00:00Z")),
            Some(at("2026-03-04T07:00:00Z"))
        );
        // Exactly at the scheduled instant: >= now keeps today.
        assert_eq!(
            next_schedule(&freq, at("2026-03-04T07:00:00Z")),
            Some(at("2026-03-04T07:00:00Z"))
        );
        // One second past: next week.
        assert_eq!(
            next_schedule(&freq, at("2026-03-04T07:00:01Z")),
            Some(at("2026-03-11T07:00:00Z"))
        );
    }

    #[test]
    fn test_monthly_fixed_day() {
        let freq: Frequency = "Monthly,15,07:00:00".parse().unwrap();
        assert_eq!(
            next_schedule(&freq, at("2026-03-10T00:00:00Z")),
            Some(at("2026-03-15T07:00:00Z"))
        );
        assert_eq!(
            next_schedule(&freq, at("2026-03-20T00:00:00Z")),
            Some(at("2026-04-15T07:00:00Z"))
        );
    }

    #[test]
    fn test_monthly_last_day() {
        let freq: Frequency = "Monthly,Last,07:00:00".parse().unwrap();
        assert_eq!(
            next_schedule(&freq, at("2026-02-01T00:00:00Z")),
            Some(at("2026-02-28T07:00:00Z"))
        );
        // 2028 is a leap year.
        assert_eq!(
            next_schedule(&freq, at("2028-02-01T00:00:00Z")),
            Some(at("2028-02-29T07:00:00Z"))
        );
    }

    #[test]
    fn test_monthly_day_clamped_in_short_month() {
        let freq: Frequency = "Monthly,31,07:00:00".parse().unwrap();
        // April has 30 days; day 31 clamps to the 30th.
        assert_eq!(
            next_schedule(&freq, at("2026-04-01T00:00:00Z")),
            Some(at("2026-04-30T07:00:00Z"))
        );
    }

    #[test]
    fn test_monthly_by_week_and_day() {
        // Second Friday of March 2026 is the 13th.
        let freq: Frequency = "MonthlyByWeekAndDay,2,Friday,07:00:00".parse().unwrap();
        assert_eq!(
            next_schedule(&freq, at("2026-03-01T00:00:00Z")),
            Some(at("2026-03-13T07:00:00Z"))
        );
        // Past it: second Friday of April 2026 is the 10th.
        assert_eq!(
            next_schedule(&freq, at("2026-03-14T00:00:00Z")),
            Some(at("2026-04-10T07:00:00Z"))
        );
    }

    #[test]
    fn test_next_schedule_is_pure() {
        let now = at("2026-03-01T10:00:00Z");
        for s in [
            "Hourly,30",
            "Daily,07:00:00",
            "Weekly,Wednesday,7:00:00",
            "Monthly,Last,07:00:00",
            "MonthlyByWeekAndDay,4,Monday,07:00:00",
        ] {
            let freq: Frequency = s.parse().unwrap();
            assert_eq!(next_schedule(&freq, now), next_schedule(&freq, now), "{s}");
        }
    }
}
