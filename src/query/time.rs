use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::error::TimeError;
use crate::parser::timestamp::{parse_timestamp, LocalZone};

/// 解析后的时间窗口 `[start, end)`（UTC）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

static RE_RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:last|past)\s+(?:(\d+)\s*)?(minutes?|mins?|m|hours?|hrs?|h|days?|d|weeks?|w)$")
        .expect("relative window regex")
});

static RE_DAY_CLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(today|yesterday)\s*)?(?:(around|about|near|at|~)\s*(.+))?$")
        .expect("day clock regex")
});

static RE_CLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})(?::(\d{2}))?\s*(am|pm|a\.m\.|p\.m\.)?$").expect("clock regex")
});

/// 本地 ISO 瞬间的 ±窗口
const INSTANT_WINDOW_MINS: i64 = 30;
/// 相对窗口上限（防溢出）
const MAX_WINDOW_SECS: i64 = 100 * 365 * 86_400;

/// 自然语言时间短语解析器。
///
/// 支持：
/// - `last|past N minutes|hours|days|weeks`、`last hour` → `[R - N·unit, R)`
/// - `today` / `yesterday` → 本地整天（按时区规则，夏令时切换日不是 24 小时）
/// - `yesterday around 7am`、`today at 14:30`、`around noon` → 本地时刻 ± tolerance
/// - ISO-8601 瞬间 → ±30 分钟
/// - 空短语 → `empty_phrase`（默认 `last 1 hour`）
#[derive(Clone, Debug)]
pub struct TimeResolver {
    tz: LocalZone,
    tolerance: Duration,
    empty_phrase: String,
}

impl TimeResolver {
    pub fn new(tz: LocalZone, tolerance: Duration, empty_phrase: &str) -> Self {
        Self {
            tz,
            tolerance,
            empty_phrase: empty_phrase.to_string(),
        }
    }

    pub fn tz(&self) -> LocalZone {
        self.tz
    }

    pub fn resolve(&self, phrase: &str, reference: DateTime<Utc>) -> Result<TimeWindow, TimeError> {
        let normalized = phrase
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        if normalized.is_empty() {
            if self.empty_phrase.trim().is_empty() {
                return Err(TimeError::Unrecognized(phrase.to_string()));
            }
            return self.resolve_phrase(&self.empty_phrase.to_ascii_lowercase(), phrase, reference);
        }
        self.resolve_phrase(&normalized, phrase, reference)
    }

    fn resolve_phrase(
        &self,
        s: &str,
        original: &str,
        reference: DateTime<Utc>,
    ) -> Result<TimeWindow, TimeError> {
        let unrecognized = || TimeError::Unrecognized(original.to_string());

        if let Some(caps) = RE_RELATIVE.captures(s) {
            let n: i64 = match caps.get(1) {
                Some(m) => m.as_str().parse().map_err(|_| self.out_of_range(original))?,
                None => 1,
            };
            let unit_secs = unit_seconds(&caps[2]).ok_or_else(unrecognized)?;
            let secs = n
                .checked_mul(unit_secs)
                .filter(|s| *s <= MAX_WINDOW_SECS)
                .ok_or_else(|| self.out_of_range(original))?;
            return Ok(TimeWindow {
                start: reference - Duration::seconds(secs),
                end: reference,
            });
        }

        if let Some(caps) = RE_DAY_CLOCK.captures(s) {
            let day_word = caps.get(1).map(|m| m.as_str());
            let clock = caps.get(3).map(|m| m.as_str().trim());
            if day_word.is_none() && clock.is_none() {
                return Err(unrecognized());
            }
            let today = self.tz.date_of(reference);
            let day = match day_word {
                Some("yesterday") => today.pred_opt().ok_or_else(|| self.out_of_range(original))?,
                _ => today,
            };
            return match clock {
                None => self.whole_day(day, original),
                Some(c) => {
                    let t = parse_clock(c).ok_or_else(unrecognized)?;
                    let center = self
                        .tz
                        .to_utc(day.and_time(t))
                        .ok_or_else(|| self.out_of_range(original))?;
                    Ok(TimeWindow {
                        start: center - self.tolerance,
                        end: center + self.tolerance,
                    })
                }
            };
        }

        if let Some(t) = parse_timestamp(original.trim(), self.tz) {
            let half = Duration::minutes(INSTANT_WINDOW_MINS);
            return Ok(TimeWindow {
                start: t - half,
                end: t + half,
            });
        }

        Err(unrecognized())
    }

    fn whole_day(&self, day: NaiveDate, original: &str) -> Result<TimeWindow, TimeError> {
        let next = day.succ_opt().ok_or_else(|| self.out_of_range(original))?;
        let start = day.and_hms_opt(0, 0, 0).and_then(|d| self.tz.to_utc(d));
        let end = next.and_hms_opt(0, 0, 0).and_then(|d| self.tz.to_utc(d));
        match (start, end) {
            (Some(start), Some(end)) => Ok(TimeWindow { start, end }),
            _ => Err(self.out_of_range(original)),
        }
    }

    fn out_of_range(&self, phrase: &str) -> TimeError {
        TimeError::OutOfRange {
            phrase: phrase.to_string(),
            reason: "window exceeds supported range".into(),
        }
    }
}

fn unit_seconds(unit: &str) -> Option<i64> {
    match unit {
        "minute" | "minutes" | "min" | "mins" | "m" => Some(60),
        "hour" | "hours" | "hr" | "hrs" | "h" => Some(3600),
        "day" | "days" | "d" => Some(86_400),
        "week" | "weeks" | "w" => Some(7 * 86_400),
        _ => None,
    }
}

/// `7am` / `7:30 pm` / `19:00` / `noon` / `midnight`
fn parse_clock(s: &str) -> Option<NaiveTime> {
    match s {
        "noon" | "midday" => return NaiveTime::from_hms_opt(12, 0, 0),
        "midnight" => return NaiveTime::from_hms_opt(0, 0, 0),
        _ => {}
    }
    let caps = RE_CLOCK.captures(s)?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
    if let Some(meridiem) = caps.get(3) {
        if !(1..=12).contains(&hour) {
            return None;
        }
        let pm = meridiem.as_str().starts_with('p');
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn resolver(offset_secs: i32) -> TimeResolver {
        TimeResolver::new(
            LocalZone::Fixed(chrono::FixedOffset::east_opt(offset_secs).unwrap()),
            Duration::hours(1),
            "last 1 hour",
        )
    }

    fn los_angeles() -> TimeResolver {
        TimeResolver::new(
            LocalZone::parse("America/Los_Angeles").unwrap(),
            Duration::hours(1),
            "last 1 hour",
        )
    }

    #[test]
    fn yesterday_around_seven() {
        let w = resolver(0)
            .resolve("yesterday around 7am", utc("2024-01-15T12:00:00Z"))
            .unwrap();
        assert_eq!(w.start, utc("2024-01-14T06:00:00Z"));
        assert_eq!(w.end, utc("2024-01-14T08:00:00Z"));
    }

    #[test]
    fn yesterday_around_seven_in_los_angeles_winter() {
        // 1 月是 PST（-08:00）：本地 7 点 = 15:00Z
        let w = los_angeles()
            .resolve("yesterday around 7am", utc("2024-01-15T20:00:00Z"))
            .unwrap();
        assert_eq!(w.start, utc("2024-01-14T14:00:00Z"));
        assert_eq!(w.end, utc("2024-01-14T16:00:00Z"));
    }

    #[test]
    fn yesterday_around_seven_in_los_angeles_summer() {
        // 7 月是 PDT（-07:00）：本地 7 点 = 14:00Z
        let w = los_angeles()
            .resolve("yesterday around 7am", utc("2024-07-15T20:00:00Z"))
            .unwrap();
        assert_eq!(w.start, utc("2024-07-14T13:00:00Z"));
        assert_eq!(w.end, utc("2024-07-14T15:00:00Z"));
    }

    #[test]
    fn spring_forward_day_is_23_hours() {
        let w = los_angeles()
            .resolve("yesterday", utc("2024-03-11T20:00:00Z"))
            .unwrap();
        assert_eq!(w.start, utc("2024-03-10T08:00:00Z"));
        assert_eq!(w.end, utc("2024-03-11T07:00:00Z"));
    }

    #[test]
    fn last_seven_days() {
        let r = utc("2024-01-15T12:00:00Z");
        let w = resolver(0).resolve("last 7 days", r).unwrap();
        assert_eq!(w.start, r - Duration::days(7));
        assert_eq!(w.end, r);
        assert!(!w.contains(r));
    }

    #[test]
    fn relative_variants() {
        let r = utc("2024-01-15T12:00:00Z");
        let res = resolver(0);
        assert_eq!(res.resolve("Last   30 Minutes", r).unwrap().start, r - Duration::minutes(30));
        assert_eq!(res.resolve("past 2 hours", r).unwrap().start, r - Duration::hours(2));
        assert_eq!(res.resolve("last hour", r).unwrap().start, r - Duration::hours(1));
        assert_eq!(res.resolve("last 1 week", r).unwrap().start, r - Duration::weeks(1));
    }

    #[test]
    fn empty_phrase_falls_back_to_last_hour() {
        let r = utc("2024-01-15T12:00:00Z");
        let w = resolver(0).resolve("   ", r).unwrap();
        assert_eq!(w.start, r - Duration::hours(1));
        assert_eq!(w.end, r);
    }

    #[test]
    fn whole_days_are_local() {
        // 本地 -07:00：2024-01-15T03:00Z 是本地 1 月 14 日 20:00
        let r = utc("2024-01-15T03:00:00Z");
        let res = resolver(-7 * 3600);
        let today = res.resolve("today", r).unwrap();
        assert_eq!(today.start, utc("2024-01-14T07:00:00Z"));
        assert_eq!(today.end, utc("2024-01-15T07:00:00Z"));
        let y = res.resolve("yesterday", r).unwrap();
        assert_eq!(y.start, utc("2024-01-13T07:00:00Z"));
    }

    #[test]
    fn clock_forms() {
        let r = utc("2024-01-15T12:00:00Z");
        let res = resolver(0);
        let w = res.resolve("today at 2:30pm", r).unwrap();
        assert_eq!(w.start, utc("2024-01-15T13:30:00Z"));
        let w = res.resolve("around noon", r).unwrap();
        assert_eq!(w.start, utc("2024-01-15T11:00:00Z"));
        let w = res.resolve("yesterday around 19:00", r).unwrap();
        assert_eq!(w.end, utc("2024-01-14T20:00:00Z"));
        let w = res.resolve("today around 12am", r).unwrap();
        assert_eq!(w.start, utc("2024-01-14T23:00:00Z"));
    }

    #[test]
    fn iso_instant_gets_half_hour_window() {
        let w = resolver(0)
            .resolve("2024-01-10T08:00:00Z", utc("2024-01-15T12:00:00Z"))
            .unwrap();
        assert_eq!(w.start, utc("2024-01-10T07:30:00Z"));
        assert_eq!(w.end, utc("2024-01-10T08:30:00Z"));
    }

    #[test]
    fn unrecognized_phrases_fail() {
        let r = utc("2024-01-15T12:00:00Z");
        let res = resolver(0);
        for p in ["next blue moon", "yesterday around teatime", "last 5 fortnights", "today at 13pm"] {
            let err = res.resolve(p, r).unwrap_err();
            assert_eq!(err.phrase(), p);
        }
        assert!(matches!(
            res.resolve("last 99999999999999 weeks", r),
            Err(TimeError::OutOfRange { .. })
        ));
    }
}
