use std::fmt;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Month, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc,
};
use chrono_tz::Tz;

/// 无时区信息的时间格式（逗号毫秒在调用前统一替换为点号）
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

/// 带偏移但不完全符合 RFC 3339 的格式（空格分隔 / 无冒号偏移）
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
];

/// 配置的本地时区：固定偏移，或随夏令时切换的 IANA 时区
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalZone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl LocalZone {
    pub fn utc() -> Self {
        LocalZone::Named(Tz::UTC)
    }

    /// `+08:00` / `-0700` / `UTC` / `America/Los_Angeles`
    pub fn parse(raw: &str) -> Option<Self> {
        parse_offset(raw)
            .map(LocalZone::Fixed)
            .or_else(|| raw.trim().parse::<Tz>().ok().map(LocalZone::Named))
    }

    /// 本地墙钟时间转 UTC。
    ///
    /// 回拨产生的重复时段取较早者；拨快跳过的时段顺延一小时。
    pub fn to_utc(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            LocalZone::Fixed(tz) => resolve_local(tz, naive),
            LocalZone::Named(tz) => resolve_local(tz, naive),
        }
    }

    /// UTC 瞬间所在的本地日期
    pub fn date_of(&self, t: DateTime<Utc>) -> NaiveDate {
        match self {
            LocalZone::Fixed(tz) => t.with_timezone(tz).date_naive(),
            LocalZone::Named(tz) => t.with_timezone(tz).date_naive(),
        }
    }
}

impl fmt::Display for LocalZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalZone::Fixed(tz) => write!(f, "{tz}"),
            LocalZone::Named(tz) => f.write_str(tz.name()),
        }
    }
}

fn resolve_local<Z: TimeZone>(tz: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            let shifted = naive.checked_add_signed(Duration::hours(1))?;
            tz.from_local_datetime(&shifted).earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
}

/// 解析日志里的时间戳并归一化到 UTC。
///
/// 带偏移的按自身偏移解释；不带偏移的按配置时区 `zone` 解释。
pub fn parse_timestamp(raw: &str, zone: LocalZone) -> Option<DateTime<Utc>> {
    let s = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if s.len() < 10 {
        return None;
    }
    let s = s.replacen(',', ".", 1);

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            return zone.to_utc(naive);
        }
    }
    None
}

/// RFC 3164 时间戳（`Jan 15 10:00:00`，没有年份）。
///
/// 年份取参考时刻的本地年份；若结果比参考时刻晚一天以上（跨年读到去年 12 月的行），退回上一年。
pub fn parse_syslog_timestamp(
    month: &str,
    day: &str,
    clock: &str,
    zone: LocalZone,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let month = month.parse::<Month>().ok()?.number_from_month();
    let day: u32 = day.parse().ok()?;
    let time = NaiveTime::parse_from_str(clock, "%H:%M:%S").ok()?;
    let year = zone.date_of(reference).year();

    let at = |year: i32| {
        NaiveDate::from_ymd_opt(year, month, day).and_then(|d| zone.to_utc(d.and_time(time)))
    };
    match at(year) {
        Some(t) if t <= reference + Duration::days(1) => Some(t),
        _ => at(year - 1),
    }
}

/// JSON 里常见的 epoch 数值：秒或毫秒
pub fn parse_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    // 1e12 以上视为毫秒
    let secs = if value >= 1e12 { value / 1000.0 } else { value };
    DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
}

/// 解析 `+08:00` / `-0700` / `UTC` / `Z` 形式的固定偏移
fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("utc") || s.eq_ignore_ascii_case("z") || s.is_empty() {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn la() -> LocalZone {
        LocalZone::parse("America/Los_Angeles").unwrap()
    }

    #[test]
    fn offsets_are_honoured() {
        let tz = LocalZone::utc();
        assert_eq!(
            parse_timestamp("2025-06-17T14:30:45-07:00", tz),
            Some(utc("2025-06-17T21:30:45Z"))
        );
        assert_eq!(
            parse_timestamp("2025-06-17T14:30:45.123-07:00", tz),
            Some(utc("2025-06-17T21:30:45.123Z"))
        );
    }

    #[test]
    fn naive_uses_configured_zone() {
        let tz = LocalZone::parse("-07:00").unwrap();
        assert_eq!(
            parse_timestamp("2025-06-17 14:30:45.123", tz),
            Some(utc("2025-06-17T21:30:45.123Z"))
        );
        assert_eq!(
            parse_timestamp("2025-06-17 14:30:45,500", tz),
            Some(utc("2025-06-17T21:30:45.500Z"))
        );
        assert_eq!(
            parse_timestamp("[2025-06-17 14:30:45]", tz),
            Some(utc("2025-06-17T21:30:45Z"))
        );
    }

    #[test]
    fn named_zone_follows_daylight_saving() {
        assert_eq!(
            parse_timestamp("2025-01-15 07:00:00", la()),
            Some(utc("2025-01-15T15:00:00Z"))
        );
        assert_eq!(
            parse_timestamp("2025-07-15 07:00:00", la()),
            Some(utc("2025-07-15T14:00:00Z"))
        );
    }

    #[test]
    fn ambiguous_and_skipped_local_times() {
        // 2025-11-02 01:30 出现两次（PDT 与 PST），取较早的 PDT
        assert_eq!(
            parse_timestamp("2025-11-02 01:30:00", la()),
            Some(utc("2025-11-02T08:30:00Z"))
        );
        // 2025-03-09 02:30 不存在，顺延到 03:30 PDT
        assert_eq!(
            parse_timestamp("2025-03-09 02:30:00", la()),
            Some(utc("2025-03-09T10:30:00Z"))
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let tz = LocalZone::utc();
        assert_eq!(parse_timestamp("yesterday", tz), None);
        assert_eq!(parse_timestamp("2025-13-45 99:00:00", tz), None);
    }

    #[test]
    fn zones_parse() {
        assert_eq!(
            LocalZone::parse("UTC"),
            FixedOffset::east_opt(0).map(LocalZone::Fixed)
        );
        assert_eq!(
            LocalZone::parse("+08:00"),
            FixedOffset::east_opt(8 * 3600).map(LocalZone::Fixed)
        );
        assert_eq!(
            LocalZone::parse("-0730"),
            FixedOffset::west_opt(7 * 3600 + 1800).map(LocalZone::Fixed)
        );
        assert_eq!(la().to_string(), "America/Los_Angeles");
        assert_eq!(LocalZone::parse("Pacific"), None);
    }

    #[test]
    fn syslog_year_comes_from_reference() {
        let r = utc("2025-01-01T12:00:00Z");
        let tz = LocalZone::utc();
        assert_eq!(
            parse_syslog_timestamp("Jan", "1", "10:00:00", tz, r),
            Some(utc("2025-01-01T10:00:00Z"))
        );
        // 元旦读到的 12 月 31 日属于上一年
        assert_eq!(
            parse_syslog_timestamp("Dec", "31", "23:59:00", tz, r),
            Some(utc("2024-12-31T23:59:00Z"))
        );
        assert_eq!(parse_syslog_timestamp("Foo", "1", "10:00:00", tz, r), None);
    }

    #[test]
    fn epoch_seconds_and_millis() {
        assert_eq!(parse_epoch(1_700_000_000.0), Some(utc("2023-11-14T22:13:20Z")));
        assert_eq!(
            parse_epoch(1_700_000_000_000.0),
            Some(utc("2023-11-14T22:13:20Z"))
        );
    }
}
