use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use regex::Regex;
use tracing::warn;

use crate::record::UNKNOWN_TIME;

pub const OUTPUT_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Everything after one of these is audience/share metadata, not time.
const SEPARATORS: &[&str] = &["分享對象：", "·"];

static DASH_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").unwrap());
static SPACE_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static RELATIVE_ZH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*(小時|分鐘|秒)").unwrap());
static RELATIVE_EN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s*(hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)\b").unwrap()
});

static CLOCK_ZH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(上午|下午)\s*(\d{1,2}):(\d{2})").unwrap());
static CLOCK_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(am|pm)\s*(\d{1,2}):(\d{2})").unwrap());
static CLOCK_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,2}):(\d{2})(?:\s*(am|pm)\b)?").unwrap());

static MONTH_DAY_ZH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})月\s*(\d{1,2})日").unwrap());
static FULL_DATE_ZH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})年\s*(\d{1,2})月\s*(\d{1,2})日").unwrap());
static DATE_EN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2})\b(?:,?\s+(\d{4})\b)?",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    fn parse(marker: &str) -> Option<Self> {
        match marker.to_ascii_lowercase().as_str() {
            "上午" | "am" => Some(Meridiem::Am),
            "下午" | "pm" => Some(Meridiem::Pm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    hour: u32,
    minute: u32,
    meridiem: Option<Meridiem>,
}

impl Clock {
    fn hour24(&self) -> u32 {
        match self.meridiem {
            Some(Meridiem::Pm) if self.hour != 12 => self.hour + 12,
            Some(Meridiem::Am) if self.hour == 12 => 0,
            _ => self.hour,
        }
    }

    fn on(&self, date: NaiveDate) -> Option<NaiveDateTime> {
        NaiveTime::from_hms_opt(self.hour24(), self.minute, 0).map(|t| date.and_time(t))
    }
}

/// Normalize a displayed post time into `YYYY-MM-DD HH:MM`.
///
/// Never fails: unrecognized text comes back cleaned but otherwise unchanged,
/// and empty text becomes [`UNKNOWN_TIME`].
pub fn normalize(text: &str, now: NaiveDateTime) -> String {
    let raw = text.trim();
    if raw.is_empty() {
        return UNKNOWN_TIME.to_string();
    }

    // Cleaning that leaves almost nothing behind ate the signal; keep the
    // original. Text that was already short ("3h") is left to the parser.
    let cleaned = clean(raw);
    if cleaned != raw && cleaned.chars().count() < 3 {
        return raw.to_string();
    }

    match parse(&cleaned, now) {
        Some(ts) => ts.format(OUTPUT_FORMAT).to_string(),
        None => {
            warn!(text = %cleaned, "Unrecognized time format, keeping raw text");
            cleaned
        }
    }
}

/// Drop share-target suffixes and dash padding, collapse whitespace.
pub fn clean(text: &str) -> String {
    let mut head = text;
    for sep in SEPARATORS {
        if let Some((before, _)) = head.split_once(sep) {
            head = before;
        }
    }
    let no_dashes = DASH_RUN_RE.replace_all(head, "");
    SPACE_RUN_RE.replace_all(&no_dashes, " ").trim().to_string()
}

fn parse(text: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if let Some(offset) = relative_offset(text) {
        return now.checked_sub_signed(offset);
    }

    if is_yesterday(text) {
        let yesterday = now.checked_sub_signed(TimeDelta::days(1))?;
        return match find_clock(text) {
            Some(clock) => clock.on(yesterday.date()),
            None => Some(yesterday),
        };
    }

    if let Some((month, day, rest)) = month_day(text) {
        // Posts older than a year omit the year too; a date later than today
        // can only belong to last year.
        let mut year = now.year();
        if (month, day) > (now.month(), now.day()) {
            year -= 1;
        }
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        return at_optional_clock(date, rest);
    }

    if let Some((date, rest)) = full_date(text) {
        return at_optional_clock(date, rest);
    }

    match find_clock(text) {
        Some(clock) if clock.meridiem.is_some() => clock.on(now.date()),
        _ => None,
    }
}

fn relative_offset(text: &str) -> Option<TimeDelta> {
    if let Some(caps) = RELATIVE_ZH_RE.captures(text) {
        let n: i64 = caps[1].parse().ok()?;
        return match &caps[2] {
            "小時" => TimeDelta::try_hours(n),
            "分鐘" => TimeDelta::try_minutes(n),
            _ => TimeDelta::try_seconds(n),
        };
    }

    let caps = RELATIVE_EN_RE.captures(text)?;
    let n: i64 = caps[1].parse().ok()?;
    match caps[2].to_ascii_lowercase().chars().next()? {
        'h' => TimeDelta::try_hours(n),
        'm' => TimeDelta::try_minutes(n),
        _ => TimeDelta::try_seconds(n),
    }
}

fn is_yesterday(text: &str) -> bool {
    text.contains("昨天") || text.to_lowercase().contains("yesterday")
}

fn find_clock(text: &str) -> Option<Clock> {
    if let Some(caps) = CLOCK_ZH_RE.captures(text) {
        return Some(Clock {
            hour: caps[2].parse().ok()?,
            minute: caps[3].parse().ok()?,
            meridiem: Meridiem::parse(&caps[1]),
        });
    }
    if let Some(caps) = CLOCK_PREFIX_RE.captures(text) {
        return Some(Clock {
            hour: caps[2].parse().ok()?,
            minute: caps[3].parse().ok()?,
            meridiem: Meridiem::parse(&caps[1]),
        });
    }
    let caps = CLOCK_SUFFIX_RE.captures(text)?;
    Some(Clock {
        hour: caps[1].parse().ok()?,
        minute: caps[2].parse().ok()?,
        meridiem: caps.get(3).and_then(|m| Meridiem::parse(m.as_str())),
    })
}

fn at_optional_clock(date: NaiveDate, rest: &str) -> Option<NaiveDateTime> {
    match find_clock(rest) {
        Some(clock) => clock.on(date),
        None => date.and_hms_opt(0, 0, 0),
    }
}

/// Month and day without a year, plus the text that follows the match.
fn month_day(text: &str) -> Option<(u32, u32, &str)> {
    if !FULL_DATE_ZH_RE.is_match(text) {
        if let Some(caps) = MONTH_DAY_ZH_RE.captures(text) {
            let end = caps.get(0)?.end();
            return Some((caps[1].parse().ok()?, caps[2].parse().ok()?, &text[end..]));
        }
    }

    let caps = DATE_EN_RE.captures(text)?;
    if caps.get(3).is_some() {
        return None;
    }
    let end = caps.get(0)?.end();
    Some((month_index(&caps[1])?, caps[2].parse().ok()?, &text[end..]))
}

fn full_date(text: &str) -> Option<(NaiveDate, &str)> {
    if let Some(caps) = FULL_DATE_ZH_RE.captures(text) {
        let end = caps.get(0)?.end();
        let date = NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        )?;
        return Some((date, &text[end..]));
    }

    let caps = DATE_EN_RE.captures(text)?;
    let year = caps.get(3)?.as_str().parse().ok()?;
    let end = caps.get(0)?.end();
    let date = NaiveDate::from_ymd_opt(year, month_index(&caps[1])?, caps[2].parse().ok()?)?;
    Some((date, &text[end..]))
}

fn month_index(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let key = name.to_ascii_lowercase();
    MONTHS.iter().position(|m| *m == key).map(|i| i as u32 + 1)
}
