//! Time-period algebra
//!
//! A [`Period`] is either the `fx` sentinel (time-invariant data) or a
//! half-open `[start, end)` span of minute-resolution timestamps.
//!
//! # Text format
//!
//! - `fx`: fixed
//! - `1980`: one year, `[1980-01-01 00:00, 1981-01-01 00:00)`
//! - `1980-1985` or `1980_1985`: the end is inclusive at its own precision
//! - `198001-198512`, `19800101-19851231`, `1980010100-...`, `198001010000-...`
//!
//! The canonical form picks the coarsest precision at which both bounds are
//! aligned, so `parse(p.to_string()) == p` for every span.

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of spans coalesced per pass in [`merge`]
const MERGE_CHUNK: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeriodError {
    #[error("Invalid period '{text}': {reason}")]
    Format { text: String, reason: String },

    #[error("Empty period '{text}': start must precede end")]
    Empty { text: String },
}

impl PeriodError {
    fn format(text: &str, reason: impl Into<String>) -> Self {
        PeriodError::Format {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Year,
    Month,
    Day,
    Hour,
    Minute,
}

impl Precision {
    /// Coarsest first
    const ALL: [Precision; 5] = [
        Precision::Year,
        Precision::Month,
        Precision::Day,
        Precision::Hour,
        Precision::Minute,
    ];

    fn from_digits(len: usize) -> Option<Self> {
        match len {
            4 => Some(Precision::Year),
            6 => Some(Precision::Month),
            8 => Some(Precision::Day),
            10 => Some(Precision::Hour),
            12 => Some(Precision::Minute),
            _ => None,
        }
    }

    fn advance(self, t: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Precision::Year => t.checked_add_months(Months::new(12)),
            Precision::Month => t.checked_add_months(Months::new(1)),
            Precision::Day => t.checked_add_signed(Duration::days(1)),
            Precision::Hour => t.checked_add_signed(Duration::hours(1)),
            Precision::Minute => t.checked_add_signed(Duration::minutes(1)),
        }
    }

    fn retreat(self, t: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Precision::Year => t.checked_sub_months(Months::new(12)),
            Precision::Month => t.checked_sub_months(Months::new(1)),
            Precision::Day => t.checked_sub_signed(Duration::days(1)),
            Precision::Hour => t.checked_sub_signed(Duration::hours(1)),
            Precision::Minute => t.checked_sub_signed(Duration::minutes(1)),
        }
    }

    fn aligned(self, t: NaiveDateTime) -> bool {
        let minute = t.minute() == 0;
        let hour = minute && t.hour() == 0;
        let day = hour && t.day() == 1;
        match self {
            Precision::Year => day && t.month() == 1,
            Precision::Month => day,
            Precision::Day => hour,
            Precision::Hour => minute,
            Precision::Minute => true,
        }
    }

    fn format(self, t: NaiveDateTime) -> String {
        let mut out = format!("{:04}", t.year());
        if self == Precision::Year {
            return out;
        }
        out.push_str(&format!("{:02}", t.month()));
        if self == Precision::Month {
            return out;
        }
        out.push_str(&format!("{:02}", t.day()));
        if self == Precision::Day {
            return out;
        }
        out.push_str(&format!("{:02}", t.hour()));
        if self == Precision::Hour {
            return out;
        }
        out.push_str(&format!("{:02}", t.minute()));
        out
    }
}

/// Half-open `[start, end)` interval with its canonical label
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Span {
    start: NaiveDateTime,
    end: NaiveDateTime,
    label: String,
}

impl Span {
    /// Build a span, truncating both bounds to the minute.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, PeriodError> {
        let start = truncate_to_minute(start);
        let end = truncate_to_minute(end);
        if start >= end {
            return Err(PeriodError::Empty {
                text: format!("{} .. {}", start, end),
            });
        }
        Ok(Self::from_bounds(start, end))
    }

    /// Caller guarantees `start < end` and minute alignment.
    fn from_bounds(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start,
            end,
            label: canonical_label(start, end),
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Ord for Span {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A time period: the fixed sentinel or a span
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    /// Time-invariant data ("fx"), excluded from interval arithmetic
    Fixed,
    Span(Span),
}

impl Period {
    /// Parse `fx` or a digit period such as `1980`, `1980-1985`, `198001_198512`.
    pub fn parse(text: &str) -> Result<Self, PeriodError> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("fx") {
            return Ok(Period::Fixed);
        }
        if trimmed.is_empty() {
            return Err(PeriodError::format(text, "empty text"));
        }

        let pieces: Vec<&str> = trimmed.split(|c| c == '-' || c == '_').collect();
        let (start, end) = match pieces.as_slice() {
            [single] => {
                let (start, precision) = parse_stamp(single, text)?;
                let end = precision
                    .advance(start)
                    .ok_or_else(|| PeriodError::format(text, "date out of range"))?;
                (start, end)
            }
            [first, last] => {
                let (start, _) = parse_stamp(first, text)?;
                let (last, precision) = parse_stamp(last, text)?;
                let end = precision
                    .advance(last)
                    .ok_or_else(|| PeriodError::format(text, "date out of range"))?;
                (start, end)
            }
            _ => {
                return Err(PeriodError::format(
                    text,
                    "expected START or START-END",
                ))
            }
        };

        Span::new(start, end)
            .map(Period::Span)
            .map_err(|_| PeriodError::Empty {
                text: text.to_string(),
            })
    }

    /// Build a span period from explicit bounds
    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, PeriodError> {
        Span::new(start, end).map(Period::Span)
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Period::Fixed)
    }

    pub fn as_span(&self) -> Option<&Span> {
        match self {
            Period::Fixed => None,
            Period::Span(span) => Some(span),
        }
    }

    pub fn start(&self) -> Option<NaiveDateTime> {
        self.as_span().map(Span::start)
    }

    pub fn end(&self) -> Option<NaiveDateTime> {
        self.as_span().map(Span::end)
    }

    /// Canonical text form, `fx` for fixed periods
    pub fn label(&self) -> &str {
        match self {
            Period::Fixed => "fx",
            Period::Span(span) => span.label(),
        }
    }

    /// `start,last` as ISO timestamps, `last` being the final included minute.
    ///
    /// Returns `None` for fixed periods.
    pub fn to_iso_range(&self) -> Option<String> {
        let span = self.as_span()?;
        let last = span.end - Duration::minutes(1);
        Some(format!(
            "{},{}",
            span.start.format("%Y-%m-%dT%H:%M:%S"),
            last.format("%Y-%m-%dT%H:%M:%S")
        ))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::parse(s)
    }
}

/// Slices of an outer period left over once an inner period is cut out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complement {
    pub before: Option<Period>,
    pub after: Option<Period>,
}

/// Overlap of two periods; fixed periods never intersect anything.
pub fn intersects(a: &Period, b: &Period) -> Option<Period> {
    let (a, b) = (a.as_span()?, b.as_span()?);
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    (start < end).then(|| Period::Span(Span::from_bounds(start, end)))
}

/// Complement slices when `outer` fully contains `inner`.
pub fn includes(outer: &Period, inner: &Period) -> Option<Complement> {
    let (outer, inner) = (outer.as_span()?, inner.as_span()?);
    if inner.start < outer.start || inner.end > outer.end {
        return None;
    }
    let before = (outer.start < inner.start)
        .then(|| Period::Span(Span::from_bounds(outer.start, inner.start)));
    let after =
        (inner.end < outer.end).then(|| Period::Span(Span::from_bounds(inner.end, outer.end)));
    Some(Complement { before, after })
}

/// Remaining suffix of `longer` when `prefix` starts at the same instant.
///
/// `Some(None)` means the prefix covers `longer` entirely.
pub fn start_with(longer: &Period, prefix: &Period) -> Option<Option<Period>> {
    let (longer, prefix) = (longer.as_span()?, prefix.as_span()?);
    if prefix.start != longer.start || prefix.end > longer.end {
        return None;
    }
    if prefix.end == longer.end {
        return Some(None);
    }
    Some(Some(Period::Span(Span::from_bounds(prefix.end, longer.end))))
}

/// Minimal sorted set of disjoint, non-adjacent periods covering the input.
///
/// With `calendar_360`, a gap consisting only of a skipped Dec-31 (as in
/// 360-day calendars) is treated as adjacency.
pub fn merge(periods: &[Period], calendar_360: bool) -> Vec<Period> {
    let has_fixed = periods.iter().any(Period::is_fixed);
    let mut spans: Vec<&Span> = periods.iter().filter_map(Period::as_span).collect();
    spans.sort_unstable();

    let mut merged: Vec<(NaiveDateTime, NaiveDateTime)> = Vec::new();
    for chunk in spans.chunks(MERGE_CHUNK) {
        let mut local = Vec::with_capacity(chunk.len());
        for span in chunk {
            coalesce_into(&mut local, span.start, span.end, calendar_360);
        }
        for (start, end) in local {
            coalesce_into(&mut merged, start, end, calendar_360);
        }
    }

    let mut out = Vec::with_capacity(merged.len() + usize::from(has_fixed));
    if has_fixed {
        out.push(Period::Fixed);
    }
    out.extend(
        merged
            .into_iter()
            .map(|(start, end)| Period::Span(Span::from_bounds(start, end))),
    );
    out
}

fn coalesce_into(
    acc: &mut Vec<(NaiveDateTime, NaiveDateTime)>,
    start: NaiveDateTime,
    end: NaiveDateTime,
    calendar_360: bool,
) {
    if let Some(last) = acc.last_mut() {
        if start <= last.1 || (calendar_360 && skips_360_day_gap(last.1, start)) {
            if end > last.1 {
                last.1 = end;
            }
            return;
        }
    }
    acc.push((start, end));
}

fn skips_360_day_gap(prev_end: NaiveDateTime, next_start: NaiveDateTime) -> bool {
    let midnight = |t: NaiveDateTime| t.hour() == 0 && t.minute() == 0;
    midnight(prev_end)
        && midnight(next_start)
        && prev_end.month() == 12
        && prev_end.day() == 31
        && next_start.year() == prev_end.year() + 1
        && next_start.month() == 1
        && next_start.day() == 1
}

fn parse_stamp(digits: &str, whole: &str) -> Result<(NaiveDateTime, Precision), PeriodError> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(PeriodError::format(whole, format!("'{}' is not a digit stamp", digits)));
    }
    let precision = Precision::from_digits(digits.len()).ok_or_else(|| {
        PeriodError::format(whole, format!("'{}' must have 4, 6, 8, 10 or 12 digits", digits))
    })?;

    let field = |range: std::ops::Range<usize>, default: u32| -> u32 {
        digits
            .get(range)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    };
    let year: i32 = digits[0..4]
        .parse()
        .map_err(|_| PeriodError::format(whole, "invalid year"))?;

    let stamp = NaiveDate::from_ymd_opt(year, field(4..6, 1), field(6..8, 1))
        .and_then(|date| date.and_hms_opt(field(8..10, 0), field(10..12, 0), 0))
        .ok_or_else(|| PeriodError::format(whole, format!("'{}' is not a valid date", digits)))?;

    Ok((stamp, precision))
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn canonical_label(start: NaiveDateTime, end: NaiveDateTime) -> String {
    let precision = Precision::ALL
        .into_iter()
        .find(|p| p.aligned(start) && p.aligned(end))
        .unwrap_or(Precision::Minute);
    let last = precision.retreat(end).unwrap_or(end);
    if last == start {
        precision.format(start)
    } else {
        format!("{}-{}", precision.format(start), precision.format(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> Period {
        Period::parse(text).unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_fixed() {
        assert_eq!(p("fx"), Period::Fixed);
        assert_eq!(p("FX"), Period::Fixed);
        assert_eq!(p("fx").to_string(), "fx");
    }

    #[test]
    fn test_parse_year_bounds() {
        let period = p("1980");
        assert_eq!(period.start(), Some(at(1980, 1, 1)));
        assert_eq!(period.end(), Some(at(1981, 1, 1)));

        let period = p("1980-1985");
        assert_eq!(period.start(), Some(at(1980, 1, 1)));
        assert_eq!(period.end(), Some(at(1986, 1, 1)));
        assert_eq!(p("1980_1985"), period);
    }

    #[test]
    fn test_parse_mixed_precision() {
        let period = p("198002-19800315");
        assert_eq!(period.start(), Some(at(1980, 2, 1)));
        assert_eq!(period.end(), Some(at(1980, 3, 16)));
        assert_eq!(period.to_string(), "19800201-19800315");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Period::parse("198"), Err(PeriodError::Format { .. })));
        assert!(matches!(Period::parse("19a0"), Err(PeriodError::Format { .. })));
        assert!(matches!(Period::parse("1980-1985-1990"), Err(PeriodError::Format { .. })));
        assert!(matches!(Period::parse("198013"), Err(PeriodError::Format { .. })));
        assert!(matches!(Period::parse(""), Err(PeriodError::Format { .. })));
        assert!(matches!(Period::parse("1990-1980"), Err(PeriodError::Empty { .. })));
    }

    #[test]
    fn test_canonical_form_round_trip() {
        for text in [
            "1980",
            "1980-1985",
            "198001-198006",
            "19800101-19800110",
            "1980010106-1980010118",
            "198001010030-198001010045",
            "198003",
        ] {
            let period = p(text);
            assert_eq!(period.to_string(), text);
            assert_eq!(p(&period.to_string()), period);
        }
        // Coarsest aligned precision wins
        assert_eq!(p("19800101-19851231").to_string(), "1980-1985");
        assert_eq!(p("198001-198012").to_string(), "1980");
    }

    #[test]
    fn test_intersects() {
        assert_eq!(intersects(&p("1980-1990"), &p("1985-1995")), Some(p("1985-1990")));
        assert_eq!(intersects(&p("1980-1984"), &p("1985-1995")), None);
        assert_eq!(intersects(&p("fx"), &p("1985-1995")), None);
        assert_eq!(intersects(&p("fx"), &p("fx")), None);
    }

    #[test]
    fn test_includes_returns_complements() {
        let complement = includes(&p("1980-1989"), &p("1982-1984")).unwrap();
        assert_eq!(complement.before, Some(p("1980-1981")));
        assert_eq!(complement.after, Some(p("1985-1989")));
        assert_eq!(complement.before.unwrap().start(), Some(at(1980, 1, 1)));

        let complement = includes(&p("1980-1989"), &p("1980-1984")).unwrap();
        assert_eq!(complement.before, None);
        assert_eq!(complement.after, Some(p("1985-1989")));

        assert!(includes(&p("1982-1984"), &p("1980-1989")).is_none());
        assert!(includes(&p("fx"), &p("1980")).is_none());
    }

    #[test]
    fn test_start_with() {
        assert_eq!(start_with(&p("1980-1989"), &p("1980-1984")), Some(Some(p("1985-1989"))));
        assert_eq!(start_with(&p("1980-1989"), &p("1980-1989")), Some(None));
        assert_eq!(start_with(&p("1980-1989"), &p("1981-1984")), None);
        assert_eq!(start_with(&p("1980-1984"), &p("1980-1989")), None);
    }

    #[test]
    fn test_merge_laws() {
        assert_eq!(merge(&[p("1980")], false), vec![p("1980")]);

        let merged = merge(&[p("1985-1995"), p("1980-1990")], false);
        assert_eq!(merged, vec![p("1980-1995")]);

        let merged = merge(&[p("1980-1982"), p("1990-1992")], false);
        assert_eq!(merged.len(), 2);

        // Adjacent spans coalesce
        assert_eq!(merge(&[p("1980"), p("1981")], false), vec![p("1980-1981")]);

        // Contained spans disappear
        assert_eq!(merge(&[p("1980-1990"), p("1983")], false), vec![p("1980-1990")]);
    }

    #[test]
    fn test_merge_keeps_fixed_once() {
        let merged = merge(&[p("fx"), p("1980"), p("fx")], false);
        assert_eq!(merged, vec![Period::Fixed, p("1980")]);
    }

    #[test]
    fn test_merge_360_day_calendar() {
        // 360-day years end on Dec 30: the span stops at Dec 31 00:00
        let first = p("19800101-19801230");
        let second = p("19810101-19811230");
        assert_eq!(merge(&[first.clone(), second.clone()], false).len(), 2);

        let merged = merge(&[first, second], true);
        assert_eq!(merged, vec![p("19800101-19811230")]);
    }

    #[test]
    fn test_merge_large_batch() {
        let base = at(1900, 1, 1);
        let periods: Vec<Period> = (0..50_000i64)
            .rev()
            .map(|i| {
                let start = base + Duration::days(i);
                Period::between(start, start + Duration::days(1)).unwrap()
            })
            .collect();

        let merged = merge(&periods, false);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start(), Some(base));
        assert_eq!(merged[0].end(), Some(base + Duration::days(50_000)));
    }

    #[test]
    fn test_iso_range() {
        assert_eq!(
            p("1980-1981").to_iso_range().unwrap(),
            "1980-01-01T00:00:00,1981-12-31T23:59:00"
        );
        assert!(Period::Fixed.to_iso_range().is_none());
    }
}
