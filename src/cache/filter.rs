//! Entry listing filters
//!
//! ```text
//! geoflow cache list --pattern regrid --min-size 10MB --older-than 30d
//! geoflow cache clean --not-pattern plot --unused-for 90d
//! ```
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// A cached artifact with its file metadata
#[derive(Debug, Clone, Serialize)]
pub struct CrsEntry {
    pub crs: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(with = "unix_seconds")]
    pub modified: SystemTime,
    #[serde(with = "unix_seconds")]
    pub accessed: SystemTime,
    pub protected: bool,
}

/// Entry selection; unset criteria match everything
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// CRS must contain this text
    pub pattern: Option<String>,
    /// CRS must not contain this text
    pub not_pattern: Option<String>,
    /// Size at least this many bytes
    pub min_size: Option<u64>,
    /// Last modified at least this long ago
    pub older_than: Option<Duration>,
    /// Last accessed at least this long ago
    pub unused_for: Option<Duration>,
}

impl ListFilter {
    pub fn matches(&self, entry: &CrsEntry, now: SystemTime) -> bool {
        let age = |time: SystemTime| now.duration_since(time).unwrap_or_default();

        self.pattern
            .as_deref()
            .map_or(true, |pattern| entry.crs.contains(pattern))
            && self
                .not_pattern
                .as_deref()
                .map_or(true, |pattern| !entry.crs.contains(pattern))
            && self.min_size.map_or(true, |min| entry.size_bytes >= min)
            && self
                .older_than
                .map_or(true, |limit| age(entry.modified) >= limit)
            && self
                .unused_for
                .map_or(true, |limit| age(entry.accessed) >= limit)
    }
}

/// Parse a size string (e.g., "5GB", "100MB", "512") into bytes
pub fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();

    let (number, multiplier) = if let Some(num) = size_str.strip_suffix("TB") {
        (num, 1024 * 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("GB") {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("MB") {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("KB") {
        (num, 1024)
    } else {
        (size_str.strip_suffix('B').unwrap_or(&size_str), 1)
    };

    let number: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("Invalid size: {}", size_str))?;
    number
        .checked_mul(multiplier)
        .with_context(|| format!("Size too large: {}", size_str))
}

/// Parse an age string (e.g., "7d", "24h", "30m", "45s") into a duration
pub fn parse_age(age_str: &str) -> Result<Duration> {
    let age_str = age_str.trim().to_lowercase();

    let (number, unit_secs) = if let Some(num) = age_str.strip_suffix('d') {
        (num, 24 * 60 * 60)
    } else if let Some(num) = age_str.strip_suffix('h') {
        (num, 60 * 60)
    } else if let Some(num) = age_str.strip_suffix('m') {
        (num, 60)
    } else if let Some(num) = age_str.strip_suffix('s') {
        (num, 1)
    } else {
        (age_str.as_str(), 1)
    };

    let number: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("Invalid age: {}", age_str))?;
    let secs = number
        .checked_mul(unit_secs)
        .with_context(|| format!("Age too large: {}", age_str))?;
    Ok(Duration::from_secs(secs))
}

mod unix_seconds {
    use serde::Serializer;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        serializer.serialize_u64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(crs: &str, size_bytes: u64, age_secs: u64, now: SystemTime) -> CrsEntry {
        let time = now - Duration::from_secs(age_secs);
        CrsEntry {
            crs: crs.to_string(),
            path: PathBuf::from("/cache/x.nc"),
            size_bytes,
            modified: time,
            accessed: time,
            protected: false,
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("5GB").unwrap(), 5 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("100mb").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("2KB").unwrap(), 2048);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512B").unwrap(), 512);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999TB").is_err());
        assert_eq!(parse_size("16777215TB").unwrap(), 16777215 * (1u64 << 40));
    }

    #[test]
    fn test_parse_age() {
        assert_eq!(parse_age("7d").unwrap(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(parse_age("24h").unwrap(), Duration::from_secs(24 * 3600));
        assert_eq!(parse_age("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_age("45").unwrap(), Duration::from_secs(45));
        assert!(parse_age("soon").is_err());
        assert!(parse_age("999999999999999999d").is_err());
    }

    #[test]
    fn test_filter_matching() {
        let now = SystemTime::now();
        let regrid = entry("regrid(ds(variable='tas'))", 2048, 3600, now);
        let plot = entry("plot(ds(variable='tas'))", 10, 60, now);

        let all = ListFilter::default();
        assert!(all.matches(&regrid, now) && all.matches(&plot, now));

        let by_pattern = ListFilter {
            pattern: Some("regrid".into()),
            ..Default::default()
        };
        assert!(by_pattern.matches(&regrid, now));
        assert!(!by_pattern.matches(&plot, now));

        let excluding = ListFilter {
            not_pattern: Some("plot".into()),
            ..Default::default()
        };
        assert!(excluding.matches(&regrid, now));
        assert!(!excluding.matches(&plot, now));

        let big_and_old = ListFilter {
            min_size: Some(1024),
            older_than: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        assert!(big_and_old.matches(&regrid, now));
        assert!(!big_and_old.matches(&plot, now));

        let unused = ListFilter {
            unused_for: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        assert!(unused.matches(&regrid, now));
        assert!(!unused.matches(&plot, now));
    }
}
