//! Modification times of archive entries.
//!
//! Tar stores whole seconds in its header and optionally a decimal fraction
//! in a PAX `mtime` record; ZIP stores MS-DOS local date/time with two second
//! resolution. [`Timestamp`] keeps seconds and nanoseconds relative to the
//! Unix epoch so all of them round-trip through the index store.
//!
//! # Example
//!
//! ```rust
//! use seekstone::Timestamp;
//!
//! let ts = Timestamp::parse_pax("1700000000.25").unwrap();
//! assert_eq!(ts.secs(), 1_700_000_000);
//! assert_eq!(ts.nanos(), 250_000_000);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A point in time relative to the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp { secs: 0, nanos: 0 };

    /// Creates a timestamp from Unix seconds.
    #[inline]
    pub const fn from_unix_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// Creates a timestamp from nanoseconds since the Unix epoch.
    pub fn from_unix_nanos(nanos: i64) -> Self {
        Self {
            secs: nanos.div_euclid(NANOS_PER_SECOND),
            nanos: nanos.rem_euclid(NANOS_PER_SECOND) as u32,
        }
    }

    /// Parses a PAX time value such as `1700000000` or `-12.5`.
    ///
    /// Returns `None` if the value is malformed.
    pub fn parse_pax(value: &str) -> Option<Self> {
        let value = value.trim();
        let (negative, digits) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut nanos: i64 = 0;
        for (i, b) in fraction.bytes().take(9).enumerate() {
            nanos += i64::from(b - b'0') * 10_i64.pow(8 - i as u32);
        }
        let total = whole.checked_mul(NANOS_PER_SECOND)?.checked_add(nanos)?;
        Some(Self::from_unix_nanos(if negative { -total } else { total }))
    }

    /// Converts an MS-DOS date and time (as stored by ZIP) to a timestamp.
    ///
    /// The DOS fields are local time; they are interpreted as UTC.
    pub fn from_dos(date: u16, time: u16) -> Self {
        let year = i64::from((date >> 9) & 0x7f) + 1980;
        let month = i64::from(((date >> 5) & 0x0f).clamp(1, 12));
        let day = i64::from((date & 0x1f).max(1));
        let hour = i64::from((time >> 11) & 0x1f);
        let minute = i64::from((time >> 5) & 0x3f);
        let second = i64::from((time & 0x1f) * 2);
        let days = days_from_civil(year, month, day);
        Self::from_unix_secs(days * 86_400 + hour * 3600 + minute * 60 + second)
    }

    /// Whole seconds since the Unix epoch.
    #[inline]
    pub const fn secs(&self) -> i64 {
        self.secs
    }

    /// Sub-second nanoseconds.
    #[inline]
    pub const fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Nanoseconds since the Unix epoch, saturating.
    pub fn as_unix_nanos(&self) -> i64 {
        self.secs
            .saturating_mul(NANOS_PER_SECOND)
            .saturating_add(i64::from(self.nanos))
    }

    /// Converts to [`SystemTime`].
    pub fn as_system_time(&self) -> SystemTime {
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::new(self.secs as u64, self.nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.secs.unsigned_abs())
                + Duration::from_nanos(u64::from(self.nanos))
        }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                Self::from_unix_nanos(-(d.as_nanos().min(i64::MAX as u128) as i64))
            }
        }
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = month;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pax_whole_seconds() {
        let ts = Timestamp::parse_pax("1234").unwrap();
        assert_eq!(ts, Timestamp::from_unix_secs(1234));
    }

    #[test]
    fn test_parse_pax_fraction() {
        let ts = Timestamp::parse_pax("1.000000001").unwrap();
        assert_eq!(ts.secs(), 1);
        assert_eq!(ts.nanos(), 1);
    }

    #[test]
    fn test_parse_pax_negative() {
        let ts = Timestamp::parse_pax("-1.5").unwrap();
        assert_eq!(ts.secs(), -2);
        assert_eq!(ts.nanos(), 500_000_000);
        assert_eq!(ts.as_unix_nanos(), -1_500_000_000);
    }

    #[test]
    fn test_parse_pax_rejects_garbage() {
        assert!(Timestamp::parse_pax("").is_none());
        assert!(Timestamp::parse_pax("12x").is_none());
        assert!(Timestamp::parse_pax("1.2e3").is_none());
    }

    #[test]
    fn test_from_dos() {
        // 2020-02-29 12:34:56
        let date = ((2020 - 1980) << 9) | (2 << 5) | 29;
        let time = (12 << 11) | (34 << 5) | (56 / 2);
        let ts = Timestamp::from_dos(date, time);
        assert_eq!(ts.secs(), 1_582_979_696);
    }

    #[test]
    fn test_system_time_round_trip() {
        let ts = Timestamp::from_unix_nanos(1_700_000_000_123_456_789);
        assert_eq!(Timestamp::from(ts.as_system_time()), ts);
        assert_eq!(Timestamp::EPOCH.as_system_time(), UNIX_EPOCH);
    }
}
