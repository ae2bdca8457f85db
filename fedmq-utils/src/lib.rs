//! Utilities module providing the small shared types used across the fedmq workspace
//!
//! ## Core Features:
//! - **Byte Size Handling**: Human-readable byte size parsing/formatting with [`Bytesize`]
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Timestamp Utilities**: Millisecond timestamps used by statistics sampling and message expiry
//! - **Counter Implementation**: Lock-free current/max counter ([`Counter`])
//! - **Quiescence**: [`CountdownLock`], a counter that can be waited on until it drains to zero
//!
//! ## Usage Examples:
//! ```rust
//! use fedmq_utils::{Bytesize, to_bytesize, to_duration, CountdownLock};
//!
//! let size = Bytesize::from("64M");
//! assert_eq!(size.as_usize(), 67_108_864);
//!
//! let duration = to_duration("1m30s");
//! assert_eq!(duration.as_secs(), 90);
//!
//! let inflight = CountdownLock::new();
//! inflight.increment();
//! inflight.decrement();
//! inflight.wait_for_zero();
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize, Serialize,
};

mod counter;
mod quiesce;

pub use counter::Counter;
pub use quiesce::CountdownLock;

/// Broker instance identifier (64-bit unsigned integer)
pub type BrokerId = u64;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Human-readable byte size representation with parsing/serialization support
///
/// # Example:
/// ```
/// use fedmq_utils::Bytesize;
///
/// let size = Bytesize::from("2G512M");
/// assert_eq!(size.as_usize(), 2_684_354_560);
///
/// let size = Bytesize::from(1024);
/// assert_eq!(size.string(), "1K");
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Format bytesize to human-readable string
    #[inline]
    pub fn string(&self) -> String {
        let mut v = self.0;
        let mut res = String::new();

        let g = v / BYTESIZE_G;
        if g > 0 {
            res.push_str(&format!("{}G", g));
            v %= BYTESIZE_G;
        }

        let m = v / BYTESIZE_M;
        if m > 0 {
            res.push_str(&format!("{}M", m));
            v %= BYTESIZE_M;
        }

        let k = v / BYTESIZE_K;
        if k > 0 {
            res.push_str(&format!("{}K", k));
            v %= BYTESIZE_K;
        }

        if v > 0 {
            res.push_str(&format!("{}B", v));
        }

        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = to_bytesize(&String::deserialize(deserializer)?);
        Ok(Bytesize(v))
    }
}

/// Parse human-readable byte size string to usize
///
/// # Example:
/// ```
/// let bytes = fedmq_utils::to_bytesize("2G512K");
/// assert_eq!(bytes, 2148007936);
/// ```
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<usize>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Deserialize optional Duration from string, an empty string or "0" means no limit
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.is_empty() {
        return Ok(None);
    }
    let d = to_duration(&v);
    if d.is_zero() {
        Ok(None)
    } else {
        Ok(Some(d))
    }
}

/// Deserialize a ratio in `0.0..=1.0`
#[inline]
pub fn deserialize_ratio<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = f64::deserialize(deserializer)?;
    if !(0.0..=1.0).contains(&v) {
        return Err(de::Error::custom(format!("ratio out of range, {v}")));
    }
    Ok(v)
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - Y or ms: milliseconds (e.g. "100Y" = 100ms)
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
///
/// # Example:
/// ```
/// let duration = fedmq_utils::to_duration("1h30m15s");
/// assert_eq!(duration.as_secs(), 5415);
///
/// let short = fedmq_utils::to_duration("250ms");
/// assert_eq!(short.as_millis(), 250);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Get current timestamp in milliseconds
///
/// # Example:
/// ```
/// let ts = fedmq_utils::timestamp_millis();
/// assert!(ts > 0);
/// ```
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format millisecond timestamp to string
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration("5s"), Duration::from_secs(5));
        assert_eq!(to_duration("100Y"), Duration::from_millis(100));
        assert_eq!(to_duration("2m10ms"), Duration::from_millis(120_010));
        assert_eq!(to_duration("abc"), Duration::ZERO);
    }

    #[test]
    fn test_bytesize() {
        assert_eq!(to_bytesize("1K"), 1024);
        assert_eq!(to_bytesize("1MB"), 1048576);
        assert_eq!(Bytesize(1048576 + 1024 + 1).string(), "1M1K1B");
    }

    #[test]
    fn test_deserialize_ratio() {
        #[derive(Deserialize)]
        struct R {
            #[serde(deserialize_with = "deserialize_ratio")]
            v: f64,
        }
        let r: R = serde_json::from_str(r#"{"v": 0.8}"#).unwrap();
        assert_eq!(r.v, 0.8);
        assert!(serde_json::from_str::<R>(r#"{"v": 1.5}"#).is_err());
    }
}
