//! Utilities shared by the rjms crates
//!
//! ## Core Features:
//! - **Byte Size Handling**: memory water marks such as `512M` or `1G256M` with [`Bytesize`]
//! - **Duration Conversion**: `"1m30s"`, `"500ms"` style strings via [`to_duration`]
//! - **Timestamp Utilities**: millisecond wall-clock helpers used for expiration and scheduling
//! - **Counter Implementation**: thread-safe current/max counter used by broker statistics ([`Counter`])
//!
//! ```rust
//! use rjms_utils::{Bytesize, to_duration};
//!
//! let high = Bytesize::from("1G512M");
//! assert_eq!(high.as_usize(), 1_610_612_736);
//!
//! let interval = to_duration("1s500ms");
//! assert_eq!(interval.as_millis(), 1500);
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

pub use counter::Counter;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Human-readable byte size with parsing/serialization support
///
/// ```
/// use rjms_utils::Bytesize;
///
/// let size = Bytesize::from("2G512M");
/// assert_eq!(size.as_usize(), 2_684_354_560);
///
/// let size = Bytesize::from(1024);
/// assert_eq!(size.string(), "1K");
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Format bytesize to human-readable string
    ///
    /// ```
    /// let mixed = rjms_utils::Bytesize(2148532224);
    /// assert_eq!(mixed.string(), "2G1M");
    /// ```
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
        write!(f, "{}", self.string())?;
        Ok(())
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
/// ```
/// let bytes = rjms_utils::to_bytesize("2G512K");
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

/// Reject a zero value for fields that size pools and queues
#[inline]
pub fn deserialize_nonzero<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let v = usize::deserialize(deserializer)?;
    if v == 0 {
        return Err(de::Error::custom("value must be greater than 0"));
    }
    Ok(v)
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
/// - w: weeks
///
/// ```
/// let duration = rjms_utils::to_duration("1h30m15s");
/// assert_eq!(duration.as_secs(), 5415);
///
/// let short = rjms_utils::to_duration("250ms");
/// assert_eq!(short.as_millis(), 250);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
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
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Current timestamp in milliseconds
///
/// ```
/// let ts = rjms_utils::timestamp_millis();
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

/// Milliseconds from now until `t`, zero when `t` is already past
#[inline]
pub fn millis_until(t: TimestampMillis) -> Duration {
    let now = timestamp_millis();
    if t > now {
        Duration::from_millis((t - now) as u64)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytesize_parse_and_format() {
        assert_eq!(to_bytesize("512M"), 512 * BYTESIZE_M);
        assert_eq!(to_bytesize("1GB"), BYTESIZE_G);
        assert_eq!(Bytesize::from("1G512M").string(), "1G512M");
        assert_eq!(Bytesize(0).string(), "");
    }

    #[test]
    fn duration_units() {
        assert_eq!(to_duration("2s").as_millis(), 2000);
        assert_eq!(to_duration("1m").as_secs(), 60);
        assert_eq!(to_duration("1s250ms").as_millis(), 1250);
        assert_eq!(to_duration("bogus"), Duration::ZERO);
    }

    #[test]
    fn millis_until_past_is_zero() {
        assert_eq!(millis_until(timestamp_millis() - 1000), Duration::ZERO);
        assert!(millis_until(timestamp_millis() + 60_000) > Duration::from_secs(50));
    }
}
