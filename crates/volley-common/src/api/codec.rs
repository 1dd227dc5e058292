//! Wire codecs for fields the tracking service encodes unusually
//!
//! - node selectors travel as one space-separated `key=value` string
//! - job deadlines arrive as integer nanoseconds or as Go-style duration
//!   strings (`"30s"`, `"1h30m"`, `"1.5h"`)
//! - segment identifiers may be strings or numbers

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::Error;

// =============================================================================
// Node selector
// =============================================================================

/// Node placement constraints, encoded on the wire as `"k1=v1 k2=v2"`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSelector(pub BTreeMap<String, String>);

impl NodeSelector {
    /// True when no constraints are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Constraints as a map suitable for a pod spec
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl FromStr for NodeSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = BTreeMap::new();
        for pair in s.split(' ').filter(|p| !p.is_empty()) {
            let parts: Vec<&str> = pair.split('=').collect();
            if parts.len() != 2 {
                return Err(Error::parse(
                    "node selector",
                    pair,
                    "invalid format for key=value pair",
                ));
            }
            map.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
        }
        Ok(Self(map))
    }
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

impl From<BTreeMap<String, String>> for NodeSelector {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl Serialize for NodeSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => s.parse().map_err(de::Error::custom),
            None => Ok(Self::default()),
        }
    }
}

// =============================================================================
// Go-style durations
// =============================================================================

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(60 * NANOS_PER_SEC),
        "h" => Some(3600 * NANOS_PER_SEC),
        _ => None,
    }
}

/// Parse a Go duration string such as `"300ms"`, `"1.5h"` or `"2h45m"`
///
/// Negative durations are rejected; a deadline or interval can't be negative.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let err = |msg: &str| Error::parse("duration", input, msg);

    let mut s = input.trim();
    if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    if s.starts_with('-') {
        return Err(err("negative durations are not allowed"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(err("empty duration"));
    }

    let mut total: u128 = 0;
    while !s.is_empty() {
        let int_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (int_part, rest) = s.split_at(int_end);

        let (frac_part, rest) = match rest.strip_prefix('.') {
            Some(after_dot) => {
                let frac_end = after_dot
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(after_dot.len());
                after_dot.split_at(frac_end)
            }
            None => ("", rest),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err("expected a number"));
        }

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let (unit, rest) = rest.split_at(unit_end);
        if unit.is_empty() {
            return Err(err("missing unit"));
        }
        let scale = unit_nanos(unit).ok_or_else(|| err("unknown unit"))?;

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| err("number out of range"))?
        };
        let mut nanos = whole
            .checked_mul(scale)
            .ok_or_else(|| err("duration out of range"))?;
        if !frac_part.is_empty() {
            let digits = frac_part.len().min(18) as u32;
            let frac: u128 = frac_part[..digits as usize]
                .parse()
                .map_err(|_| err("number out of range"))?;
            nanos += frac * scale / 10u128.pow(digits);
        }

        total = total
            .checked_add(nanos)
            .ok_or_else(|| err("duration out of range"))?;
        s = rest;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| err("duration out of range"))?;
    Ok(Duration::new(secs, (total % NANOS_PER_SEC) as u32))
}

/// Render a duration the way Go's `time.Duration.String` does (`"1h30m0s"`)
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < NANOS_PER_SEC {
        return if nanos % NANOS_PER_MILLI == 0 {
            format!("{}ms", nanos / NANOS_PER_MILLI)
        } else if nanos % NANOS_PER_MICRO == 0 {
            format!("{}µs", nanos / NANOS_PER_MICRO)
        } else {
            format!("{}ns", nanos)
        };
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h{}m", hours, minutes));
    } else if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    let sub = d.subsec_nanos();
    if sub == 0 {
        out.push_str(&format!("{}s", secs));
    } else {
        let frac = format!("{:09}", sub);
        out.push_str(&format!("{}.{}s", secs, frac.trim_end_matches('0')));
    }
    out
}

/// Serde adapter for `Option<Duration>` fields encoded as nanoseconds or Go strings
pub mod go_duration {
    use super::*;

    /// Serialize as a Go duration string, `null` when absent
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    /// Accept integer nanoseconds, a duration string, or `null`
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => match n.as_u64() {
                Some(nanos) => Ok(Some(Duration::from_nanos(nanos))),
                None => Err(de::Error::custom(format!(
                    "invalid duration {}: expected a non-negative integer of nanoseconds",
                    n
                ))),
            },
            Some(serde_json::Value::String(s)) => {
                parse_duration(&s).map(Some).map_err(de::Error::custom)
            }
            Some(other) => Err(de::Error::custom(format!(
                "invalid duration {}: expected nanoseconds or a duration string",
                other
            ))),
        }
    }
}

/// Accept a string or an integer, keeping the textual form
pub fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a string or number, got {}",
            other
        ))),
    }
}
