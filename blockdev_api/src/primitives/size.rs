use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Units accepted in size strings, longest suffix first so `MiB` wins over `B`.
const SIZE_UNITS: &[(&str, u64)] = &[
    ("TiB", 1 << 40),
    ("GiB", 1 << 30),
    ("MiB", 1 << 20),
    ("KiB", 1 << 10),
    ("TB", 1_000_000_000_000),
    ("GB", 1_000_000_000),
    ("MB", 1_000_000),
    ("KB", 1_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("K", 1_000),
    ("B", 1),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizeError {
    #[error("Empty size")]
    Empty,
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
    #[error("Size '{0}' is out of range")]
    OutOfRange(String),
}

/// An absolute number of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes(pub u64);

impl Bytes {
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Parses a size with an optional unit suffix. SI suffixes are powers of 1000, IEC suffixes
    /// powers of 1024, and the number may carry a fraction (`1.5GiB`).
    pub fn from_human_readable(s: &str) -> Result<Self, SizeError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SizeError::Empty);
        }

        let (number, factor) = SIZE_UNITS
            .iter()
            .find_map(|(suffix, factor)| s.strip_suffix(suffix).map(|n| (n.trim(), *factor)))
            .unwrap_or((s, 1));

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(factor)
                .map(Bytes)
                .ok_or_else(|| SizeError::OutOfRange(s.into()));
        }

        let fractional = number
            .parse::<f64>()
            .map_err(|_| SizeError::InvalidNumber(s.into()))?;
        let value = fractional * factor as f64;
        if !value.is_finite() || value < 0.0 || value > u64::MAX as f64 {
            return Err(SizeError::OutOfRange(s.into()));
        }
        Ok(Bytes(value as u64))
    }
}

impl Display for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl FromStr for Bytes {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_human_readable(s)
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Sizes may come as "1GiB" or as a bare number of bytes.
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Bytes::from_str(&s)
                .map_err(|e| serde::de::Error::custom(format!("invalid size: {e}"))),
            serde_json::Value::Number(n) => n.as_u64().map(Bytes).ok_or_else(|| {
                serde::de::Error::custom("invalid size, expected unsigned integer")
            }),
            _ => Err(serde::de::Error::custom("invalid size")),
        }
    }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

/// A size that is either absolute or a percentage of the space that is still available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSpec {
    Absolute(Bytes),
    Percent(f64),
}

impl SizeSpec {
    /// Resolves the size against the space still available.
    pub fn resolve(&self, available: u64) -> u64 {
        match self {
            SizeSpec::Absolute(bytes) => bytes.0,
            SizeSpec::Percent(percent) => (available as f64 * percent / 100.0) as u64,
        }
    }
}

impl FromStr for SizeSpec {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().strip_suffix('%') {
            Some(percent) => {
                let percent = percent
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| SizeError::InvalidNumber(s.into()))?;
                if !(0.0..=100.0).contains(&percent) {
                    return Err(SizeError::OutOfRange(s.into()));
                }
                Ok(SizeSpec::Percent(percent))
            }
            None => Bytes::from_str(s).map(SizeSpec::Absolute),
        }
    }
}

impl<'de> Deserialize<'de> for SizeSpec {
    fn deserialize<D>(deserializer: D) -> Result<SizeSpec, D::Error>
    where
        D: Deserializer<'de>,
    {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => SizeSpec::from_str(&s)
                .map_err(|e| serde::de::Error::custom(format!("invalid size: {e}"))),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(|n| SizeSpec::Absolute(Bytes(n)))
                .ok_or_else(|| serde::de::Error::custom("invalid size, expected unsigned integer")),
            _ => Err(serde::de::Error::custom("invalid size")),
        }
    }
}

impl Serialize for SizeSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SizeSpec::Absolute(bytes) => bytes.serialize(serializer),
            SizeSpec::Percent(percent) => serializer.serialize_str(&format!("{percent}%")),
        }
    }
}

/// Deserializes a value that YAML may type as a number or a string (`100`, `1800M`) into its
/// string form, for values handed verbatim to external tools.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or a number, found {other}"
        ))),
    }
}
