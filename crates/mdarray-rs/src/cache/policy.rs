//! Eviction policy and configuration for primitive caches.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Capacity used by a bare `lru` policy string.
pub const DEFAULT_LRU_CAPACITY: usize = 256;

/// How a primitive cache bounds its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Never evicts; entries live until overwritten, removed, or cleared.
    #[default]
    Unbounded,
    /// Evicts the least recently used entry once `capacity` entries are cached.
    Lru { capacity: NonZeroUsize },
}

impl EvictionPolicy {
    pub fn lru(capacity: usize) -> Result<Self> {
        let capacity =
            NonZeroUsize::new(capacity).ok_or_else(|| anyhow!("lru capacity must be non-zero"))?;
        Ok(EvictionPolicy::Lru { capacity })
    }

    pub fn capacity(self) -> Option<usize> {
        match self {
            EvictionPolicy::Unbounded => None,
            EvictionPolicy::Lru { capacity } => Some(capacity.get()),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("unbounded") || trimmed.eq_ignore_ascii_case("none") {
            return Ok(EvictionPolicy::Unbounded);
        }
        if trimmed.eq_ignore_ascii_case("lru") {
            return EvictionPolicy::lru(DEFAULT_LRU_CAPACITY);
        }
        if let Some(rest) = trimmed
            .strip_prefix("lru(")
            .and_then(|inner| inner.strip_suffix(')'))
        {
            let mut capacity = DEFAULT_LRU_CAPACITY;
            for part in rest.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                if let Some(value) = part.strip_prefix("capacity=") {
                    capacity = value
                        .trim()
                        .parse()
                        .map_err(|_| anyhow!("invalid lru capacity: {}", value))?;
                } else {
                    bail!("unknown lru option: {}", part);
                }
            }
            return EvictionPolicy::lru(capacity);
        }
        bail!("unknown eviction policy: {}", trimmed)
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Unbounded => f.write_str("unbounded"),
            EvictionPolicy::Lru { capacity } => write!(f, "lru(capacity={capacity})"),
        }
    }
}

impl Serialize for EvictionPolicy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EvictionPolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// User-facing configuration for a [`CacheContext`](super::CacheContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

impl CacheConfig {
    /// Reads the eviction policy from `MDARRAY_PRIMITIVE_CACHE`.
    pub fn from_env() -> Self {
        CacheConfig {
            eviction: crate::env::primitive_cache_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_strings() {
        assert_eq!(
            "unbounded".parse::<EvictionPolicy>().unwrap(),
            EvictionPolicy::Unbounded
        );
        assert_eq!(
            "LRU".parse::<EvictionPolicy>().unwrap().capacity(),
            Some(DEFAULT_LRU_CAPACITY)
        );
        assert_eq!(
            "lru(capacity=8)".parse::<EvictionPolicy>().unwrap(),
            EvictionPolicy::lru(8).unwrap()
        );
    }

    #[test]
    fn rejects_bad_policy_strings() {
        assert!("lru(capacity=0)".parse::<EvictionPolicy>().is_err());
        assert!("lru(capacity=x)".parse::<EvictionPolicy>().is_err());
        assert!("lru(size=4)".parse::<EvictionPolicy>().is_err());
        assert!("fifo".parse::<EvictionPolicy>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for policy in [EvictionPolicy::Unbounded, EvictionPolicy::lru(12).unwrap()] {
            assert_eq!(policy.to_string().parse::<EvictionPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn config_serializes_policy_as_string() {
        let config = CacheConfig {
            eviction: EvictionPolicy::lru(4).unwrap(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"eviction":"lru(capacity=4)"}"#);
        let parsed: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        let defaulted: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(defaulted.eviction, EvictionPolicy::Unbounded);
    }
}
