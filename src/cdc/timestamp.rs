// ABOUTME: Hybrid logical timestamp used for commit times, watermarks and change ranges
// ABOUTME: Ordered by (physical, logical); textual form is "<physical>-<logical>"

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A commit timestamp produced by the source engine.
///
/// The physical part is wall-clock derived, the logical part disambiguates
/// commits that share a physical tick.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    physical: i64,
    logical: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        physical: 0,
        logical: 0,
    };

    pub const fn new(physical: i64, logical: u32) -> Self {
        Self { physical, logical }
    }

    /// Timestamp with a zero logical component.
    pub const fn from_physical(physical: i64) -> Self {
        Self::new(physical, 0)
    }

    pub fn physical(&self) -> i64 {
        self.physical
    }

    pub fn logical(&self) -> u32 {
        self.logical
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.physical, self.logical)
    }
}

impl FromStr for Timestamp {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("timestamp cannot be empty"));
        }

        // A leading '-' belongs to a negative physical part, so split after it.
        let split_at = value
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '-')
            .map(|(idx, _)| idx);

        match split_at {
            Some(idx) => {
                let physical = value[..idx]
                    .parse::<i64>()
                    .with_context(|| format!("invalid physical part in timestamp '{}'", value))?;
                let logical = value[idx + 1..]
                    .parse::<u32>()
                    .with_context(|| format!("invalid logical part in timestamp '{}'", value))?;
                Ok(Self::new(physical, logical))
            }
            None => {
                let physical = value
                    .parse::<i64>()
                    .with_context(|| format!("invalid timestamp '{}'", value))?;
                Ok(Self::from_physical(physical))
            }
        }
    }
}

impl TryFrom<String> for Timestamp {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.to_string()
    }
}
