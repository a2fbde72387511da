use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inclusive range of numeric user ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub min: u32,
    pub max: u32,
}

impl UidRange {
    pub fn contains(&self, uid: u32) -> bool {
        (self.min..=self.max).contains(&uid)
    }
}

impl FromStr for UidRange {
    type Err = SchemaError;

    /// Accepts `N`, `N-M`, `N-` (open upper bound) and `-M`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidUidRange(s.to_owned());
        let s = s.trim();
        let (min, max) = match s.split_once('-') {
            None => {
                let n = s.parse().map_err(|_| invalid())?;
                (n, n)
            }
            Some((lo, hi)) => {
                let min = if lo.is_empty() {
                    0
                } else {
                    lo.parse().map_err(|_| invalid())?
                };
                let max = if hi.is_empty() {
                    u32::MAX
                } else {
                    hi.parse().map_err(|_| invalid())?
                };
                if lo.is_empty() && hi.is_empty() {
                    return Err(invalid());
                }
                (min, max)
            }
        };
        if min > max {
            return Err(invalid());
        }
        Ok(Self { min, max })
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else if self.max == u32::MAX {
            write!(f, "{}-", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Comma separated list of [`UidRange`]s. Empty means "any user".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RangeList(Vec<UidRange>);

impl RangeList {
    pub fn new(ranges: Vec<UidRange>) -> Self {
        Self(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ranges(&self) -> &[UidRange] {
        &self.0
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.0.iter().any(|r| r.contains(uid))
    }
}

impl FromStr for RangeList {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ranges = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(ranges))
    }
}

impl TryFrom<String> for RangeList {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RangeList> for String {
    fn from(value: RangeList) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}
