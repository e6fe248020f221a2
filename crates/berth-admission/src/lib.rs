//! Admission checks on the host identity a task would run as.
//!
//! Operators deny ranges of host user and group ids in the agent
//! configuration; a task whose resolved user falls inside a denied range is
//! rejected before any of its filesystem sandbox is prepared. Malformed range
//! configuration is a parse-time error, surfaced when the configuration is
//! loaded rather than when a task is admitted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("range value cannot be empty")]
    EmptyRange,
    #[error("invalid bound `{bound}`")]
    InvalidBound {
        bound: String,
        #[source]
        err: std::num::ParseIntError,
    },
    #[error("invalid range `{range}`: lower bound cannot be greater than upper bound")]
    InvertedRange { range: String },
    #[error("invalid range `{range}`: expected `id` or `lower-upper`")]
    MalformedRange { range: String },
    #[error("invalid {kind}: {err}")]
    RangeConfig {
        kind: &'static str,
        #[source]
        err: Box<Error>,
    },
    #[error("running as uid {0} is disallowed")]
    UidDenied(u32),
    #[error("running as gid {0} is disallowed")]
    GidDenied(u32),
}

/// An inclusive range of denied user or group ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    #[serde(rename = "from")]
    pub lower: u32,
    #[serde(rename = "to")]
    pub upper: u32,
}

impl IdRange {
    /// Whether `id` falls within the range, both bounds inclusive.
    pub fn contains(&self, id: u32) -> bool {
        (self.lower..=self.upper).contains(&id)
    }
}

impl FromStr for IdRange {
    type Err = Error;

    /// Parse `"N"` as the degenerate range `N..=N` and `"N-M"` as `N..=M`.
    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::EmptyRange);
        }

        let parse = |bound: &str| {
            bound.parse::<u32>().map_err(|err| Error::InvalidBound {
                bound: bound.to_string(),
                err,
            })
        };

        match s.split('-').collect::<Vec<_>>().as_slice() {
            [id] => {
                let id = parse(id)?;
                Ok(Self {
                    lower: id,
                    upper: id,
                })
            }
            [lower, upper] => {
                let lower = parse(lower)?;
                let upper = parse(upper)?;
                if lower > upper {
                    return Err(Error::InvertedRange {
                        range: s.to_string(),
                    });
                }
                Ok(Self { lower, upper })
            }
            _ => Err(Error::MalformedRange {
                range: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lower == self.upper {
            write!(f, "{}", self.lower)
        } else {
            write!(f, "{}-{}", self.lower, self.upper)
        }
    }
}

/// A resolved OS user: the host identity a task would run as.
///
/// Resolution (name lookup, group membership) is the task driver's job; this
/// crate only judges the numeric ids.
#[derive(Debug, Clone)]
pub struct OsUser {
    pub name: String,
    pub uid: u32,
    pub gids: Vec<u32>,
}

/// Parse a comma-separated denied-range specification, e.g. `"0,1000-2000"`.
///
/// An empty specification denies nothing. `kind` names the configuration
/// field in errors, so an operator can tell a bad uid list from a bad gid
/// list.
pub fn parse_id_ranges(kind: &'static str, spec: &str) -> Result<Vec<IdRange>, Error> {
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    spec.split(',')
        .map(|range| {
            range.parse().map_err(|err| Error::RangeConfig {
                kind,
                err: Box::new(err),
            })
        })
        .collect()
}

/// Reject `user` if its uid, or any gid of a group it belongs to, falls
/// within a denied range.
///
/// Runs at admission time, before any task filesystem work begins.
pub fn check_user(
    user: &OsUser,
    denied_uids: &[IdRange],
    denied_gids: &[IdRange],
) -> Result<(), Error> {
    for range in denied_uids {
        if range.contains(user.uid) {
            return Err(Error::UidDenied(user.uid));
        }
    }

    for range in denied_gids {
        for &gid in &user.gids {
            if range.contains(gid) {
                return Err(Error::GidDenied(gid));
            }
        }
    }

    Ok(())
}
