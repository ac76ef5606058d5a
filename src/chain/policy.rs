//! What a chain does when its data never arrives in time

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::step::CmdStatus;

/// Timeout behavior selected when a chain is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Drop partial state and fail the trace; waiting steps are aborted
    #[default]
    Fail,
    /// Finish the trace; waiting steps are resumed so they can fall back
    Degrade,
    /// Keep the chain and its waiters; a late `set_ready` still wakes them
    Linger,
}

impl TimeoutPolicy {
    /// Status reported to the worker when the deadline fires
    pub fn status(&self) -> CmdStatus {
        match self {
            TimeoutPolicy::Fail => CmdStatus::Error,
            TimeoutPolicy::Degrade => CmdStatus::Done,
            TimeoutPolicy::Linger => CmdStatus::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutPolicy::Fail => "fail",
            TimeoutPolicy::Degrade => "degrade",
            TimeoutPolicy::Linger => "linger",
        }
    }

    pub fn all() -> &'static [TimeoutPolicy] {
        &[
            TimeoutPolicy::Fail,
            TimeoutPolicy::Degrade,
            TimeoutPolicy::Linger,
        ]
    }
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeoutPolicy::all()
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown timeout policy '{s}' (expected fail, degrade or linger)")
            })
    }
}
