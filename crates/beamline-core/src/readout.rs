//! Readout priorities decide when a device is read during a scan.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When a device is read during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutPriority {
    /// Read once before the acquisition loop.
    Baseline,
    /// Read at every acquisition point.
    Monitored,
    /// Publishes data on its own schedule; staged but never read by the loop.
    Async,
    /// Only read when a scan explicitly asks for it.
    OnRequest,
}

impl ReadoutPriority {
    /// Label used on the bus and in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            ReadoutPriority::Baseline => "baseline",
            ReadoutPriority::Monitored => "monitored",
            ReadoutPriority::Async => "async",
            ReadoutPriority::OnRequest => "on_request",
        }
    }
}

impl fmt::Display for ReadoutPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadoutPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(ReadoutPriority::Baseline),
            "monitored" => Ok(ReadoutPriority::Monitored),
            "async" => Ok(ReadoutPriority::Async),
            "on_request" => Ok(ReadoutPriority::OnRequest),
            other => Err(format!("unknown readout priority '{other}'")),
        }
    }
}
