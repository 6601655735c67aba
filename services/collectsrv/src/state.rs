//! Device lifecycle states and control events

use std::fmt;
use std::str::FromStr;

use errors::CollectError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceState {
    /// Polling, last cycle clean
    Collecting,
    /// Polling, last cycle reported frame errors
    CollectingError,
    /// Initial connection failed; retried by the heartbeat
    Unconnected,
    /// No variables configured
    EmptyVariable,
    Stopped,
    /// Reserved; nothing enters this state
    Error,
}

impl DeviceState {
    /// A broker exists only while collecting
    pub fn has_broker(&self) -> bool {
        matches!(self, Self::Collecting | Self::CollectingError)
    }

    /// What a control event does in this state
    pub fn on_event(self, event: ControlEvent) -> Transition {
        use ControlEvent::{Restart, Start, Stop};
        match (self, event) {
            (Self::Collecting, Start) => Transition::Keep,
            (Self::Stopped, Stop) => Transition::Keep,
            (_, Start | Restart) => Transition::Reconnect,
            (_, Stop) => Transition::Stop,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::CollectingError => "collectingError",
            Self::Unconnected => "unconnected",
            Self::EmptyVariable => "emptyVariable",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlEvent {
    Start,
    Restart,
    Stop,
}

impl FromStr for ControlEvent {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "restart" => Ok(Self::Restart),
            "stop" => Ok(Self::Stop),
            other => Err(CollectError::UnsupportedControl(other.to_string())),
        }
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Stop => "stop",
        })
    }
}

/// Effect of a control event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do
    Keep,
    /// Tear down any broker, then attempt readiness again
    Reconnect,
    /// Tear down any broker and move to `Stopped`
    Stop,
}
