//! Lifecycle notifications emitted by the hypervisor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Wire name of the instance-started lifecycle action.
pub const ACTION_INSTANCE_STARTED: &str = "instance-started";

/// Wire name of the instance-shutdown lifecycle action.
pub const ACTION_INSTANCE_SHUTDOWN: &str = "instance-shutdown";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An asynchronous notification that an instance changed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened to the instance.
    pub action: LifecycleAction,

    /// The name of the instance concerned.
    pub instance: String,

    /// When the hypervisor recorded the event.
    pub timestamp: DateTime<Utc>,
}

/// The action carried by a lifecycle event.
///
/// Wire names outside the modeled set parse to [`LifecycleAction::Other`] so
/// consumers can skip events they do not care about without failing the
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// The instance transitioned to running.
    Started,

    /// The instance stopped.
    Stopped,

    /// A lifecycle action this library does not model.
    Other(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LifecycleEvent {
    /// Creates an event stamped with the current time.
    pub fn now(action: LifecycleAction, instance: impl Into<String>) -> Self {
        Self {
            action,
            instance: instance.into(),
            timestamp: Utc::now(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<&str> for LifecycleAction {
    fn from(wire: &str) -> Self {
        match wire {
            ACTION_INSTANCE_STARTED => LifecycleAction::Started,
            ACTION_INSTANCE_SHUTDOWN => LifecycleAction::Stopped,
            other => LifecycleAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleAction::Started => write!(f, "{}", ACTION_INSTANCE_STARTED),
            LifecycleAction::Stopped => write!(f, "{}", ACTION_INSTANCE_SHUTDOWN),
            LifecycleAction::Other(name) => write!(f, "{}", name),
        }
    }
}

impl Serialize for LifecycleAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LifecycleAction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(LifecycleAction::from(s.as_str()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
