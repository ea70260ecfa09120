use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineStatus {
    /// Created, pre-flight balance check not yet run
    NotStarted,
    /// Evaluating signals, may open and grow the position
    Running,
    /// Draining inventory, never grows the position
    ShuttingDown,
    /// Inventory is flat (or was never opened), engine has stopped
    Terminated,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::NotStarted => "NOT_STARTED",
            EngineStatus::Running => "RUNNING",
            EngineStatus::ShuttingDown => "SHUTTING_DOWN",
            EngineStatus::Terminated => "TERMINATED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: EngineStatus) -> bool {
        use EngineStatus::*;

        matches!(
            (self, target),
            (NotStarted, Running)
                | (NotStarted, Terminated)
                | (Running, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    /// Only these states may create or grow a position
    pub fn can_grow_position(&self) -> bool {
        matches!(self, EngineStatus::NotStarted | EngineStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineStatus::Terminated)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why an engine left `Running`. Assigned exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseType {
    /// Retired while flat, nothing left to drain
    Liquidated,
    /// Stop requested by the controller
    EarlyStop,
    /// Close retry budget exhausted
    Failed,
    /// Pre-flight budget check failed, nothing was opened
    InsufficientBalance,
}

impl CloseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseType::Liquidated => "LIQUIDATED",
            CloseType::EarlyStop => "EARLY_STOP",
            CloseType::Failed => "FAILED",
            CloseType::InsufficientBalance => "INSUFFICIENT_BALANCE",
        }
    }
}

impl fmt::Display for CloseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
