use serde::Serialize;
use std::fmt;

use crate::domain::InstrumentId;

/// Why the controller stops an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Instrument left the configured market set; the engine drains and exits
    Descoped,
    /// Idle engine retired so it is recreated with current parameters
    Refresh,
}

/// Proposed change to the live engine set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ControllerAction {
    Create(InstrumentId),
    Stop {
        instrument: InstrumentId,
        reason: StopReason,
    },
}

impl ControllerAction {
    pub fn instrument(&self) -> &InstrumentId {
        match self {
            ControllerAction::Create(instrument) => instrument,
            ControllerAction::Stop { instrument, .. } => instrument,
        }
    }
}

impl fmt::Display for ControllerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerAction::Create(instrument) => write!(f, "create {instrument}"),
            ControllerAction::Stop { instrument, reason } => {
                write!(f, "stop {instrument} ({reason:?})")
            }
        }
    }
}
