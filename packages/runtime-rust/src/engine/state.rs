//! Engine lifecycle state.

use std::fmt;

use serde::Serialize;

/// `DOWN → STARTING → UP → STOPPING → DOWN`, with `FAILED` reachable from
/// `STARTING`. Only `run()` and `destroy()` move it, under one guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    #[default]
    Down,
    Starting,
    Up,
    Stopping,
    Failed,
}

impl EngineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "DOWN",
            Self::Starting => "STARTING",
            Self::Up => "UP",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
        }
    }

    /// Whether waiting longer could still end in `UP`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Down | Self::Failed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
