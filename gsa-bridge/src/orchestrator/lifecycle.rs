//! Service lifecycle states.

use std::fmt;

use serde::Serialize;

/// Where the service is in its start/stop cycle.
///
/// `Stopped → Starting → Running → Stopping → Stopped`. A failed start goes
/// straight back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    /// Whether moving to `next` follows the lifecycle.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Starting)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use LifecycleState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Stopped));
        assert!(Stopping.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert_eq!(Running.to_string(), "running");
    }
}
