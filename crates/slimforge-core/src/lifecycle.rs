use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Attaching,
    Mounted,
    Loading,
    Configuring,
    Unloading,
    Detaching,
    Committed,
    Discarded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Committed | RunState::Discarded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Attaching => "attaching",
            RunState::Mounted => "mounted",
            RunState::Loading => "loading",
            RunState::Configuring => "configuring",
            RunState::Unloading => "unloading",
            RunState::Detaching => "detaching",
            RunState::Committed => "committed",
            RunState::Discarded => "discarded",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (RunState::Idle, RunState::Attaching)
            | (RunState::Attaching, RunState::Mounted | RunState::Failed)
            | (RunState::Mounted, RunState::Loading)
            | (RunState::Loading, RunState::Configuring)
            | (
                RunState::Mounted | RunState::Loading | RunState::Configuring,
                RunState::Unloading
            )
            | (RunState::Unloading, RunState::Detaching)
            | (
                RunState::Detaching,
                RunState::Committed | RunState::Discarded | RunState::Failed
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Current run state plus the validated path taken to reach it.
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: RunState,
    history: Vec<Transition>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: RunState::Idle,
            history: vec![Transition {
                state: RunState::Idle,
                at: Utc::now(),
            }],
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn advance(&mut self, to: RunState) -> Result<(), CoreError> {
        validate_transition(self.current, to)?;
        debug!("run state: {} -> {to}", self.current);
        self.current = to;
        self.history.push(Transition { state: to, at: Utc::now() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(RunState::Idle, RunState::Attaching).is_ok());
        assert!(validate_transition(RunState::Attaching, RunState::Mounted).is_ok());
        assert!(validate_transition(RunState::Attaching, RunState::Failed).is_ok());
        assert!(validate_transition(RunState::Mounted, RunState::Loading).is_ok());
        assert!(validate_transition(RunState::Loading, RunState::Unloading).is_ok()); // load failure
        assert!(validate_transition(RunState::Configuring, RunState::Unloading).is_ok());
        assert!(validate_transition(RunState::Unloading, RunState::Detaching).is_ok());
        assert!(validate_transition(RunState::Detaching, RunState::Committed).is_ok());
        assert!(validate_transition(RunState::Detaching, RunState::Discarded).is_ok());
        assert!(validate_transition(RunState::Detaching, RunState::Failed).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(RunState::Idle, RunState::Mounted).is_err());
        assert!(validate_transition(RunState::Configuring, RunState::Detaching).is_err());
        assert!(validate_transition(RunState::Mounted, RunState::Committed).is_err());
        assert!(validate_transition(RunState::Committed, RunState::Attaching).is_err());
        assert!(validate_transition(RunState::Unloading, RunState::Loading).is_err());
    }

    #[test]
    fn tracker_records_history() {
        let mut t = StateTracker::new();
        t.advance(RunState::Attaching).unwrap();
        t.advance(RunState::Mounted).unwrap();
        assert!(t.advance(RunState::Committed).is_err());
        assert_eq!(t.current(), RunState::Mounted);
        let states: Vec<_> = t.history().iter().map(|h| h.state).collect();
        assert_eq!(states, vec![RunState::Idle, RunState::Attaching, RunState::Mounted]);
        assert!(!t.current().is_terminal());
    }
}
