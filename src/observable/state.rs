use std::fmt;

use crate::observable::ObservableError;

/// Producer lifecycle state. Everything but `Writable` is terminal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StreamState {
    #[default]
    Writable,
    Closed,
    Aborted,
    Canceled,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Writable => "writable",
            StreamState::Closed => "closed",
            StreamState::Aborted => "aborted",
            StreamState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != StreamState::Writable
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer action subject to state validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Write,
    Close,
    Abort,
    Cancel,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Write => "write",
            Action::Close => "close",
            Action::Abort => "abort",
            Action::Cancel => "cancel",
        }
    }

    /// State the producer is in after the action succeeds.
    pub fn target(self) -> StreamState {
        match self {
            Action::Write => StreamState::Writable,
            Action::Close => StreamState::Closed,
            Action::Abort => StreamState::Aborted,
            Action::Cancel => StreamState::Canceled,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check-and-set over [`StreamState`].
///
/// Callers hold the owning lock across `transition` and the envelope send so
/// the first action evaluated is also the first transmitted.
#[derive(Debug, Default)]
pub(crate) struct StateMachine {
    state: StreamState,
}

impl StateMachine {
    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn check(&self, action: Action) -> Result<(), ObservableError> {
        if self.state.is_terminal() {
            return Err(ObservableError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    pub(crate) fn transition(&mut self, action: Action) -> Result<StreamState, ObservableError> {
        self.check(action)?;
        self.state = action.target();
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, StateMachine, StreamState};
    use crate::observable::ObservableError;

    #[test]
    fn writes_keep_the_machine_writable() {
        let mut machine = StateMachine::default();
        for _ in 0..3 {
            assert_eq!(
                machine.transition(Action::Write).expect("write"),
                StreamState::Writable
            );
        }
    }

    #[test]
    fn first_terminal_action_wins() {
        for first in [Action::Close, Action::Abort, Action::Cancel] {
            let mut machine = StateMachine::default();
            assert_eq!(machine.transition(first).expect("first"), first.target());

            for later in [Action::Write, Action::Close, Action::Abort, Action::Cancel] {
                match machine.transition(later) {
                    Err(ObservableError::InvalidState { action, state }) => {
                        assert_eq!(action, later);
                        assert_eq!(state, first.target());
                    }
                    other => panic!("{later} after {first} should fail, got {other:?}"),
                }
            }
            assert_eq!(machine.state(), first.target());
        }
    }

    #[test]
    fn only_writable_is_non_terminal() {
        assert!(!StreamState::Writable.is_terminal());
        assert!(StreamState::Closed.is_terminal());
        assert!(StreamState::Aborted.is_terminal());
        assert!(StreamState::Canceled.is_terminal());
    }
}
