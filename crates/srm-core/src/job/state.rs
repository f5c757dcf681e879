// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job lifecycle states and the fixed transition table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Pending,
    #[serde(rename = "TQUEUED")]
    TQueued,
    #[serde(rename = "PRIORITYTQUEUED")]
    PriorityTQueued,
    Running,
    #[serde(rename = "RQUEUED")]
    RQueued,
    Ready,
    Transferring,
    #[serde(rename = "RETRYWAIT")]
    RetryWait,
    #[serde(rename = "ASYNCWAIT")]
    AsyncWait,
    #[serde(rename = "RUNNINGWITHOUTTHREAD")]
    RunningWithoutThread,
    Restored,
    Done,
    Failed,
    Canceled,
}

impl State {
    pub const ALL: [State; 14] = [
        State::Pending,
        State::TQueued,
        State::PriorityTQueued,
        State::Running,
        State::RQueued,
        State::Ready,
        State::Transferring,
        State::RetryWait,
        State::AsyncWait,
        State::RunningWithoutThread,
        State::Restored,
        State::Done,
        State::Failed,
        State::Canceled,
    ];

    /// DONE, FAILED and CANCELED.
    pub fn is_final(&self) -> bool {
        matches!(self, State::Done | State::Failed | State::Canceled)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: State) -> bool {
        use State::*;
        match self {
            Pending => matches!(
                next,
                Done | Canceled | Failed | Running | TQueued | Restored
            ),
            TQueued | PriorityTQueued => {
                matches!(next, Canceled | Failed | Running | Restored)
            }
            Running => matches!(
                next,
                Canceled
                    | Failed
                    | RetryWait
                    | AsyncWait
                    | RQueued
                    | Ready
                    | Done
                    | RunningWithoutThread
                    | Restored
            ),
            AsyncWait => matches!(
                next,
                Canceled | Failed | Running | PriorityTQueued | Done | RetryWait | Restored
            ),
            RetryWait => matches!(
                next,
                Canceled | Failed | Running | PriorityTQueued | Restored
            ),
            RQueued => matches!(next, Canceled | Failed | Ready | Restored),
            Ready => matches!(next, Canceled | Failed | Transferring | Done | Restored),
            Transferring => matches!(next, Canceled | Failed | Done | Restored),
            RunningWithoutThread | Restored => true,
            Done | Failed | Canceled => false,
        }
    }

    /// Legal successors of this state, in declaration order.
    pub fn successors(&self) -> Vec<State> {
        State::ALL
            .iter()
            .copied()
            .filter(|next| self.can_transition_to(*next))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::TQueued => "TQUEUED",
            State::PriorityTQueued => "PRIORITYTQUEUED",
            State::Running => "RUNNING",
            State::RQueued => "RQUEUED",
            State::Ready => "READY",
            State::Transferring => "TRANSFERRING",
            State::RetryWait => "RETRYWAIT",
            State::AsyncWait => "ASYNCWAIT",
            State::RunningWithoutThread => "RUNNINGWITHOUTTHREAD",
            State::Restored => "RESTORED",
            State::Done => "DONE",
            State::Failed => "FAILED",
            State::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for State {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_states_have_no_successors() {
        for state in [State::Done, State::Failed, State::Canceled] {
            assert!(state.is_final());
            assert!(state.successors().is_empty(), "{} has successors", state);
        }
    }

    #[test]
    fn test_hub_states_reach_everything() {
        for state in [State::Restored, State::RunningWithoutThread] {
            assert_eq!(state.successors().len(), State::ALL.len());
        }
    }

    #[test]
    fn test_adjacency_table() {
        use State::*;
        let cases = vec![
            (Pending, vec![Running, TQueued, Restored, Done, Failed, Canceled]),
            (TQueued, vec![Running, Restored, Failed, Canceled]),
            (PriorityTQueued, vec![Running, Restored, Failed, Canceled]),
            (
                Running,
                vec![
                    RQueued,
                    Ready,
                    RetryWait,
                    AsyncWait,
                    RunningWithoutThread,
                    Restored,
                    Done,
                    Failed,
                    Canceled,
                ],
            ),
            (
                AsyncWait,
                vec![
                    Running,
                    PriorityTQueued,
                    RetryWait,
                    Restored,
                    Done,
                    Failed,
                    Canceled,
                ],
            ),
            (
                RetryWait,
                vec![Running, PriorityTQueued, Restored, Failed, Canceled],
            ),
            (RQueued, vec![Ready, Restored, Failed, Canceled]),
            (Ready, vec![Transferring, Restored, Done, Failed, Canceled]),
            (Transferring, vec![Restored, Done, Failed, Canceled]),
        ];

        for (from, allowed) in cases {
            for to in State::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_state_names_parse() {
        for state in State::ALL {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("WAITING".parse::<State>().is_err());
    }
}
