use conclave_types::TaskVerb;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The eleven task states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Authorized,
    Activated,
    Routed,
    Accepted,
    InProgress,
    Reported,
    Aggregated,
    Completed,
    Declined,
    Quarantined,
    Nullified,
}

impl TaskState {
    pub const ALL: [TaskState; 11] = [
        TaskState::Authorized,
        TaskState::Activated,
        TaskState::Routed,
        TaskState::Accepted,
        TaskState::InProgress,
        TaskState::Reported,
        TaskState::Aggregated,
        TaskState::Completed,
        TaskState::Declined,
        TaskState::Quarantined,
        TaskState::Nullified,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Authorized => "authorized",
            TaskState::Activated => "activated",
            TaskState::Routed => "routed",
            TaskState::Accepted => "accepted",
            TaskState::InProgress => "in_progress",
            TaskState::Reported => "reported",
            TaskState::Aggregated => "aggregated",
            TaskState::Completed => "completed",
            TaskState::Declined => "declined",
            TaskState::Quarantined => "quarantined",
            TaskState::Nullified => "nullified",
        }
    }

    /// The state a verb moves a task into.
    pub fn entered_by(verb: TaskVerb) -> TaskState {
        match verb {
            TaskVerb::Authorized => TaskState::Authorized,
            TaskVerb::Activated => TaskState::Activated,
            TaskVerb::Routed => TaskState::Routed,
            TaskVerb::Accepted => TaskState::Accepted,
            TaskVerb::Started => TaskState::InProgress,
            TaskVerb::Reported => TaskState::Reported,
            TaskVerb::Aggregated => TaskState::Aggregated,
            TaskVerb::Completed => TaskState::Completed,
            TaskVerb::Declined => TaskState::Declined,
            TaskVerb::Quarantined => TaskState::Quarantined,
            TaskVerb::Nullified => TaskState::Nullified,
        }
    }

    /// `completed` and `nullified` freeze a task.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Nullified)
    }

    /// Work has started: consent was given and the task has moved past acceptance.
    pub fn is_commenced(self) -> bool {
        matches!(
            self,
            TaskState::InProgress | TaskState::Reported | TaskState::Aggregated
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition `next()` refuses. The named variants are the ones governance
/// rules call out explicitly; everything else is `Undefined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IllegalTransition {
    #[error("cannot decline a task that is already {from}")]
    DeclineAfterCommencement { from: TaskState },

    #[error("a task can only be accepted from routed, not {from}")]
    AcceptOutsideRouting { from: TaskState },

    #[error("a quarantined task can never complete")]
    QuarantineCannotComplete,

    #[error("task is {from} and frozen; {verb} refused")]
    FromTerminal { from: TaskState, verb: TaskVerb },

    #[error("task already exists in state {from}")]
    Reauthorization { from: TaskState },

    #[error("no transition from {from} via {verb}")]
    Undefined { from: TaskState, verb: TaskVerb },
}

/// The task transition function. Pure and total: every `(state, verb)` pair
/// yields either the successor state or a named refusal.
pub fn next(state: TaskState, verb: TaskVerb) -> Result<TaskState, IllegalTransition> {
    use TaskState as S;
    use TaskVerb as V;

    if state.is_terminal() {
        return Err(IllegalTransition::FromTerminal { from: state, verb });
    }

    match (state, verb) {
        (S::Authorized, V::Activated)
        | (S::Activated, V::Routed)
        | (S::Routed, V::Accepted)
        | (S::Accepted, V::Started)
        | (S::InProgress, V::Reported)
        | (S::Reported, V::Aggregated)
        | (S::Aggregated, V::Completed)
        | (S::Accepted, V::Declined)
        | (S::Routed, V::Declined)
        | (S::InProgress, V::Quarantined)
        | (S::Reported, V::Quarantined)
        | (_, V::Nullified) => Ok(TaskState::entered_by(verb)),

        (from, V::Authorized) => Err(IllegalTransition::Reauthorization { from }),
        (from, V::Declined) if from.is_commenced() => {
            Err(IllegalTransition::DeclineAfterCommencement { from })
        }
        (from, V::Accepted) => Err(IllegalTransition::AcceptOutsideRouting { from }),
        (S::Quarantined, V::Completed) => Err(IllegalTransition::QuarantineCannotComplete),
        (from, verb) => Err(IllegalTransition::Undefined { from, verb }),
    }
}

/// Where the halt table sends a task in `state`.
///
/// Tasks that never reached consent are nullified; tasks holding consent are
/// quarantined. Everything else keeps its state, history is never rewritten.
pub fn halt_disposition(state: TaskState) -> TaskState {
    match state {
        TaskState::Authorized | TaskState::Activated | TaskState::Routed => TaskState::Nullified,
        TaskState::Accepted
        | TaskState::InProgress
        | TaskState::Reported
        | TaskState::Aggregated => TaskState::Quarantined,
        TaskState::Completed
        | TaskState::Declined
        | TaskState::Quarantined
        | TaskState::Nullified => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LEGAL: &[(TaskState, TaskVerb, TaskState)] = &[
        (TaskState::Authorized, TaskVerb::Activated, TaskState::Activated),
        (TaskState::Activated, TaskVerb::Routed, TaskState::Routed),
        (TaskState::Routed, TaskVerb::Accepted, TaskState::Accepted),
        (TaskState::Accepted, TaskVerb::Started, TaskState::InProgress),
        (TaskState::InProgress, TaskVerb::Reported, TaskState::Reported),
        (TaskState::Reported, TaskVerb::Aggregated, TaskState::Aggregated),
        (TaskState::Aggregated, TaskVerb::Completed, TaskState::Completed),
        (TaskState::Accepted, TaskVerb::Declined, TaskState::Declined),
        (TaskState::Routed, TaskVerb::Declined, TaskState::Declined),
        (TaskState::InProgress, TaskVerb::Quarantined, TaskState::Quarantined),
        (TaskState::Reported, TaskVerb::Quarantined, TaskState::Quarantined),
    ];

    fn legal_successor(state: TaskState, verb: TaskVerb) -> Option<TaskState> {
        if verb == TaskVerb::Nullified && !state.is_terminal() {
            return Some(TaskState::Nullified);
        }
        LEGAL
            .iter()
            .find(|(s, v, _)| *s == state && *v == verb)
            .map(|(_, _, to)| *to)
    }

    #[test]
    fn named_refusals() {
        for from in [TaskState::InProgress, TaskState::Reported, TaskState::Aggregated] {
            assert_eq!(
                next(from, TaskVerb::Declined),
                Err(IllegalTransition::DeclineAfterCommencement { from })
            );
        }
        assert_eq!(
            next(TaskState::Activated, TaskVerb::Accepted),
            Err(IllegalTransition::AcceptOutsideRouting {
                from: TaskState::Activated
            })
        );
        assert_eq!(
            next(TaskState::Quarantined, TaskVerb::Completed),
            Err(IllegalTransition::QuarantineCannotComplete)
        );
        assert_eq!(
            next(TaskState::Completed, TaskVerb::Nullified),
            Err(IllegalTransition::FromTerminal {
                from: TaskState::Completed,
                verb: TaskVerb::Nullified
            })
        );
        assert!(matches!(
            next(TaskState::Routed, TaskVerb::Authorized),
            Err(IllegalTransition::Reauthorization { .. })
        ));
    }

    #[test]
    fn quarantine_and_decline_only_exit_to_nullified() {
        for state in [TaskState::Quarantined, TaskState::Declined] {
            for verb in TaskVerb::ALL {
                let result = next(state, *verb);
                if *verb == TaskVerb::Nullified {
                    assert_eq!(result, Ok(TaskState::Nullified));
                } else {
                    assert!(result.is_err(), "{state} via {verb}");
                }
            }
        }
    }

    #[test]
    fn halt_table() {
        use TaskState::*;
        let expected = [
            (Authorized, Nullified),
            (Activated, Nullified),
            (Routed, Nullified),
            (Accepted, Quarantined),
            (InProgress, Quarantined),
            (Reported, Quarantined),
            (Aggregated, Quarantined),
            (Completed, Completed),
            (Declined, Declined),
            (Quarantined, Quarantined),
            (Nullified, Nullified),
        ];
        for (from, to) in expected {
            assert_eq!(halt_disposition(from), to, "{from}");
        }
    }

    proptest! {
        #[test]
        fn next_matches_the_edge_table(
            state in prop::sample::select(TaskState::ALL.to_vec()),
            verb in prop::sample::select(TaskVerb::ALL.to_vec()),
        ) {
            match legal_successor(state, verb) {
                Some(to) => prop_assert_eq!(next(state, verb), Ok(to)),
                None => prop_assert!(next(state, verb).is_err()),
            }
        }
    }
}
