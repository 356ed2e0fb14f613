use chrono::{DateTime, Duration, Utc};
use conclave_types::{TaskId, TaskVerb};
use serde::{Deserialize, Serialize};

use crate::board::TaskRecord;
use crate::task::TaskState;

/// Windows after which the substrate moves a task on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// `routed -> declined` when nobody responds.
    pub routed_ttl: Duration,
    /// `accepted -> in_progress` once the acceptance has sat idle.
    pub acceptance_inactivity: Duration,
    /// `in_progress -> quarantined` when no report arrives.
    pub report_deadline: Duration,
    /// `reported -> quarantined` when aggregation never happens.
    pub aggregation_deadline: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            routed_ttl: Duration::hours(72),
            acceptance_inactivity: Duration::hours(24),
            report_deadline: Duration::days(7),
            aggregation_deadline: Duration::hours(72),
        }
    }
}

/// Why a timeout fired. None of these attribute fault to anyone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    NoResponse,
    AcceptanceInactivity,
    MissedReportDeadline,
    MissedAggregationDeadline,
}

impl TimeoutReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutReason::NoResponse => "no_response",
            TimeoutReason::AcceptanceInactivity => "acceptance_inactivity",
            TimeoutReason::MissedReportDeadline => "missed_report_deadline",
            TimeoutReason::MissedAggregationDeadline => "missed_aggregation_deadline",
        }
    }
}

impl std::fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An automatic transition that has come due.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DueTransition {
    pub task_id: TaskId,
    pub from: TaskState,
    pub verb: TaskVerb,
    pub reason: TimeoutReason,
    pub due_at: DateTime<Utc>,
}

pub fn due_transition(
    record: &TaskRecord,
    policy: &TimeoutPolicy,
    now: DateTime<Utc>,
) -> Option<DueTransition> {
    let (window, verb, reason) = match record.current_state {
        TaskState::Routed => (
            policy.routed_ttl,
            TaskVerb::Declined,
            TimeoutReason::NoResponse,
        ),
        TaskState::Accepted => (
            policy.acceptance_inactivity,
            TaskVerb::Started,
            TimeoutReason::AcceptanceInactivity,
        ),
        TaskState::InProgress => (
            policy.report_deadline,
            TaskVerb::Quarantined,
            TimeoutReason::MissedReportDeadline,
        ),
        TaskState::Reported => (
            policy.aggregation_deadline,
            TaskVerb::Quarantined,
            TimeoutReason::MissedAggregationDeadline,
        ),
        _ => return None,
    };
    let due_at = record.state_entered_at + window;
    (now >= due_at).then(|| DueTransition {
        task_id: record.task_id.clone(),
        from: record.current_state,
        verb,
        reason,
        due_at,
    })
}
