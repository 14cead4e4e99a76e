use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::report::{CompletenessReport, ResearchReport, ResolvedMetric};

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Working,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Transitions only move forward; terminal states have no successors.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Working | Self::Failed | Self::Canceled),
            Self::Working => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Canceled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Succeeded,
    Failed,
}

/// Incremental update appended to a task as each basket finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialEvent {
    /// Position in the task's event stream, starting at 0.
    pub sequence: usize,
    pub basket: String,
    pub outcome: EventOutcome,
    pub metrics: BTreeMap<String, ResolvedMetric>,
    pub completeness: CompletenessReport,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

/// A research task as seen by readers of the task store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub ticker: String,
    pub company_name: String,
    pub status: TaskStatus,
    pub cancel_requested: bool,
    pub partial_events: Vec<PartialEvent>,
    /// Present only once the task is completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResearchReport>,
    /// Present only once the task has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(ticker: &str, company_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            company_name: company_name.to_string(),
            status: TaskStatus::Pending,
            cancel_requested: false,
            partial_events: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next` if the transition is allowed. Returns whether it happened.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Append an event unless the task is already terminal.
    pub fn push_event(&mut self, mut event: PartialEvent) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        event.sequence = self.partial_events.len();
        self.partial_events.push(event);
        self.updated_at = Utc::now();
        true
    }

    pub fn complete(&mut self, report: ResearchReport) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.result = Some(report);
        true
    }

    pub fn fail(&mut self, error: String) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn event(basket: &str) -> PartialEvent {
        PartialEvent {
            sequence: 99,
            basket: basket.to_string(),
            outcome: EventOutcome::Succeeded,
            metrics: BTreeMap::new(),
            completeness: CompletenessReport {
                category: basket.to_string(),
                required: 0,
                found: 0,
                percentage: Decimal::ZERO,
                missing: vec![],
            },
            fallback_used: false,
            error: None,
            emitted_at: Utc::now(),
        }
    }

    #[test]
    fn status_transitions_are_one_way() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Working));
        assert!(TaskStatus::Working.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Working.can_transition_to(TaskStatus::Canceled));
        assert!(!TaskStatus::Working.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Working));
        assert!(!TaskStatus::Canceled.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn terminal_task_rejects_events_and_transitions() {
        let mut task = Task::new("AAPL", "Apple");
        assert!(task.transition(TaskStatus::Working));
        assert!(task.push_event(event("fundamentals")));
        assert!(task.transition(TaskStatus::Canceled));

        assert!(!task.push_event(event("valuation")));
        assert!(!task.transition(TaskStatus::Working));
        assert!(!task.fail("late".to_string()));
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.partial_events.len(), 1);
        assert!(task.error.is_none());
    }

    #[test]
    fn events_are_numbered_in_append_order() {
        let mut task = Task::new("AAPL", "Apple");
        task.transition(TaskStatus::Working);
        task.push_event(event("fundamentals"));
        task.push_event(event("valuation"));
        let sequences: Vec<usize> = task.partial_events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
        assert_eq!(TaskStatus::Working.to_string(), "working");
    }
}
