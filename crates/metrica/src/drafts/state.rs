//! Review workflow states and the legal transitions between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    InReview,
    Finalized,
    Committed,
    Rejected,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 5] = [
        WorkflowStatus::Draft,
        WorkflowStatus::InReview,
        WorkflowStatus::Finalized,
        WorkflowStatus::Committed,
        WorkflowStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::InReview => "in_review",
            WorkflowStatus::Finalized => "finalized",
            WorkflowStatus::Committed => "committed",
            WorkflowStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Committed | WorkflowStatus::Rejected)
    }

    /// Statuses a reviewer still has to act on.
    pub fn awaiting_review() -> [WorkflowStatus; 2] {
        [WorkflowStatus::Draft, WorkflowStatus::InReview]
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown workflow status '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftOperation {
    Create,
    Assign,
    Edit,
    Acknowledge,
    Finalize,
    Commit,
    Reject,
    /// Commit without review, for drafts clearing the auto-commit bar.
    AutoCommit,
    /// Undo of an auto-commit: the draft goes back to review.
    Reopen,
}

impl fmt::Display for DraftOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DraftOperation::Create => "create",
            DraftOperation::Assign => "assign",
            DraftOperation::Edit => "edit",
            DraftOperation::Acknowledge => "acknowledge",
            DraftOperation::Finalize => "finalize",
            DraftOperation::Commit => "commit",
            DraftOperation::Reject => "reject",
            DraftOperation::AutoCommit => "auto-commit",
            DraftOperation::Reopen => "reopen",
        };
        f.write_str(name)
    }
}

/// Status after applying `operation` in `from`, or `None` when illegal.
/// Edits leave the status unchanged.
pub fn next_status(from: WorkflowStatus, operation: DraftOperation) -> Option<WorkflowStatus> {
    use DraftOperation as Op;
    use WorkflowStatus as S;
    match (from, operation) {
        (S::Draft, Op::Assign) => Some(S::InReview),
        (S::Draft | S::InReview, Op::Edit | Op::Acknowledge) => Some(from),
        (S::InReview, Op::Finalize) => Some(S::Finalized),
        (S::Finalized, Op::Commit) => Some(S::Committed),
        (S::Draft | S::InReview, Op::Reject) => Some(S::Rejected),
        (S::Draft, Op::AutoCommit) => Some(S::Committed),
        (S::Committed, Op::Reopen) => Some(S::InReview),
        _ => None,
    }
}
