//! Job and page status names as stored in the `jobs` and `pages` tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    /// Also the end state of a cancelled job; its `user_message` says so.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Processing,
    Extracted,
    Completed,
    Failed,
    /// The classifier could not tell the record type.
    NeedsClassification,
    Cancelled,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Processing => "processing",
            PageStatus::Extracted => "extracted",
            PageStatus::Completed => "completed",
            PageStatus::Failed => "failed",
            PageStatus::NeedsClassification => "needs_classification",
            PageStatus::Cancelled => "cancelled",
        }
    }

    /// Pages a retried job does not process again.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PageStatus::Extracted
                | PageStatus::Completed
                | PageStatus::Failed
                | PageStatus::NeedsClassification
        )
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PageStatus::Pending),
            "processing" => Ok(PageStatus::Processing),
            "extracted" => Ok(PageStatus::Extracted),
            "completed" => Ok(PageStatus::Completed),
            "failed" => Ok(PageStatus::Failed),
            "needs_classification" => Ok(PageStatus::NeedsClassification),
            "cancelled" => Ok(PageStatus::Cancelled),
            other => Err(format!("unknown page status '{}'", other)),
        }
    }
}
