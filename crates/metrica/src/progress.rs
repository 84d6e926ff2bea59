//! Job progress broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Phase a job progress event reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Claimed,
    PageStarted,
    PageFinished,
    DraftsCreated,
    Completed,
    Failed,
    Requeued,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Claimed => write!(f, "Claimed"),
            JobPhase::PageStarted => write!(f, "Page started"),
            JobPhase::PageFinished => write!(f, "Page finished"),
            JobPhase::DraftsCreated => write!(f, "Drafts created"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
            JobPhase::Requeued => write!(f, "Requeued"),
        }
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub tenant_id: String,
    pub phase: JobPhase,
    /// Human-readable description of the current activity.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,
    /// Page status after a `PageFinished` event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_status: Option<String>,
    /// Set on `DraftsCreated`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drafts: Option<u32>,
    /// User-facing failure text, never a raw internal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    pub fn new(job_id: &str, tenant_id: &str, phase: JobPhase, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            phase,
            message: message.to_string(),
            timestamp: Utc::now(),
            page_id: None,
            ordinal: None,
            page_status: None,
            drafts: None,
            error: None,
        }
    }

    pub fn with_page(mut self, page_id: &str, ordinal: u32) -> Self {
        self.page_id = Some(page_id.to_string());
        self.ordinal = Some(ordinal);
        self
    }

    pub fn failed(job_id: &str, tenant_id: &str, user_message: &str) -> Self {
        let mut event = Self::new(job_id, tenant_id, JobPhase::Failed, "Processing failed");
        event.error = Some(user_message.to_string());
        event
    }
}

/// Broadcasts job progress events to any number of subscribers.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
