use crate::progress::{JobPhase, JobProgressBroadcaster, JobProgressEvent};

/// Events emitted while a page moves through the stages.
pub enum ProgressEvent<'a> {
    PageStarted {
        page_id: &'a str,
        ordinal: u32,
    },
    Stage {
        page_id: &'a str,
        ordinal: u32,
        stage: &'static str,
    },
    PageFinished {
        page_id: &'a str,
        ordinal: u32,
        status: &'a str,
        error: Option<&'static str>,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent<'_>);
}

/// No-op reporter for callers without subscribers.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent<'_>) {}
}

/// Bridges page events of one job onto the broadcast channel. Stage events
/// are only traced; subscribers see page boundaries.
pub struct BroadcastProgress {
    job_id: String,
    tenant_id: String,
    broadcaster: JobProgressBroadcaster,
}

impl BroadcastProgress {
    pub fn new(job_id: &str, tenant_id: &str, broadcaster: JobProgressBroadcaster) -> Self {
        Self {
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            broadcaster,
        }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::PageStarted { page_id, ordinal } => {
                self.broadcaster.send(
                    JobProgressEvent::new(
                        &self.job_id,
                        &self.tenant_id,
                        JobPhase::PageStarted,
                        &format!("Processing page {}", ordinal),
                    )
                    .with_page(page_id, ordinal),
                );
            }
            ProgressEvent::Stage { ordinal, stage, .. } => {
                tracing::trace!(ordinal, stage, "Page stage");
            }
            ProgressEvent::PageFinished {
                page_id,
                ordinal,
                status,
                error,
            } => {
                let mut event = JobProgressEvent::new(
                    &self.job_id,
                    &self.tenant_id,
                    JobPhase::PageFinished,
                    &format!("Page {} {}", ordinal, status),
                )
                .with_page(page_id, ordinal);
                event.page_status = Some(status.to_string());
                event.error = error.map(str::to_string);
                self.broadcaster.send(event);
            }
        }
    }
}
