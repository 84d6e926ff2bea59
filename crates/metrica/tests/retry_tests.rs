//! Bounded retries, dead letters and recovery after transient failures.

mod common;

use common::*;
use metrica::error::PermanentKind;
use metrica::{EngineError, JobOutcome};

const TENANT: &str = "holy-trinity";

#[test]
fn test_transient_failures_stop_after_max_retries() {
    let h = TestHarness::new();
    h.engine.fail_with(Some(transient_failure()));
    let job = h.submit_pages(TENANT, 600, vec![baptism_certificate("Fr. Ioann Smirnov")]);

    let outcomes: Vec<JobOutcome> = h.drain().into_iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            JobOutcome::Requeued { retry_count: 1 },
            JobOutcome::Requeued { retry_count: 2 },
            JobOutcome::DeadLettered { retry_count: 2 },
        ]
    );
    assert_eq!(h.engine.calls(), 3);

    let status = h.status(&job);
    assert_eq!(status.status, "failed");
    assert_eq!(status.retry_count, h.config.worker.max_retries);
    let message = status.user_message.expect("user message");
    assert!(!message.contains("503"), "internal detail leaked: {}", message);

    let dead = h.service.dead_letters(Some(TENANT)).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, job);
    assert!(h.service.dead_letters(Some("other-parish")).unwrap().is_empty());
    assert!(h.drafts_for(TENANT, &job).is_empty());
}

#[test]
fn test_job_recovers_when_service_returns() {
    let h = TestHarness::new();
    h.engine.fail_with(Some(transient_failure()));
    let job = h.submit_pages(TENANT, 610, vec![baptism_certificate("Fr. Ioann Smirnov")]);

    let first = h.service.run_once("w1").unwrap().expect("claimed");
    assert_eq!(first.outcome, JobOutcome::Requeued { retry_count: 1 });
    let status = h.status(&job);
    assert_eq!(status.status, "queued");
    assert_eq!(status.pages[0].status, "pending");

    h.engine.fail_with(None);
    let second = h.service.run_once("w2").unwrap().expect("claimed");
    assert_eq!(
        second.outcome,
        JobOutcome::Completed {
            drafts: 1,
            failed_pages: 0
        }
    );
    let status = h.status(&job);
    assert_eq!(status.status, "completed");
    assert_eq!(status.retry_count, 1);
    assert!(h.service.dead_letters(None).unwrap().is_empty());
}

#[test]
fn test_permanent_failure_is_not_retried() {
    let h = TestHarness::new();
    h.engine.fail_with(Some(EngineError::permanent(PermanentKind::Auth, "key revoked")));
    let job = h.submit_pages(TENANT, 620, vec![baptism_certificate("Fr. Ioann Smirnov")]);

    let reports = h.drain();
    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].outcome, JobOutcome::Failed { .. }));
    assert_eq!(h.engine.calls(), 1);

    let status = h.status(&job);
    assert_eq!(status.status, "failed");
    assert_eq!(status.retry_count, 0);
    assert!(!status.user_message.unwrap_or_default().contains("key revoked"));
}

#[test]
fn test_settled_pages_are_not_reprocessed_on_retry() {
    let h = TestHarness::new();
    h.engine.fail_page_with(631, Some(transient_failure()));
    let job = h.submit_pages(
        TENANT,
        630,
        vec![
            baptism_certificate("Fr. Ioann Smirnov"),
            baptism_certificate("Fr. Pavel Orlov"),
        ],
    );

    let first = h.service.run_once("w1").unwrap().expect("claimed");
    assert_eq!(first.outcome, JobOutcome::Requeued { retry_count: 1 });
    assert_eq!(h.engine.calls(), 2);
    let mut statuses: Vec<(u32, String)> = h
        .status(&job)
        .pages
        .into_iter()
        .map(|p| (p.ordinal, p.status))
        .collect();
    statuses.sort();
    assert_eq!(statuses[0].1, "extracted");
    assert_eq!(statuses[1].1, "pending");

    h.engine.fail_page_with(631, None);
    let second = h.service.run_once("w1").unwrap().expect("claimed");
    assert_eq!(
        second.outcome,
        JobOutcome::Completed {
            drafts: 2,
            failed_pages: 0
        }
    );
    // Only the page that failed was recognized again.
    assert_eq!(h.engine.calls(), 3);
    assert!(h.status(&job).pages.iter().all(|p| p.status == "completed"));
}
