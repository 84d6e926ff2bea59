use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{DraftError, EngineError, PermanentKind, PreprocessError, StorageError};

pub const MSG_BLURRY: &str = "image too blurry to process";
pub const MSG_UNSUPPORTED: &str = "unsupported file format";
pub const MSG_NO_TEXT: &str = "no readable text was found on this page";
pub const MSG_AUTH: &str = "the recognition service rejected our credentials; contact an administrator";
pub const MSG_UNAVAILABLE: &str = "the recognition service is temporarily unavailable; the job will be retried";
pub const MSG_INTERNAL: &str = "a temporary processing error occurred; the job will be retried";
pub const MSG_CANCELLED: &str = "processing was cancelled";
pub const MSG_SOURCE_MISSING: &str = "the uploaded file is no longer available; please upload it again";

/// Why a page stopped. Transient errors requeue the job; the rest fail only
/// the page.
#[derive(Error, Debug)]
pub enum PageError {
    #[error("Preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Recognition failed: {0}")]
    Engine(#[from] EngineError),

    #[error("No text recognized (quality {quality:.2})")]
    NoText { quality: f32, low_quality: bool },

    #[error("Artifact storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Draft creation failed: {0}")]
    Draft(#[from] DraftError),

    #[error("Cancelled")]
    Cancelled,
}

impl PageError {
    pub fn is_transient(&self) -> bool {
        match self {
            PageError::Engine(e) => e.is_transient(),
            // A vanished upload stays vanished.
            PageError::Storage(StorageError::NotFound(_)) => false,
            PageError::Storage(_) | PageError::Database(_) | PageError::Draft(_) => true,
            PageError::Preprocess(_) | PageError::NoText { .. } | PageError::Cancelled => false,
        }
    }

    /// Actionable text for the review UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            PageError::Preprocess(PreprocessError::Decode(_)) => MSG_UNSUPPORTED,
            PageError::Preprocess(_) => MSG_BLURRY,
            PageError::NoText { low_quality: true, .. } => MSG_BLURRY,
            PageError::NoText { .. } => MSG_NO_TEXT,
            PageError::Engine(EngineError::Transient { .. }) => MSG_UNAVAILABLE,
            PageError::Engine(EngineError::Permanent { kind, .. }) => match kind {
                PermanentKind::Auth => MSG_AUTH,
                PermanentKind::BadImage => MSG_BLURRY,
                PermanentKind::UnsupportedFormat | PermanentKind::InvalidRequest => MSG_UNSUPPORTED,
            },
            PageError::Storage(StorageError::NotFound(_)) => MSG_SOURCE_MISSING,
            PageError::Storage(_) | PageError::Database(_) | PageError::Draft(_) => MSG_INTERNAL,
            PageError::Cancelled => MSG_CANCELLED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientKind;

    #[test]
    fn test_transient_classification() {
        assert!(PageError::from(EngineError::transient(TransientKind::RateLimited, "429")).is_transient());
        assert!(!PageError::from(EngineError::permanent(PermanentKind::Auth, "401")).is_transient());
        assert!(!PageError::Cancelled.is_transient());
        assert!(!PageError::from(StorageError::NotFound("upload/aa/x".into())).is_transient());
        assert!(PageError::from(StorageError::ReadFile {
            path: "artifacts/upload/aa/x".into(),
            source: std::io::Error::other("disk unplugged"),
        })
        .is_transient());
    }

    #[test]
    fn test_user_messages_hide_internals() {
        let auth = PageError::from(EngineError::permanent(PermanentKind::Auth, "HTTP 401: bad key sk-123"));
        assert_eq!(auth.user_message(), MSG_AUTH);
        assert!(!auth.user_message().contains("sk-123"));

        let blurry = PageError::NoText {
            quality: 0.1,
            low_quality: true,
        };
        assert_eq!(blurry.user_message(), MSG_BLURRY);
        assert_eq!(
            PageError::Preprocess(PreprocessError::Decode("bad magic".into())).user_message(),
            MSG_UNSUPPORTED
        );
        assert_eq!(
            PageError::from(StorageError::NotFound("upload/aa/x".into())).user_message(),
            MSG_SOURCE_MISSING
        );
    }
}
