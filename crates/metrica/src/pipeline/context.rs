use crate::classifier::Classification;
use crate::corrections::AppliedCorrection;
use crate::db::page_repo::PageRow;
use crate::engine::Recognition;
use crate::layout::ExtractionStrategy;
use crate::preprocess::PreparedImage;
use crate::record::RecordCandidate;
use crate::tokenizer::TokenizedPage;

/// State of one page as it moves through the stages. The page row is kept
/// current so it can be persisted after any stage.
pub struct PageContext {
    pub job_id: String,
    pub tenant_id: String,
    pub page: PageRow,

    pub prepared: Option<PreparedImage>,
    pub recognition: Option<Recognition>,
    pub tokens: Option<TokenizedPage>,
    pub classification: Option<Classification>,
    pub strategy: Option<ExtractionStrategy>,
    pub candidates: Vec<RecordCandidate>,
    pub applied_corrections: Vec<AppliedCorrection>,
}

impl PageContext {
    pub fn new(job_id: &str, tenant_id: &str, page: PageRow) -> Self {
        Self {
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            page,
            prepared: None,
            recognition: None,
            tokens: None,
            classification: None,
            strategy: None,
            candidates: Vec::new(),
            applied_corrections: Vec::new(),
        }
    }
}
