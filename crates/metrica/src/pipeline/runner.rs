use std::sync::Arc;

use tracing::{debug, info_span, warn};

use crate::classifier::Classifier;
use crate::columns::ColumnMapper;
use crate::corrections::CorrectionMemory;
use crate::engine::structure::{self, RetryStrategy};
use crate::engine::{CallContext, OcrClient, Recognition};
use crate::layout::{ExtractionStrategy, LayoutExtractor, LayoutTemplate, TemplateRegistry};
use crate::preprocess::{PreparedImage, Preprocessor};
use crate::queue::PageStatus;
use crate::record::{RecordCandidate, RecordType};
use crate::scoring::Scorer;
use crate::storage::{ArtifactKind, ArtifactStore};
use crate::tokenizer::{self, TokenizedPage};

use super::config::PipelineConfig;
use super::context::PageContext;
use super::error::PageError;
use super::progress::{ProgressEvent, ProgressReporter};

/// How a page left the pipeline without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Extracted { candidates: usize },
    /// The classifier could not settle on a record type.
    NeedsClassification,
}

impl PageOutcome {
    pub fn status(&self) -> PageStatus {
        match self {
            PageOutcome::Extracted { .. } => PageStatus::Extracted,
            PageOutcome::NeedsClassification => PageStatus::NeedsClassification,
        }
    }
}

/// Second recognition of a ledger page that produced better rows.
struct Retried {
    recognition: Recognition,
    page: TokenizedPage,
}

/// Drives one page from upload bytes to scored, corrected and validated
/// candidates. Shared by all workers; every stage is read-only on `self`.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    preprocessor: Preprocessor,
    client: OcrClient,
    classifier: Classifier,
    registry: Arc<TemplateRegistry>,
    layout: LayoutExtractor,
    columns: ColumnMapper,
    scorer: Scorer,
    memory: CorrectionMemory,
    artifacts: ArtifactStore,
}

impl Pipeline {
    /// Builds the stage components from config around the shared
    /// recognition client, template registry and correction memory.
    pub fn from_config(
        config: Arc<PipelineConfig>,
        client: OcrClient,
        registry: Arc<TemplateRegistry>,
        memory: CorrectionMemory,
        artifacts: ArtifactStore,
    ) -> Self {
        let extraction = &config.extraction;
        Self {
            preprocessor: Preprocessor::new(config.preprocess.clone()),
            classifier: Classifier::new(extraction.classifier_min_confidence),
            layout: LayoutExtractor::new(extraction),
            columns: ColumnMapper::new(extraction),
            scorer: Scorer::new(extraction),
            client,
            registry,
            memory,
            artifacts,
            config,
        }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Runs every stage for one page. `cancelled` is polled between stages,
    /// never inside one. On success the page row in `ctx` carries the
    /// artifact references and classification, ready to persist.
    pub fn run(
        &self,
        ctx: &mut PageContext,
        cancelled: &dyn Fn() -> bool,
        progress: &dyn ProgressReporter,
    ) -> Result<PageOutcome, PageError> {
        let page_id = ctx.page.id.clone();
        let ordinal = ctx.page.ordinal;
        // Reports the stage and opens its span; the span closes with the
        // guard at the end of the stage block.
        let stage = |stage: &'static str| {
            progress.report(ProgressEvent::Stage {
                page_id: &page_id,
                ordinal,
                stage,
            });
            info_span!("stage", stage).entered()
        };
        let checkpoint = || if cancelled() { Err(PageError::Cancelled) } else { Ok(()) };

        // Step 1: Preprocess
        let prepared = {
            let _stage = stage("preprocess");
            let upload = self.artifacts.get(&ctx.page.source_ref)?;
            let prepared = self.preprocessor.prepare(&upload)?;
            ctx.page.preprocessed_ref = Some(self.artifacts.put(ArtifactKind::Preprocessed, &prepared.png)?);
            ctx.page.quality_score = Some(f64::from(prepared.quality));
            ctx.page.needs_review = prepared.low_quality;
            if prepared.low_quality {
                debug!(quality = prepared.quality, "Low-quality scan; all fields go to review");
            }
            &*ctx.prepared.insert(prepared)
        };
        checkpoint()?;

        // Step 2: Recognize
        let recognition = {
            let _stage = stage("recognize");
            let call = CallContext {
                tenant_id: &ctx.tenant_id,
                job_id: Some(&ctx.job_id),
                page_id: Some(&page_id),
            };
            let recognition = self.client.recognize(&prepared.png, &call)?;
            ctx.page.raw_ocr_ref = recognition.raw_ref.clone();
            &*ctx.recognition.insert(recognition)
        };
        checkpoint()?;

        // Step 3: Tokenize
        let page = {
            let _stage = stage("tokenize");
            let page = tokenizer::tokenize(&recognition.result, &prepared.rule_lines);
            if page.is_empty() {
                return Err(PageError::NoText {
                    quality: prepared.quality,
                    low_quality: prepared.low_quality,
                });
            }
            ctx.page.tokens_ref = Some(self.artifacts.put_json(ArtifactKind::Tokens, &page)?);
            ctx.page.detected_language = page.detected_language.clone();
            debug!(tokens = page.tokens.len(), lines = page.line_count(), "Tokenized page");
            &*ctx.tokens.insert(page)
        };

        // Step 4: Classify
        let classification = {
            let _stage = stage("classify");
            self.classifier.classify(page)
        };
        ctx.page.record_type = Some(classification.record_type.as_str().to_string());
        ctx.page.classification_confidence = Some(f64::from(classification.confidence));
        if classification.is_unknown() {
            debug!(confidence = classification.confidence, "Page needs manual classification");
            ctx.classification = Some(classification);
            return Ok(PageOutcome::NeedsClassification);
        }
        checkpoint()?;

        // Step 5: Select a strategy once, then extract
        let extraction = &self.config.extraction;
        let strategy = self.registry.select(
            &ctx.tenant_id,
            classification.record_type,
            classification.shape,
            page,
            extraction.anchor_similarity,
            extraction.template_match_threshold,
        );
        let Some(strategy) = strategy else {
            warn!(record_type = %classification.record_type, "No layout template for record type");
            ctx.classification = Some(classification);
            return Ok(PageOutcome::NeedsClassification);
        };
        let (mut candidates, retried) = {
            let _stage = stage("extract");
            match &strategy {
                ExtractionStrategy::Layout { template, mismatch } => {
                    let mut candidate = self.layout.extract(page, template, *mismatch);
                    candidate.attach_sources(page);
                    (vec![candidate], None)
                }
                ExtractionStrategy::Columns { template } => {
                    let call = CallContext {
                        tenant_id: &ctx.tenant_id,
                        job_id: Some(&ctx.job_id),
                        page_id: Some(&page_id),
                    };
                    self.extract_columns(&call, prepared, page, classification.record_type, template.as_deref())
                }
            }
        };
        if let Some(retried) = retried {
            ctx.page.raw_ocr_ref = retried.recognition.raw_ref.clone();
            ctx.page.tokens_ref = Some(self.artifacts.put_json(ArtifactKind::Tokens, &retried.page)?);
            ctx.recognition = Some(retried.recognition);
            ctx.tokens = Some(retried.page);
        }
        checkpoint()?;

        // Step 6: Score, apply known corrections, validate
        {
            let _stage = stage("score");
            let low_quality = prepared.low_quality;
            for candidate in candidates.iter_mut() {
                self.scorer.score(candidate, low_quality);
                let applied = self.memory.apply_known(&ctx.tenant_id, candidate)?;
                ctx.applied_corrections.extend(applied);
                self.scorer.validate(candidate);
            }
            if !ctx.applied_corrections.is_empty() {
                debug!(count = ctx.applied_corrections.len(), "Applied known corrections");
            }
            ctx.page.candidates_ref = Some(self.artifacts.put_json(ArtifactKind::Candidates, &candidates)?);
        }

        let count = candidates.len();
        ctx.classification = Some(classification);
        ctx.strategy = Some(strategy);
        ctx.candidates = candidates;
        Ok(PageOutcome::Extracted { candidates: count })
    }

    /// Maps ledger rows and, when the table structure looks broken,
    /// recognizes an altered image once more and keeps the better rows.
    fn extract_columns(
        &self,
        call: &CallContext<'_>,
        prepared: &PreparedImage,
        page: &TokenizedPage,
        record_type: RecordType,
        template: Option<&LayoutTemplate>,
    ) -> (Vec<RecordCandidate>, Option<Retried>) {
        let mut rows = self.columns.map_columns(page, record_type, template);
        let assessment = structure::assess(page, &rows);
        let mut score = assessment.score;
        let mut retried = None;

        let retry = assessment
            .retry_strategy()
            .filter(|_| self.config.extraction.structure_retry && assessment.needs_retry());
        if let Some(strategy) = retry {
            match self.recognize_variant(strategy, prepared, call) {
                Ok(second) => {
                    let second_rows = self.columns.map_columns(&second.page, record_type, template);
                    let second_score = structure::assess(&second.page, &second_rows).score;
                    debug!(?strategy, before = score, after = second_score, "Retried table recognition");
                    if second_score > score {
                        rows = second_rows;
                        score = second_score;
                        retried = Some(second);
                    }
                }
                Err(e) => warn!(?strategy, error = %e, "Table recognition retry failed"),
            }
        }

        let final_page = retried.as_ref().map_or(page, |r| &r.page);
        for row in rows.iter_mut() {
            row.structure_score = Some(score);
            row.attach_sources(final_page);
        }
        (rows, retried)
    }

    fn recognize_variant(
        &self,
        strategy: RetryStrategy,
        prepared: &PreparedImage,
        call: &CallContext<'_>,
    ) -> Result<Retried, PageError> {
        let variant = strategy.variant(&prepared.png)?;
        let recognition = self.client.recognize(&variant.png, call)?;
        let restored = variant.restore(&recognition.result);
        let raw_ref = self.artifacts.put_json(ArtifactKind::RawOcr, &restored)?;
        let page = tokenizer::tokenize(&restored, &prepared.rule_lines);
        Ok(Retried {
            recognition: Recognition {
                result: Arc::new(restored),
                content_hash: recognition.content_hash,
                raw_ref: Some(raw_ref),
                cached: recognition.cached,
            },
            page,
        })
    }
}
