use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};
use crossbeam_channel::RecvTimeoutError;
use moka::sync::Cache;

use super::{OcrEngine, RateLimiter, RawOcrResult};
use crate::db::{self, usage_repo, Database};
use crate::error::{EngineError, TransientKind};
use crate::sanitize::short_hash;
use crate::storage::{content_hash, ArtifactKind, ArtifactStore};

/// Bounded exponential backoff with a hard per-call timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Doubling delays from `base_delay` up to `max_delay`, one per retry
    /// after the first attempt. Jitter is added by the caller.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.max(1) as usize - 1)
    }
}

/// Who a recognition call is billed to.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub tenant_id: &'a str,
    pub job_id: Option<&'a str>,
    pub page_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Recognition {
    pub result: Arc<RawOcrResult>,
    pub content_hash: String,
    /// Artifact holding the raw engine output, when it could be stored.
    pub raw_ref: Option<String>,
    pub cached: bool,
}

#[derive(Clone)]
struct CachedResult {
    result: Arc<RawOcrResult>,
    raw_ref: Option<String>,
}

/// Rate-limited, retried and cached access to one recognition engine.
///
/// Clones share the engine, limiter and in-process cache.
#[derive(Clone)]
pub struct OcrClient {
    engine: Arc<dyn OcrEngine>,
    limiter: Arc<RateLimiter>,
    cache: Cache<String, CachedResult>,
    db: Database,
    artifacts: ArtifactStore,
    policy: RetryPolicy,
    cost_per_page_micros: u64,
}

impl OcrClient {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        limiter: Arc<RateLimiter>,
        db: Database,
        artifacts: ArtifactStore,
        policy: RetryPolicy,
        cache_capacity: u64,
        cost_per_page_micros: u64,
    ) -> Self {
        Self {
            engine,
            limiter,
            cache: Cache::builder().max_capacity(cache_capacity).build(),
            db,
            artifacts,
            policy,
            cost_per_page_micros,
        }
    }

    pub fn recognize(&self, image: &[u8], ctx: &CallContext<'_>) -> Result<Recognition, EngineError> {
        let hash = content_hash(image);
        let _span = tracing::info_span!(
            "recognize",
            engine = self.engine.name(),
            image = %short_hash(&hash)
        )
        .entered();

        if let Some(hit) = self.lookup(&hash) {
            tracing::debug!("Recognition cache hit");
            self.log_usage(ctx, &hash, true, 0);
            return Ok(Recognition {
                result: hit.result,
                content_hash: hash,
                raw_ref: hit.raw_ref,
                cached: true,
            });
        }

        let result = Arc::new(self.call_with_retries(image)?);

        let raw_ref = match self.artifacts.put_json(ArtifactKind::RawOcr, result.as_ref()) {
            Ok(reference) => {
                if let Err(e) =
                    usage_repo::cache_store(&self.db, &hash, self.engine.name(), &reference, &db::now())
                {
                    tracing::warn!("Failed to index recognition result: {}", e);
                }
                Some(reference)
            }
            Err(e) => {
                tracing::warn!("Failed to store raw recognition result: {}", e);
                None
            }
        };
        self.cache.insert(
            self.cache_key(&hash),
            CachedResult {
                result: Arc::clone(&result),
                raw_ref: raw_ref.clone(),
            },
        );
        self.log_usage(ctx, &hash, false, self.cost_per_page_micros);

        Ok(Recognition {
            result,
            content_hash: hash,
            raw_ref,
            cached: false,
        })
    }

    fn cache_key(&self, hash: &str) -> String {
        format!("{}:{}", self.engine.name(), hash)
    }

    /// In-process cache first, then the persistent index.
    fn lookup(&self, hash: &str) -> Option<CachedResult> {
        let key = self.cache_key(hash);
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit);
        }

        let reference = match usage_repo::cache_lookup(&self.db, hash, self.engine.name()) {
            Ok(Some(reference)) => reference,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Recognition cache lookup failed: {}", e);
                return None;
            }
        };
        match self.artifacts.get_json::<RawOcrResult>(&reference) {
            Ok(result) => {
                let hit = CachedResult {
                    result: Arc::new(result),
                    raw_ref: Some(reference),
                };
                self.cache.insert(key, hit.clone());
                Some(hit)
            }
            Err(e) => {
                // Artifact removed by retention; drop the stale index row.
                tracing::debug!("Cached recognition artifact unavailable: {}", e);
                if let Err(e) = usage_repo::cache_forget(&self.db, &reference) {
                    tracing::warn!("Failed to drop stale cache entry: {}", e);
                }
                None
            }
        }
    }

    fn call_with_retries(&self, image: &[u8]) -> Result<RawOcrResult, EngineError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let attempt = Cell::new(1_u32);

        let result = (|| {
            let waited = self.limiter.acquire();
            if waited > Duration::from_millis(50) {
                tracing::debug!("Rate limiter delayed call by {:?}", waited);
            }
            self.call_with_timeout(image)
        })
        .retry(self.policy.backoff().with_jitter())
        .sleep(thread::sleep)
        .when(EngineError::is_transient)
        .notify(|e: &EngineError, delay: Duration| {
            tracing::warn!(
                attempt = attempt.get(),
                max_attempts,
                "Transient recognition failure, retrying in {:?}: {}",
                delay,
                e
            );
            attempt.set(attempt.get() + 1);
        })
        .call();

        if let Err(e) = &result {
            tracing::warn!(attempt = attempt.get(), "Recognition failed: {}", e);
        }
        result
    }

    /// Runs the engine on a helper thread so a hung call cannot hold the
    /// worker past the timeout. The helper is left to finish on its own.
    fn call_with_timeout(&self, image: &[u8]) -> Result<RawOcrResult, EngineError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let engine = Arc::clone(&self.engine);
        let image = image.to_vec();
        thread::Builder::new()
            .name("ocr-call".to_string())
            .spawn(move || {
                let _ = tx.send(engine.recognize(&image));
            })
            .map_err(|e| {
                EngineError::transient(
                    TransientKind::Network,
                    format!("failed to spawn recognition thread: {}", e),
                )
            })?;

        match rx.recv_timeout(self.policy.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::transient(
                TransientKind::Timeout,
                format!("recognition exceeded {:?}", self.policy.timeout),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::transient(
                TransientKind::Network,
                "recognition thread terminated unexpectedly",
            )),
        }
    }

    fn log_usage(&self, ctx: &CallContext<'_>, hash: &str, cached: bool, cost_micros: u64) {
        let entry = usage_repo::UsageEntry {
            tenant_id: ctx.tenant_id.to_string(),
            job_id: ctx.job_id.map(str::to_string),
            page_id: ctx.page_id.map(str::to_string),
            engine: self.engine.name().to_string(),
            content_hash: hash.to_string(),
            cached,
            pages: 1,
            cost_micros,
            created_at: db::now(),
        };
        if let Err(e) = usage_repo::record_usage(&self.db, &entry) {
            tracing::warn!("Failed to record recognition usage: {}", e);
        }
    }
}
