//! Seeded class-balanced sampling + concurrent article fetches.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use wikirel_adapters::{ArticleError, ArticleSource, FetchOutcome};
use wikirel_core::{Dataset, FetchedPage, ReliabilityRecord};
use wikirel_storage::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelClass {
    Negative,
    Positive,
}

impl fmt::Display for LabelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negative => f.write_str("negative"),
            Self::Positive => f.write_str("positive"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("dataset `{dataset}`: requested {requested} {class} rows but only {available} exist")]
    SampleSizeExceeded {
        dataset: String,
        class: LabelClass,
        requested: usize,
        available: usize,
    },
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Rows drawn per class per dataset.
    pub sample_size: usize,
    /// Seeds each class draw.
    pub sampling_seed: u64,
    /// Seeds the post-merge shuffle, mixed with the dataset name.
    pub shuffle_seed: u64,
    /// Sleep before every request.
    pub fetch_delay: Duration,
    /// Bounds one request once it holds an in-flight slot; queueing is not counted.
    pub fetch_timeout: Duration,
    /// Requests allowed in flight at once. Keep at or below the source's own limit.
    pub max_in_flight: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            sample_size: 1,
            sampling_seed: 1,
            shuffle_seed: 42,
            fetch_delay: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(30),
            max_in_flight: 16,
        }
    }
}

/// Stable 64-bit seed for `label` under `base`.
pub fn derive_seed(base: u64, label: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(base.to_le_bytes());
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Draw exactly `n` rows without replacement. Fails instead of clamping.
pub fn sample_rows<'a>(
    rows: &[&'a ReliabilityRecord],
    n: usize,
    seed: u64,
    dataset: &str,
    class: LabelClass,
) -> Result<Vec<&'a ReliabilityRecord>, CrawlError> {
    if n > rows.len() {
        return Err(CrawlError::SampleSizeExceeded {
            dataset: dataset.to_string(),
            class,
            requested: n,
            available: rows.len(),
        });
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Ok(index::sample(&mut rng, rows.len(), n)
        .into_iter()
        .map(|i| rows[i])
        .collect())
}

#[derive(Debug, Clone)]
pub struct DatasetSample<'a> {
    pub negative: Vec<&'a ReliabilityRecord>,
    pub positive: Vec<&'a ReliabilityRecord>,
}

/// Both class draws for one dataset; each uses a fresh RNG seeded with `seed`.
pub fn sample_dataset(
    dataset: &Dataset,
    sample_size: usize,
    seed: u64,
) -> Result<DatasetSample<'_>, CrawlError> {
    let (negative, positive) = dataset.partition_by_label();
    Ok(DatasetSample {
        negative: sample_rows(&negative, sample_size, seed, &dataset.name, LabelClass::Negative)?,
        positive: sample_rows(&positive, sample_size, seed, &dataset.name, LabelClass::Positive)?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlStats {
    pub sampled: usize,
    pub fetched: usize,
    pub not_found: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl CrawlStats {
    pub fn dropped(&self) -> usize {
        self.not_found + self.failed + self.timed_out
    }
}

#[derive(Debug, Clone)]
pub struct DatasetCrawl {
    pub pages: Vec<FetchedPage>,
    pub stats: CrawlStats,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub pages: BTreeMap<String, Vec<FetchedPage>>,
    pub stats: BTreeMap<String, CrawlStats>,
    /// Datasets abandoned before any fetch, with the reason.
    pub skipped: BTreeMap<String, String>,
}

enum Attempt {
    Page(FetchedPage),
    NotFound,
    Failed(ArticleError),
    TimedOut,
}

pub struct SamplingCrawler {
    source: Arc<dyn ArticleSource>,
    config: CrawlConfig,
    in_flight: Arc<Semaphore>,
}

impl SamplingCrawler {
    pub fn new(source: Arc<dyn ArticleSource>, config: CrawlConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            source,
            config,
            in_flight,
        }
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Crawl every dataset. A dataset whose sample cannot be drawn is skipped, not fatal.
    pub async fn crawl(&self, datasets: &BTreeMap<String, Dataset>) -> CrawlReport {
        let mut report = CrawlReport::default();
        for (name, dataset) in datasets {
            match self.crawl_dataset(dataset).await {
                Ok(crawl) => {
                    report.pages.insert(name.clone(), crawl.pages);
                    report.stats.insert(name.clone(), crawl.stats);
                }
                Err(err) => {
                    warn!(dataset = %name, error = %err, "skipping dataset");
                    report.skipped.insert(name.clone(), err.to_string());
                }
            }
        }
        report
    }

    pub async fn crawl_dataset(&self, dataset: &Dataset) -> Result<DatasetCrawl, CrawlError> {
        let sample = sample_dataset(dataset, self.config.sample_size, self.config.sampling_seed)?;
        info!(
            dataset = %dataset.name,
            negative = sample.negative.len(),
            positive = sample.positive.len(),
            source = self.source.source_id(),
            "sampled dataset"
        );

        let mut stats = CrawlStats {
            sampled: sample.negative.len() + sample.positive.len(),
            ..Default::default()
        };
        let mut pages = self.fetch_batch(&dataset.name, &sample.negative, &mut stats).await;
        pages.extend(self.fetch_batch(&dataset.name, &sample.positive, &mut stats).await);

        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(self.config.shuffle_seed, &dataset.name));
        pages.shuffle(&mut rng);

        info!(
            dataset = %dataset.name,
            fetched = stats.fetched,
            dropped = stats.dropped(),
            "crawled dataset"
        );
        Ok(DatasetCrawl { pages, stats })
    }

    /// Fetch every row concurrently, at most `max_in_flight` at once, and wait for all of them.
    /// Successes come back in row order.
    async fn fetch_batch(
        &self,
        dataset: &str,
        rows: &[&ReliabilityRecord],
        stats: &mut CrawlStats,
    ) -> Vec<FetchedPage> {
        let mut set = JoinSet::new();
        for (position, row) in rows.iter().enumerate() {
            let source = Arc::clone(&self.source);
            let in_flight = Arc::clone(&self.in_flight);
            let delay = self.config.fetch_delay;
            let timeout = self.config.fetch_timeout;
            let (page_id, revision_id, has_template) = (row.page_id, row.revision_id, row.has_template);
            set.spawn(async move {
                tokio::time::sleep(delay).await;
                let Ok(_permit) = in_flight.acquire_owned().await else {
                    let closed = ArticleError::Fetch(FetchError::LimiterClosed);
                    return (position, page_id, revision_id, Attempt::Failed(closed));
                };
                let attempt =
                    match tokio::time::timeout(timeout, source.fetch_revision(page_id, revision_id)).await {
                        Ok(Ok(FetchOutcome::Found(article))) => Attempt::Page(FetchedPage {
                            page_id,
                            revision_id,
                            title: article.title,
                            content: article.content,
                            has_template,
                        }),
                        Ok(Ok(FetchOutcome::NotFound)) => Attempt::NotFound,
                        Ok(Err(err)) => Attempt::Failed(err),
                        Err(_) => Attempt::TimedOut,
                    };
                (position, page_id, revision_id, attempt)
            });
        }

        let mut found = Vec::with_capacity(rows.len());
        while let Some(joined) = set.join_next().await {
            let (position, page_id, revision_id, attempt) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(dataset, error = %err, "fetch task aborted");
                    stats.failed += 1;
                    continue;
                }
            };
            match attempt {
                Attempt::Page(page) => {
                    stats.fetched += 1;
                    found.push((position, page));
                }
                Attempt::NotFound => {
                    warn!(dataset, page_id, revision_id, "page or revision not found; dropping row");
                    stats.not_found += 1;
                }
                Attempt::Failed(err) => {
                    warn!(dataset, page_id, revision_id, error = %err, "fetch failed; dropping row");
                    stats.failed += 1;
                }
                Attempt::TimedOut => {
                    warn!(dataset, page_id, revision_id, "fetch timed out; dropping row");
                    stats.timed_out += 1;
                }
            }
        }

        found.sort_by_key(|(position, _)| *position);
        found.into_iter().map(|(_, page)| page).collect()
    }
}
