//! Pipeline orchestration: crawl, unify, and per-run reports.

pub mod crawl;
pub mod unify;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;
use wikirel_adapters::{ArticleSource, FixtureArticleSource, WikipediaApiSource, DEFAULT_API_URL};
use wikirel_core::{Dataset, FeatureKind, FetchedPage, TitleConvention};
use wikirel_storage::{
    load_feature_table, write_atomic, DatasetStore, HttpClientConfig, HttpFetcher, PageStore,
    WrittenFile,
};

pub use crawl::{
    derive_seed, sample_dataset, sample_rows, CrawlConfig, CrawlError, CrawlReport, CrawlStats,
    DatasetCrawl, DatasetSample, LabelClass, SamplingCrawler,
};
pub use unify::{unify, unify_all, UnifyError, UnifyReport, UnifyStats};

pub const CRATE_NAME: &str = "wikirel-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureRegistry {
    pub features: Vec<FeatureSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureSourceConfig {
    pub name: String,
    pub kind: FeatureKind,
    pub path: PathBuf,
    #[serde(default)]
    pub convention: Option<TitleConvention>,
    pub output_dir: PathBuf,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl FeatureSourceConfig {
    pub fn convention(&self) -> TitleConvention {
        self.convention
            .unwrap_or_else(|| TitleConvention::default_for(self.kind))
    }
}

impl FeatureRegistry {
    /// The term-weight and page-rank sources used when no registry file exists.
    pub fn builtin() -> Self {
        Self {
            features: vec![
                FeatureSourceConfig {
                    name: "tfidf".to_string(),
                    kind: FeatureKind::Idf,
                    path: PathBuf::from("tfidf/wiki_tfidf_terms.csv"),
                    convention: Some(TitleConvention::HyphenJoined),
                    output_dir: PathBuf::from("tfidf_unified"),
                    enabled: true,
                },
                FeatureSourceConfig {
                    name: "pagerank".to_string(),
                    kind: FeatureKind::PageRank,
                    path: PathBuf::from("pagerank/pageranks_sorted_without_id.csv"),
                    convention: Some(TitleConvention::SpaceJoined),
                    output_dir: PathBuf::from("pagerank_unified"),
                    enabled: true,
                },
            ],
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(raw).context("parsing feature registry")?;
        let mut seen = BTreeSet::new();
        for feature in &registry.features {
            if !seen.insert(feature.name.as_str()) {
                bail!("feature source `{}` is declared twice", feature.name);
            }
        }
        Ok(registry)
    }

    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(raw) => Self::from_yaml(&raw).with_context(|| format!("loading {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no feature registry file; using built-in sources");
                Ok(Self::builtin())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Enabled sources, or only `name` (enabled or not) when given.
    pub fn select(&self, name: Option<&str>) -> Result<Vec<&FeatureSourceConfig>> {
        match name {
            Some(name) => match self.features.iter().find(|f| f.name == name) {
                Some(feature) => Ok(vec![feature]),
                None => bail!("unknown feature source `{name}`"),
            },
            None => Ok(self.features.iter().filter(|f| f.enabled).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub pages_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub features_file: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
    pub sample_size: usize,
    pub sampling_seed: u64,
    pub shuffle_seed: u64,
    pub fetch_delay_ms: u64,
    pub fetch_timeout_secs: u64,
    pub max_in_flight: usize,
    pub api_url: String,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            data_dir: PathBuf::from("./data"),
            pages_dir: PathBuf::from("./pages"),
            reports_dir: PathBuf::from("./reports"),
            features_file: PathBuf::from("./features.yaml"),
            fixtures_dir: None,
            sample_size: 1,
            sampling_seed: 1,
            shuffle_seed: 42,
            fetch_delay_ms: 1000,
            fetch_timeout_secs: 30,
            max_in_flight: 16,
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: "wikirel-bot/0.1".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable value; using default");
            default
        }),
        Err(_) => default,
    }
}

/// Seeds fix the sample and its order, so a malformed one is an error rather than a silent default.
pub fn parse_seed(key: &str, raw: Option<&str>, default: u64) -> Result<u64> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be an unsigned integer, got {raw:?}")),
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let seed = |key: &str, default: u64| {
            parse_seed(key, std::env::var(key).ok().as_deref(), default)
        };
        Ok(Self {
            workspace_root: defaults.workspace_root,
            data_dir: env_path("WIKIREL_DATA_DIR", defaults.data_dir),
            pages_dir: env_path("WIKIREL_PAGES_DIR", defaults.pages_dir),
            reports_dir: env_path("WIKIREL_REPORTS_DIR", defaults.reports_dir),
            features_file: env_path("WIKIREL_FEATURES_FILE", defaults.features_file),
            fixtures_dir: std::env::var("WIKIREL_FIXTURES_DIR").ok().map(PathBuf::from),
            sample_size: env_parse("WIKIREL_SAMPLE_SIZE", defaults.sample_size),
            sampling_seed: seed("WIKIREL_SAMPLING_SEED", defaults.sampling_seed)?,
            shuffle_seed: seed("WIKIREL_SHUFFLE_SEED", defaults.shuffle_seed)?,
            fetch_delay_ms: env_parse("WIKIREL_FETCH_DELAY_MS", defaults.fetch_delay_ms),
            fetch_timeout_secs: env_parse("WIKIREL_FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
            max_in_flight: env_parse("WIKIREL_MAX_IN_FLIGHT", defaults.max_in_flight),
            api_url: std::env::var("WIKIREL_API_URL").unwrap_or(defaults.api_url),
            user_agent: std::env::var("WIKIREL_USER_AGENT").unwrap_or(defaults.user_agent),
        })
    }

    pub fn crawl_config(&self) -> CrawlConfig {
        CrawlConfig {
            sample_size: self.sample_size,
            sampling_seed: self.sampling_seed,
            shuffle_seed: self.shuffle_seed,
            fetch_delay: Duration::from_millis(self.fetch_delay_ms),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_in_flight: self.max_in_flight.max(1),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: self.max_in_flight.max(1),
        }
    }

    /// Relative registry paths are taken from the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDataset {
    pub stage: String,
    pub dataset: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl ManifestFile {
    fn from_written(file: &WrittenFile, root: &Path) -> Self {
        let path = file.path.strip_prefix(root).unwrap_or(&file.path);
        Self {
            path: path.display().to_string(),
            sha256: file.sha256.clone(),
            bytes: file.byte_size as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub sample_size: usize,
    pub sampling_seed: u64,
    pub shuffle_seed: u64,
    #[serde(default)]
    pub crawl: BTreeMap<String, CrawlStats>,
    /// Feature source name to per-dataset join stats.
    #[serde(default)]
    pub unify: BTreeMap<String, BTreeMap<String, UnifyStats>>,
    #[serde(default)]
    pub skipped: Vec<SkippedDataset>,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    pub reports_dir: String,
}

impl RunSummary {
    fn start(command: &str, config: &PipelineConfig, source_id: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            command: command.to_string(),
            started_at: now,
            finished_at: now,
            source_id: source_id.to_string(),
            sample_size: config.sample_size,
            sampling_seed: config.sampling_seed,
            shuffle_seed: config.shuffle_seed,
            crawl: BTreeMap::new(),
            unify: BTreeMap::new(),
            skipped: Vec::new(),
            files: Vec::new(),
            reports_dir: String::new(),
        }
    }

    fn skip_all(&mut self, stage: &str, skipped: BTreeMap<String, String>) {
        self.skipped
            .extend(skipped.into_iter().map(|(dataset, reason)| SkippedDataset {
                stage: stage.to_string(),
                dataset,
                reason,
            }));
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn ArticleSource>,
}

impl Pipeline {
    /// Replays fixtures when `fixtures_dir` is set, otherwise talks to the live API.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let source: Arc<dyn ArticleSource> = match &config.fixtures_dir {
            Some(dir) => Arc::new(FixtureArticleSource::new(config.resolve(dir))),
            None => {
                let http = HttpFetcher::new(config.http_config())?;
                Arc::new(WikipediaApiSource::new(Arc::new(http), config.api_url.clone()))
            }
        };
        Ok(Self { config, source })
    }

    pub fn with_source(config: PipelineConfig, source: Arc<dyn ArticleSource>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_crawl(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::start("crawl", &self.config, self.source.source_id());
        self.crawl_stage(&mut summary).await?;
        self.finish(summary).await
    }

    pub async fn run_unify(&self, feature: Option<&str>) -> Result<RunSummary> {
        let mut summary = RunSummary::start("unify", &self.config, self.source.source_id());
        self.unify_stage(&mut summary, feature, None).await?;
        self.finish(summary).await
    }

    /// Crawl then unify every enabled feature source, under one run id.
    /// Unify sees only the pages crawled in this run.
    pub async fn run_all(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::start("run", &self.config, self.source.source_id());
        let pages = self.crawl_stage(&mut summary).await?;
        self.unify_stage(&mut summary, None, Some(pages)).await?;
        self.finish(summary).await
    }

    async fn load_datasets(&self) -> Result<BTreeMap<String, Dataset>> {
        let data_dir = self.config.resolve(&self.config.data_dir);
        DatasetStore::new(&data_dir)
            .load()
            .await
            .with_context(|| format!("loading reliability datasets from {}", data_dir.display()))
    }

    async fn crawl_stage(
        &self,
        summary: &mut RunSummary,
    ) -> Result<BTreeMap<String, Vec<FetchedPage>>> {
        // A malformed input directory fails the run before any request goes out.
        let datasets = self.load_datasets().await?;
        info!(datasets = datasets.len(), source = self.source.source_id(), "starting crawl");

        let crawler = SamplingCrawler::new(Arc::clone(&self.source), self.config.crawl_config());
        let report = crawler.crawl(&datasets).await;

        let pages_dir = self.config.resolve(&self.config.pages_dir);
        let store = PageStore::new(&pages_dir);
        let written = store
            .save(&report.pages)
            .await
            .with_context(|| format!("saving pages to {}", pages_dir.display()))?;
        // Pages left over from an earlier run must not outlive a dataset skipped in this one.
        for name in report.skipped.keys() {
            if store.remove(name).await? {
                info!(dataset = %name, "removed stale pages for skipped dataset");
            }
        }

        summary.crawl = report.stats;
        summary.skip_all("crawl", report.skipped);
        summary.files.extend(
            written
                .iter()
                .map(|f| ManifestFile::from_written(f, &self.config.workspace_root)),
        );
        Ok(report.pages)
    }

    /// Unify `crawled` when given, otherwise whatever the pages directory holds.
    async fn unify_stage(
        &self,
        summary: &mut RunSummary,
        feature: Option<&str>,
        crawled: Option<BTreeMap<String, Vec<FetchedPage>>>,
    ) -> Result<()> {
        let features_file = self.config.resolve(&self.config.features_file);
        let registry = FeatureRegistry::load_or_builtin(&features_file).await?;
        let selected = registry.select(feature)?;
        if selected.is_empty() {
            warn!("no enabled feature sources");
            return Ok(());
        }

        let datasets = self.load_datasets().await?;
        let pages = match crawled {
            Some(pages) => pages,
            None => {
                let pages_dir = self.config.resolve(&self.config.pages_dir);
                PageStore::new(&pages_dir)
                    .load()
                    .await
                    .with_context(|| format!("loading pages from {}", pages_dir.display()))?
            }
        };

        for source in selected {
            let table_path = self.config.resolve(&source.path);
            let table = load_feature_table(&table_path, source.kind, source.convention())
                .await
                .with_context(|| format!("loading feature source `{}`", source.name))?;
            let report = unify_all(&datasets, &pages, &table);

            let flat: Vec<Dataset> = report.datasets.values().map(|u| u.to_dataset()).collect();
            let output_dir = self.config.resolve(&source.output_dir);
            let written = DatasetStore::new(&output_dir)
                .save(flat.iter())
                .await
                .with_context(|| format!("saving unified datasets to {}", output_dir.display()))?;
            info!(
                feature = %source.name,
                datasets = flat.len(),
                output_dir = %output_dir.display(),
                "wrote unified datasets"
            );

            summary.unify.insert(source.name.clone(), report.stats);
            summary.skip_all(&format!("unify:{}", source.name), report.skipped);
            summary.files.extend(
                written
                    .iter()
                    .map(|f| ManifestFile::from_written(f, &self.config.workspace_root)),
            );
        }
        Ok(())
    }

    async fn finish(&self, mut summary: RunSummary) -> Result<RunSummary> {
        summary.finished_at = Utc::now();
        let reports_root = self.config.resolve(&self.config.reports_dir);
        let dir = write_run_report(&reports_root, &mut summary).await?;
        info!(run_id = %summary.run_id, reports_dir = %dir.display(), "run complete");
        Ok(summary)
    }
}

/// Write `summary.json`, `brief.md` and `manifest.json` under `{reports_root}/{run_id}`.
pub async fn write_run_report(reports_root: &Path, summary: &mut RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    summary.reports_dir = dir.display().to_string();

    let summary_json = serde_json::to_vec_pretty(&*summary).context("serializing run summary")?;
    let summary_file = write_atomic(&dir.join("summary.json"), &summary_json).await?;
    let brief_file = write_atomic(&dir.join("brief.md"), render_brief(summary).as_bytes()).await?;

    let mut files = summary.files.clone();
    files.push(ManifestFile::from_written(&summary_file, reports_root));
    files.push(ManifestFile::from_written(&brief_file, reports_root));
    let manifest = RunManifest {
        schema_version: 1,
        run_id: summary.run_id,
        files,
    };
    let manifest_json = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
    write_atomic(&dir.join("manifest.json"), &manifest_json).await?;
    Ok(dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("# wikirel {} run", summary.command),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Article source: {}", summary.source_id),
        format!(
            "- Sample size: {} per class (sampling seed {}, shuffle seed {})",
            summary.sample_size, summary.sampling_seed, summary.shuffle_seed
        ),
    ];

    if !summary.crawl.is_empty() {
        lines.push(String::new());
        lines.push("## Crawl".to_string());
        lines.push("| dataset | sampled | fetched | not found | failed | timed out |".to_string());
        lines.push("|---|---|---|---|---|---|".to_string());
        for (name, s) in &summary.crawl {
            lines.push(format!(
                "| {name} | {} | {} | {} | {} | {} |",
                s.sampled, s.fetched, s.not_found, s.failed, s.timed_out
            ));
        }
    }

    for (feature, stats) in &summary.unify {
        lines.push(String::new());
        lines.push(format!("## Unify: {feature}"));
        lines.push("| dataset | pages | matched | join miss | missing revision |".to_string());
        lines.push("|---|---|---|---|---|".to_string());
        for (name, s) in stats {
            lines.push(format!(
                "| {name} | {} | {} | {} | {} |",
                s.pages, s.matched, s.join_miss, s.missing_revision
            ));
        }
    }

    if !summary.skipped.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped".to_string());
        for skip in &summary.skipped {
            lines.push(format!("- {} `{}`: {}", skip.stage, skip.dataset, skip.reason));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the `runs` most recent reports under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();

    let mut summaries = Vec::new();
    for dir in dirs {
        let path = dir.path().join("summary.json");
        if !path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# wikirel runs".to_string(), String::new()];
    for summary in summaries.iter().take(runs.max(1)) {
        let fetched: usize = summary.crawl.values().map(|s| s.fetched).sum();
        let sampled: usize = summary.crawl.values().map(|s| s.sampled).sum();
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.command));
        lines.push(format!("- started: {}", summary.started_at));
        if !summary.crawl.is_empty() {
            lines.push(format!(
                "- crawl: {fetched}/{sampled} pages across {} datasets",
                summary.crawl.len()
            ));
        }
        for (feature, stats) in &summary.unify {
            let matched: usize = stats.values().map(|s| s.matched).sum();
            lines.push(format!("- unify {feature}: {matched} rows"));
        }
        if !summary.skipped.is_empty() {
            lines.push(format!("- skipped: {}", summary.skipped.len()));
        }
        lines.push(format!("- files: {}", summary.files.len()));
        lines.push(format!("- report: `{}`", summary.reports_dir));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
