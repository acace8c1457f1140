//! Dataset file storage + HTTP fetch utilities for wikirel.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use wikirel_core::{
    is_index_column, parse_id, parse_label, Dataset, FeatureKind, FeatureTable, FetchedPage,
    ReliabilityRecord, TitleConvention, HAS_TEMPLATE_COLUMN, PAGE_ID_COLUMN, REVISION_ID_COLUMN,
};

pub const CRATE_NAME: &str = "wikirel-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed delimited file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed json file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} is missing required column `{column}`")]
    SchemaMismatch { path: PathBuf, column: String },
    #[error("{path} has unexpected column `{column}`")]
    UnexpectedColumn { path: PathBuf, column: String },
    #[error("{path} line {line}: invalid `{column}` value {value:?}")]
    InvalidValue {
        path: PathBuf,
        line: u64,
        column: String,
        value: String,
    },
    #[error("{path}: revision_id {revision_id} appears more than once")]
    DuplicateRevision { path: PathBuf, revision_id: u64 },
    #[error("dataset name `{name}` is derived from both {first} and {second}")]
    DuplicateDatasetName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Derive a dataset name from a file name: everything before the first `_` or `.`.
pub fn derive_dataset_name(file_name: &str) -> Option<String> {
    let name = file_name.split(['_', '.']).next().unwrap_or_default();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn delimiter_for(path: &Path) -> Option<u8> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "csv" => Some(b','),
        "tsv" => Some(b'\t'),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub delimiter: u8,
}

/// Explicit dataset name → file mapping for one directory.
#[derive(Debug, Clone, Default)]
pub struct DatasetCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl DatasetCatalog {
    /// Scan `dir` for `.csv`/`.tsv` files. Two files deriving the same name is an error.
    pub async fn scan(dir: &Path) -> Result<Self, StoreError> {
        let mut read_dir = fs::read_dir(dir).await.map_err(io_err(dir))?;
        let mut candidates = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(io_err(dir))? {
            let file_type = entry.file_type().await.map_err(io_err(&entry.path()))?;
            if file_type.is_file() {
                candidates.push(entry.path());
            }
        }
        candidates.sort();
        Self::from_paths(candidates)
    }

    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Result<Self, StoreError> {
        let mut entries: BTreeMap<String, CatalogEntry> = BTreeMap::new();
        for path in paths {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            let Some(delimiter) = delimiter_for(&path) else {
                debug!(path = %path.display(), "skipping non-delimited file");
                continue;
            };
            let Some(name) = derive_dataset_name(file_name) else {
                continue;
            };
            if let Some(existing) = entries.get(&name) {
                return Err(StoreError::DuplicateDatasetName {
                    name,
                    first: existing.path.clone(),
                    second: path,
                });
            }
            entries.insert(name, CatalogEntry { path, delimiter });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CatalogEntry)> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a temp file in the same directory and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<WrittenFile, StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        });
    }

    Ok(WrittenFile {
        path: path.to_path_buf(),
        byte_size: bytes.len(),
        sha256: sha256_hex(bytes),
    })
}

fn parse_dataset(name: &str, path: &Path, delimiter: u8, bytes: &[u8]) -> Result<Dataset, StoreError> {
    let csv_err = |source| StoreError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(bytes);
    let header: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(ToString::to_string)
        .collect();

    let column = |name: &str| -> Result<usize, StoreError> {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
    };
    let page_idx = column(PAGE_ID_COLUMN)?;
    let revision_idx = column(REVISION_ID_COLUMN)?;
    let label_idx = column(HAS_TEMPLATE_COLUMN)?;

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        let invalid = |column: &str, value: &str| StoreError::InvalidValue {
            path: path.to_path_buf(),
            line,
            column: column.to_string(),
            value: value.to_string(),
        };

        let raw_page = row.get(page_idx).unwrap_or_default();
        let raw_revision = row.get(revision_idx).unwrap_or_default();
        let raw_label = row.get(label_idx).unwrap_or_default();
        let page_id = parse_id(raw_page).ok_or_else(|| invalid(PAGE_ID_COLUMN, raw_page))?;
        let revision_id =
            parse_id(raw_revision).ok_or_else(|| invalid(REVISION_ID_COLUMN, raw_revision))?;
        let has_template =
            parse_label(raw_label).ok_or_else(|| invalid(HAS_TEMPLATE_COLUMN, raw_label))?;

        if !seen.insert(revision_id) {
            return Err(StoreError::DuplicateRevision {
                path: path.to_path_buf(),
                revision_id,
            });
        }
        records.push(ReliabilityRecord {
            page_id,
            revision_id,
            has_template,
            cells: row.iter().map(ToString::to_string).collect(),
        });
    }

    Ok(Dataset::new(name, header, records))
}

/// Serialize a dataset as CSV, leaving out positional index columns.
pub fn encode_dataset(dataset: &Dataset) -> Result<Vec<u8>, csv::Error> {
    let keep: Vec<usize> = dataset
        .header
        .iter()
        .enumerate()
        .filter(|(_, h)| !is_index_column(h))
        .map(|(i, _)| i)
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(keep.iter().map(|&i| dataset.header[i].as_str()))?;
    for record in &dataset.records {
        writer.write_record(
            keep.iter()
                .map(|&i| record.cells.get(i).map(String::as_str).unwrap_or_default()),
        )?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

/// Owns the on-disk representation of a directory of reliability datasets.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn catalog(&self) -> Result<DatasetCatalog, StoreError> {
        DatasetCatalog::scan(&self.root).await
    }

    /// Load and validate every dataset in the directory.
    pub async fn load(&self) -> Result<BTreeMap<String, Dataset>, StoreError> {
        let catalog = self.catalog().await?;
        let mut datasets = BTreeMap::new();
        for (name, entry) in catalog.iter() {
            let dataset = self.load_entry(name, entry).await?;
            info!(
                dataset = %name,
                rows = dataset.len(),
                path = %entry.path.display(),
                "loaded dataset"
            );
            datasets.insert(name.clone(), dataset);
        }
        Ok(datasets)
    }

    pub async fn load_entry(&self, name: &str, entry: &CatalogEntry) -> Result<Dataset, StoreError> {
        let bytes = fs::read(&entry.path).await.map_err(io_err(&entry.path))?;
        parse_dataset(name, &entry.path, entry.delimiter, &bytes)
    }

    /// Write one `{name}.csv` per dataset.
    pub async fn save<'a>(
        &self,
        datasets: impl IntoIterator<Item = &'a Dataset>,
    ) -> Result<Vec<WrittenFile>, StoreError> {
        let mut written = Vec::new();
        for dataset in datasets {
            let path = self.root.join(format!("{}.csv", dataset.name));
            let bytes = encode_dataset(dataset).map_err(|source| StoreError::Csv {
                path: path.clone(),
                source,
            })?;
            let file = write_atomic(&path, &bytes).await?;
            info!(dataset = %dataset.name, rows = dataset.len(), path = %path.display(), "saved dataset");
            written.push(file);
        }
        Ok(written)
    }
}

/// Per-dataset JSON files of fetched pages.
#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn save(
        &self,
        pages: &BTreeMap<String, Vec<FetchedPage>>,
    ) -> Result<Vec<WrittenFile>, StoreError> {
        let mut written = Vec::new();
        for (name, dataset_pages) in pages {
            let path = self.root.join(format!("{name}.json"));
            let bytes = serde_json::to_vec(dataset_pages).map_err(|source| StoreError::Json {
                path: path.clone(),
                source,
            })?;
            written.push(write_atomic(&path, &bytes).await?);
        }
        Ok(written)
    }

    /// Delete `{name}.json`. Returns whether a file was there.
    pub async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.root.join(format!("{name}.json"));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub async fn load(&self) -> Result<BTreeMap<String, Vec<FetchedPage>>, StoreError> {
        let mut read_dir = fs::read_dir(&self.root).await.map_err(io_err(&self.root))?;
        let mut pages = BTreeMap::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(io_err(&self.root))? {
            let path = entry.path();
            let is_json = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("json"));
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_json || stem.starts_with('.') {
                continue;
            }
            let bytes = fs::read(&path).await.map_err(io_err(&path))?;
            let dataset_pages: Vec<FetchedPage> =
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
                    path: path.clone(),
                    source,
                })?;
            pages.insert(stem.to_string(), dataset_pages);
        }
        Ok(pages)
    }
}

/// Load an auxiliary feature table with exactly the key and value columns of `kind`.
///
/// Rows with an empty or non-finite value are skipped so a lookup never yields a null feature.
pub async fn load_feature_table(
    path: &Path,
    kind: FeatureKind,
    convention: TitleConvention,
) -> Result<FeatureTable, StoreError> {
    let bytes = fs::read(path).await.map_err(io_err(path))?;
    let delimiter = delimiter_for(path).unwrap_or(b',');
    let csv_err = |source| StoreError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(bytes.as_slice());
    let header: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(ToString::to_string)
        .collect();

    let key_column = kind.key_column();
    let value_column = kind.value_column();
    for column in &header {
        if column != key_column && column != value_column && !is_index_column(column) {
            return Err(StoreError::UnexpectedColumn {
                path: path.to_path_buf(),
                column: column.clone(),
            });
        }
    }
    let position = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
    };
    let key_idx = position(key_column)?;
    let value_idx = position(value_column)?;

    let mut raw = Vec::new();
    let mut skipped = 0usize;
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        let value_text = row.get(value_idx).unwrap_or_default().trim();
        if value_text.is_empty() {
            skipped += 1;
            continue;
        }
        let value: f64 = value_text.parse().map_err(|_| StoreError::InvalidValue {
            path: path.to_path_buf(),
            line: row.position().map(|p| p.line()).unwrap_or_default(),
            column: value_column.to_string(),
            value: value_text.to_string(),
        })?;
        if !value.is_finite() {
            skipped += 1;
            continue;
        }
        raw.push((row.get(key_idx).unwrap_or_default().to_string(), value));
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped feature rows without a usable value");
    }

    let table = FeatureTable::from_entries(kind, convention, raw);
    info!(path = %path.display(), rows = table.len(), ?kind, "loaded feature table");
    Ok(table)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 16,
        }
    }
}

/// Shared reqwest client with a cap on concurrent requests. Never retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else {
            Self::Request(err)
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }

    /// One GET with query parameters. Non-2xx statuses are errors.
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", url);
        self.send(url, query).instrument(span).await
    }

    async fn send(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(%status, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const WEASEL_CSV: &str = "\
,page_id,revision_id,has_template,article_quality_score,revision_text_bytes
0,10,100,1,Start,2048
1,11,101,0,B,4096
2,12,102,1.0,C,512
";

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn dataset_names_stop_at_first_delimiter() {
        assert_eq!(derive_dataset_name("weasel_2020.csv").as_deref(), Some("weasel"));
        assert_eq!(derive_dataset_name("peacock.csv").as_deref(), Some("peacock"));
        assert_eq!(derive_dataset_name("_x.csv"), None);
    }

    #[test]
    fn catalog_rejects_duplicate_derived_names() {
        let err = DatasetCatalog::from_paths(vec![
            PathBuf::from("data/weasel_a.csv"),
            PathBuf::from("data/weasel_b.csv"),
        ])
        .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDatasetName { ref name, .. } if name == "weasel"));
    }

    #[test]
    fn catalog_skips_hidden_and_unknown_files() {
        let catalog = DatasetCatalog::from_paths(vec![
            PathBuf::from("data/.weasel.csv"),
            PathBuf::from("data/notes.txt"),
            PathBuf::from("data/peacock.tsv"),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("peacock").map(|e| e.delimiter), Some(b'\t'));
    }

    #[tokio::test]
    async fn load_parses_required_columns_and_keeps_cells() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("weasel_dataset.csv"), WEASEL_CSV).unwrap();

        let datasets = DatasetStore::new(dir.path()).load().await.unwrap();
        let weasel = &datasets["weasel"];
        assert_eq!(weasel.len(), 3);
        assert_eq!(weasel.header[0], "");
        assert_eq!(weasel.records[1].revision_id, 101);
        assert!(!weasel.records[1].has_template);
        assert!(weasel.records[2].has_template);
        assert_eq!(weasel.records[0].cells[4], "Start");
    }

    #[tokio::test]
    async fn save_then_load_drops_only_the_index_column() {
        let src = tempdir().expect("tempdir");
        let out = tempdir().expect("tempdir");
        std::fs::write(src.path().join("weasel.csv"), WEASEL_CSV).unwrap();

        let loaded = DatasetStore::new(src.path()).load().await.unwrap();
        let written = DatasetStore::new(out.path()).save(loaded.values()).await.unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].path.ends_with("weasel.csv"));

        let reloaded = DatasetStore::new(out.path()).load().await.unwrap();
        let original = &loaded["weasel"];
        let again = &reloaded["weasel"];
        assert_eq!(again.len(), original.len());
        let expected: Vec<_> = original
            .header
            .iter()
            .filter(|h| !is_index_column(h))
            .cloned()
            .collect();
        assert_eq!(again.header, expected);
        assert_eq!(again.records[0].cells, vec!["10", "100", "1", "Start", "2048"]);
    }

    #[tokio::test]
    async fn missing_required_column_is_a_schema_mismatch() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("weasel.csv"), "page_id,has_template\n1,0\n").unwrap();
        let err = DatasetStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { ref column, .. } if column == "revision_id"));
    }

    #[tokio::test]
    async fn repeated_revision_is_rejected() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("weasel.csv"),
            "page_id,revision_id,has_template\n1,5,0\n2,5,1\n",
        )
        .unwrap();
        let err = DatasetStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRevision { revision_id: 5, .. }));
    }

    #[tokio::test]
    async fn invalid_label_reports_line_and_column() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("weasel.csv"),
            "page_id,revision_id,has_template\n1,5,maybe\n",
        )
        .unwrap();
        let err = DatasetStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidValue { ref column, line: 2, .. } if column == "has_template"
        ));
    }

    #[tokio::test]
    async fn pages_round_trip_by_file_stem() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());
        let mut pages = BTreeMap::new();
        pages.insert(
            "weasel".to_string(),
            vec![FetchedPage {
                page_id: 10,
                revision_id: 100,
                title: "Climate Change".into(),
                content: "climate change is".into(),
                has_template: true,
            }],
        );
        store.save(&pages).await.unwrap();
        assert_eq!(store.load().await.unwrap(), pages);
    }

    #[tokio::test]
    async fn removing_pages_drops_the_dataset_from_the_next_load() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());
        std::fs::write(dir.path().join("tiny.json"), "[]").unwrap();
        assert!(store.remove("tiny").await.unwrap());
        assert!(!store.remove("tiny").await.unwrap());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pages_written_with_numeric_labels_still_load() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("weasel.json"),
            r#"[{"page_id": 10, "revision_id": 100, "title": "A", "content": "a", "has_template": 1},
                {"page_id": 11, "revision_id": 101, "title": "B", "content": "b", "has_template": 0}]"#,
        )
        .unwrap();
        let pages = PageStore::new(dir.path()).load().await.unwrap();
        let labels: Vec<bool> = pages["weasel"].iter().map(|p| p.has_template).collect();
        assert_eq!(labels, vec![true, false]);
    }

    #[tokio::test]
    async fn feature_table_validates_columns_and_skips_blank_values() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wiki_tfidf_terms.csv");
        std::fs::write(&path, "token,idf\nclimate-change,4.2\nempty,\nclimate-change,1.0\n").unwrap();
        let table = load_feature_table(&path, FeatureKind::Idf, TitleConvention::HyphenJoined)
            .await
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("climate-change").map(|e| e.value), Some(4.2));
        assert!(table.lookup("empty").is_none());

        let err = load_feature_table(&path, FeatureKind::PageRank, TitleConvention::SpaceJoined)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedColumn { .. }));
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.csv");
        write_atomic(&path, b"first").await.unwrap();
        let second = write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(second.byte_size, 6);
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
