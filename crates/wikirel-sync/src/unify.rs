//! Title-keyed join of fetched pages against an auxiliary feature table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use wikirel_core::{Dataset, FeatureTable, FetchedPage, UnifiedDataset, UnifiedRecord};

#[derive(Debug, Error)]
pub enum UnifyError {
    #[error("dataset `{dataset}` already has a `{column}` column")]
    FeatureColumnCollision { dataset: String, column: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifyStats {
    pub pages: usize,
    pub matched: usize,
    pub join_miss: usize,
    pub missing_revision: usize,
}

/// Inner join: a page yields a row only when its normalized title is in `table`
/// and its revision is in `dataset`. Output follows `pages` order.
pub fn unify(
    dataset: &Dataset,
    pages: &[FetchedPage],
    table: &FeatureTable,
) -> Result<(UnifiedDataset, UnifyStats), UnifyError> {
    let column = table.kind().value_column();
    if dataset.column_index(column).is_some() {
        return Err(UnifyError::FeatureColumnCollision {
            dataset: dataset.name.clone(),
            column: column.to_string(),
        });
    }

    let revisions = dataset.revision_index();
    let mut stats = UnifyStats {
        pages: pages.len(),
        ..Default::default()
    };
    let mut records = Vec::new();
    for page in pages {
        let key = table.convention().normalize_title(&page.title);
        let Some(entry) = table.lookup(&key) else {
            debug!(dataset = %dataset.name, title = %page.title, %key, "no feature match");
            stats.join_miss += 1;
            continue;
        };
        let Some(record) = revisions.get(&page.revision_id) else {
            warn!(
                dataset = %dataset.name,
                revision_id = page.revision_id,
                "fetched page has no source row"
            );
            stats.missing_revision += 1;
            continue;
        };
        records.push(UnifiedRecord {
            record: (*record).clone(),
            feature: table.kind(),
            value: entry.value,
        });
        stats.matched += 1;
    }

    info!(
        dataset = %dataset.name,
        feature = column,
        matched = stats.matched,
        join_miss = stats.join_miss,
        "unified dataset"
    );
    Ok((
        UnifiedDataset {
            name: dataset.name.clone(),
            source_header: dataset.header.clone(),
            feature: table.kind(),
            records,
        },
        stats,
    ))
}

#[derive(Debug, Clone, Default)]
pub struct UnifyReport {
    pub datasets: BTreeMap<String, UnifiedDataset>,
    pub stats: BTreeMap<String, UnifyStats>,
    pub skipped: BTreeMap<String, String>,
}

/// Unify every crawled dataset that still has a source dataset.
pub fn unify_all(
    datasets: &BTreeMap<String, Dataset>,
    pages: &BTreeMap<String, Vec<FetchedPage>>,
    table: &FeatureTable,
) -> UnifyReport {
    let mut report = UnifyReport::default();
    for (name, dataset_pages) in pages {
        let Some(dataset) = datasets.get(name) else {
            warn!(dataset = %name, "pages have no matching reliability dataset");
            report
                .skipped
                .insert(name.clone(), "no reliability dataset with this name".to_string());
            continue;
        };
        match unify(dataset, dataset_pages, table) {
            Ok((unified, stats)) => {
                report.datasets.insert(name.clone(), unified);
                report.stats.insert(name.clone(), stats);
            }
            Err(err) => {
                warn!(dataset = %name, error = %err, "skipping dataset");
                report.skipped.insert(name.clone(), err.to_string());
            }
        }
    }
    report
}
