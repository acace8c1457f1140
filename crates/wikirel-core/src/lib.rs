//! Core domain model for the reliability dataset builder.

use std::collections::HashMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "wikirel-core";

pub const PAGE_ID_COLUMN: &str = "page_id";
pub const REVISION_ID_COLUMN: &str = "revision_id";
pub const HAS_TEMPLATE_COLUMN: &str = "has_template";

/// Columns every reliability dataset must carry.
pub const REQUIRED_COLUMNS: [&str; 3] = [PAGE_ID_COLUMN, REVISION_ID_COLUMN, HAS_TEMPLATE_COLUMN];

/// One article revision from a reliability dataset.
///
/// `cells` holds every value of the source row verbatim, aligned with the owning
/// [`Dataset::header`]; the typed fields are parsed copies of the required columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityRecord {
    pub page_id: u64,
    pub revision_id: u64,
    pub has_template: bool,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub header: Vec<String>,
    pub records: Vec<ReliabilityRecord>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, header: Vec<String>, records: Vec<ReliabilityRecord>) -> Self {
        Self {
            name: name.into(),
            header,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.header.iter().position(|h| h == column)
    }

    /// Split rows into `(negative, positive)` by `has_template`, preserving file order.
    pub fn partition_by_label(&self) -> (Vec<&ReliabilityRecord>, Vec<&ReliabilityRecord>) {
        self.records.iter().partition(|r| !r.has_template)
    }

    pub fn revision_index(&self) -> HashMap<u64, &ReliabilityRecord> {
        self.records.iter().map(|r| (r.revision_id, r)).collect()
    }
}

/// Positional index columns written by dataframe tools (`""` or `Unnamed: 0`).
pub fn is_index_column(column: &str) -> bool {
    let trimmed = column.trim();
    trimmed.is_empty()
        || trimmed
            .strip_prefix("Unnamed: ")
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Parse a 0/1 label as it appears in reliability files (`1`, `1.0`, `true`).
pub fn parse_label(raw: &str) -> Option<bool> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Some(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Some(false);
    }
    match trimmed.parse::<f64>().ok()? {
        v if v == 1.0 => Some(true),
        v if v == 0.0 => Some(false),
        _ => None,
    }
}

/// Parse an identifier column; integral floats such as `123.0` are accepted.
pub fn parse_id(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Ok(v) = trimmed.parse::<u64>() {
        return Some(v);
    }
    let v = trimmed.parse::<f64>().ok()?;
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
        Some(v as u64)
    } else {
        None
    }
}

/// Result of one successful article fetch, persisted per dataset as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub page_id: u64,
    pub revision_id: u64,
    pub title: String,
    pub content: String,
    /// Written as a bool; `0`/`1` and their float or string forms are read too.
    #[serde(deserialize_with = "deserialize_label")]
    pub has_template: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelRepr {
    Flag(bool),
    Number(f64),
    Text(String),
}

fn deserialize_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let parsed = match LabelRepr::deserialize(deserializer)? {
        LabelRepr::Flag(flag) => Some(flag),
        LabelRepr::Number(n) => parse_label(&n.to_string()),
        LabelRepr::Text(text) => parse_label(&text),
    };
    parsed.ok_or_else(|| D::Error::custom("has_template must be 0, 1 or a boolean"))
}

/// The auxiliary numeric feature a unification run injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Term-weight table: `token` → `idf`.
    Idf,
    /// Page-rank table: `title` → `rank`.
    PageRank,
}

impl FeatureKind {
    pub fn key_column(self) -> &'static str {
        match self {
            Self::Idf => "token",
            Self::PageRank => "title",
        }
    }

    pub fn value_column(self) -> &'static str {
        match self {
            Self::Idf => "idf",
            Self::PageRank => "rank",
        }
    }
}

/// How a feature source encodes article titles in its key column.
///
/// The two upstream sources disagree: term-weight tokens join words with `-`,
/// page-rank titles use spaces (stored with `_` on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleConvention {
    HyphenJoined,
    SpaceJoined,
}

impl TitleConvention {
    pub fn default_for(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Idf => Self::HyphenJoined,
            FeatureKind::PageRank => Self::SpaceJoined,
        }
    }

    /// Turn a fetched page title into a feature-table lookup key.
    pub fn normalize_title(self, title: &str) -> String {
        match self {
            Self::HyphenJoined => title.to_lowercase().replace(' ', "-"),
            Self::SpaceJoined => title.to_lowercase(),
        }
    }

    /// Clean a key read from the feature table itself.
    pub fn normalize_key(self, key: &str) -> String {
        match self {
            Self::HyphenJoined => key.to_string(),
            Self::SpaceJoined => key.trim().to_lowercase().replace('_', " "),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureEntry {
    pub key: String,
    pub value: f64,
}

/// Immutable key → value table. When a key occurs more than once the first
/// occurrence in file order wins; later duplicates are kept in `entries` but never
/// returned by [`FeatureTable::lookup`].
#[derive(Debug, Clone)]
pub struct FeatureTable {
    kind: FeatureKind,
    convention: TitleConvention,
    entries: Vec<FeatureEntry>,
    index: HashMap<String, usize>,
}

impl FeatureTable {
    pub fn from_entries(
        kind: FeatureKind,
        convention: TitleConvention,
        raw: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for (key, value) in raw {
            let key = convention.normalize_key(&key);
            index.entry(key.clone()).or_insert(entries.len());
            entries.push(FeatureEntry { key, value });
        }
        Self {
            kind,
            convention,
            entries,
            index,
        }
    }

    pub fn kind(&self) -> FeatureKind {
        self.kind
    }

    pub fn convention(&self) -> TitleConvention {
        self.convention
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FeatureEntry] {
        &self.entries
    }

    /// Look up an already-normalized key.
    pub fn lookup(&self, key: &str) -> Option<&FeatureEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    /// Normalize `title` with this table's convention and look it up.
    pub fn lookup_title(&self, title: &str) -> Option<&FeatureEntry> {
        self.lookup(&self.convention.normalize_title(title))
    }
}

/// A reliability row joined to exactly one auxiliary feature value.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedRecord {
    pub record: ReliabilityRecord,
    pub feature: FeatureKind,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDataset {
    pub name: String,
    pub source_header: Vec<String>,
    pub feature: FeatureKind,
    pub records: Vec<UnifiedRecord>,
}

impl UnifiedDataset {
    /// Flatten into a plain dataset with the feature appended as the last column.
    pub fn to_dataset(&self) -> Dataset {
        let mut header = self.source_header.clone();
        header.push(self.feature.value_column().to_string());
        let records = self
            .records
            .iter()
            .map(|u| {
                let mut record = u.record.clone();
                record.cells.push(u.value.to_string());
                record
            })
            .collect();
        Dataset::new(self.name.clone(), header, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(revision_id: u64, has_template: bool) -> ReliabilityRecord {
        ReliabilityRecord {
            page_id: revision_id * 10,
            revision_id,
            has_template,
            cells: vec![
                (revision_id * 10).to_string(),
                revision_id.to_string(),
                u8::from(has_template).to_string(),
            ],
        }
    }

    #[test]
    fn title_conventions_match_their_sources() {
        assert_eq!(
            TitleConvention::HyphenJoined.normalize_title("Climate Change"),
            "climate-change"
        );
        assert_eq!(
            TitleConvention::SpaceJoined.normalize_title("Climate Change"),
            "climate change"
        );
        assert_eq!(
            TitleConvention::SpaceJoined.normalize_key("  Climate_Change "),
            "climate change"
        );
        assert_eq!(
            TitleConvention::HyphenJoined.normalize_key("climate_change"),
            "climate_change"
        );
    }

    #[test]
    fn feature_table_first_match_wins() {
        let table = FeatureTable::from_entries(
            FeatureKind::Idf,
            TitleConvention::HyphenJoined,
            vec![
                ("climate-change".to_string(), 4.2),
                ("climate-change".to_string(), 9.9),
            ],
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup_title("Climate Change").map(|e| e.value), Some(4.2));
    }

    #[test]
    fn hyphen_table_does_not_match_underscored_keys() {
        let table = FeatureTable::from_entries(
            FeatureKind::Idf,
            TitleConvention::HyphenJoined,
            vec![("climate_change".to_string(), 4.2)],
        );
        assert!(table.lookup_title("Climate Change").is_none());
    }

    #[test]
    fn rank_table_keys_are_cleaned_on_load() {
        let table = FeatureTable::from_entries(
            FeatureKind::PageRank,
            TitleConvention::SpaceJoined,
            vec![("Climate_Change".to_string(), 0.75)],
        );
        assert_eq!(table.lookup_title("Climate Change").map(|e| e.value), Some(0.75));
    }

    #[test]
    fn labels_and_ids_parse_like_dataframe_exports() {
        assert_eq!(parse_label("1"), Some(true));
        assert_eq!(parse_label("0.0"), Some(false));
        assert_eq!(parse_label("True"), Some(true));
        assert_eq!(parse_label("2"), None);
        assert_eq!(parse_id("123"), Some(123));
        assert_eq!(parse_id("123.0"), Some(123));
        assert_eq!(parse_id("12.5"), None);
        assert_eq!(parse_id("-1"), None);
    }

    #[test]
    fn index_columns_are_recognized() {
        assert!(is_index_column(""));
        assert!(is_index_column("Unnamed: 0"));
        assert!(!is_index_column("Unnamed: x"));
        assert!(!is_index_column("page_id"));
    }

    #[test]
    fn partition_preserves_file_order() {
        let dataset = Dataset::new(
            "weasel",
            REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            vec![record(1, true), record(2, false), record(3, true), record(4, false)],
        );
        let (negative, positive) = dataset.partition_by_label();
        assert_eq!(negative.iter().map(|r| r.revision_id).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(positive.iter().map(|r| r.revision_id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn unified_dataset_appends_exactly_one_feature_column() {
        let unified = UnifiedDataset {
            name: "weasel".into(),
            source_header: REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            feature: FeatureKind::PageRank,
            records: vec![UnifiedRecord {
                record: record(7, true),
                feature: FeatureKind::PageRank,
                value: 0.5,
            }],
        };
        let flat = unified.to_dataset();
        assert_eq!(flat.header.last().map(String::as_str), Some("rank"));
        assert_eq!(flat.header.len(), 4);
        assert_eq!(flat.records[0].cells.last().map(String::as_str), Some("0.5"));
    }

    #[test]
    fn fetched_page_accepts_numeric_labels() {
        let raw = r#"{"page_id": 1, "revision_id": 2, "title": "T", "content": "c", "has_template": 1}"#;
        let page: FetchedPage = serde_json::from_str(raw).unwrap();
        assert!(page.has_template);

        let raw = raw.replace(r#""has_template": 1"#, r#""has_template": 0.0"#);
        assert!(!serde_json::from_str::<FetchedPage>(&raw).unwrap().has_template);

        let raw = raw.replace(r#""has_template": 0.0"#, r#""has_template": 2"#);
        assert!(serde_json::from_str::<FetchedPage>(&raw).is_err());
    }

    #[test]
    fn fetched_page_json_shape() {
        let page = FetchedPage {
            page_id: 1,
            revision_id: 2,
            title: "T".into(),
            content: "c".into(),
            has_template: true,
        };
        let value = serde_json::to_value(&page).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 5);
        assert!(value.get("has_template").unwrap().as_bool().unwrap());
    }
}
