//! Plant catalog and the keyword context enricher.
//!
//! The catalog is a JSON array of entries loaded once per process. A
//! query is matched against each entry by keyword overlap and the first
//! few hits become a short context block for the system prompt.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::consts::{CONTEXT_LIMIT, MIN_KEYWORD_LEN};

/// Catalog identifiers are numeric in generated catalogs and free text in
/// hand-written ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryId {
    Number(u64),
    Text(String),
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Number(n) => write!(f, "{n}"),
            EntryId::Text(s) => f.write_str(s),
        }
    }
}

/// One plant in the nursery inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: EntryId,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub scientific_name: String,
    #[serde(default)]
    pub category: String,
}

impl CatalogEntry {
    fn haystack(&self) -> String {
        format!("{} {} {}", self.common_name, self.scientific_name, self.category).to_lowercase()
    }
}

/// Where the catalog document lives.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogSource {
    File(PathBuf),
    Url(String),
}

impl CatalogSource {
    /// `http(s)://` strings are URLs, everything else a path.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            CatalogSource::Url(s.to_string())
        } else {
            CatalogSource::File(PathBuf::from(s))
        }
    }
}

impl fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogSource::File(path) => write!(f, "{}", path.display()),
            CatalogSource::Url(url) => f.write_str(url),
        }
    }
}

/// An immutable, in-memory plant catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json).context("invalid catalog JSON")?;
        Ok(Self { entries })
    }

    pub async fn load(source: &CatalogSource) -> Result<Self> {
        let body = match source {
            CatalogSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read catalog {}", path.display()))?,
            CatalogSource::Url(url) => {
                let resp = reqwest::get(url)
                    .await
                    .with_context(|| format!("failed to fetch catalog {url}"))?;
                if !resp.status().is_success() {
                    bail!("catalog fetch failed ({}): {url}", resp.status());
                }
                resp.text().await?
            }
        };
        Self::from_json(&body)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose names or category contain any query word longer
    /// than three characters, in catalog order, at most `limit`.
    pub fn matches(&self, query: &str, limit: usize) -> Vec<&CatalogEntry> {
        let query = query.to_lowercase();
        let keywords: Vec<&str> = query
            .split_whitespace()
            .filter(|k| k.chars().count() > MIN_KEYWORD_LEN)
            .collect();
        if keywords.is_empty() {
            return Vec::new();
        }

        self.entries
            .iter()
            .filter(|entry| {
                let text = entry.haystack();
                keywords.iter().any(|k| text.contains(k))
            })
            .take(limit)
            .collect()
    }

    /// Context block for the system prompt; empty when nothing matches.
    pub fn build_context(&self, query: &str) -> String {
        let matches = self.matches(query, CONTEXT_LIMIT);
        if matches.is_empty() {
            return String::new();
        }

        let mut context = String::from("Available plants in Heartyculture Nursery inventory:\n");
        for (i, p) in matches.iter().enumerate() {
            context.push_str(&format!(
                "{}. {} ({}). Category: {}. ID: {}\n",
                i + 1,
                p.common_name,
                p.scientific_name,
                p.category,
                p.id
            ));
        }
        context
    }
}

/// A catalog fetched on first use. Failed loads are logged, treated as an
/// empty catalog, and retried on the next use.
pub struct LazyCatalog {
    source: Option<CatalogSource>,
    cell: OnceCell<Catalog>,
}

impl LazyCatalog {
    pub fn new(source: CatalogSource) -> Self {
        Self {
            source: Some(source),
            cell: OnceCell::new(),
        }
    }

    /// A catalog with no source; every context is empty.
    pub fn disabled() -> Self {
        Self {
            source: None,
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already loaded catalog.
    pub fn ready(catalog: Catalog) -> Self {
        Self {
            source: None,
            cell: OnceCell::new_with(Some(catalog)),
        }
    }

    pub async fn get(&self) -> Option<&Catalog> {
        let source = match &self.source {
            Some(source) => source,
            None => return self.cell.get(),
        };
        let loaded = self
            .cell
            .get_or_try_init(|| async {
                let catalog = Catalog::load(source).await?;
                info!(%source, items = catalog.len(), "catalog loaded");
                anyhow::Ok(catalog)
            })
            .await;
        match loaded {
            Ok(catalog) => Some(catalog),
            Err(e) => {
                error!(%source, "catalog load failed: {e:#}");
                None
            }
        }
    }

    /// Number of loaded entries, without triggering a load.
    pub fn loaded_len(&self) -> usize {
        self.cell.get().map_or(0, Catalog::len)
    }

    pub async fn build_context(&self, query: &str) -> String {
        match self.get().await {
            Some(catalog) => catalog.build_context(query),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Catalog {
        Catalog::from_json(
            r#"[
                {"id": 1, "common_name": "Rose", "scientific_name": "Rosa indica", "category": "Shrub"},
                {"id": 2, "common_name": "Money Plant", "scientific_name": "Epipremnum aureum", "category": "Indoor"},
                {"id": "hc-3", "common_name": "Tulsi", "scientific_name": "Ocimum tenuiflorum", "category": "Herb"}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn rose_query_yields_rose_context() {
        let context = sample().build_context("rose");
        assert!(context.contains("Rose"));
        assert!(context.starts_with("Available plants"));
        assert!(context.contains("1. Rose (Rosa indica). Category: Shrub. ID: 1"));
    }

    #[test]
    fn empty_and_short_queries_yield_nothing() {
        let catalog = sample();
        assert_eq!(catalog.build_context(""), "");
        assert_eq!(catalog.build_context("a big red"), "");
    }

    #[test]
    fn matching_is_case_insensitive_and_covers_all_fields() {
        let catalog = sample();
        let hits: Vec<String> = catalog
            .matches("Something INDOOR or an ocimum", 5)
            .iter()
            .map(|e| e.common_name.clone())
            .collect();
        assert_eq!(hits, vec!["Money Plant", "Tulsi"]);
    }

    #[test]
    fn context_is_capped() {
        let entries = (0..8)
            .map(|i| CatalogEntry {
                id: EntryId::Number(i),
                common_name: format!("Fern {i}"),
                scientific_name: String::new(),
                category: "Fern".into(),
            })
            .collect();
        let context = Catalog::new(entries).build_context("ferns fern");
        assert_eq!(context.lines().count(), 1 + CONTEXT_LIMIT);
        assert!(context.contains("5. Fern 4"));
        assert!(!context.contains("Fern 5"));
    }

    #[test]
    fn text_ids_display_verbatim() {
        assert!(sample().build_context("tulsi").contains("ID: hc-3"));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let catalog = Catalog::from_json(r#"[{"id": 7, "common_name": "Aloe"}]"#).unwrap();
        assert_eq!(catalog.entries()[0].category, "");
        assert!(catalog.build_context("aloe vera").contains("Aloe"));
    }

    #[test]
    fn source_parse() {
        assert_eq!(
            CatalogSource::parse("https://example.com/p.json"),
            CatalogSource::Url("https://example.com/p.json".into())
        );
        assert_eq!(
            CatalogSource::parse("assets/p.json"),
            CatalogSource::File(PathBuf::from("assets/p.json"))
        );
    }

    #[tokio::test]
    async fn lazy_catalog_treats_failure_as_empty_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plants.json");
        let lazy = LazyCatalog::new(CatalogSource::File(path.clone()));

        assert_eq!(lazy.build_context("rose").await, "");
        assert_eq!(lazy.loaded_len(), 0);

        std::fs::write(&path, r#"[{"id": 1, "common_name": "Rose", "category": "Shrub"}]"#).unwrap();
        assert!(lazy.build_context("rose").await.contains("Rose"));
        assert_eq!(lazy.loaded_len(), 1);
    }

    #[tokio::test]
    async fn disabled_catalog_is_always_empty() {
        let lazy = LazyCatalog::disabled();
        assert_eq!(lazy.build_context("rose").await, "");
    }

    #[tokio::test]
    async fn ready_catalog_needs_no_source() {
        let lazy = LazyCatalog::ready(sample());
        assert_eq!(lazy.loaded_len(), 3);
        assert!(lazy.build_context("rose").await.contains("Rose"));
    }
}
