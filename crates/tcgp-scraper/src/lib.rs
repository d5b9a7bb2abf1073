//! Source partition fetching + catalog page parsing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tcgp_core::{rarity_tier_from_glyphs, RawCardRecord};
use tcgp_storage::{FetchError, HttpFetcher};
use thiserror::Error;

pub const CRATE_NAME: &str = "tcgp-scraper";

pub const DEFAULT_SOURCE_BASE_URL: &str = "https://pocket.limitlesstcg.com";

/// Rarity marker glyph rendered by the source.
const RARITY_GLYPH: char = '◊';

/// One independently fetchable slice of the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partition {
    /// One set code, e.g. `A1`.
    Set(String),
    /// Free-text name query used by the secondary pass.
    Name(String),
}

impl Partition {
    pub fn key(&self) -> String {
        match self {
            Partition::Set(code) => format!("set:{code}"),
            Partition::Name(name) => format!("name:{name}"),
        }
    }

    /// Builds the catalog query URL for this partition.
    pub fn url(&self, base_url: &str) -> String {
        let query = match self {
            Partition::Set(code) => format!("!set:{code}"),
            Partition::Name(name) => format!("name:{name}"),
        };
        format!(
            "{}/cards/?q={}+display%3Afull+sort%3Aname&show=all",
            base_url.trim_end_matches('/'),
            urlencoding::encode(&query)
        )
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

/// Partition-scoped failure. Carries the partition key so a caller can
/// selectively re-run what failed; it never aborts the surrounding run.
#[derive(Debug, Error)]
#[error("partition {partition_key} failed: {source}")]
pub struct PartitionFailure {
    pub partition_key: String,
    #[source]
    pub source: ScrapeError,
}

/// One partition's fetch result: the raw document plus its parsed records.
#[derive(Debug, Clone)]
pub struct FetchedPartition {
    pub fetched_at: DateTime<Utc>,
    pub document: String,
    pub records: Vec<RawCardRecord>,
}

/// Seam between the orchestrator and the concrete source, so runs can be
/// driven by stub sources in tests.
#[async_trait]
pub trait PartitionSource: Send + Sync {
    async fn fetch_partition(
        &self,
        partition: &Partition,
    ) -> Result<FetchedPartition, PartitionFailure>;
}

/// Live HTML source backed by the shared HTTP fetcher.
pub struct LimitlessSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl LimitlessSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PartitionSource for LimitlessSource {
    async fn fetch_partition(
        &self,
        partition: &Partition,
    ) -> Result<FetchedPartition, PartitionFailure> {
        let url = partition.url(&self.base_url);
        let document = self
            .http
            .fetch_text(&url)
            .await
            .map_err(|err| PartitionFailure {
                partition_key: partition.key(),
                source: ScrapeError::Fetch(err),
            })?;
        let records =
            parse_catalog_document(&document, &self.base_url).map_err(|err| PartitionFailure {
                partition_key: partition.key(),
                source: err,
            })?;
        Ok(FetchedPartition {
            fetched_at: Utc::now(),
            document,
            records,
        })
    }
}

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|err| ScrapeError::Selector {
        selector: css.to_string(),
        message: err.to_string(),
    })
}

fn collect_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// `"Genetic Apex (A1 025/226)"` -> `"Genetic Apex"`.
fn strip_trailing_parenthetical(text: &str) -> String {
    text.split('(').next().unwrap_or(text).trim().to_string()
}

fn absolutize_image(base_url: &str, src: &str) -> String {
    if src.starts_with("http://") || src.starts_with("https://") {
        return src.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        src.trim_start_matches('/')
    )
}

/// Parses one catalog results page into raw records.
///
/// Elements missing a name or image are skipped. Duplicate derived identity
/// within the same document keeps the first occurrence. A document matching
/// nothing yields zero records rather than an error.
pub fn parse_catalog_document(
    html: &str,
    base_url: &str,
) -> Result<Vec<RawCardRecord>, ScrapeError> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.card-page-main")?;
    let name_sel = selector("span.card-text-name")?;
    let img_sel = selector("img.card")?;
    let details_sel = selector("div.prints-current-details span")?;

    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for element in document.select(&card_sel) {
        let source_name = match element.select(&name_sel).next().map(collect_text) {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        let image_src = match element
            .select(&img_sel)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(str::trim)
        {
            Some(src) if !src.is_empty() => src,
            _ => continue,
        };

        let mut details = element.select(&details_sel);
        let source_set = details
            .next()
            .map(collect_text)
            .as_deref()
            .map(strip_trailing_parenthetical)
            .unwrap_or_default();
        if source_set.is_empty() {
            continue;
        }
        let glyph_count = details
            .next()
            .map(|span| collect_text(span).matches(RARITY_GLYPH).count())
            .unwrap_or(0);

        let record = RawCardRecord {
            source_name,
            source_set,
            rarity_tier: rarity_tier_from_glyphs(glyph_count),
            image_ref: absolutize_image(base_url, image_src),
        };
        if seen.insert(record.identity()) {
            records.push(record);
        }
    }

    Ok(records)
}
