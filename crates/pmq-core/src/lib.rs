//! Core domain model for prediction-market queries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pmq-core";

/// Snapshot of one market event as stored in the read replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub id: String,
    pub slug: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub section: Option<String>,
    pub subsection: Option<String>,
    pub is_active: bool,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    pub open_interest: Option<f64>,
    pub last_trade_date: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MarketRecord {
    /// Minimal active record; remaining fields default to absent.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: None,
            title: title.into(),
            description: None,
            domain: None,
            section: None,
            subsection: None,
            is_active: true,
            volume: None,
            liquidity: None,
            open_interest: None,
            last_trade_date: None,
            updated_at: None,
        }
    }

    pub fn volume_or_zero(&self) -> f64 {
        self.volume.unwrap_or(0.0)
    }

    pub fn metric(&self, field: MetricField) -> Option<f64> {
        match field {
            MetricField::Volume => self.volume,
            MetricField::Liquidity => self.liquidity,
            MetricField::OpenInterest => self.open_interest,
        }
    }

    /// Lowercased title + description + taxonomy labels, used for keyword hits.
    pub fn search_haystack(&self) -> String {
        [
            Some(self.title.as_str()),
            self.description.as_deref(),
            self.domain.as_deref(),
            self.section.as_deref(),
            self.subsection.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
    }
}

/// Numeric column a ranking query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    #[default]
    Volume,
    Liquidity,
    OpenInterest,
}

impl MetricField {
    pub fn column(self) -> &'static str {
        match self {
            MetricField::Volume => "volume",
            MetricField::Liquidity => "liquidity",
            MetricField::OpenInterest => "open_interest",
        }
    }

    /// Infer the metric from free text; volume when nothing else is named.
    pub fn detect(query: &str) -> Self {
        let lowered = query.to_lowercase();
        if lowered.contains("liquidity") {
            return MetricField::Liquidity;
        }
        let mentions_oi = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "oi");
        if lowered.contains("open interest") || lowered.contains("open-interest") || mentions_oi {
            return MetricField::OpenInterest;
        }
        MetricField::Volume
    }
}

/// Execution path chosen for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    Scan,
    Semantic,
    Compare,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Scan => "SCAN",
            Strategy::Semantic => "SEMANTIC",
            Strategy::Compare => "COMPARE",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a match in a result set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Scan,
    Semantic,
    KeywordFallback,
}

impl MatchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchSource::Scan => "scan",
            MatchSource::Semantic => "semantic",
            MatchSource::KeywordFallback => "keyword_fallback",
        }
    }
}

/// A record plus the relevance judgement attached to it for one request.
///
/// Scan results carry no relevance. Semantic matches carry the model score,
/// keyword fallback matches carry a synthetic score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch {
    pub record: MarketRecord,
    pub relevance: Option<u8>,
    pub reasoning: Option<String>,
    pub source: MatchSource,
}

impl ScoredMatch {
    pub fn unscored(record: MarketRecord) -> Self {
        Self {
            record,
            relevance: None,
            reasoning: None,
            source: MatchSource::Scan,
        }
    }

    pub fn scored(
        record: MarketRecord,
        relevance: u8,
        reasoning: impl Into<String>,
        source: MatchSource,
    ) -> Self {
        Self {
            record,
            relevance: Some(relevance.min(100)),
            reasoning: Some(reasoning.into()),
            source,
        }
    }
}

/// One side of a multi-category comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonTarget {
    pub label: String,
    pub filter_expr: String,
}

/// Per-request decision produced by the strategy analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub intent: String,
    pub output_format: String,
    pub strategy: Strategy,
    pub filter_expr: Option<String>,
    pub comparisons: Vec<ComparisonTarget>,
    /// Taxonomy domain codes; empty means every domain.
    pub domain_filter: Vec<u32>,
    pub display_limit: Option<usize>,
    pub required_fields: Vec<String>,
    pub batch_reason: Option<String>,
}

impl QueryAnalysis {
    pub const DEFAULT_FIELDS: [&'static str; 8] = [
        "id",
        "title",
        "slug",
        "domain",
        "section",
        "subsection",
        "volume",
        "liquidity",
    ];

    /// Fallback used whenever the analysis completion is unusable.
    pub fn degraded(query: &str) -> Self {
        Self {
            intent: format!("INTENT: {query}"),
            output_format: "Include relevant information".to_string(),
            strategy: Strategy::Semantic,
            filter_expr: None,
            comparisons: Vec::new(),
            domain_filter: Vec::new(),
            display_limit: None,
            required_fields: Self::DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            batch_reason: Some("analysis unavailable".to_string()),
        }
    }

    /// Identifier and title are always needed to match and display records.
    pub fn ensure_required_fields(&mut self) {
        if !self.required_fields.iter().any(|f| f == "id") {
            self.required_fields.insert(0, "id".to_string());
        }
        if !self.required_fields.iter().any(|f| f == "title") {
            let at = 1.min(self.required_fields.len());
            self.required_fields.insert(at, "title".to_string());
        }
    }
}

/// Normalized record handed to machine consumers of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub id: String,
    pub title: String,
    pub slug: Option<String>,
    pub domain: Option<String>,
    pub section: Option<String>,
    pub subsection: Option<String>,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    pub open_interest: Option<f64>,
    pub relevance: Option<u8>,
    pub reasoning: Option<String>,
    pub url: String,
    pub source: MatchSource,
}

impl StructuredRecord {
    pub fn from_match(scored: &ScoredMatch, link_base: &str) -> Self {
        let record = &scored.record;
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            slug: record.slug.clone(),
            domain: record.domain.clone(),
            section: record.section.clone(),
            subsection: record.subsection.clone(),
            volume: record.volume,
            liquidity: record.liquidity,
            open_interest: record.open_interest,
            relevance: scored.relevance,
            reasoning: scored.reasoning.clone(),
            url: market_url(link_base, record.slug.as_deref(), &record.id),
            source: scored.source,
        }
    }
}

/// Canonical event link, preferring the slug over the id.
pub fn market_url(link_base: &str, slug: Option<&str>, id: &str) -> String {
    let base = link_base.trim_end_matches('/');
    match slug.map(str::trim).filter(|s| !s.is_empty()) {
        Some(slug) => format!("{base}/{slug}"),
        None => format!("{base}/{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_detection_prefers_named_metric() {
        assert_eq!(MetricField::detect("top markets by liquidity"), MetricField::Liquidity);
        assert_eq!(MetricField::detect("highest open interest"), MetricField::OpenInterest);
        assert_eq!(MetricField::detect("largest OI in crypto"), MetricField::OpenInterest);
        assert_eq!(MetricField::detect("election markets"), MetricField::Volume);
        // "oi" inside another word does not count
        assert_eq!(MetricField::detect("markets about oil"), MetricField::Volume);
    }

    #[test]
    fn required_fields_always_include_id_and_title() {
        let mut analysis = QueryAnalysis::degraded("x");
        analysis.required_fields = vec!["volume".into()];
        analysis.ensure_required_fields();
        assert_eq!(analysis.required_fields, vec!["id", "title", "volume"]);

        analysis.required_fields.clear();
        analysis.ensure_required_fields();
        assert_eq!(analysis.required_fields, vec!["id", "title"]);
    }

    #[test]
    fn market_url_falls_back_to_id() {
        let base = "https://polymarket.com/event/";
        assert_eq!(
            market_url(base, Some("fed-cut"), "42"),
            "https://polymarket.com/event/fed-cut"
        );
        assert_eq!(market_url(base, Some("  "), "42"), "https://polymarket.com/event/42");
        assert_eq!(market_url(base, None, "42"), "https://polymarket.com/event/42");
    }

    #[test]
    fn scored_match_clamps_relevance() {
        let m = ScoredMatch::scored(MarketRecord::new("1", "t"), 140, "r", MatchSource::Semantic);
        assert_eq!(m.relevance, Some(100));
    }

    #[test]
    fn strategy_serializes_upper_case() {
        let json = serde_json::to_string(&Strategy::Semantic).unwrap();
        assert_eq!(json, "\"SEMANTIC\"");
    }
}
