use std::sync::Arc;
use std::time::Duration;

use pmq_core::{ComparisonTarget, MarketRecord, ScoredMatch};
use pmq_storage::{RowStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};

use crate::completion::{complete_within, CompletionClient};
use crate::error::{CompletionError, QueryError};
use crate::formatter::dollars;
use crate::rewriter::SqlSafetyRewriter;

/// Tabulated result of one compared category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub label: String,
    pub count: usize,
    pub total_volume: f64,
    pub avg_liquidity: Option<f64>,
    pub avg_open_interest: Option<f64>,
    pub sample: Vec<SampleRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRow {
    pub id: String,
    pub title: String,
    pub domain: Option<String>,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    pub open_interest: Option<f64>,
}

impl From<&MarketRecord> for SampleRow {
    fn from(record: &MarketRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            domain: record.domain.clone(),
            volume: record.volume,
            liquidity: record.liquidity,
            open_interest: record.open_interest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComparisonReport {
    pub display_text: String,
    pub categories: Vec<CategorySummary>,
    /// Sampled rows of every category, in category order.
    pub matches: Vec<ScoredMatch>,
    pub formatted_by_model: bool,
}

impl ComparisonReport {
    pub fn total_rows(&self) -> usize {
        self.categories.iter().map(|c| c.count).sum()
    }
}

pub struct ComparisonExecutor {
    completion: Arc<dyn CompletionClient>,
    store: Arc<dyn RowStore>,
    sample: usize,
    timeout: Duration,
}

impl ComparisonExecutor {
    pub fn new(
        completion: Arc<dyn CompletionClient>,
        store: Arc<dyn RowStore>,
        sample: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            completion,
            store,
            sample: sample.max(1),
            timeout,
        }
    }

    /// Scan every target independently, then hand the table to one formatting
    /// completion. A rejected or failing category is reported in its row; only
    /// when all of them fail is the comparison an error.
    pub async fn execute(
        &self,
        targets: &[ComparisonTarget],
        rewriter: &SqlSafetyRewriter,
        user_query: &str,
        context: Option<&str>,
        limit: Option<usize>,
    ) -> Result<ComparisonReport, QueryError> {
        if targets.is_empty() {
            return Err(QueryError::InvalidFilter("no comparison categories".to_string()));
        }

        let mut categories = Vec::with_capacity(targets.len());
        let mut matches = Vec::new();
        for target in targets {
            let summary = match rewriter.rewrite(&target.filter_expr, user_query) {
                Err(err) => {
                    warn!(category = %target.label, error = %err, "comparison filter rejected");
                    failed_category(&target.label, err.to_string())
                }
                Ok(scan) => {
                    let mut request = scan.into_request();
                    if let Some(limit) = limit {
                        request = request.limit(limit);
                    }
                    match self.store.scan(&request).await {
                        Ok(rows) => {
                            info!(category = %target.label, rows = rows.len(), "comparison category scanned");
                            matches.extend(rows.iter().take(self.sample).cloned().map(ScoredMatch::unscored));
                            summarize(&target.label, &rows, self.sample)
                        }
                        Err(err @ StoreError::Unavailable { .. }) => return Err(err.into()),
                        Err(StoreError::InvalidQuery(message)) => {
                            warn!(category = %target.label, %message, "comparison scan failed");
                            failed_category(&target.label, message)
                        }
                    }
                }
            };
            categories.push(summary);
        }

        if categories.iter().all(|c| c.error.is_some()) {
            let reasons = categories
                .iter()
                .filter_map(|c| c.error.as_deref().map(|e| format!("{}: {e}", c.label)))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(QueryError::InvalidFilter(reasons));
        }

        let prompt = formatting_prompt(user_query, context, &categories);
        let (display_text, formatted_by_model) =
            match complete_within(self.completion.as_ref(), &prompt, self.timeout).await {
                Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), true),
                Ok(_) => (markdown_table(&categories), false),
                Err(CompletionError::RateLimited(message)) => return Err(QueryError::RateLimited(message)),
                Err(err) => {
                    warn!(error = %err, "comparison formatting failed; rendering table locally");
                    (markdown_table(&categories), false)
                }
            };

        Ok(ComparisonReport {
            display_text,
            categories,
            matches,
            formatted_by_model,
        })
    }
}

fn failed_category(label: &str, error: String) -> CategorySummary {
    CategorySummary {
        label: label.to_string(),
        count: 0,
        total_volume: 0.0,
        avg_liquidity: None,
        avg_open_interest: None,
        sample: Vec::new(),
        error: Some(error),
    }
}

pub fn summarize(label: &str, rows: &[MarketRecord], sample: usize) -> CategorySummary {
    let average = |values: Vec<f64>| {
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    };
    CategorySummary {
        label: label.to_string(),
        count: rows.len(),
        total_volume: rows.iter().map(MarketRecord::volume_or_zero).sum(),
        avg_liquidity: average(rows.iter().filter_map(|r| r.liquidity).collect()),
        avg_open_interest: average(rows.iter().filter_map(|r| r.open_interest).collect()),
        sample: rows.iter().take(sample).map(SampleRow::from).collect(),
        error: None,
    }
}

fn formatting_prompt(user_query: &str, context: Option<&str>, categories: &[CategorySummary]) -> String {
    let table = serde_json::to_string_pretty(categories).unwrap_or_else(|_| "[]".to_string());
    let context = context
        .map(|text| format!("\nEXTERNAL CONTEXT FROM WEB SEARCH:\n{text}\n"))
        .unwrap_or_default();
    format!(
        "Format this comparison data into a clear, concise response for the user.

USER QUERY: {user_query}
{context}
COMPARISON RESULTS:
{table}

INSTRUCTIONS:
- Present the comparison in a clear, easy-to-read format
- For aggregate values (count, total volume, averages), show a single summary line per category
- For sample rows, show a brief list
- Use markdown formatting (**bold** for headers)
- Keep it concise; the user wants a quick comparison
- Format financial values (liquidity, volume) with $ and commas

Response:"
    )
}

/// Deterministic rendering used when the formatting completion is unusable.
pub fn markdown_table(categories: &[CategorySummary]) -> String {
    let money = |value: Option<f64>, decimals: usize| {
        value
            .map(|v| format!("${}", dollars(v, decimals)))
            .unwrap_or_else(|| "n/a".to_string())
    };

    let mut lines = vec![
        "**Comparison**".to_string(),
        String::new(),
        "| Category | Markets | Total volume | Avg liquidity | Avg open interest |".to_string(),
        "|---|---|---|---|---|".to_string(),
    ];
    for category in categories {
        if let Some(error) = &category.error {
            lines.push(format!("| {} | n/a | n/a | n/a | n/a ({error}) |", category.label));
            continue;
        }
        lines.push(format!(
            "| {} | {} | {} | {} | {} |",
            category.label,
            category.count,
            money(Some(category.total_volume), 0),
            money(category.avg_liquidity, 2),
            money(category.avg_open_interest, 2),
        ));
    }

    for category in categories.iter().filter(|c| !c.sample.is_empty()) {
        lines.push(String::new());
        lines.push(format!("**{}**", category.label));
        lines.extend(category.sample.iter().map(|row| match row.volume {
            Some(volume) if volume != 0.0 => format!("- {} (${})", row.title, dollars(volume, 0)),
            _ => format!("- {}", row.title),
        }));
    }
    lines.join("\n")
}
