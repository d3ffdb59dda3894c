use std::sync::{Arc, OnceLock};
use std::time::Duration;

use pmq_core::{ComparisonTarget, QueryAnalysis, Strategy};
use regex::Regex;
use tracing::{info, warn};

use crate::completion::{complete_within, CompletionClient};
use crate::taxonomy::Taxonomy;

const SCHEMA: &str = "\
DATABASE SCHEMA:
Table: events

These are the ONLY columns available. Do not use any other column:
- id (TEXT, PRIMARY KEY) - Event ID
- slug (TEXT, UNIQUE) - URL slug
- title (TEXT) - Event title/question
- description (TEXT) - Detailed event description (nullable)
- domain (TEXT) - Top-level category
- section (TEXT) - Second-level category
- subsection (TEXT) - Third-level category
- is_active (INTEGER) - 1 when the event is open
- volume (REAL) - Trading volume in USD
- liquidity (REAL) - Market liquidity in USD
- open_interest (REAL) - Open interest in USD
- last_trade_date (TEXT) - Last trade date (ISO format)
- updated_at (TEXT) - Last update timestamp

Common query patterns:
- Top volume: SELECT id, title, slug, domain, volume, liquidity FROM events WHERE is_active=1 ORDER BY volume DESC
- Recent: SELECT id, title, slug, domain, volume FROM events WHERE is_active=1 ORDER BY updated_at DESC
- Filter by domain: WHERE domain LIKE '%Politics%'
- Search title: WHERE LOWER(title) LIKE '%keyword%' (prefer broad keywords such as '%tax%')";

/// Turns a raw query into a [`QueryAnalysis`] via one completion call.
///
/// Never fails: an unusable completion yields [`QueryAnalysis::degraded`].
pub struct StrategyAnalyzer {
    completion: Arc<dyn CompletionClient>,
    taxonomy: Arc<Taxonomy>,
    timeout: Duration,
}

impl StrategyAnalyzer {
    pub fn new(completion: Arc<dyn CompletionClient>, taxonomy: Arc<Taxonomy>, timeout: Duration) -> Self {
        Self {
            completion,
            taxonomy,
            timeout,
        }
    }

    pub async fn analyze(&self, query: &str) -> QueryAnalysis {
        let prompt = self.build_prompt(query);
        let mut analysis = match complete_within(self.completion.as_ref(), &prompt, self.timeout).await {
            Ok(text) => match parse_analysis(&text, query, &self.taxonomy) {
                Some(analysis) => analysis,
                None => {
                    warn!("analysis degraded: completion had no recognizable fields");
                    QueryAnalysis::degraded(query)
                }
            },
            Err(err) => {
                warn!(error = %err, "analysis degraded: completion failed");
                QueryAnalysis::degraded(query)
            }
        };

        if is_simple_metric_query(query) && analysis.strategy != Strategy::Compare {
            if analysis.strategy != Strategy::Scan {
                info!(proposed = %analysis.strategy, "simple ranking query; forcing SCAN");
            }
            analysis.strategy = Strategy::Scan;
        }
        if analysis.display_limit.is_none() {
            analysis.display_limit = extract_top_n(query);
        }
        analysis.ensure_required_fields();
        analysis
    }

    pub fn build_prompt(&self, query: &str) -> String {
        let platform = &self.taxonomy.platform;
        let domains = self.taxonomy.describe(0);
        format!(
            "You are a prediction markets assistant with access to {platform} events.
Unless the user asks a generic question about prediction markets, answer from the database.

Analyze this user query and provide ALL decision points.

USER QUERY: {query}

{SCHEMA}

AVAILABLE DOMAINS FOR FILTERING:
{domains}

Provide:
1. INTENT (what the user wants, filters, sorting)
2. OUTPUT_FORMAT (what to show in the response)
3. USER_LIMIT (a number when the user asks for \"top 5\", \"first 3\", \"10 markets\"; otherwise ALL)
4. STRATEGY (SQL or BATCH or COMPARISON)
   - SQL for simple filters and rankings by volume, liquidity or open interest without semantic filtering
   - BATCH for semantic search: people, entities, abstract concepts, specific subcategories
   - COMPARISON for aggregates (avg, min, max, sum) across different categories, one SQL query per category
   - Filter precisely with the domain, section and subsection columns
5. DOMAIN_FILTER (for BATCH; be inclusive, always include the Miscellaneous domain, or ALL when broad)
6. REQUIRED_COLUMNS (id, title, slug, domain, section, subsection, description, volume, liquidity, open_interest)

Response format:
INTENT: <intent description>
FILTERS: <filters or NONE>
SORTING: <sorting or NONE>
OUTPUT_FORMAT: <what to include in output>
USER_LIMIT: <number or ALL>
STRATEGY: SQL or BATCH or COMPARISON
SQL_QUERY: <if SQL, a single SELECT over events WITHOUT LIMIT>
BATCH_REASON: <if BATCH, the reason>
COMPARISON_QUERIES: <if COMPARISON, CATEGORY1:query1|CATEGORY2:query2>
DOMAIN_FILTER: <comma-separated domain numbers or ALL>
REQUIRED_COLUMNS: <comma-separated>

Your response:"
        )
    }
}

/// Parse the line-oriented analysis format. `None` when no known field is present.
pub fn parse_analysis(text: &str, query: &str, taxonomy: &Taxonomy) -> Option<QueryAnalysis> {
    let mut analysis = QueryAnalysis::degraded(query);
    analysis.batch_reason = None;
    let mut intent_lines = Vec::new();
    let mut recognized = false;

    for line in text.lines() {
        let line = line.trim().trim_start_matches(['*', '-', ' ']).trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches('*').trim();
        let key = key.trim().trim_matches('*').to_ascii_uppercase();
        match key.as_str() {
            "INTENT" | "FILTERS" | "SORTING" => intent_lines.push(format!("{key}: {value}")),
            "OUTPUT_FORMAT" if !value.is_empty() => analysis.output_format = value.to_string(),
            "USER_LIMIT" => {
                analysis.display_limit = value.parse::<usize>().ok().filter(|n| *n > 0);
            }
            "STRATEGY" => {
                let upper = value.to_ascii_uppercase();
                analysis.strategy = if upper.contains("COMPAR") {
                    Strategy::Compare
                } else if upper.contains("SQL") || upper.contains("SCAN") {
                    Strategy::Scan
                } else {
                    Strategy::Semantic
                };
            }
            "SQL_QUERY" => analysis.filter_expr = non_sentinel(value),
            "BATCH_REASON" => analysis.batch_reason = non_sentinel(value),
            "COMPARISON_QUERIES" => analysis.comparisons = parse_comparisons(value),
            "DOMAIN_FILTER" => {
                analysis.domain_filter = value
                    .split(',')
                    .filter_map(|part| part.trim().parse::<u32>().ok())
                    .filter(|code| taxonomy.contains(*code))
                    .collect();
            }
            "REQUIRED_COLUMNS" => {
                let columns: Vec<String> = value
                    .split(',')
                    .map(|c| c.trim().to_lowercase())
                    .filter(|c| !c.is_empty() && c != "none")
                    .collect();
                if !columns.is_empty() {
                    analysis.required_fields = columns;
                }
            }
            _ => continue,
        }
        recognized = true;
    }

    if !recognized {
        return None;
    }
    if !intent_lines.is_empty() {
        analysis.intent = intent_lines.join("\n");
    }
    analysis.ensure_required_fields();
    Some(analysis)
}

fn non_sentinel(value: &str) -> Option<String> {
    let value = value.trim().trim_matches('`').trim();
    let upper = value.to_ascii_uppercase();
    if value.is_empty() || upper == "NONE" || upper == "N/A" || upper == "NULL" {
        None
    } else {
        Some(value.to_string())
    }
}

/// `LABEL:query|LABEL:query`; pairs without a label or query are dropped.
pub fn parse_comparisons(value: &str) -> Vec<ComparisonTarget> {
    value
        .split('|')
        .filter_map(|pair| {
            let (label, filter) = pair.split_once(':')?;
            let label = label.trim().trim_matches('"');
            let filter = filter.trim().trim_matches('"');
            (!label.is_empty() && !filter.is_empty()).then(|| ComparisonTarget {
                label: label.to_string(),
                filter_expr: filter.to_string(),
            })
        })
        .collect()
}

fn words(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// True for plain "top/highest N by metric" style rankings that need neither
/// semantic scoring nor external context. Comparisons never qualify.
pub fn is_simple_metric_query(query: &str) -> bool {
    let lowered = query.to_lowercase();
    let words = words(query);
    let has = |w: &str| words.iter().any(|x| x == w);

    if has("compare") || has("vs") || has("versus") || lowered.contains("compared to") {
        return false;
    }

    let rank_hit = ["top", "highest", "biggest", "largest", "most", "first", "best"]
        .iter()
        .any(|w| has(w))
        || words.iter().any(|w| {
            w.strip_prefix("top")
                .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        });
    let metric_hit = has("volume")
        || has("liquidity")
        || has("oi")
        || lowered.contains("open interest")
        || lowered.contains("open-interest");
    let by_metric = has("by") && metric_hit;
    let topical = ["about", "related", "involving", "for", "on"].iter().any(|w| has(w));
    let bare_listing = (has("markets") || has("events")) && !topical;

    metric_hit && (rank_hit || by_metric || bare_listing)
}

/// Ranking words whose presence lets a sparse scan stand without escalation.
pub fn is_simple_data_query(query: &str) -> bool {
    let words = words(query);
    ["top", "highest", "lowest", "most", "least", "first", "last"]
        .iter()
        .any(|w| words.iter().any(|x| x == w))
}

/// Numeric limit from phrasing such as "top 5", "first 3", "10 markets".
pub fn extract_top_n(query: &str) -> Option<usize> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:top|first|best|largest|biggest|highest|lowest)[\s-]*(\d{1,3})\b|\b(\d{1,3})\s+(?:markets|events|bets)\b",
        )
        .expect("static limit pattern")
    });
    let captures = pattern.captures(query)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompletionError;
    use async_trait::async_trait;

    struct Fixed(Result<String, CompletionError>);

    #[async_trait]
    impl CompletionClient for Fixed {
        async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
            self.0.clone()
        }
    }

    fn analyzer(reply: Result<&str, CompletionError>) -> StrategyAnalyzer {
        StrategyAnalyzer::new(
            Arc::new(Fixed(reply.map(str::to_string))),
            Arc::new(Taxonomy::default()),
            Duration::from_secs(5),
        )
    }

    const SQL_REPLY: &str = "INTENT: politics markets\n\
        FILTERS: domain politics\n\
        SORTING: volume\n\
        OUTPUT_FORMAT: title and volume\n\
        USER_LIMIT: ALL\n\
        STRATEGY: SQL\n\
        SQL_QUERY: SELECT id, title FROM events WHERE domain LIKE '%Politics%'\n\
        BATCH_REASON: NONE\n\
        COMPARISON_QUERIES: NONE\n\
        DOMAIN_FILTER: 6, 7, 99\n\
        REQUIRED_COLUMNS: volume, slug";

    #[test]
    fn parses_every_field() {
        let analysis = parse_analysis(SQL_REPLY, "politics", &Taxonomy::default()).expect("parsed");
        assert_eq!(analysis.strategy, Strategy::Scan);
        assert_eq!(
            analysis.filter_expr.as_deref(),
            Some("SELECT id, title FROM events WHERE domain LIKE '%Politics%'")
        );
        assert_eq!(analysis.intent, "INTENT: politics markets\nFILTERS: domain politics\nSORTING: volume");
        assert_eq!(analysis.domain_filter, vec![6, 7]);
        assert_eq!(analysis.display_limit, None);
        assert_eq!(analysis.batch_reason, None);
        assert_eq!(analysis.required_fields, vec!["id", "title", "volume", "slug"]);
    }

    #[test]
    fn parses_comparison_pairs() {
        let text = "STRATEGY: COMPARISON\nCOMPARISON_QUERIES: Crypto:SELECT AVG(liquidity) FROM events WHERE domain LIKE '%Crypto%'|Sports: SELECT * FROM events|broken";
        let analysis = parse_analysis(text, "q", &Taxonomy::default()).expect("parsed");
        assert_eq!(analysis.strategy, Strategy::Compare);
        assert_eq!(analysis.comparisons.len(), 2);
        assert_eq!(analysis.comparisons[1].label, "Sports");
        assert_eq!(analysis.comparisons[1].filter_expr, "SELECT * FROM events");
    }

    #[test]
    fn unrecognized_text_is_not_an_analysis() {
        assert!(parse_analysis("I'm sorry, I can't help", "q", &Taxonomy::default()).is_none());
    }

    #[tokio::test]
    async fn failed_completion_degrades_to_semantic() {
        let analysis = analyzer(Err(CompletionError::Failed("boom".into())))
            .analyze("who wins the super bowl")
            .await;
        assert_eq!(analysis.strategy, Strategy::Semantic);
        assert!(analysis.filter_expr.is_none());
        assert!(analysis.required_fields.starts_with(&["id".to_string(), "title".to_string()]));
    }

    #[tokio::test]
    async fn ranking_queries_are_forced_to_scan() {
        let reply = "STRATEGY: BATCH\nBATCH_REASON: semantic";
        let analysis = analyzer(Ok(reply)).analyze("top 2 markets by volume").await;
        assert_eq!(analysis.strategy, Strategy::Scan);
        assert_eq!(analysis.display_limit, Some(2));
    }

    #[test]
    fn simple_metric_heuristic() {
        assert!(is_simple_metric_query("top 2 markets by volume"));
        assert!(is_simple_metric_query("highest liquidity"));
        assert!(is_simple_metric_query("top10 by open interest"));
        assert!(is_simple_metric_query("markets by volume"));
        assert!(!is_simple_metric_query("markets about the fed"));
        assert!(!is_simple_metric_query("top markets about bitcoin"));
        assert!(!is_simple_metric_query("compare volume of crypto vs sports"));
        assert!(!is_simple_metric_query("markets about oil"));
    }

    #[test]
    fn limits_come_from_ranking_phrasing() {
        assert_eq!(extract_top_n("top 5 election markets"), Some(5));
        assert_eq!(extract_top_n("show me the Top-10 by liquidity"), Some(10));
        assert_eq!(extract_top_n("give me 3 markets on AI"), Some(3));
        assert_eq!(extract_top_n("top markets"), None);
        assert_eq!(extract_top_n("top 0"), None);
    }

    #[test]
    fn prompt_lists_taxonomy() {
        let prompt = analyzer(Ok("")).build_prompt("anything");
        assert!(prompt.contains("USER QUERY: anything"));
        assert!(prompt.contains("11. Miscellaneous"));
        assert!(prompt.contains("STRATEGY: SQL or BATCH or COMPARISON"));
    }
}
