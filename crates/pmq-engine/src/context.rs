//! Optional web-search context for reasoning-heavy strategies.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::completion::{complete_within, CompletionClient, ContextSearch};
use crate::keywords::KeywordExtractor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatheredContext {
    pub queries: Vec<String>,
    pub text: Option<String>,
}

pub struct ContextGatherer {
    completion: Arc<dyn CompletionClient>,
    search: Arc<dyn ContextSearch>,
    timeout: Duration,
    min_queries: usize,
    max_queries: usize,
}

impl ContextGatherer {
    pub fn new(completion: Arc<dyn CompletionClient>, search: Arc<dyn ContextSearch>, timeout: Duration) -> Self {
        Self {
            completion,
            search,
            timeout,
            min_queries: 3,
            max_queries: 5,
        }
    }

    /// Search failures degrade to "no context"; the subqueries are still
    /// reported.
    pub async fn gather(&self, query: &str, intent: &str) -> GatheredContext {
        let queries = self.subqueries(query, intent).await;
        if queries.is_empty() {
            return GatheredContext::default();
        }
        let text = match self.search.search(&queries).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "context search failed; continuing without it");
                None
            }
        };
        info!(queries = queries.len(), found = text.is_some(), "context gathered");
        GatheredContext { queries, text }
    }

    /// The raw query first, then generated subqueries, deduplicated without
    /// regard to case and capped; keyword drill-downs backfill a short list.
    pub async fn subqueries(&self, query: &str, intent: &str) -> Vec<String> {
        let prompt = format!(
            "Decompose the following prediction-market user request into {min}-{max} diverse news-style subqueries.
User query: {query}
Intent summary: {intent}

Guidelines:
- Prioritize recent news, developments or factual context about the key events, entities or nouns in the query.
- Capture different entities, catalysts and time horizons relevant to the prediction.
- Keep each subquery between 5 and 12 words.
- Include at least one subquery tying the subject back to prediction markets or odds if relevant.
- Output ONLY a JSON array of strings, no prose.
",
            min = self.min_queries,
            max = self.max_queries,
        );

        let mut generated = match complete_within(self.completion.as_ref(), &prompt, self.timeout).await {
            Ok(text) => parse_query_list(&text),
            Err(err) => {
                warn!(error = %err, "subquery generation failed; using keyword subqueries");
                Vec::new()
            }
        };
        if generated.is_empty() {
            let keywords = KeywordExtractor::new(8).extract(query);
            generated.extend(
                keywords
                    .phrases
                    .iter()
                    .take(2)
                    .map(|phrase| format!("{phrase} latest developments")),
            );
            generated.extend(
                keywords
                    .tokens
                    .iter()
                    .take(3)
                    .map(|kw| format!("{kw} prediction market odds")),
            );
            if !intent.trim().is_empty() {
                generated.push(intent.trim().to_string());
            }
        }

        let mut seen = HashSet::new();
        let mut queries = Vec::new();
        let seed = query.trim();
        let combined = (!seed.is_empty())
            .then(|| seed.to_string())
            .into_iter()
            .chain(generated);
        for candidate in combined {
            if queries.len() >= self.max_queries {
                break;
            }
            if seen.insert(candidate.to_lowercase()) {
                queries.push(candidate);
            }
        }

        if queries.len() < self.min_queries {
            for kw in KeywordExtractor::new(6).extract(query).tokens {
                if queries.len() >= self.min_queries {
                    break;
                }
                let filler = format!("{kw} background context");
                if seen.insert(filler.to_lowercase()) {
                    queries.push(filler);
                }
            }
        }
        queries
    }
}

/// A JSON array of strings, either the whole reply or the first bracketed span.
fn parse_query_list(text: &str) -> Vec<String> {
    let text = text.trim();
    let parsed = serde_json::from_str::<Vec<serde_json::Value>>(text).ok().or_else(|| {
        let start = text.find('[')?;
        let end = text.rfind(']')?;
        (start < end)
            .then(|| serde_json::from_str::<Vec<serde_json::Value>>(&text[start..=end]).ok())
            .flatten()
    });
    parsed
        .unwrap_or_default()
        .iter()
        .filter_map(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompletionError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Reply(Result<String, CompletionError>);

    #[async_trait]
    impl CompletionClient for Reply {
        async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingSearch {
        seen: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ContextSearch for RecordingSearch {
        async fn search(&self, queries: &[String]) -> Result<Option<String>, CompletionError> {
            self.seen.lock().unwrap().push(queries.to_vec());
            if self.fail {
                return Err(CompletionError::Failed("offline".into()));
            }
            Ok(Some("- Fed signals easing (Source: Reuters)".into()))
        }
    }

    fn gatherer(reply: Result<&str, CompletionError>, search: Arc<RecordingSearch>) -> ContextGatherer {
        ContextGatherer::new(
            Arc::new(Reply(reply.map(str::to_string))),
            search,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn generated_subqueries_follow_the_seed_and_dedupe() {
        let search = Arc::new(RecordingSearch::default());
        let gatherer = gatherer(
            Ok("Sure: [\"Fed rate cut odds\", \"fed RATE cut odds\", \"FOMC March meeting\", \"CPI outlook\", \"jobs report\", \"extra\"]"),
            Arc::clone(&search),
        );
        let context = gatherer.gather("fed rate cut", "INTENT: rates").await;
        assert_eq!(
            context.queries,
            vec!["fed rate cut", "Fed rate cut odds", "FOMC March meeting", "CPI outlook", "jobs report"]
        );
        assert_eq!(context.text.as_deref(), Some("- Fed signals easing (Source: Reuters)"));
        assert_eq!(search.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keyword_subqueries_when_generation_fails() {
        let search = Arc::new(RecordingSearch::default());
        let gatherer = gatherer(Err(CompletionError::Failed("boom".into())), search);
        let queries = gatherer.subqueries("bitcoin halving impact", "INTENT: halving").await;
        assert_eq!(queries[0], "bitcoin halving impact");
        assert_eq!(queries[1], "bitcoin halving latest developments");
        assert!(queries.len() <= 5);
        assert!(queries.iter().any(|q| q == "bitcoin prediction market odds"));
    }

    #[tokio::test]
    async fn short_lists_are_backfilled() {
        let search = Arc::new(RecordingSearch::default());
        let gatherer = gatherer(Ok("[\"nuclear\"]"), search);
        let queries = gatherer.subqueries("nuclear", "").await;
        assert_eq!(queries, vec!["nuclear", "nuclear background context"]);
    }

    #[tokio::test]
    async fn search_failure_keeps_queries_without_text() {
        let search = Arc::new(RecordingSearch {
            fail: true,
            ..Default::default()
        });
        let gatherer = gatherer(Ok("[\"a b c\"]"), search);
        let context = gatherer.gather("tariffs on china", "").await;
        assert!(context.text.is_none());
        assert_eq!(context.queries[0], "tariffs on china");
    }

    #[test]
    fn query_list_parsing_tolerates_prose() {
        assert_eq!(parse_query_list("[\"a\", 3, \" b \"]"), vec!["a", "b"]);
        assert_eq!(parse_query_list("no list here"), Vec::<String>::new());
    }
}
