//! Parallel relevance scoring of candidate markets in bounded batches.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pmq_core::{MarketRecord, MatchSource, MetricField, ScoredMatch};
use pmq_storage::{OrderBy, Predicate, RowStore, ScanRequest, TextColumn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::completion::{complete_within, CompletionClient};
use crate::config::EngineConfig;
use crate::error::{CompletionError, QueryError};
use crate::keywords::Keywords;
use crate::taxonomy::Taxonomy;

/// Score assumed when a triple carries an id but no readable score.
pub const DEFAULT_SCORE: u8 = 75;

#[derive(Debug, Clone, Copy)]
pub struct ScorerSettings {
    pub batch_size: usize,
    pub max_batches: usize,
    pub workers: usize,
    pub relevance_floor: u8,
    pub prefilter_floor: usize,
    pub completion_timeout: Duration,
}

impl From<&EngineConfig> for ScorerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_batches: config.max_batches.max(1),
            workers: config.batch_workers.max(1),
            relevance_floor: config.relevance_floor,
            prefilter_floor: config.prefilter_floor,
            completion_timeout: config.completion_timeout,
        }
    }
}

impl ScorerSettings {
    fn capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.max_batches)
    }
}

pub struct ScoringRequest<'a> {
    pub query: &'a str,
    pub intent: &'a str,
    pub candidates: Vec<MarketRecord>,
    pub keywords: &'a Keywords,
    pub context: Option<&'a str>,
    pub display_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMatch {
    pub id: String,
    pub score: u8,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScoringOutcome {
    /// Ranked, deduplicated, floor applied. Not truncated.
    pub matches: Vec<ScoredMatch>,
    pub batches: usize,
    pub failed_batches: usize,
    pub fallback_used: bool,
}

#[derive(Serialize)]
struct BatchItem<'a> {
    id: &'a str,
    title: &'a str,
    domain: &'a str,
}

pub struct BatchSemanticScorer {
    completion: Arc<dyn CompletionClient>,
    store: Arc<dyn RowStore>,
    taxonomy: Arc<Taxonomy>,
    settings: ScorerSettings,
}

impl BatchSemanticScorer {
    pub fn new(
        completion: Arc<dyn CompletionClient>,
        store: Arc<dyn RowStore>,
        taxonomy: Arc<Taxonomy>,
        settings: ScorerSettings,
    ) -> Self {
        Self {
            completion,
            store,
            taxonomy,
            settings,
        }
    }

    pub fn settings(&self) -> &ScorerSettings {
        &self.settings
    }

    pub async fn score(&self, request: ScoringRequest<'_>) -> Result<ScoringOutcome, QueryError> {
        let ScoringRequest {
            query,
            intent,
            candidates,
            keywords,
            context,
            display_limit,
        } = request;
        let candidate_count = candidates.len();
        let retained = self.prefilter(candidates, keywords);
        let batches = self.partition(retained);
        let span = info_span!("semantic_scoring", candidates = candidate_count, batches = batches.len());

        async {
            let total = batches.len();
            let prompts = batches
                .iter()
                .enumerate()
                .map(|(idx, batch)| self.batch_prompt(query, intent, context, idx + 1, total, batch))
                .collect::<Vec<_>>();
            let replies = self.dispatch(prompts).await?;

            let mut seen = HashSet::new();
            let mut accepted = Vec::new();
            let mut failed_batches = 0;
            let mut first_error = None;
            for (idx, (batch, reply)) in batches.iter().zip(replies).enumerate() {
                let text = match reply {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(batch = idx + 1, error = %err, "batch scoring failed");
                        failed_batches += 1;
                        first_error.get_or_insert(err);
                        continue;
                    }
                };
                let parsed = parse_batch_response(&text, batch);
                debug!(batch = idx + 1, matches = parsed.len(), "batch scored");
                for found in parsed {
                    if !seen.insert(found.id.clone()) {
                        continue;
                    }
                    if let Some(record) = batch.iter().find(|r| r.id == found.id) {
                        accepted.push(ScoredMatch::scored(
                            record.clone(),
                            found.score,
                            found.reasoning,
                            MatchSource::Semantic,
                        ));
                    }
                }
            }

            let floor = self.settings.relevance_floor;
            let qualifying = accepted
                .iter()
                .filter(|m| m.relevance.unwrap_or(0) >= floor)
                .count();
            let min_expected = display_limit.unwrap_or(5).max(5);
            let mut fallback_used = false;
            if qualifying < min_expected {
                let limit = (min_expected * 2).max(15);
                let supplement = self.keyword_fallback(keywords, limit).await;
                let mut added = 0;
                for found in supplement {
                    if seen.insert(found.record.id.clone()) {
                        accepted.push(found);
                        added += 1;
                        continue;
                    }
                    // A semantic score under the floor would be dropped at ranking.
                    if let Some(slot) = accepted.iter_mut().find(|m| {
                        m.record.id == found.record.id
                            && m.source == MatchSource::Semantic
                            && m.relevance.unwrap_or(0) < floor
                    }) {
                        *slot = found;
                        added += 1;
                    }
                }
                fallback_used = added > 0;
                if fallback_used {
                    info!(added, "keyword fallback supplemented semantic matches");
                }
            }

            if total > 0 && failed_batches == total && accepted.is_empty() {
                let reason = first_error.map(|e| e.to_string()).unwrap_or_default();
                return Err(QueryError::ScoringFailed(reason));
            }

            let matches = rank(accepted, floor);
            info!(
                matches = matches.len(),
                failed_batches,
                fallback_used,
                "semantic scoring complete"
            );
            Ok(ScoringOutcome {
                matches,
                batches: total,
                failed_batches,
                fallback_used,
            })
        }
        .instrument(span)
        .await
    }

    /// Keep candidates with keyword hits, best first, bounded by batch
    /// capacity and padded by volume up to the prefilter floor. Without hits
    /// the full set is returned.
    pub fn prefilter(&self, candidates: Vec<MarketRecord>, keywords: &Keywords) -> Vec<MarketRecord> {
        if candidates.is_empty() || keywords.tokens.is_empty() {
            return candidates;
        }
        let scores: Vec<u32> = candidates
            .iter()
            .map(|record| keywords.hit_score(&record.search_haystack()))
            .collect();
        if scores.iter().all(|score| *score == 0) {
            return candidates;
        }

        let total = candidates.len();
        let (mut hits, mut misses): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .zip(scores)
            .partition(|(_, score)| *score > 0);
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| by_volume_desc(&a.0, &b.0)));
        hits.truncate(self.settings.capacity());

        let mut kept: Vec<MarketRecord> = hits.into_iter().map(|(record, _)| record).collect();
        if kept.len() < self.settings.prefilter_floor && !misses.is_empty() {
            let needed = self.settings.prefilter_floor - kept.len();
            misses.sort_by(|a, b| by_volume_desc(&a.0, &b.0));
            kept.extend(misses.into_iter().take(needed).map(|(record, _)| record));
        }
        info!(kept = kept.len(), of = total, "keyword prefilter");
        kept
    }

    pub fn partition(&self, records: Vec<MarketRecord>) -> Vec<Vec<MarketRecord>> {
        records
            .chunks(self.settings.batch_size)
            .take(self.settings.max_batches)
            .map(<[MarketRecord]>::to_vec)
            .collect()
    }

    fn batch_prompt(
        &self,
        query: &str,
        intent: &str,
        context: Option<&str>,
        batch_no: usize,
        total: usize,
        batch: &[MarketRecord],
    ) -> String {
        let items: Vec<BatchItem<'_>> = batch
            .iter()
            .map(|r| BatchItem {
                id: &r.id,
                title: &r.title,
                domain: r.domain.as_deref().unwrap_or(""),
            })
            .collect();
        let payload = serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string());
        let context = context
            .map(|text| format!("\nADDITIONAL CONTEXT FROM WEB SEARCH:\n{text}\n"))
            .unwrap_or_default();
        let domains = self.taxonomy.describe(4);
        let floor = self.settings.relevance_floor;

        format!(
            "You are an event relationship evaluator.

USER QUERY: {query}
USER INTENT: {intent}
{context}
BATCH {batch_no} of {total}: events to evaluate (each with id, title and domain):
{payload}

1. Interpret the intent: related events, events affected or unaffected by the query, inverse relationships,
   or events restricted to a named domain.
2. Map the query onto these domains, treating synonyms sensibly:
{domains}
   When a cause in one domain targets events in another, evaluate events in the target domain,
   always including Miscellaneous.
3. Score relevance 0-100:
   - 95-100 only for markets explicitly about the exact entity or event, or a direct causal dependency
   - 90-94 sustained, near-certain impact
   - 80-89 strong but not guaranteed relationship
   - {floor}-79 same category with partial ties
   - below {floor}: exclude
4. Keep explanations to 15 words or fewer.

OUTPUT FORMAT:
A single line of events separated by \"|\", each as \"id:score:explanation\", highest score first.
Example: 123:95:ExxonMobil directly impacted by oil prices|456:87:Energy equities linked to rate policy
If no event scores {floor} or higher, return exactly: NONE

Response:"
        )
    }

    /// One completion per prompt, at most `workers` in flight. A rate-limited
    /// reply aborts the remaining calls.
    async fn dispatch(&self, prompts: Vec<String>) -> Result<Vec<Result<String, CompletionError>>, QueryError> {
        let count = prompts.len();
        let semaphore = Arc::new(Semaphore::new(self.settings.workers));
        let mut tasks = JoinSet::new();
        for (idx, prompt) in prompts.into_iter().enumerate() {
            let completion = Arc::clone(&self.completion);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.settings.completion_timeout;
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, Err(CompletionError::Failed("worker pool closed".to_string())));
                };
                (idx, complete_within(completion.as_ref(), &prompt, timeout).await)
            });
        }

        let mut replies: Vec<Option<Result<String, CompletionError>>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Err(CompletionError::RateLimited(message)))) => {
                    warn!(batch = idx + 1, %message, "rate limited; cancelling remaining batches");
                    tasks.abort_all();
                    return Err(QueryError::RateLimited(message));
                }
                Ok((idx, reply)) => replies[idx] = Some(reply),
                Err(err) => warn!(error = %err, "batch task did not complete"),
            }
        }

        Ok(replies
            .into_iter()
            .map(|reply| {
                reply.unwrap_or_else(|| Err(CompletionError::Failed("batch task did not complete".to_string())))
            })
            .collect())
    }

    /// Deterministic LIKE search over title and description, scored 72-95 by
    /// the number of distinct terms hit.
    pub async fn keyword_fallback(&self, keywords: &Keywords, limit: usize) -> Vec<ScoredMatch> {
        let terms = keywords.terms();
        if terms.is_empty() {
            return Vec::new();
        }
        let request = ScanRequest::active()
            .filter(Predicate::AnyContains {
                columns: vec![TextColumn::Title, TextColumn::Description],
                terms: terms.clone(),
            })
            .order_by(OrderBy::Metric(MetricField::Volume))
            .limit(limit);
        let records = match self.store.scan(&request).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "keyword fallback scan failed");
                return Vec::new();
            }
        };

        records
            .into_iter()
            .map(|record| {
                let haystack = format!(
                    "{} {}",
                    record.title,
                    record.description.as_deref().unwrap_or_default()
                )
                .to_lowercase();
                let mut matched: Vec<&str> = terms
                    .iter()
                    .map(String::as_str)
                    .filter(|term| haystack.contains(term))
                    .collect();
                matched.sort_unstable();
                matched.dedup();
                let score = (72 + matched.len().min(5) * 4).min(95) as u8;
                let reasoning = if matched.is_empty() {
                    "Direct keyword match".to_string()
                } else {
                    format!("Direct keyword match on {}", matched.join(", "))
                };
                ScoredMatch::scored(record, score, reasoning, MatchSource::KeywordFallback)
            })
            .collect()
    }
}

fn by_volume_desc(a: &MarketRecord, b: &MarketRecord) -> Ordering {
    b.volume_or_zero().total_cmp(&a.volume_or_zero())
}

/// Parse `id:score:reasoning|...` for one batch. Ids outside the batch are
/// dropped; an unreadable score becomes [`DEFAULT_SCORE`]; scores below the
/// floor are kept here and filtered at ranking time.
pub fn parse_batch_response(text: &str, batch: &[MarketRecord]) -> Vec<BatchMatch> {
    let mut body = text.trim().trim_matches(|c| c == '"' || c == '`').trim();
    if body.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    let upper = body.to_ascii_uppercase();
    for prefix in ["IDS WITH SCORES:", "IDS:"] {
        if upper.starts_with(prefix) {
            body = body[prefix.len()..].trim();
            break;
        }
    }

    let ids: HashSet<&str> = batch.iter().map(|r| r.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut matches = Vec::new();
    for triple in body.split(['|', '\n']) {
        let triple = triple.trim().trim_matches('"').trim();
        if triple.is_empty() {
            continue;
        }
        let mut parts = triple.splitn(3, ':');
        let id = parts.next().unwrap_or_default().trim().trim_matches('"');
        let score = parts
            .next()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|s| s.clamp(0, 100) as u8)
            .unwrap_or(DEFAULT_SCORE);
        let reasoning = parts
            .next()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("relevant match");

        if !ids.contains(id) || !seen.insert(id.to_string()) {
            continue;
        }
        matches.push(BatchMatch {
            id: id.to_string(),
            score,
            reasoning: reasoning.to_string(),
        });
    }
    matches
}

/// Drop semantic matches under `floor`, then order by relevance and volume.
pub fn rank(matches: Vec<ScoredMatch>, floor: u8) -> Vec<ScoredMatch> {
    let mut ranked: Vec<ScoredMatch> = matches
        .into_iter()
        .filter(|m| m.source != MatchSource::Semantic || m.relevance.unwrap_or(0) >= floor)
        .collect();
    ranked.sort_by(|a, b| {
        b.relevance
            .unwrap_or(0)
            .cmp(&a.relevance.unwrap_or(0))
            .then_with(|| by_volume_desc(&a.record, &b.record))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::KeywordExtractor;
    use async_trait::async_trait;
    use pmq_storage::StoreError;
    use std::sync::Mutex;

    fn record(id: &str, title: &str, volume: f64) -> MarketRecord {
        MarketRecord {
            volume: Some(volume),
            ..MarketRecord::new(id, title)
        }
    }

    #[derive(Default)]
    struct FixedStore {
        rows: Vec<MarketRecord>,
        scans: Mutex<Vec<ScanRequest>>,
    }

    #[async_trait]
    impl RowStore for FixedStore {
        async fn scan(&self, request: &ScanRequest) -> Result<Vec<MarketRecord>, StoreError> {
            self.scans.lock().unwrap().push(request.clone());
            Ok(self.rows.clone())
        }
    }

    /// Replies by batch label; unknown batches answer NONE.
    struct ByBatch(Vec<(&'static str, Result<&'static str, CompletionError>)>);

    #[async_trait]
    impl CompletionClient for ByBatch {
        async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
            for (needle, reply) in &self.0 {
                if prompt.contains(needle) {
                    return reply.clone().map(str::to_string);
                }
            }
            Ok("NONE".to_string())
        }
    }

    fn settings(batch_size: usize) -> ScorerSettings {
        ScorerSettings {
            batch_size,
            max_batches: 10,
            workers: 4,
            relevance_floor: 70,
            prefilter_floor: 100,
            completion_timeout: Duration::from_secs(5),
        }
    }

    fn scorer(
        replies: Vec<(&'static str, Result<&'static str, CompletionError>)>,
        store: Arc<FixedStore>,
        batch_size: usize,
    ) -> BatchSemanticScorer {
        BatchSemanticScorer::new(
            Arc::new(ByBatch(replies)),
            store,
            Arc::new(Taxonomy::default()),
            settings(batch_size),
        )
    }

    #[test]
    fn parses_triples_with_tolerance() {
        let batch = vec![record("1", "a", 1.0), record("2", "b", 1.0), record("3", "c", 1.0)];
        let parsed = parse_batch_response(
            "IDS WITH SCORES: 1:92:Direct: exact match|2:abc:unsure|999:99:hallucinated|3|1:50:dup",
            &batch,
        );
        assert_eq!(
            parsed,
            vec![
                BatchMatch { id: "1".into(), score: 92, reasoning: "Direct: exact match".into() },
                BatchMatch { id: "2".into(), score: 75, reasoning: "unsure".into() },
                BatchMatch { id: "3".into(), score: 75, reasoning: "relevant match".into() },
            ]
        );
        assert!(parse_batch_response("  \"NONE\" ", &batch).is_empty());
        assert_eq!(parse_batch_response("1:140:over", &batch)[0].score, 100);
    }

    #[test]
    fn ranking_applies_floor_to_semantic_matches_only() {
        let ranked = rank(
            vec![
                ScoredMatch::scored(record("low", "x", 900.0), 60, "weak", MatchSource::Semantic),
                ScoredMatch::scored(record("a", "x", 10.0), 88, "r", MatchSource::Semantic),
                ScoredMatch::scored(record("b", "x", 50.0), 88, "r", MatchSource::Semantic),
                ScoredMatch::scored(record("kw", "x", 1.0), 76, "kw", MatchSource::KeywordFallback),
            ],
            70,
        );
        let ids: Vec<_> = ranked.iter().map(|m| m.record.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "kw"]);
    }

    #[test]
    fn prefilter_keeps_hits_and_pads_by_volume() {
        let scorer = BatchSemanticScorer::new(
            Arc::new(ByBatch(vec![])),
            Arc::new(FixedStore::default()),
            Arc::new(Taxonomy::default()),
            ScorerSettings { prefilter_floor: 3, ..settings(10) },
        );
        let keywords = KeywordExtractor::default().extract("bitcoin price");
        let kept = scorer.prefilter(
            vec![
                record("quiet", "Will it rain", 5.0),
                record("btc", "Bitcoin above 100k", 10.0),
                record("both", "Bitcoin price on Friday", 1.0),
                record("loud", "Super Bowl winner", 500.0),
            ],
            &keywords,
        );
        let ids: Vec<_> = kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["both", "btc", "loud"]);

        let none = scorer.prefilter(vec![record("x", "Unrelated", 1.0)], &keywords);
        assert_eq!(none.len(), 1);
    }

    #[test]
    fn partition_caps_batch_count() {
        let scorer = BatchSemanticScorer::new(
            Arc::new(ByBatch(vec![])),
            Arc::new(FixedStore::default()),
            Arc::new(Taxonomy::default()),
            ScorerSettings { max_batches: 2, ..settings(2) },
        );
        let records = (0..7).map(|i| record(&i.to_string(), "t", 1.0)).collect();
        let batches = scorer.partition(records);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].id, "2");
    }

    #[tokio::test]
    async fn one_matching_batch_and_one_empty_batch() {
        let store = Arc::new(FixedStore::default());
        let scorer = scorer(vec![("BATCH 1 of 2", Ok("id1:90:reason"))], Arc::clone(&store), 2);
        let keywords = Keywords::default();
        let outcome = scorer
            .score(ScoringRequest {
                query: "anything",
                intent: "INTENT: anything",
                candidates: vec![
                    record("id1", "a", 1.0),
                    record("id2", "b", 1.0),
                    record("id3", "c", 1.0),
                    record("id4", "d", 1.0),
                ],
                keywords: &keywords,
                context: None,
                display_limit: None,
            })
            .await
            .expect("scored");

        assert_eq!(outcome.batches, 2);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].record.id, "id1");
        assert_eq!(outcome.matches[0].relevance, Some(90));
        assert!(!outcome.fallback_used);
    }

    #[tokio::test]
    async fn duplicate_ids_across_batches_keep_the_first() {
        let store = Arc::new(FixedStore::default());
        let scorer = scorer(
            vec![("BATCH 1 of 2", Ok("dup:80:first")), ("BATCH 2 of 2", Ok("dup:99:second"))],
            store,
            1,
        );
        let keywords = Keywords::default();
        let outcome = scorer
            .score(ScoringRequest {
                query: "q",
                intent: "i",
                candidates: vec![record("dup", "a", 1.0), record("dup", "a", 1.0)],
                keywords: &keywords,
                context: None,
                display_limit: None,
            })
            .await
            .expect("scored");
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].reasoning.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn rate_limit_aborts_without_fallback() {
        let store = Arc::new(FixedStore {
            rows: vec![record("kw", "Fed decision", 1.0)],
            ..Default::default()
        });
        let scorer = scorer(
            vec![("BATCH", Err(CompletionError::RateLimited("429".into())))],
            Arc::clone(&store),
            1,
        );
        let keywords = KeywordExtractor::default().extract("fed decision");
        let err = scorer
            .score(ScoringRequest {
                query: "fed decision",
                intent: "i",
                candidates: vec![record("a", "Fed decision", 1.0), record("b", "Fed chair", 1.0)],
                keywords: &keywords,
                context: None,
                display_limit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::RateLimited(_)));
        assert!(store.scans.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sparse_results_pull_in_keyword_fallback() {
        let store = Arc::new(FixedStore {
            rows: vec![MarketRecord {
                description: Some("Federal Reserve decision in March".into()),
                ..record("kw", "Fed rates cut by 50bps", 40.0)
            }],
            ..Default::default()
        });
        let scorer = scorer(vec![], Arc::clone(&store), 10);
        let keywords = KeywordExtractor::default().extract("fed rates");
        let outcome = scorer
            .score(ScoringRequest {
                query: "fed rates",
                intent: "i",
                candidates: vec![record("a", "Unrelated", 1.0)],
                keywords: &keywords,
                context: None,
                display_limit: Some(3),
            })
            .await
            .expect("scored");

        assert!(outcome.fallback_used);
        let only = &outcome.matches[0];
        assert_eq!(only.source, MatchSource::KeywordFallback);
        // "fed", "rates", "fed rates" all hit
        assert_eq!(only.relevance, Some(84));
        assert_eq!(only.reasoning.as_deref(), Some("Direct keyword match on fed, fed rates, rates"));
        let scans = store.scans.lock().unwrap();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].limit, Some(15));
    }

    #[tokio::test]
    async fn weak_semantic_score_yields_to_keyword_fallback() {
        let store = Arc::new(FixedStore {
            rows: vec![record("kw", "Fed rates decision", 40.0)],
            ..Default::default()
        });
        let scorer = scorer(vec![("BATCH 1 of 1", Ok("kw:50:weak link"))], Arc::clone(&store), 10);
        let keywords = KeywordExtractor::default().extract("fed rates");
        let outcome = scorer
            .score(ScoringRequest {
                query: "fed rates",
                intent: "i",
                candidates: vec![record("kw", "Fed rates decision", 40.0)],
                keywords: &keywords,
                context: None,
                display_limit: None,
            })
            .await
            .expect("scored");

        assert!(outcome.fallback_used);
        assert_eq!(outcome.matches.len(), 1);
        let only = &outcome.matches[0];
        assert_eq!(only.record.id, "kw");
        assert_eq!(only.source, MatchSource::KeywordFallback);
        assert_eq!(only.relevance, Some(84));
    }

    #[tokio::test]
    async fn qualifying_semantic_score_is_not_replaced_by_fallback() {
        let store = Arc::new(FixedStore {
            rows: vec![record("kw", "Fed rates decision", 40.0)],
            ..Default::default()
        });
        let scorer = scorer(vec![("BATCH 1 of 1", Ok("kw:91:on point"))], Arc::clone(&store), 10);
        let keywords = KeywordExtractor::default().extract("fed rates");
        let outcome = scorer
            .score(ScoringRequest {
                query: "fed rates",
                intent: "i",
                candidates: vec![record("kw", "Fed rates decision", 40.0)],
                keywords: &keywords,
                context: None,
                display_limit: None,
            })
            .await
            .expect("scored");

        assert!(!outcome.fallback_used);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].source, MatchSource::Semantic);
        assert_eq!(outcome.matches[0].relevance, Some(91));
    }

    #[tokio::test]
    async fn every_batch_failing_without_fallback_is_an_error() {
        let scorer = scorer(
            vec![("BATCH", Err(CompletionError::Failed("boom".into())))],
            Arc::new(FixedStore::default()),
            1,
        );
        let keywords = Keywords::default();
        let err = scorer
            .score(ScoringRequest {
                query: "q",
                intent: "i",
                candidates: vec![record("a", "x", 1.0), record("b", "y", 1.0)],
                keywords: &keywords,
                context: None,
                display_limit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ScoringFailed(_)));
    }

    #[tokio::test]
    async fn one_failed_batch_is_absorbed() {
        let scorer = scorer(
            vec![
                ("BATCH 1 of 2", Err(CompletionError::Timeout { secs: 30 })),
                ("BATCH 2 of 2", Ok("b:85:good")),
            ],
            Arc::new(FixedStore::default()),
            1,
        );
        let keywords = Keywords::default();
        let outcome = scorer
            .score(ScoringRequest {
                query: "q",
                intent: "i",
                candidates: vec![record("a", "x", 1.0), record("b", "y", 1.0)],
                keywords: &keywords,
                context: None,
                display_limit: None,
            })
            .await
            .expect("scored");
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.matches[0].record.id, "b");
    }
}
