use std::sync::Arc;

use anyhow::Context;
use pmq_core::{MarketRecord, MetricField, QueryAnalysis, ScoredMatch, Strategy, StructuredRecord};
use pmq_storage::{
    OrderBy, Predicate, ReplicaGuard, RowStore, ScanRequest, SqliteRowStore, StoreError, TextColumn,
};
use serde::{Serialize, Serializer};
use tracing::{field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::analyzer::{is_simple_data_query, is_simple_metric_query, StrategyAnalyzer};
use crate::comparison::ComparisonExecutor;
use crate::completion::{CompletionClient, ContextSearch, GeminiClient, PerplexitySearch};
use crate::config::EngineConfig;
use crate::context::{ContextGatherer, GatheredContext};
use crate::error::QueryError;
use crate::formatter::{FormattedResult, ResultFormatter};
use crate::keywords::{KeywordExtractor, Keywords};
use crate::rewriter::SqlSafetyRewriter;
use crate::scorer::{BatchSemanticScorer, ScorerSettings, ScoringRequest};
use crate::taxonomy::Taxonomy;

/// Everything a caller gets back from one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub display_text: String,
    pub records: Vec<StructuredRecord>,
    pub strategy_used: Strategy,
    /// Matches before display truncation.
    pub total_matches: usize,
    pub context_queries: Vec<String>,
    #[serde(serialize_with = "error_message")]
    pub error: Option<QueryError>,
}

impl QueryOutcome {
    fn success(strategy: Strategy, formatted: FormattedResult, total_matches: usize) -> Self {
        Self {
            display_text: formatted.display_text,
            records: formatted.records,
            strategy_used: strategy,
            total_matches,
            context_queries: Vec::new(),
            error: None,
        }
    }

    fn failed(strategy: Strategy, error: QueryError) -> Self {
        Self {
            display_text: error.to_string(),
            records: Vec::new(),
            strategy_used: strategy,
            total_matches: 0,
            context_queries: Vec::new(),
            error: Some(error),
        }
    }

    fn with_context_queries(mut self, queries: Vec<String>) -> Self {
        self.context_queries = queries;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

fn error_message<S: Serializer>(error: &Option<QueryError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Per-query values shared by every execution path.
struct Plan<'a> {
    query: &'a str,
    analysis: &'a QueryAnalysis,
    keywords: &'a Keywords,
    metric: MetricField,
    display_limit: usize,
}

pub struct QueryOrchestrator {
    config: EngineConfig,
    taxonomy: Arc<Taxonomy>,
    store: Arc<dyn RowStore>,
    completion: Arc<dyn CompletionClient>,
    analyzer: StrategyAnalyzer,
    extractor: KeywordExtractor,
    scorer: BatchSemanticScorer,
    comparison: ComparisonExecutor,
    formatter: ResultFormatter,
    context: Option<ContextGatherer>,
}

impl QueryOrchestrator {
    pub fn new(
        config: EngineConfig,
        taxonomy: Arc<Taxonomy>,
        store: Arc<dyn RowStore>,
        completion: Arc<dyn CompletionClient>,
    ) -> Self {
        let timeout = config.completion_timeout;
        Self {
            analyzer: StrategyAnalyzer::new(Arc::clone(&completion), Arc::clone(&taxonomy), timeout),
            extractor: KeywordExtractor::default(),
            scorer: BatchSemanticScorer::new(
                Arc::clone(&completion),
                Arc::clone(&store),
                Arc::clone(&taxonomy),
                ScorerSettings::from(&config),
            ),
            comparison: ComparisonExecutor::new(
                Arc::clone(&completion),
                Arc::clone(&store),
                config.comparison_sample,
                timeout,
            ),
            formatter: ResultFormatter::new(taxonomy.link_base.clone(), config.reasoning_limit),
            context: None,
            config,
            taxonomy,
            store,
            completion,
        }
    }

    /// Attach external search context to semantic and comparison queries.
    pub fn with_search(mut self, search: Arc<dyn ContextSearch>) -> Self {
        self.context = Some(ContextGatherer::new(
            Arc::clone(&self.completion),
            search,
            self.config.completion_timeout,
        ));
        self
    }

    /// Gemini completions over the SQLite replica named by the environment,
    /// with Perplexity context when a key is present.
    pub async fn from_env(guard: ReplicaGuard) -> anyhow::Result<Self> {
        let config = EngineConfig::from_env();
        let taxonomy = Taxonomy::load_or_default(config.taxonomy_path.as_deref()).await?;
        let api_key = config
            .gemini_api_key
            .clone()
            .context("GEMINI_API_KEY is not set")?;
        let completion = GeminiClient::new(api_key, &config.gemini_model, config.completion_timeout)?;
        let store = SqliteRowStore::new(&config.read_db, guard);
        let search = match &config.perplexity_api_key {
            Some(key) => Some(PerplexitySearch::new(key, config.completion_timeout)?),
            None => None,
        };

        let orchestrator = Self::new(config, Arc::new(taxonomy), Arc::new(store), Arc::new(completion));
        Ok(match search {
            Some(search) => orchestrator.with_search(Arc::new(search)),
            None => orchestrator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Answer one natural-language query. Failures are reported in
    /// [`QueryOutcome::error`] with a user-facing `display_text`.
    pub async fn process_query(&self, query: &str) -> QueryOutcome {
        let query_id = Uuid::new_v4();
        let span = info_span!("process_query", %query_id, strategy = field::Empty);
        let query = query.trim();

        async {
            let keywords = self.extractor.extract(query);
            let analysis = self.analyzer.analyze(query).await;
            tracing::Span::current().record("strategy", analysis.strategy.as_str());
            info!(
                strategy = %analysis.strategy,
                domains = ?analysis.domain_filter,
                limit = ?analysis.display_limit,
                keywords = ?keywords.tokens,
                "query analyzed"
            );

            let plan = Plan {
                query,
                analysis: &analysis,
                keywords: &keywords,
                metric: MetricField::detect(query),
                display_limit: analysis.display_limit.unwrap_or(self.config.display_limit).max(1),
            };

            let outcome = match analysis.strategy {
                Strategy::Scan => match self.scan(&plan).await {
                    Ok(Some(outcome)) => outcome,
                    Ok(None) => self.semantic(&plan).await,
                    Err(err) => QueryOutcome::failed(Strategy::Scan, err),
                },
                Strategy::Semantic => self.semantic(&plan).await,
                Strategy::Compare if analysis.comparisons.is_empty() => {
                    warn!("comparison without categories; using semantic scoring");
                    self.semantic(&plan).await
                }
                Strategy::Compare => self.compare(&plan).await,
            };

            match &outcome.error {
                Some(err) => warn!(error = %err, strategy = %outcome.strategy_used, "query failed"),
                None => info!(
                    strategy = %outcome.strategy_used,
                    total = outcome.total_matches,
                    shown = outcome.records.len(),
                    "query answered"
                ),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// `Ok(None)` means the scan could not stand alone and the query moves to
    /// semantic scoring.
    async fn scan(&self, plan: &Plan<'_>) -> Result<Option<QueryOutcome>, QueryError> {
        let request = match plan.analysis.filter_expr.as_deref() {
            Some(sql) => match SqlSafetyRewriter::new(plan.metric).rewrite(sql, plan.query) {
                Ok(safe) => {
                    info!(sql = %safe.sql, "filter rewritten");
                    safe.into_request()
                }
                Err(err) => {
                    warn!(error = %err, "filter rejected; escalating to semantic scoring");
                    return Ok(None);
                }
            },
            None => ScanRequest::active().order_by(OrderBy::Metric(plan.metric)),
        };

        let rows = match self.store.scan(&request).await {
            Ok(rows) => rows,
            Err(err @ StoreError::Unavailable { .. }) => return Err(err.into()),
            Err(StoreError::InvalidQuery(message)) => {
                warn!(%message, "filter failed in store; escalating to semantic scoring");
                return Ok(None);
            }
        };

        let stands_alone = !rows.is_empty() && is_simple_data_query(plan.query);
        if rows.len() < self.config.scan_escalation_threshold && !stands_alone {
            info!(rows = rows.len(), "sparse scan; escalating to semantic scoring");
            return Ok(None);
        }

        let matches: Vec<ScoredMatch> = rows.into_iter().map(ScoredMatch::unscored).collect();
        let total = matches.len();
        let formatted = self.formatter.render(&matches, total, plan.display_limit);
        Ok(Some(QueryOutcome::success(Strategy::Scan, formatted, total)))
    }

    async fn semantic(&self, plan: &Plan<'_>) -> QueryOutcome {
        let context = self.gather_context(plan).await;
        let outcome = match self.semantic_inner(plan, context.text.as_deref()).await {
            Ok(outcome) => outcome,
            Err(err) => QueryOutcome::failed(Strategy::Semantic, err),
        };
        outcome.with_context_queries(context.queries)
    }

    async fn semantic_inner(&self, plan: &Plan<'_>, context: Option<&str>) -> Result<QueryOutcome, QueryError> {
        let candidates = self.candidates(plan).await?;
        if candidates.is_empty() {
            return Ok(QueryOutcome::success(Strategy::Semantic, self.formatter.no_candidates(), 0));
        }

        let scored = self
            .scorer
            .score(ScoringRequest {
                query: plan.query,
                intent: &plan.analysis.intent,
                candidates,
                keywords: plan.keywords,
                context,
                display_limit: plan.analysis.display_limit,
            })
            .await?;
        if scored.matches.is_empty() {
            return Ok(QueryOutcome::success(
                Strategy::Semantic,
                self.formatter.no_matches(plan.query),
                0,
            ));
        }

        let total = scored.matches.len();
        let formatted = self.formatter.render(&scored.matches, total, plan.display_limit);
        Ok(QueryOutcome::success(Strategy::Semantic, formatted, total))
    }

    /// SQL prefilter when the query names domains or keywords, else the
    /// domain-filtered active set, else every active market.
    async fn candidates(&self, plan: &Plan<'_>) -> Result<Vec<MarketRecord>, QueryError> {
        let domains = self.taxonomy.domain_names(&plan.analysis.domain_filter);
        let order = OrderBy::Metric(plan.metric);

        if !is_simple_metric_query(plan.query) && (!domains.is_empty() || !plan.keywords.is_empty()) {
            let mut request = ScanRequest::active();
            if !domains.is_empty() {
                request = request.filter(Predicate::DomainIn(domains.clone()));
            }
            if let Some(matcher) = keyword_matcher(plan.keywords) {
                request = request.filter(matcher);
            }
            let rows = self
                .store
                .scan(&request.order_by(order.clone()).limit(self.config.prefilter_scan_limit))
                .await?;
            if !rows.is_empty() {
                info!(rows = rows.len(), "sql prefilter supplied candidates");
                return Ok(rows);
            }
            info!("sql prefilter returned no candidates");
        }

        if !domains.is_empty() {
            let rows = self
                .store
                .scan(
                    &ScanRequest::active()
                        .filter(Predicate::DomainIn(domains))
                        .order_by(order.clone()),
                )
                .await?;
            if !rows.is_empty() {
                return Ok(rows);
            }
            info!("no candidates in the selected domains; using every active market");
        }

        Ok(self.store.scan(&ScanRequest::active().order_by(order)).await?)
    }

    async fn compare(&self, plan: &Plan<'_>) -> QueryOutcome {
        let context = self.gather_context(plan).await;
        let rewriter = SqlSafetyRewriter::new(plan.metric);
        let outcome = match self
            .comparison
            .execute(
                &plan.analysis.comparisons,
                &rewriter,
                plan.query,
                context.text.as_deref(),
                plan.analysis.display_limit,
            )
            .await
        {
            Ok(report) => {
                let total = report.total_rows();
                QueryOutcome {
                    records: report
                        .matches
                        .iter()
                        .map(|m| StructuredRecord::from_match(m, &self.taxonomy.link_base))
                        .collect(),
                    display_text: report.display_text,
                    strategy_used: Strategy::Compare,
                    total_matches: total,
                    context_queries: Vec::new(),
                    error: None,
                }
            }
            Err(err) => QueryOutcome::failed(Strategy::Compare, err),
        };
        outcome.with_context_queries(context.queries)
    }

    async fn gather_context(&self, plan: &Plan<'_>) -> GatheredContext {
        match &self.context {
            Some(gatherer) => gatherer.gather(plan.query, &plan.analysis.intent).await,
            None => GatheredContext::default(),
        }
    }
}

/// Tokens over title and taxonomy columns, phrases over the title.
fn keyword_matcher(keywords: &Keywords) -> Option<Predicate> {
    let mut parts = Vec::new();
    if !keywords.tokens.is_empty() {
        parts.push(Predicate::AnyContains {
            columns: vec![
                TextColumn::Title,
                TextColumn::Slug,
                TextColumn::Domain,
                TextColumn::Section,
                TextColumn::Subsection,
            ],
            terms: keywords.tokens.clone(),
        });
    }
    if !keywords.phrases.is_empty() {
        parts.push(Predicate::AnyContains {
            columns: vec![TextColumn::Title],
            terms: keywords.phrases.clone(),
        });
    }
    (!parts.is_empty()).then_some(Predicate::Any(parts))
}
