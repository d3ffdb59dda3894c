//! Natural-language query engine over the prediction-market replica.
//!
//! A query is analyzed into a [`pmq_core::Strategy`], executed as a direct
//! scan, a batched semantic scoring pass, or a multi-category comparison, and
//! rendered by [`ResultFormatter`].

pub mod analyzer;
pub mod comparison;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod formatter;
pub mod keywords;
pub mod orchestrator;
pub mod rewriter;
pub mod scorer;
pub mod taxonomy;

pub use analyzer::StrategyAnalyzer;
pub use comparison::{CategorySummary, ComparisonExecutor, ComparisonReport};
pub use completion::{CompletionClient, ContextSearch, GeminiClient, PerplexitySearch};
pub use config::EngineConfig;
pub use context::{ContextGatherer, GatheredContext};
pub use error::{CompletionError, QueryError, RewriteError};
pub use formatter::{FormattedResult, ResultFormatter};
pub use keywords::{KeywordExtractor, Keywords};
pub use orchestrator::{QueryOrchestrator, QueryOutcome};
pub use rewriter::{SafeScan, SqlSafetyRewriter};
pub use scorer::{BatchSemanticScorer, ScorerSettings, ScoringOutcome, ScoringRequest};
pub use taxonomy::Taxonomy;

pub const CRATE_NAME: &str = "pmq-engine";
