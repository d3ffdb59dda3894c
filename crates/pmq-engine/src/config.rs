use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub read_db: PathBuf,
    pub batch_size: usize,
    pub max_batches: usize,
    pub batch_workers: usize,
    pub relevance_floor: u8,
    pub display_limit: usize,
    pub reasoning_limit: usize,
    pub prefilter_floor: usize,
    pub prefilter_scan_limit: usize,
    pub scan_escalation_threshold: usize,
    pub comparison_sample: usize,
    pub completion_timeout: Duration,
    pub taxonomy_path: Option<PathBuf>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub perplexity_api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_db: PathBuf::from("polymarket_read.db"),
            batch_size: 200,
            max_batches: 10,
            batch_workers: 4,
            relevance_floor: 70,
            display_limit: 20,
            reasoning_limit: 10,
            prefilter_floor: 100,
            prefilter_scan_limit: 600,
            scan_escalation_threshold: 10,
            comparison_sample: 10,
            completion_timeout: Duration::from_secs(30),
            taxonomy_path: None,
            gemini_api_key: None,
            gemini_model: "gemini-1.5-flash".to_string(),
            perplexity_api_key: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            read_db: std::env::var("PMQ_READ_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.read_db),
            batch_size: env_usize("PMQ_BATCH_SIZE", defaults.batch_size).max(1),
            max_batches: env_usize("PMQ_MAX_BATCHES", defaults.max_batches).max(1),
            batch_workers: env_usize("PMQ_BATCH_WORKERS", defaults.batch_workers).max(1),
            relevance_floor: env_usize("PMQ_RELEVANCE_FLOOR", defaults.relevance_floor.into())
                .min(100) as u8,
            display_limit: env_usize("PMQ_DISPLAY_LIMIT", defaults.display_limit).max(1),
            reasoning_limit: env_usize("PMQ_REASONING_LIMIT", defaults.reasoning_limit),
            prefilter_floor: env_usize("PMQ_PREFILTER_FLOOR", defaults.prefilter_floor),
            prefilter_scan_limit: defaults.prefilter_scan_limit,
            scan_escalation_threshold: env_usize(
                "PMQ_SCAN_ESCALATION_THRESHOLD",
                defaults.scan_escalation_threshold,
            ),
            comparison_sample: env_usize("PMQ_COMPARISON_SAMPLE", defaults.comparison_sample).max(1),
            completion_timeout: Duration::from_secs(
                env_usize("PMQ_COMPLETION_TIMEOUT_SECS", 30).max(1) as u64,
            ),
            taxonomy_path: non_empty_var("PMQ_TAXONOMY_PATH").map(PathBuf::from),
            gemini_api_key: non_empty_var("GEMINI_API_KEY"),
            gemini_model: non_empty_var("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            perplexity_api_key: non_empty_var("PERPLEXITY_API_KEY"),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_batches, 10);
        assert_eq!(config.batch_workers, 4);
        assert_eq!(config.relevance_floor, 70);
        assert_eq!(config.display_limit, 20);
    }
}
