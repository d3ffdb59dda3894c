use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::CompletionError;

/// Language-model completion: prompt in, text out.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// External search context for a set of subqueries. `Ok(None)` means nothing
/// useful was found.
#[async_trait]
pub trait ContextSearch: Send + Sync {
    async fn search(&self, queries: &[String]) -> Result<Option<String>, CompletionError>;
}

/// One completion call bounded by `timeout`.
pub async fn complete_within(
    client: &dyn CompletionClient,
    prompt: &str,
    timeout: Duration,
) -> Result<String, CompletionError> {
    match tokio::time::timeout(timeout, client.complete(prompt)).await {
        Ok(result) => result,
        Err(_) => Err(CompletionError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

pub fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    let message = format!("http status {}: {}", status.as_u16(), truncate(body, 300));
    if status == StatusCode::TOO_MANY_REQUESTS {
        CompletionError::RateLimited(message)
    } else {
        CompletionError::from_message(message)
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, timeout: Duration) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout {
            secs: timeout.as_secs(),
        }
    } else {
        CompletionError::from_message(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn build_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout)
        .user_agent(concat!("pmq/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building reqwest client")
}

/// Gemini `generateContent` over HTTPS.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    timeout: Duration,
}

impl GeminiClient {
    pub const DEFAULT_ENDPOINT: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            timeout,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl CompletionClient for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        );
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| CompletionError::Failed(format!("invalid completion body: {err}")))?;
        let text = gemini_text(&payload).ok_or_else(|| {
            CompletionError::Failed("completion response carried no text".to_string())
        })?;
        debug!(model = %self.model, chars = text.len(), "completion received");
        Ok(text)
    }
}

fn gemini_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Perplexity search API, rendered into plain context lines.
#[derive(Debug, Clone)]
pub struct PerplexitySearch {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    max_results: usize,
    timeout: Duration,
}

impl PerplexitySearch {
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.perplexity.ai/search";

    pub fn new(api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            api_key: api_key.into(),
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            max_results: 5,
            timeout,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ContextSearch for PerplexitySearch {
    async fn search(&self, queries: &[String]) -> Result<Option<String>, CompletionError> {
        let queries: Vec<String> = queries
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if queries.is_empty() {
            return Ok(None);
        }

        let query_field = if queries.len() == 1 {
            json!(queries[0])
        } else {
            json!(queries)
        };
        let body = json!({
            "query": query_field,
            "max_results": self.max_results,
            "num_results": self.max_results,
            "include_answer": true,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| CompletionError::Failed(format!("invalid search body: {err}")))?;

        let context = render_search_context(&payload, &queries, self.max_results);
        if let Some(text) = &context {
            info!(
                lines = text.lines().count(),
                queries = queries.len(),
                "gathered search context"
            );
        }
        Ok(context)
    }
}

/// Flatten a search response into "Summary" and "- snippet (Source: title)"
/// lines, grouped per query when several were sent.
pub fn render_search_context(payload: &Value, queries: &[String], max_results: usize) -> Option<String> {
    let label_for = |idx: usize| {
        queries
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Query {}", idx + 1))
    };
    let mut lines = Vec::new();

    match payload.get("answers").or_else(|| payload.get("answer")) {
        Some(Value::Array(answers)) => {
            for (idx, answer) in answers.iter().enumerate() {
                if let Some(text) = answer.as_str().map(str::trim).filter(|t| !t.is_empty()) {
                    lines.push(format!("Summary ({}): {text}", label_for(idx)));
                }
            }
        }
        Some(Value::String(answer)) if !answer.trim().is_empty() => {
            lines.push(format!("Summary: {}", answer.trim()));
        }
        _ => {}
    }

    let mut grouped: Vec<(String, &Vec<Value>)> = Vec::new();
    match payload.get("results").or_else(|| payload.get("top_results")) {
        Some(Value::Array(items)) if !items.is_empty() && items.iter().all(Value::is_array) => {
            for (idx, item) in items.iter().enumerate() {
                if let Value::Array(results) = item {
                    grouped.push((label_for(idx), results));
                }
            }
        }
        Some(Value::Array(items)) => grouped.push((label_for(0), items)),
        Some(Value::Object(map)) => {
            for (key, value) in map {
                if let Value::Array(results) = value {
                    let label = key
                        .parse::<usize>()
                        .ok()
                        .and_then(|n| n.checked_sub(1))
                        .and_then(|idx| queries.get(idx).cloned())
                        .unwrap_or_else(|| key.clone());
                    grouped.push((label, results));
                }
            }
        }
        _ => {}
    }

    for (label, results) in grouped {
        if queries.len() > 1 {
            lines.push(format!("Query focus: {label}"));
        }
        let snippets = results.iter().filter_map(|result| {
            let snippet = ["snippet", "text", "content"]
                .iter()
                .find_map(|key| result.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty())?;
            let title = ["title", "source", "url"]
                .iter()
                .find_map(|key| result.get(*key).and_then(Value::as_str));
            Some(match title {
                Some(title) => format!("- {snippet} (Source: {title})"),
                None => format!("- {snippet}"),
            })
        });
        lines.extend(snippets.take(max_results));
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl CompletionClient for Slow {
        async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_completions_time_out() {
        let err = complete_within(&Slow, "p", Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err, CompletionError::Timeout { secs: 2 });
    }

    #[test]
    fn too_many_requests_is_rate_limited() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_rate_limited());
        assert!(classify_status(StatusCode::FORBIDDEN, "Quota exceeded").is_rate_limited());
        assert!(!classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom").is_rate_limited());
    }

    #[test]
    fn gemini_parts_are_joined() {
        let payload = json!({
            "candidates": [{ "content": { "parts": [{ "text": "STRATEGY: " }, { "text": "SQL\n" }] } }]
        });
        assert_eq!(gemini_text(&payload).as_deref(), Some("STRATEGY: SQL"));
        assert_eq!(gemini_text(&json!({ "candidates": [] })), None);
    }

    #[test]
    fn search_context_groups_results_per_query() {
        let queries = vec!["fed rate cut".to_string(), "cpi print".to_string()];
        let payload = json!({
            "answer": "Markets expect a cut.",
            "results": [
                [{ "snippet": "Fed signals easing", "title": "Reuters" }],
                [{ "text": "CPI cooled in May" }, { "title": "no snippet" }]
            ]
        });
        let text = render_search_context(&payload, &queries, 5).expect("context");
        assert_eq!(
            text,
            "Summary: Markets expect a cut.\n\
             Query focus: fed rate cut\n\
             - Fed signals easing (Source: Reuters)\n\
             Query focus: cpi print\n\
             - CPI cooled in May"
        );
    }

    #[test]
    fn empty_search_payload_has_no_context() {
        assert_eq!(render_search_context(&json!({}), &["q".to_string()], 5), None);
    }
}
