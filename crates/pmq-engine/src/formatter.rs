use pmq_core::{market_url, ScoredMatch, StructuredRecord};
use serde::Serialize;

/// Display text plus the normalized records behind it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormattedResult {
    pub display_text: String,
    pub records: Vec<StructuredRecord>,
}

#[derive(Debug, Clone)]
pub struct ResultFormatter {
    link_base: String,
    reasoning_limit: usize,
}

impl ResultFormatter {
    pub fn new(link_base: impl Into<String>, reasoning_limit: usize) -> Self {
        Self {
            link_base: link_base.into(),
            reasoning_limit,
        }
    }

    /// Render the first `display_limit` of `matches`. `total` is the
    /// full match count reported in the header.
    pub fn render(&self, matches: &[ScoredMatch], total: usize, display_limit: usize) -> FormattedResult {
        let shown = &matches[..matches.len().min(display_limit)];
        let header = if total > shown.len() {
            format!("Found {total} markets (showing top {}):", shown.len())
        } else {
            format!("Found {total} market{}:", if total == 1 { "" } else { "s" })
        };

        let mut blocks = Vec::with_capacity(shown.len() + 1);
        blocks.push(header);
        blocks.extend(
            shown
                .iter()
                .enumerate()
                .map(|(idx, scored)| self.render_item(idx + 1, scored)),
        );

        FormattedResult {
            display_text: blocks.join("\n\n"),
            records: shown
                .iter()
                .map(|scored| StructuredRecord::from_match(scored, &self.link_base))
                .collect(),
        }
    }

    fn render_item(&self, rank: usize, scored: &ScoredMatch) -> String {
        let record = &scored.record;
        let mut line = format!("{rank}. **{}**", record.title);
        if let Some(score) = scored.relevance {
            match scored.reasoning.as_deref().filter(|r| !r.is_empty()) {
                Some(reasoning) if rank <= self.reasoning_limit => {
                    line.push_str(&format!(" (Relevance: {score}/100 - {reasoning})"));
                }
                _ => line.push_str(&format!(" (Relevance: {score}/100)")),
            }
        }
        if let Some(volume) = record.volume.filter(|v| *v != 0.0 && v.is_finite()) {
            line.push_str(&format!("\n   - Volume: ${}", dollars(volume, 0)));
        }
        if let Some(liquidity) = record.liquidity.filter(|v| *v != 0.0 && v.is_finite()) {
            line.push_str(&format!("\n   - Liquidity: ${}", dollars(liquidity, 2)));
        }
        if let Some(domain) = record.domain.as_deref().filter(|d| !d.is_empty()) {
            line.push_str(&format!("\n   - Category: {domain}"));
        }
        line.push_str(&format!(
            "\n   - 🔗 Link: {}",
            market_url(&self.link_base, record.slug.as_deref(), &record.id)
        ));
        line
    }

    pub fn no_candidates(&self) -> FormattedResult {
        FormattedResult {
            display_text: "No active events found.".to_string(),
            records: Vec::new(),
        }
    }

    pub fn no_matches(&self, query: &str) -> FormattedResult {
        FormattedResult {
            display_text: format!("No relevant events found for: {query}"),
            records: Vec::new(),
        }
    }
}

/// `1234567.891` with 2 decimals -> `1,234,567.89`.
pub fn dollars(value: f64, decimals: usize) -> String {
    let fixed = format!("{:.*}", decimals, value.abs());
    let (whole, fraction) = match fixed.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (fixed.as_str(), None),
    };

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (idx, digit) in whole.chars().enumerate() {
        if idx > 0 && (whole.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if value < 0.0 && fixed.chars().any(|c| c != '0' && c != '.') {
        "-"
    } else {
        ""
    };
    match fraction {
        Some(fraction) => format!("{sign}{grouped}.{fraction}"),
        None => format!("{sign}{grouped}"),
    }
}
