use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "does", "do", "for", "from", "how",
    "if", "in", "is", "it", "its", "more", "of", "on", "or", "than", "that", "the", "their",
    "them", "then", "there", "they", "this", "to", "was", "what", "when", "where", "which", "who",
    "will", "with", "would", "markets", "market", "affected", "top", "best", "highest", "lowest",
    "about", "show", "list", "give",
];

/// Tokens shorter than three characters that still carry meaning.
const SHORT_KEYWORDS: &[&str] = &["ai", "uk", "us", "eu", "ufc", "nba", "nfl", "mlb"];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[a-z0-9']+").expect("static token pattern"))
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keywords {
    /// Most frequent first, ties in query order.
    pub tokens: Vec<String>,
    pub phrases: Vec<String>,
}

impl Keywords {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.phrases.is_empty()
    }

    /// Tokens followed by phrases.
    pub fn terms(&self) -> Vec<String> {
        self.tokens.iter().chain(self.phrases.iter()).cloned().collect()
    }

    /// Prefilter weight of a lowercased haystack: 2 per token hit, 3 per phrase hit.
    pub fn hit_score(&self, haystack: &str) -> u32 {
        let tokens = self.tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
        let phrases = self.phrases.iter().filter(|p| haystack.contains(p.as_str())).count();
        (tokens * 2 + phrases * 3) as u32
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeywordExtractor {
    max_keywords: usize,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self { max_keywords: 12 }
    }
}

impl KeywordExtractor {
    pub fn new(max_keywords: usize) -> Self {
        Self {
            max_keywords: max_keywords.max(1),
        }
    }

    pub fn extract(&self, query: &str) -> Keywords {
        let lowered = query.to_lowercase();
        let tokens: Vec<&str> = token_pattern()
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .collect();

        let mut counted: Vec<(&str, usize)> = Vec::new();
        for token in &tokens {
            if token.len() < 3 && !SHORT_KEYWORDS.contains(token) {
                continue;
            }
            if is_stopword(token) {
                continue;
            }
            match counted.iter_mut().find(|(seen, _)| *seen == *token) {
                Some((_, count)) => *count += 1,
                None => counted.push((*token, 1)),
            }
        }
        // stable: equal counts keep first-seen order
        counted.sort_by(|a, b| b.1.cmp(&a.1));
        let ranked = counted
            .into_iter()
            .take(self.max_keywords)
            .map(|(token, _)| token.to_string())
            .collect();

        let mut seen = HashSet::new();
        let phrases = tokens
            .windows(2)
            .filter(|pair| !(is_stopword(pair[0]) && is_stopword(pair[1])))
            .filter(|pair| pair[0].len() + pair[1].len() >= 5)
            .map(|pair| format!("{} {}", pair[0], pair[1]))
            .filter(|phrase| seen.insert(phrase.clone()))
            .take((self.max_keywords / 2).max(4))
            .collect();

        Keywords {
            tokens: ranked,
            phrases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_stopwords_and_short_tokens_but_keeps_known_acronyms() {
        let keywords = KeywordExtractor::default().extract("Which NBA markets will be affected by AI in the US?");
        assert_eq!(keywords.tokens, vec!["nba", "ai", "us"]);
    }

    #[test]
    fn ranks_repeated_tokens_first() {
        let keywords = KeywordExtractor::default().extract("election odds, trump election, senate election");
        assert_eq!(keywords.tokens[0], "election");
        assert_eq!(&keywords.tokens[1..], ["odds", "trump", "senate"]);
    }

    #[test]
    fn bigrams_skip_stopword_pairs_and_tiny_pairs() {
        let keywords = KeywordExtractor::default().extract("fed rate cut in the december meeting");
        assert!(keywords.phrases.contains(&"fed rate".to_string()));
        assert!(keywords.phrases.contains(&"rate cut".to_string()));
        assert!(!keywords.phrases.contains(&"in the".to_string()));
        assert!(keywords.phrases.len() <= 6);
    }

    #[test]
    fn caps_token_count() {
        let keywords = KeywordExtractor::new(2).extract("alpha beta gamma delta");
        assert_eq!(keywords.tokens, vec!["alpha", "beta"]);
        assert_eq!(keywords.phrases.len(), 3);
    }

    #[test]
    fn hit_score_weights_phrases_higher() {
        let keywords = KeywordExtractor::default().extract("bitcoin price");
        let haystack = "will the bitcoin price close above 100k";
        assert_eq!(keywords.hit_score(haystack), 2 + 2 + 3);
        assert_eq!(keywords.hit_score("ethereum staking"), 0);
    }

    #[test]
    fn empty_query_yields_nothing() {
        assert!(KeywordExtractor::default().extract("  ").is_empty());
    }
}
