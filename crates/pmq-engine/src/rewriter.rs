//! Vetting of analyzer-proposed SELECT statements.
//!
//! The analyzer's SQL is untrusted text. Only a single read-only selection over
//! `events` survives; its WHERE and ORDER BY clauses are extracted and handed to
//! the row store, which always projects the full record column set. Limits are
//! stripped because the orchestrator owns result sizing.

use pmq_core::MetricField;
use pmq_storage::{OrderBy, Predicate, ScanRequest};

use crate::error::RewriteError;

const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "ATTACH", "DETACH", "PRAGMA",
    "VACUUM", "REINDEX", "TRUNCATE", "BEGIN", "COMMIT",
];
const UNSUPPORTED: &[&str] = &["GROUP", "HAVING", "JOIN", "UNION", "INTERSECT", "EXCEPT", "WITH"];
const TABLE: &str = "events";

/// A filter that passed every check, ready for the row store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeScan {
    pub where_clause: Option<String>,
    pub order_by: String,
    /// Normalized statement, for logs.
    pub sql: String,
}

impl SafeScan {
    pub fn into_request(self) -> ScanRequest {
        let mut request = ScanRequest::default().order_by(OrderBy::Raw(self.order_by));
        if let Some(clause) = self.where_clause {
            request = request.filter(Predicate::Raw(clause));
        }
        request
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlSafetyRewriter {
    metric: MetricField,
}

impl SqlSafetyRewriter {
    /// `metric` orders results when the statement has no ORDER BY.
    pub fn new(metric: MetricField) -> Self {
        Self { metric }
    }

    pub fn rewrite(&self, sql: &str, user_query: &str) -> Result<SafeScan, RewriteError> {
        let statement = sql.trim().trim_matches('`').trim();
        let statement = statement.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        if statement.is_empty() {
            return Err(RewriteError::Empty);
        }

        let masked = mask_literals(statement);
        if masked.contains(';') {
            return Err(RewriteError::MultipleStatements);
        }
        if !starts_with_keyword(&masked, "SELECT") {
            return Err(RewriteError::NotReadOnly);
        }
        for word in masked.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
            let upper = word.to_ascii_uppercase();
            if FORBIDDEN.contains(&upper.as_str()) {
                return Err(RewriteError::ForbiddenKeyword(upper));
            }
            if UNSUPPORTED.contains(&upper.as_str()) {
                return Err(RewriteError::Unsupported(upper));
            }
        }

        let (inner, inner_masked) = unwrap_aggregate(statement, &masked)?;
        let clauses = split_clauses(inner, &inner_masked)?;

        let mut where_clause = clauses.where_clause.map(str::to_string);
        let wants_inactive = user_query.to_lowercase().contains("inactive");
        let mentions_active = inner.to_lowercase().contains("is_active");
        if !wants_inactive && !mentions_active {
            where_clause = Some(match where_clause {
                Some(existing) => format!("is_active = 1 AND ({existing})"),
                None => "is_active = 1".to_string(),
            });
        }

        let order_by = match clauses.order_by {
            Some(order) => order.to_string(),
            None if self.metric == MetricField::Volume => "volume DESC".to_string(),
            None => format!("{} DESC, volume DESC", self.metric.column()),
        };

        let mut sql = format!("SELECT * FROM {TABLE}");
        if let Some(clause) = &where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_by);

        Ok(SafeScan {
            where_clause,
            order_by,
            sql,
        })
    }
}

/// Copy of `sql` with string literal contents and quoted identifiers replaced
/// by spaces. Byte offsets are preserved.
fn mask_literals(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => {
                if chars.peek() == Some(&q) {
                    chars.next();
                    masked.push_str("  ");
                    continue;
                }
                quote = None;
                masked.push(c);
            }
            Some(_) => masked.extend(std::iter::repeat(' ').take(c.len_utf8())),
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                masked.push(c);
            }
        }
    }
    masked
}

fn starts_with_keyword(masked: &str, keyword: &str) -> bool {
    let bytes = masked.trim_start().as_bytes();
    let kw = keyword.as_bytes();
    bytes.len() >= kw.len()
        && bytes[..kw.len()].eq_ignore_ascii_case(kw)
        && bytes
            .get(kw.len())
            .map_or(true, |b| !(b.is_ascii_alphanumeric() || *b == b'_'))
}

/// Byte offsets of `keyword` at parenthesis depth zero, on word boundaries.
fn top_level_positions(masked: &str, keyword: &str) -> Vec<usize> {
    let bytes = masked.as_bytes();
    let kw = keyword.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut positions = Vec::new();
    let mut depth = 0i32;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {
                if depth == 0
                    && idx + kw.len() <= bytes.len()
                    && bytes[idx..idx + kw.len()].eq_ignore_ascii_case(kw)
                    && (idx == 0 || !is_word(bytes[idx - 1]))
                    && bytes.get(idx + kw.len()).map_or(true, |b| !is_word(*b))
                {
                    positions.push(idx);
                    idx += kw.len();
                    continue;
                }
            }
        }
        idx += 1;
    }
    positions
}

fn first_top_level(masked: &str, keyword: &str) -> Option<usize> {
    top_level_positions(masked, keyword).into_iter().next()
}

/// Position just past a top-level `ORDER BY`, and where it starts.
fn order_by_position(masked: &str) -> Option<(usize, usize)> {
    top_level_positions(masked, "ORDER").into_iter().find_map(|start| {
        let rest = &masked[start + "ORDER".len()..];
        let skipped = rest.len() - rest.trim_start().len();
        let after = start + "ORDER".len() + skipped;
        starts_with_keyword(&masked[after..], "BY").then_some((start, after + "BY".len()))
    })
}

/// `SELECT AGG(x) FROM (SELECT ... FROM events ...)` becomes the inner selection.
fn unwrap_aggregate<'a>(statement: &'a str, masked: &str) -> Result<(&'a str, String), RewriteError> {
    let Some(from) = first_top_level(masked, "FROM") else {
        return Err(RewriteError::Unsupported("missing FROM".to_string()));
    };
    let after_from = &masked[from + "FROM".len()..];
    let offset = from + "FROM".len() + (after_from.len() - after_from.trim_start().len());
    if !masked[offset..].starts_with('(') {
        return Ok((statement, masked.to_string()));
    }

    let mut depth = 0i32;
    let mut close = None;
    for (idx, b) in masked.as_bytes().iter().enumerate().skip(offset) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close.ok_or_else(|| RewriteError::Unsupported("unbalanced parentheses".to_string()))?;
    let inner = statement[offset + 1..close].trim();
    let inner_masked = mask_literals(inner);
    if !starts_with_keyword(&inner_masked, "SELECT") {
        return Err(RewriteError::NotReadOnly);
    }
    if let Some(nested) = first_top_level(&inner_masked, "FROM") {
        let rest = inner_masked[nested + "FROM".len()..].trim_start();
        if rest.starts_with('(') {
            return Err(RewriteError::Unsupported("nested subquery".to_string()));
        }
    }
    Ok((inner, inner_masked))
}

struct Clauses<'a> {
    where_clause: Option<&'a str>,
    order_by: Option<&'a str>,
}

fn split_clauses<'a>(statement: &'a str, masked: &str) -> Result<Clauses<'a>, RewriteError> {
    let from = first_top_level(masked, "FROM")
        .ok_or_else(|| RewriteError::Unsupported("missing FROM".to_string()))?;
    let where_at = first_top_level(masked, "WHERE");
    let order_at = order_by_position(masked);
    let limit_at = first_top_level(masked, "LIMIT");
    let offset_at = first_top_level(masked, "OFFSET");

    let tail_start = [limit_at, offset_at].into_iter().flatten().min().unwrap_or(statement.len());

    let table_end = [where_at, order_at.map(|(start, _)| start), Some(tail_start)]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(statement.len());
    let table = statement[from + "FROM".len()..table_end].trim();
    let table_name = table
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']');
    if !table_name.eq_ignore_ascii_case(TABLE) {
        return Err(RewriteError::Unsupported(format!("table {table}")));
    }
    if table.contains(',') {
        return Err(RewriteError::Unsupported("multiple tables".to_string()));
    }

    let where_clause = where_at.map(|start| {
        let end = [order_at.map(|(s, _)| s), Some(tail_start)]
            .into_iter()
            .flatten()
            .filter(|end| *end > start)
            .min()
            .unwrap_or(statement.len());
        statement[start + "WHERE".len()..end].trim()
    });
    let order_by = order_at.map(|(_, body)| statement[body..tail_start.max(body)].trim());

    Ok(Clauses {
        where_clause: where_clause.filter(|c| !c.is_empty()),
        order_by: order_by.filter(|c| !c.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(sql: &str) -> Result<SafeScan, RewriteError> {
        SqlSafetyRewriter::default().rewrite(sql, "show markets")
    }

    #[test]
    fn injects_activity_and_default_order() {
        let scan = rewrite("SELECT id, title FROM events WHERE domain LIKE '%Politics%';").expect("safe");
        assert_eq!(scan.where_clause.as_deref(), Some("is_active = 1 AND (domain LIKE '%Politics%')"));
        assert_eq!(scan.order_by, "volume DESC");
        assert_eq!(
            scan.sql,
            "SELECT * FROM events WHERE is_active = 1 AND (domain LIKE '%Politics%') ORDER BY volume DESC"
        );
    }

    #[test]
    fn strips_limits_and_keeps_explicit_order() {
        let scan = rewrite("select * from events where is_active=1 order by liquidity desc limit 5 offset 10")
            .expect("safe");
        assert_eq!(scan.where_clause.as_deref(), Some("is_active=1"));
        assert_eq!(scan.order_by, "liquidity desc");
        assert!(!scan.sql.to_lowercase().contains("limit"));
    }

    #[test]
    fn no_where_clause_gets_activity_predicate() {
        let scan = rewrite("SELECT * FROM events ORDER BY volume DESC LIMIT 3").expect("safe");
        assert_eq!(scan.where_clause.as_deref(), Some("is_active = 1"));
        assert_eq!(scan.order_by, "volume DESC");
    }

    #[test]
    fn inactive_requests_skip_activity_predicate() {
        let scan = SqlSafetyRewriter::default()
            .rewrite("SELECT * FROM events WHERE domain = 'Sports'", "inactive sports markets")
            .expect("safe");
        assert_eq!(scan.where_clause.as_deref(), Some("domain = 'Sports'"));
    }

    #[test]
    fn default_order_follows_detected_metric() {
        let scan = SqlSafetyRewriter::new(MetricField::Liquidity)
            .rewrite("SELECT * FROM events", "by liquidity")
            .expect("safe");
        assert_eq!(scan.order_by, "liquidity DESC, volume DESC");
    }

    #[test]
    fn rejects_writes_and_multiple_statements() {
        assert_eq!(rewrite("DELETE FROM events"), Err(RewriteError::NotReadOnly));
        assert_eq!(rewrite("   "), Err(RewriteError::Empty));
        assert_eq!(
            rewrite("SELECT * FROM events; DROP TABLE events"),
            Err(RewriteError::MultipleStatements)
        );
        assert!(rewrite("SELECT * FROM events WHERE id IN (SELECT id FROM events WHERE volume > 5)").is_ok());
        assert!(matches!(
            rewrite("SELECT * FROM events WHERE 1=1 UNION SELECT * FROM sqlite_master"),
            Err(RewriteError::Unsupported(_))
        ));
        assert!(matches!(
            rewrite("SELECT * FROM events WHERE x = 1 ATTACH"),
            Err(RewriteError::ForbiddenKeyword(_))
        ));
    }

    #[test]
    fn keywords_inside_literals_are_data() {
        let scan = rewrite("SELECT * FROM events WHERE title LIKE '%drop; delete%' ORDER BY volume DESC")
            .expect("literal keywords are fine");
        assert_eq!(
            scan.where_clause.as_deref(),
            Some("is_active = 1 AND (title LIKE '%drop; delete%')")
        );
    }

    #[test]
    fn other_tables_are_unsupported() {
        assert!(matches!(
            rewrite("SELECT * FROM sqlite_master"),
            Err(RewriteError::Unsupported(_))
        ));
        assert!(matches!(
            rewrite("SELECT * FROM events e, users u"),
            Err(RewriteError::Unsupported(_))
        ));
    }

    #[test]
    fn aggregate_wrappers_unwrap_to_inner_selection() {
        let scan = rewrite(
            "SELECT AVG(liquidity) FROM (SELECT liquidity FROM events WHERE domain LIKE '%Finance%' ORDER BY volume DESC LIMIT 10)",
        )
        .expect("safe");
        assert_eq!(scan.where_clause.as_deref(), Some("is_active = 1 AND (domain LIKE '%Finance%')"));
        assert_eq!(scan.order_by, "volume DESC");
    }

    #[test]
    fn into_request_carries_raw_clauses() {
        let request = rewrite("SELECT * FROM events WHERE volume > 10").expect("safe").into_request();
        assert_eq!(
            request.predicate,
            Some(Predicate::Raw("is_active = 1 AND (volume > 10)".to_string()))
        );
        assert_eq!(request.order_by, Some(OrderBy::Raw("volume DESC".to_string())));
        assert_eq!(request.limit, None);
    }
}
