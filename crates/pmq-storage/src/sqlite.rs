use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use pmq_core::{MarketRecord, MetricField};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Connection, QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::guard::ReplicaGuard;
use crate::scan::{OrderBy, Predicate, ScanRequest};
use crate::{RowStore, StoreError};

const MARKET_COLUMNS: &str = "CAST(id AS TEXT) AS id, slug, title, description, domain, section, \
     subsection, CAST(is_active AS INTEGER) AS is_active, CAST(volume AS REAL) AS volume, \
     CAST(liquidity AS REAL) AS liquidity, CAST(open_interest AS REAL) AS open_interest, \
     last_trade_date, CAST(updated_at AS TEXT) AS updated_at";

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        slug TEXT UNIQUE,
        title TEXT NOT NULL,
        description TEXT,
        domain TEXT,
        section TEXT,
        subsection TEXT,
        section_tag_id INTEGER,
        subsection_tag_id INTEGER,
        is_active INTEGER NOT NULL DEFAULT 1,
        volume REAL DEFAULT 0,
        last_trade_date TEXT,
        liquidity REAL,
        open_interest REAL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_synced TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_active_volume ON events (is_active, volume)",
    "CREATE INDEX IF NOT EXISTS idx_events_domain ON events (domain)",
];

/// Read-side row store over the replica file.
///
/// Every scan opens a short-lived read-only connection inside a guard section,
/// so a sync pass never replaces the file under an open handle.
#[derive(Debug, Clone)]
pub struct SqliteRowStore {
    path: PathBuf,
    guard: ReplicaGuard,
}

impl SqliteRowStore {
    pub fn new(path: impl Into<PathBuf>, guard: ReplicaGuard) -> Self {
        Self {
            path: path.into(),
            guard,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn guard(&self) -> &ReplicaGuard {
        &self.guard
    }

    async fn open(&self) -> Result<SqliteConnection, StoreError> {
        open_read_only(&self.path).await
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<MarketRecord>, StoreError> {
        let _read = self.guard.enter_read();
        let mut conn = self.open().await?;

        let mut builder = build_scan_query(request);
        debug!(sql = builder.sql(), "row store scan");
        let fetched = builder.build().fetch_all(&mut conn).await;
        let _ = conn.close().await;

        let rows = fetched.map_err(|err| classify_error(&self.path, err))?;
        rows.iter()
            .map(market_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| classify_error(&self.path, err))
    }
}

/// Writer-side access to the canonical store.
#[derive(Debug, Clone)]
pub struct MarketWriter {
    pool: SqlitePool,
    path: PathBuf,
}

impl MarketWriter {
    /// Open (creating if needed) the writer store and ensure its schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| unavailable(&path, err))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|err| classify_error(&path, err))?;
        let writer = Self { pool, path };
        writer.init_schema().await?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| classify_error(&self.path, err))?;
        }
        Ok(())
    }

    /// Insert a market or refresh an existing one. Absent numeric fields keep
    /// their stored values.
    pub async fn upsert_market(&self, record: &MarketRecord) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated_at = record
            .updated_at
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| now.clone());

        sqlx::query(
            r#"
            INSERT INTO events (
                id, slug, title, description, domain, section, subsection, is_active,
                volume, liquidity, open_interest, last_trade_date, updated_at, last_synced
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                slug = excluded.slug,
                title = excluded.title,
                description = COALESCE(excluded.description, events.description),
                domain = excluded.domain,
                section = excluded.section,
                subsection = excluded.subsection,
                is_active = excluded.is_active,
                volume = COALESCE(excluded.volume, events.volume),
                liquidity = COALESCE(excluded.liquidity, events.liquidity),
                open_interest = COALESCE(excluded.open_interest, events.open_interest),
                last_trade_date = COALESCE(excluded.last_trade_date, events.last_trade_date),
                updated_at = excluded.updated_at,
                last_synced = excluded.last_synced
            "#,
        )
        .bind(&record.id)
        .bind(&record.slug)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.domain)
        .bind(&record.section)
        .bind(&record.subsection)
        .bind(i64::from(record.is_active))
        .bind(record.volume)
        .bind(record.liquidity)
        .bind(record.open_interest)
        .bind(&record.last_trade_date)
        .bind(updated_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| classify_error(&self.path, err))?;
        Ok(())
    }

    /// Deactivate every active market whose id is not listed.
    pub async fn mark_inactive_except(&self, active_ids: &[String]) -> Result<u64, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE events SET is_active = 0, updated_at = ");
        builder.push_bind(Utc::now().to_rfc3339());
        builder.push(" WHERE is_active = 1");
        if !active_ids.is_empty() {
            builder.push(" AND id NOT IN (");
            let mut separated = builder.separated(", ");
            for id in active_ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| classify_error(&self.path, err))?;
        Ok(result.rows_affected())
    }

    pub async fn count_active(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| classify_error(&self.path, err))?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Count active markets in a store file through a read-only connection.
pub async fn count_active_records(path: &Path) -> Result<u64, StoreError> {
    let mut conn = open_read_only(path).await?;
    let counted: Result<i64, sqlx::Error> =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE is_active = 1")
            .fetch_one(&mut conn)
            .await;
    let _ = conn.close().await;
    counted
        .map(|count| count.max(0) as u64)
        .map_err(|err| classify_error(path, err))
}

/// Write a transactionally consistent copy of `source` to `dest`.
///
/// `dest` must not exist yet.
pub async fn snapshot_into(source: &Path, dest: &Path) -> Result<(), StoreError> {
    if !source.exists() {
        return Err(unavailable(source, "source store file missing"));
    }
    let options = SqliteConnectOptions::new().filename(source);
    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .map_err(|err| classify_error(source, err))?;
    let copied = sqlx::query("VACUUM INTO ?")
        .bind(dest.to_string_lossy().into_owned())
        .execute(&mut conn)
        .await;
    let _ = conn.close().await;
    copied.map_err(|err| classify_error(source, err))?;
    Ok(())
}

async fn open_read_only(path: &Path) -> Result<SqliteConnection, StoreError> {
    if !path.exists() {
        return Err(unavailable(path, "snapshot file missing"));
    }
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    SqliteConnection::connect_with(&options)
        .await
        .map_err(|err| classify_error(path, err))
}

fn build_scan_query(request: &ScanRequest) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(format!("SELECT {MARKET_COLUMNS} FROM events"));
    if let Some(predicate) = &request.predicate {
        builder.push(" WHERE ");
        push_predicate(&mut builder, predicate);
    }
    match &request.order_by {
        Some(OrderBy::Metric(metric)) => {
            builder.push(format!(" ORDER BY {} DESC", metric.column()));
            if *metric != MetricField::Volume {
                builder.push(", volume DESC");
            }
        }
        Some(OrderBy::Raw(order)) => {
            builder.push(" ORDER BY ");
            builder.push(order);
        }
        None => {}
    }
    if let Some(limit) = request.limit {
        builder.push(" LIMIT ");
        builder.push_bind(limit.min(i64::MAX as usize) as i64);
    }
    builder
}

fn push_predicate(builder: &mut QueryBuilder<'static, Sqlite>, predicate: &Predicate) {
    match predicate {
        Predicate::Active => {
            builder.push("is_active = 1");
        }
        Predicate::Raw(expr) => {
            builder.push("(");
            builder.push(expr);
            builder.push(")");
        }
        Predicate::DomainIn(domains) if domains.is_empty() => {
            builder.push("1 = 1");
        }
        Predicate::DomainIn(domains) => {
            builder.push("domain IN (");
            let mut separated = builder.separated(", ");
            for domain in domains {
                separated.push_bind(domain.clone());
            }
            separated.push_unseparated(")");
        }
        Predicate::AnyContains { columns, terms } => {
            let terms = terms
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>();
            if terms.is_empty() || columns.is_empty() {
                builder.push("1 = 0");
                return;
            }
            builder.push("(");
            let mut first = true;
            for term in &terms {
                for column in columns {
                    if !first {
                        builder.push(" OR ");
                    }
                    first = false;
                    builder.push(format!("LOWER(COALESCE({}, '')) LIKE ", column.column()));
                    builder.push_bind(format!("%{term}%"));
                }
            }
            builder.push(")");
        }
        Predicate::All(parts) if parts.is_empty() => {
            builder.push("1 = 1");
        }
        Predicate::All(parts) => push_joined(builder, parts, " AND "),
        Predicate::Any(parts) if parts.is_empty() => {
            builder.push("1 = 0");
        }
        Predicate::Any(parts) => {
            builder.push("(");
            push_joined(builder, parts, " OR ");
            builder.push(")");
        }
    }
}

fn push_joined(builder: &mut QueryBuilder<'static, Sqlite>, parts: &[Predicate], joiner: &str) {
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            builder.push(joiner);
        }
        builder.push("(");
        push_predicate(builder, part);
        builder.push(")");
    }
}

fn market_from_row(row: &SqliteRow) -> Result<MarketRecord, sqlx::Error> {
    let updated_at: Option<String> = row.try_get("updated_at")?;
    Ok(MarketRecord {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
        description: row.try_get("description")?,
        domain: row.try_get("domain")?,
        section: row.try_get("section")?,
        subsection: row.try_get("subsection")?,
        is_active: row.try_get::<Option<i64>, _>("is_active")?.unwrap_or(0) != 0,
        volume: row.try_get("volume")?,
        liquidity: row.try_get("liquidity")?,
        open_interest: row.try_get("open_interest")?,
        last_trade_date: row.try_get("last_trade_date")?,
        updated_at: updated_at.as_deref().and_then(parse_timestamp),
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn unavailable(path: &Path, reason: impl ToString) -> StoreError {
    StoreError::Unavailable {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn classify_error(path: &Path, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            let lowered = message.to_lowercase();
            if lowered.contains("not a database")
                || lowered.contains("malformed")
                || lowered.contains("unable to open")
                || lowered.contains("no such table")
            {
                unavailable(path, message)
            } else {
                StoreError::InvalidQuery(message)
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::InvalidQuery(err.to_string())
        }
        _ => unavailable(path, err),
    }
}
