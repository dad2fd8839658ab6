//! PostgreSQL backend
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so a place is locked by exactly one
//! session until that session's transaction ends. The per-place computation is
//! performed by the database's indexing triggers, fired by resetting
//! `indexed_status`.

use super::{BatchOutcome, BatchRequest, DbError, DbResult, IndexConnection, PlaceStore, SkippedPlace};
use crate::index::status::ProgressMarker;
use crate::{FailurePolicy, Phase, PlaceId, Rank, RankRange, WorkUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};
use std::str::FromStr;
use tracing::debug;

const BOUNDARY_FILTER: &str = "class = 'boundary' AND type = 'administrative'";

const PROGRESS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS placedex_progress (
        phase TEXT PRIMARY KEY,
        rank_min INTEGER NOT NULL,
        rank_max INTEGER NOT NULL,
        last_rank INTEGER,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

/// Connection factory for a PostgreSQL place database
#[derive(Debug, Clone)]
pub struct PgStore {
    options: PgConnectOptions,
}

impl PgStore {
    /// Parse `dsn` without connecting. Accepts `postgres://` URLs and libpq
    /// keyword/value strings such as `dbname=nominatim host=localhost`.
    pub fn new(dsn: &str) -> DbResult<Self> {
        Ok(Self {
            options: connect_options(dsn)?,
        })
    }
}

#[async_trait]
impl PlaceStore for PgStore {
    type Connection = PgIndexConnection;

    async fn connect(&self) -> DbResult<PgIndexConnection> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(classify)?;
        Ok(PgIndexConnection { conn })
    }
}

/// One PostgreSQL session
pub struct PgIndexConnection {
    conn: PgConnection,
}

#[async_trait]
impl IndexConnection for PgIndexConnection {
    async fn run_batch(&mut self, request: &BatchRequest<'_>) -> DbResult<BatchOutcome> {
        let mut tx = self.conn.begin().await.map_err(classify)?;

        let claimed: Vec<PlaceId> = sqlx::query_scalar(&claim_query(request.unit.phase))
            .bind(request.unit.rank.value() as i32)
            .bind(request.exclude)
            .bind(request.limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(classify)?;

        let mut outcome = BatchOutcome {
            claimed,
            ..Default::default()
        };

        if outcome.claimed.is_empty() {
            tx.rollback().await.map_err(classify)?;
            return Ok(outcome);
        }

        debug!("Claimed {} places of {}", outcome.claimed.len(), request.unit);

        for &place_id in &outcome.claimed {
            match request.policy {
                // Dropping `tx` on error rolls the whole batch back.
                FailurePolicy::AbortBatch => {
                    index_place(&mut tx, place_id).await?;
                    outcome.indexed += 1;
                }
                FailurePolicy::SkipAndLog => {
                    sqlx::query("SAVEPOINT place")
                        .execute(&mut *tx)
                        .await
                        .map_err(classify)?;

                    match index_place(&mut tx, place_id).await {
                        Ok(()) => {
                            sqlx::query("RELEASE SAVEPOINT place")
                                .execute(&mut *tx)
                                .await
                                .map_err(classify)?;
                            outcome.indexed += 1;
                        }
                        Err(DbError::Data { message, .. }) => {
                            sqlx::query("ROLLBACK TO SAVEPOINT place")
                                .execute(&mut *tx)
                                .await
                                .map_err(classify)?;
                            outcome.skipped.push(SkippedPlace {
                                place_id,
                                reason: message,
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        tx.commit().await.map_err(classify)?;
        Ok(outcome)
    }

    async fn count_pending(&mut self, unit: WorkUnit) -> DbResult<u64> {
        let query = format!(
            "SELECT count(*) FROM placex WHERE indexed_status > 0 AND rank_search = $1 AND {}",
            phase_filter(unit.phase)
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(unit.rank.value() as i32)
            .fetch_one(&mut self.conn)
            .await
            .map_err(classify)?;
        Ok(count.max(0) as u64)
    }

    async fn prepare_progress(&mut self) -> DbResult<()> {
        sqlx::query(PROGRESS_TABLE)
            .execute(&mut self.conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn load_progress(&mut self, phase: Phase) -> DbResult<Option<ProgressMarker>> {
        let row = sqlx::query(
            "SELECT rank_min, rank_max, last_rank, updated_at FROM placedex_progress WHERE phase = $1",
        )
        .bind(phase.name())
        .fetch_optional(&mut self.conn)
        .await;

        // No progress table yet means no run has been recorded.
        let row = match row {
            Err(e) if is_undefined_table(&e) => return Ok(None),
            other => other.map_err(classify)?,
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let rank_min: i32 = row.try_get("rank_min").map_err(classify)?;
        let rank_max: i32 = row.try_get("rank_max").map_err(classify)?;
        let last_rank: Option<i32> = row.try_get("last_rank").map_err(classify)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(classify)?;

        let stored_rank = |value: i32| {
            Rank::new(value as i64)
                .map_err(|e| DbError::Schema(format!("placedex_progress for {}: {}", phase, e)))
        };

        Ok(Some(ProgressMarker {
            phase,
            rank_min: stored_rank(rank_min)?,
            rank_max: stored_rank(rank_max)?,
            last_rank: last_rank.map(stored_rank).transpose()?,
            updated_at,
        }))
    }

    async fn reset_progress(&mut self, phase: Phase, range: RankRange) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO placedex_progress (phase, rank_min, rank_max, last_rank, updated_at)
            VALUES ($1, $2, $3, NULL, now())
            ON CONFLICT (phase) DO UPDATE
               SET rank_min = EXCLUDED.rank_min,
                   rank_max = EXCLUDED.rank_max,
                   last_rank = NULL,
                   updated_at = now()
            "#,
        )
        .bind(phase.name())
        .bind(range.min.value() as i32)
        .bind(range.max.value() as i32)
        .execute(&mut self.conn)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn record_progress(&mut self, phase: Phase, rank: Rank) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE placedex_progress
               SET last_rank = $2, updated_at = now()
             WHERE phase = $1 AND (last_rank IS NULL OR last_rank < $2)
            "#,
        )
        .bind(phase.name())
        .bind(rank.value() as i32)
        .execute(&mut self.conn)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn mark_import_indexed(&mut self) -> DbResult<()> {
        sqlx::query("UPDATE import_status SET indexed = true")
            .execute(&mut self.conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn try_acquire_lease(&mut self, key: i64) -> DbResult<bool> {
        sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
            .map_err(classify)
    }

    async fn release_lease(&mut self, key: i64) -> DbResult<()> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
            .map_err(classify)?;
        if !released {
            debug!("Advisory lock {} was not held by this session", key);
        }
        Ok(())
    }

    async fn close(self) -> DbResult<()> {
        self.conn.close().await.map_err(classify)
    }
}

/// Run the indexing computation for one place inside the batch transaction
async fn index_place(conn: &mut PgConnection, place_id: PlaceId) -> DbResult<()> {
    sqlx::query("UPDATE placex SET indexed_status = 0 WHERE place_id = $1")
        .bind(place_id)
        .execute(conn)
        .await
        .map_err(|e| place_error(place_id, e))?;
    Ok(())
}

fn phase_filter(phase: Phase) -> String {
    match phase {
        Phase::Boundary => BOUNDARY_FILTER.to_string(),
        Phase::Regular => format!("NOT ({})", BOUNDARY_FILTER),
    }
}

fn claim_query(phase: Phase) -> String {
    format!(
        r#"
        SELECT place_id FROM placex
         WHERE indexed_status > 0
           AND rank_search = $1
           AND {}
           AND place_id <> ALL($2)
         ORDER BY place_id
         LIMIT $3
           FOR UPDATE SKIP LOCKED
        "#,
        phase_filter(phase)
    )
}

/// Map a driver error onto the engine's error taxonomy
fn classify(err: sqlx::Error) -> DbError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DbError::Connection(err.to_string()),
        sqlx::Error::Configuration(_) => DbError::Configuration(err.to_string()),
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } => {
            DbError::Schema(err.to_string())
        }
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("40P01") => DbError::Deadlock(db_err.message().to_string()),
            Some("40001") | Some("55P03") => DbError::LockContention(db_err.message().to_string()),
            Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                DbError::Connection(db_err.message().to_string())
            }
            Some(code) if code.starts_with("42") || code.starts_with("3F") => {
                DbError::Schema(db_err.message().to_string())
            }
            _ => DbError::Query(db_err.message().to_string()),
        },
        _ => DbError::Query(err.to_string()),
    }
}

fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("42P01"))
}

/// Like [`classify`], but data exceptions raised while computing a place
/// are attributed to that place.
fn place_error(place_id: PlaceId, err: sqlx::Error) -> DbError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref().is_some_and(is_data_exception) {
            return DbError::Data {
                place_id,
                message: db_err.message().to_string(),
            };
        }
    }
    classify(err)
}

/// SQLSTATE classes for bad input data: data exceptions, integrity
/// violations and errors raised from PL/pgSQL.
fn is_data_exception(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("23") || code.starts_with("P0")
}

/// Build connection options from a URL or a libpq keyword/value string.
/// Unset keywords fall back to the `PG*` environment variables.
fn connect_options(dsn: &str) -> DbResult<PgConnectOptions> {
    let dsn = dsn.trim();
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        return PgConnectOptions::from_str(dsn).map_err(classify);
    }

    let mut options = PgConnectOptions::new();
    for (key, value) in keyword_pairs(dsn)? {
        let value = value.as_str();
        options = match key.as_str() {
            "host" | "hostaddr" => options.host(value),
            "port" => options.port(value.parse().map_err(|_| {
                DbError::Configuration(format!("invalid port '{}'", value))
            })?),
            "dbname" => options.database(value),
            "user" => options.username(value),
            "password" => options.password(value),
            "application_name" => options.application_name(value),
            "sslmode" => options.ssl_mode(value.parse().map_err(|_| {
                DbError::Configuration(format!("invalid sslmode '{}'", value))
            })?),
            other => {
                return Err(DbError::Configuration(format!(
                    "unsupported DSN keyword '{}'",
                    other
                )));
            }
        };
    }
    Ok(options)
}

/// Split a libpq keyword/value string. Spaces around `=` are allowed; values
/// may be single-quoted, and a backslash escapes the next character.
fn keyword_pairs(dsn: &str) -> DbResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = dsn.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(pairs);
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(DbError::Configuration(format!(
                "missing '=' after '{}' in DSN",
                key
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    Some(c) => value.push(c),
                    None => {
                        return Err(DbError::Configuration(format!(
                            "unterminated quoted value for '{}' in DSN",
                            key
                        )));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        pairs.push((key, value));
    }
}
