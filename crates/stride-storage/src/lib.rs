//! Postgres persistence for credentials and raw activity documents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Connection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use stride_core::{Credential, RawActivity};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "stride-storage";

/// Rows per bulk upsert statement; 4 binds per row stays well under the Postgres bind limit.
pub const UPSERT_CHUNK_ROWS: usize = 1000;

/// Schema bootstrap: credentials live in `public`, raw documents in `raw`.
pub const SCHEMA_INIT: &str = r#"
CREATE SCHEMA IF NOT EXISTS raw;

CREATE TABLE IF NOT EXISTS public.strava_tokens (
    athlete_id BIGINT PRIMARY KEY,
    access_token TEXT,
    refresh_token TEXT,
    expires_at BIGINT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS raw.strava_activities (
    athlete_id BIGINT NOT NULL,
    activity_id BIGINT NOT NULL,
    extracted_at_utc TIMESTAMPTZ NOT NULL,
    payload JSONB NOT NULL,
    PRIMARY KEY (athlete_id, activity_id)
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Unit of work for one ingestion run. Everything written through it becomes visible only on
/// `commit`.
#[async_trait]
pub trait IngestTransaction: Send {
    async fn load_credentials(&mut self) -> Result<Vec<Credential>, StoreError>;

    /// Upsert keyed by athlete id; a rotated refresh token replaces the old one.
    async fn save_credential(&mut self, credential: &Credential) -> Result<(), StoreError>;

    /// Bulk upsert keyed by (athlete_id, activity_id). Returns rows written.
    async fn upsert_raw_activities(&mut self, rows: &[RawActivity]) -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The job holds a single connection for its whole run.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn begin(&self) -> Result<PgIngestTx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgIngestTx { tx })
    }
}

pub struct PgIngestTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl IngestTransaction for PgIngestTx {
    async fn load_credentials(&mut self) -> Result<Vec<Credential>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT athlete_id,
                   COALESCE(access_token, '') AS access_token,
                   refresh_token,
                   COALESCE(expires_at, 0) AS expires_at
              FROM public.strava_tokens
             WHERE refresh_token IS NOT NULL
             ORDER BY athlete_id
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Credential, StoreError> {
                Ok(Credential {
                    athlete_id: row.try_get("athlete_id")?,
                    access_token: row.try_get("access_token")?,
                    refresh_token: row.try_get("refresh_token")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .collect()
    }

    async fn save_credential(&mut self, credential: &Credential) -> Result<(), StoreError> {
        // A savepoint keeps a failed statement from aborting the whole job transaction.
        let mut sp = Connection::begin(&mut *self.tx).await?;
        sqlx::query(
            r#"
            INSERT INTO public.strava_tokens (athlete_id, access_token, refresh_token, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (athlete_id) DO UPDATE
              SET access_token = EXCLUDED.access_token,
                  refresh_token = EXCLUDED.refresh_token,
                  expires_at = EXCLUDED.expires_at,
                  updated_at = now()
            "#,
        )
        .bind(credential.athlete_id)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at)
        .execute(&mut *sp)
        .await?;
        sp.commit().await?;
        Ok(())
    }

    async fn upsert_raw_activities(&mut self, rows: &[RawActivity]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut sp = Connection::begin(&mut *self.tx).await?;
        let mut written = 0u64;
        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO raw.strava_activities (athlete_id, activity_id, extracted_at_utc, payload) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.athlete_id)
                    .push_bind(row.activity_id)
                    .push_bind(row.extracted_at)
                    .push_bind(Json(row.payload.clone()));
            });
            qb.push(
                " ON CONFLICT (athlete_id, activity_id) DO UPDATE \
                 SET extracted_at_utc = EXCLUDED.extracted_at_utc, \
                     payload = EXCLUDED.payload",
            );
            let result = qb.build().execute(&mut *sp).await?;
            written += result.rows_affected();
            debug!(rows = chunk.len(), "upserted raw activity chunk");
        }
        sp.commit().await?;
        Ok(written)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Stored row as read back for verification tooling.
///
/// The job never reads these back; the read helpers below exist for checking what a run wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredActivity {
    pub activity_id: i64,
    pub extracted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl PgStore {
    /// Read-back helper: every stored row for `athlete_id`, ordered by activity id.
    pub async fn raw_activities_for(&self, athlete_id: i64) -> Result<Vec<StoredActivity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT activity_id, extracted_at_utc, payload
              FROM raw.strava_activities
             WHERE athlete_id = $1
             ORDER BY activity_id
            "#,
        )
        .bind(athlete_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<StoredActivity, StoreError> {
                let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;
                Ok(StoredActivity {
                    activity_id: row.try_get("activity_id")?,
                    extracted_at: row.try_get("extracted_at_utc")?,
                    payload,
                })
            })
            .collect()
    }

    /// Read-back helper: the stored token row for `athlete_id`, with the same null handling as
    /// the job's credential load.
    pub async fn credential_for(&self, athlete_id: i64) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT athlete_id,
                   COALESCE(access_token, '') AS access_token,
                   refresh_token,
                   COALESCE(expires_at, 0) AS expires_at
              FROM public.strava_tokens
             WHERE athlete_id = $1
            "#,
        )
        .bind(athlete_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Credential, StoreError> {
            Ok(Credential {
                athlete_id: row.try_get("athlete_id")?,
                access_token: row.try_get("access_token")?,
                refresh_token: row.try_get("refresh_token")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }
}
