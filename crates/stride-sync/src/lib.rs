//! Ingestion job: refresh expired Strava credentials, page through every athlete's activities and
//! upsert them as raw documents, all inside one database transaction per run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stride_core::{Credential, RawActivity};
use stride_storage::{IngestTransaction, PgStore, StoreError};
use stride_strava::{ActivityProvider, RateLimitPolicy, StravaClient, StravaConfig, StravaError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod snapshot;

pub const CRATE_NAME: &str = "stride-sync";

/// How many per-athlete errors an aggregate failure quotes.
const FAILURE_SAMPLE: usize = 5;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("missing required environment variable {0}")]
    MissingConfiguration(&'static str),
    #[error(
        "no activities written for {athletes} athlete(s); {}",
        failure_sample(.failures)
    )]
    AggregateFailure {
        athletes: usize,
        failures: Vec<AthleteFailure>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Failure of a single athlete; recorded in the run report, never propagated.
#[derive(Debug, Error)]
pub enum AthleteError {
    #[error(transparent)]
    Strava(#[from] StravaError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn failure_sample(failures: &[AthleteFailure]) -> String {
    if failures.is_empty() {
        return "no athlete reported an error".to_string();
    }
    let sample = failures
        .iter()
        .take(FAILURE_SAMPLE)
        .map(|f| format!("[{}] {}", f.athlete_id, f.message))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} failed: {sample}", failures.len())
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub strava: StravaConfig,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database_url: required(&lookup, "DATABASE_URL")?,
            strava: strava_config_from_lookup(&lookup)?,
        })
    }
}

pub fn database_url_from_env() -> Result<String, SyncError> {
    required(&|key: &str| std::env::var(key).ok(), "DATABASE_URL")
}

pub fn strava_config_from_env() -> Result<StravaConfig, SyncError> {
    strava_config_from_lookup(&|key: &str| std::env::var(key).ok())
}

pub fn strava_config_from_lookup<F>(lookup: &F) -> Result<StravaConfig, SyncError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = StravaConfig::new(
        required(lookup, "STRAVA_CLIENT_ID")?,
        required(lookup, "STRAVA_CLIENT_SECRET")?,
    );
    if let Some(url) = lookup("STRAVA_TOKEN_URL").filter(|v| !v.is_empty()) {
        config.token_url = url;
    }
    if let Some(url) = lookup("STRAVA_API_BASE_URL").filter(|v| !v.is_empty()) {
        config.api_base_url = url;
    }
    if let Some(per_page) = parsed::<u32, _>(lookup, "STRAVA_PER_PAGE").filter(|n| *n > 0) {
        config.per_page = per_page;
    }
    if let Some(secs) = parsed(lookup, "STRAVA_HTTP_TIMEOUT_SECS") {
        config.timeout = Duration::from_secs(secs);
    }
    config.user_agent = Some(
        lookup("STRAVA_USER_AGENT").unwrap_or_else(|| "stride-ingest/0.1".to_string()),
    );

    let defaults = RateLimitPolicy::default();
    config.rate_limit = RateLimitPolicy {
        max_retries: parsed(lookup, "STRAVA_RATE_LIMIT_MAX_RETRIES").unwrap_or(defaults.max_retries),
        base_delay: parsed(lookup, "STRAVA_RATE_LIMIT_PAUSE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.base_delay),
        max_delay: parsed(lookup, "STRAVA_RATE_LIMIT_MAX_PAUSE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_delay),
    };
    Ok(config)
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, SyncError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.is_empty())
        .ok_or(SyncError::MissingConfiguration(key))
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AthleteLoad {
    pub athlete_id: i64,
    pub rows_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AthleteFailure {
    pub athlete_id: i64,
    pub message: String,
}

/// Outcome of processing every credential in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub athletes: usize,
    pub rows_written: u64,
    pub loaded: Vec<AthleteLoad>,
    pub failures: Vec<AthleteFailure>,
}

impl IngestReport {
    fn record(mut self, athlete_id: i64, outcome: Result<u64, AthleteError>) -> Self {
        self.athletes += 1;
        match outcome {
            Ok(rows_written) => {
                self.rows_written += rows_written;
                self.loaded.push(AthleteLoad {
                    athlete_id,
                    rows_written,
                });
            }
            Err(err) => self.failures.push(AthleteFailure {
                athlete_id,
                message: err.to_string(),
            }),
        }
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extracted_at: DateTime<Utc>,
    pub athletes: usize,
    pub rows_written: u64,
    pub failures: Vec<AthleteFailure>,
}

/// Return `credential` untouched while its access token is usable at `now`; otherwise run the
/// refresh grant and persist the rotated pair before returning it.
pub async fn ensure_valid_credential<T, P>(
    tx: &mut T,
    provider: &P,
    credential: Credential,
    now: i64,
) -> Result<Credential, AthleteError>
where
    T: IngestTransaction,
    P: ActivityProvider + ?Sized,
{
    if !credential.needs_refresh(now) {
        return Ok(credential);
    }

    info!(
        athlete_id = credential.athlete_id,
        expires_at = credential.expires_at,
        "access token missing or expired; refreshing"
    );
    let grant = provider
        .refresh_access_token(&credential.refresh_token)
        .await?;
    let refreshed = Credential {
        athlete_id: credential.athlete_id,
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        expires_at: grant.expires_at,
    };
    tx.save_credential(&refreshed).await?;
    Ok(refreshed)
}

async fn ingest_athlete<T, P>(
    tx: &mut T,
    provider: &P,
    credential: Credential,
    extracted_at: DateTime<Utc>,
) -> Result<u64, AthleteError>
where
    T: IngestTransaction,
    P: ActivityProvider + ?Sized,
{
    let now = Utc::now().timestamp();
    let credential = ensure_valid_credential(tx, provider, credential, now).await?;

    let documents = provider
        .fetch_all_activities(&credential.access_token)
        .await?;
    let fetched = documents.len();
    let rows = RawActivity::collect(credential.athlete_id, extracted_at, documents);
    if rows.len() < fetched {
        debug!(
            skipped = fetched - rows.len(),
            "dropped documents without a usable id or with NUL characters"
        );
    }

    Ok(tx.upsert_raw_activities(&rows).await?)
}

/// Process each credential in order. One athlete's failure is recorded and the fold moves on.
pub async fn ingest_athletes<T, P>(
    tx: &mut T,
    provider: &P,
    credentials: Vec<Credential>,
    extracted_at: DateTime<Utc>,
) -> IngestReport
where
    T: IngestTransaction,
    P: ActivityProvider + ?Sized,
{
    let mut report = IngestReport::default();

    for credential in credentials {
        let athlete_id = credential.athlete_id;
        let outcome = ingest_athlete(tx, provider, credential, extracted_at)
            .instrument(info_span!("athlete", athlete_id))
            .await;
        match &outcome {
            Ok(rows) => info!(athlete_id, rows, "loaded activities"),
            Err(err) => error!(athlete_id, error = %err, "athlete ingestion failed"),
        }
        report = report.record(athlete_id, outcome);
    }

    report
}

/// Run the whole job inside `tx`: commit when anything was written, roll back otherwise.
pub async fn run_ingest_job<T, P>(
    mut tx: T,
    provider: &P,
    extracted_at: DateTime<Utc>,
) -> Result<IngestReport, SyncError>
where
    T: IngestTransaction,
    P: ActivityProvider + ?Sized,
{
    let credentials = match tx.load_credentials().await {
        Ok(credentials) => credentials,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback after credential load failure failed");
            }
            return Err(err.into());
        }
    };

    if credentials.is_empty() {
        info!("no athletes found in strava_tokens");
        tx.commit().await?;
        return Ok(IngestReport::default());
    }

    let report = ingest_athletes(&mut tx, provider, credentials, extracted_at).await;

    if report.rows_written == 0 {
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "rollback after aggregate failure failed");
        }
        return Err(SyncError::AggregateFailure {
            athletes: report.athletes,
            failures: report.failures,
        });
    }

    tx.commit().await?;
    Ok(report)
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary, SyncError> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let extracted_at = started_at;

    let client = StravaClient::new(config.strava.clone())?;
    let store = PgStore::connect(&config.database_url).await?;
    store.ensure_schema().await?;
    let tx = store.begin().await?;

    let report = run_ingest_job(tx, &client, extracted_at)
        .instrument(info_span!("sync_run", %run_id))
        .await?;

    Ok(SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        extracted_at,
        athletes: report.athletes,
        rows_written: report.rows_written,
        failures: report.failures,
    })
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SyncError> {
    let config = SyncConfig::from_env()?;
    run_sync_once(&config).await
}

pub async fn migrate_from_env() -> Result<(), SyncError> {
    let store = PgStore::connect(&database_url_from_env()?).await?;
    store.ensure_schema().await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{MemoryStore, ScriptedProvider};
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use stride_strava::TokenGrant;

    const FAR_FUTURE: i64 = 4_000_000_000;

    fn extracted_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap()
    }

    fn valid(athlete_id: i64, access: &str) -> Credential {
        Credential {
            athlete_id,
            access_token: access.into(),
            refresh_token: format!("refresh-{athlete_id}"),
            expires_at: FAR_FUTURE,
        }
    }

    fn expired(athlete_id: i64) -> Credential {
        Credential {
            athlete_id,
            access_token: "stale".into(),
            refresh_token: format!("refresh-{athlete_id}"),
            expires_at: 1_000,
        }
    }

    fn grant(access: &str, refresh: &str) -> TokenGrant {
        TokenGrant {
            access_token: access.into(),
            refresh_token: refresh.into(),
            expires_at: FAR_FUTURE,
            athlete: None,
        }
    }

    fn docs(ids: &[i64]) -> Vec<serde_json::Value> {
        ids.iter().map(|id| json!({"id": id, "type": "Ride"})).collect()
    }

    #[tokio::test]
    async fn valid_credential_makes_no_refresh_call() {
        let store = MemoryStore::default();
        let mut tx = store.begin();
        let provider = ScriptedProvider::default();
        let cred = valid(1, "live-token");

        let out = ensure_valid_credential(&mut tx, &provider, cred.clone(), 1_700_000_000)
            .await
            .expect("valid");

        assert_eq!(out, cred);
        assert!(provider.refresh_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed_once_and_rotated() {
        let store = MemoryStore::with_credentials(vec![expired(7)]);
        let mut tx = store.begin();
        let provider = ScriptedProvider::default().grant("refresh-7", grant("fresh", "rotated"));

        let out = ensure_valid_credential(&mut tx, &provider, expired(7), 1_700_000_000)
            .await
            .expect("refreshed");
        tx.commit().await.expect("commit");

        assert_eq!(out.access_token, "fresh");
        assert_eq!(out.refresh_token, "rotated");
        assert_eq!(*provider.refresh_calls.lock().unwrap(), vec!["refresh-7".to_string()]);
        let stored = store.snapshot().credentials[&7].clone();
        assert_eq!(stored, out);
    }

    #[tokio::test]
    async fn missing_access_token_forces_refresh() {
        let store = MemoryStore::default();
        let mut tx = store.begin();
        let provider = ScriptedProvider::default().grant("refresh-3", grant("a", "r"));
        let cred = Credential {
            access_token: String::new(),
            ..valid(3, "")
        };

        ensure_valid_credential(&mut tx, &provider, cred, 0)
            .await
            .expect("refreshed");
        assert_eq!(provider.refresh_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_is_auth_failure() {
        let store = MemoryStore::default();
        let mut tx = store.begin();
        let provider = ScriptedProvider::default().reject_refresh("refresh-9");

        let err = ensure_valid_credential(&mut tx, &provider, expired(9), 1_700_000_000)
            .await
            .expect_err("rejected");
        assert!(matches!(
            err,
            AthleteError::Strava(StravaError::Auth { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn job_commits_and_isolates_failures() {
        let store = MemoryStore::with_credentials(vec![
            valid(1, "tok-1"),
            valid(2, "tok-2"),
            expired(3),
        ]);
        let provider = ScriptedProvider::default()
            .listing("tok-1", docs(&[10, 11, 12]))
            .failing_listing("tok-2", 500)
            .grant("refresh-3", grant("tok-3", "rotated-3"))
            .listing("tok-3", vec![json!({"id": 30}), json!({"name": "no id"})]);

        let report = run_ingest_job(store.begin(), &provider, extracted_at())
            .await
            .expect("job");

        assert_eq!(report.athletes, 3);
        assert_eq!(report.rows_written, 4);
        assert_eq!(
            report.loaded,
            vec![
                AthleteLoad { athlete_id: 1, rows_written: 3 },
                AthleteLoad { athlete_id: 3, rows_written: 1 },
            ]
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].athlete_id, 2);
        assert!(report.failures[0].message.contains("500"));

        let db = store.snapshot();
        assert_eq!(db.activities.len(), 4);
        assert!(db
            .activities
            .values()
            .all(|row| row.extracted_at == extracted_at()));
        assert_eq!(db.credentials[&3].refresh_token, "rotated-3");
    }

    #[tokio::test]
    async fn every_athlete_failing_rolls_back_and_reports_sample() {
        let store = MemoryStore::with_credentials(vec![expired(1), expired(2)]);
        // Athlete 1 refreshes fine but its listing is revoked; athlete 2 cannot refresh.
        let provider = ScriptedProvider::default()
            .grant("refresh-1", grant("tok-1", "rotated-1"))
            .failing_listing("tok-1", 401)
            .reject_refresh("refresh-2");

        let err = run_ingest_job(store.begin(), &provider, extracted_at())
            .await
            .expect_err("aggregate failure");

        match &err {
            SyncError::AggregateFailure { athletes, failures } => {
                assert_eq!(*athletes, 2);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("[1]"));
        assert!(message.contains("[2]"));

        let db = store.snapshot();
        assert!(db.activities.is_empty());
        assert_eq!(db.credentials[&1].refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn zero_rows_without_errors_is_still_aggregate_failure() {
        let store = MemoryStore::with_credentials(vec![valid(1, "tok-1")]);
        let provider = ScriptedProvider::default().listing("tok-1", Vec::new());

        let err = run_ingest_job(store.begin(), &provider, extracted_at())
            .await
            .expect_err("aggregate failure");
        assert!(matches!(err, SyncError::AggregateFailure { athletes: 1, .. }));
    }

    #[tokio::test]
    async fn empty_credential_table_is_not_a_failure() {
        let store = MemoryStore::default();
        let provider = ScriptedProvider::default();

        let report = run_ingest_job(store.begin(), &provider, extracted_at())
            .await
            .expect("empty run");
        assert_eq!(report, IngestReport::default());
        assert!(provider.fetch_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reingesting_overwrites_payload_and_timestamp() {
        let store = MemoryStore::with_credentials(vec![valid(1, "tok-1")]);
        let first = ScriptedProvider::default()
            .listing("tok-1", vec![json!({"id": 10, "name": "before"})]);
        run_ingest_job(store.begin(), &first, extracted_at())
            .await
            .expect("first run");

        let later = extracted_at() + chrono::Duration::hours(12);
        let second = ScriptedProvider::default()
            .listing("tok-1", vec![json!({"id": 10, "name": "after"})]);
        run_ingest_job(store.begin(), &second, later)
            .await
            .expect("second run");

        let db = store.snapshot();
        assert_eq!(db.activities.len(), 1);
        let row = &db.activities[&(1, 10)];
        assert_eq!(row.payload["name"], "after");
        assert_eq!(row.extracted_at, later);
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn config_requires_all_three_variables() {
        let base = [
            ("DATABASE_URL", "postgres://localhost/stride"),
            ("STRAVA_CLIENT_ID", "123"),
            ("STRAVA_CLIENT_SECRET", "shh"),
        ];
        assert!(SyncConfig::from_lookup(lookup_from(&base)).is_ok());

        for missing in ["DATABASE_URL", "STRAVA_CLIENT_ID", "STRAVA_CLIENT_SECRET"] {
            let pairs: Vec<_> = base.iter().copied().filter(|(k, _)| *k != missing).collect();
            match SyncConfig::from_lookup(lookup_from(&pairs)) {
                Err(SyncError::MissingConfiguration(key)) => assert_eq!(key, missing),
                other => panic!("expected missing {missing}, got {other:?}"),
            }
        }

        let blank = [
            ("DATABASE_URL", ""),
            ("STRAVA_CLIENT_ID", "123"),
            ("STRAVA_CLIENT_SECRET", "shh"),
        ];
        assert!(matches!(
            SyncConfig::from_lookup(lookup_from(&blank)),
            Err(SyncError::MissingConfiguration("DATABASE_URL"))
        ));
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/stride"),
            ("STRAVA_CLIENT_ID", "123"),
            ("STRAVA_CLIENT_SECRET", "shh"),
        ]))
        .expect("config");
        assert_eq!(config.strava.per_page, 200);
        assert_eq!(config.strava.token_url, stride_strava::DEFAULT_TOKEN_URL);
        assert_eq!(config.strava.rate_limit.base_delay, Duration::from_secs(5));

        let config = SyncConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/stride"),
            ("STRAVA_CLIENT_ID", "123"),
            ("STRAVA_CLIENT_SECRET", "shh"),
            ("STRAVA_PER_PAGE", "50"),
            ("STRAVA_RATE_LIMIT_PAUSE_SECS", "2"),
            ("STRAVA_RATE_LIMIT_MAX_RETRIES", "not-a-number"),
            ("STRAVA_API_BASE_URL", "http://127.0.0.1:9999/api/v3"),
        ]))
        .expect("config");
        assert_eq!(config.strava.per_page, 50);
        assert_eq!(config.strava.rate_limit.base_delay, Duration::from_secs(2));
        assert_eq!(config.strava.rate_limit.max_retries, 8);
        assert_eq!(
            config.strava.activities_url(),
            "http://127.0.0.1:9999/api/v3/athlete/activities"
        );
    }
}
