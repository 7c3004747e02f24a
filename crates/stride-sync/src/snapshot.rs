//! Load a previously exported activity snapshot file into the raw table.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use stride_core::RawActivity;
use stride_storage::{IngestTransaction, PgStore};
use tracing::info;

use crate::{database_url_from_env, SyncError};

pub const SNAPSHOT_PREFIX: &str = "strava_activities_raw_";

#[derive(Debug, Clone, Deserialize)]
pub struct ActivitySnapshot {
    pub extracted_at_utc: DateTime<Utc>,
    pub activities: Vec<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct SnapshotLoad {
    pub path: PathBuf,
    pub extracted_at: DateTime<Utc>,
    pub rows_written: u64,
}

/// Snapshot names embed a sortable timestamp, so the newest file sorts last.
pub async fn latest_snapshot(dir: &Path) -> anyhow::Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", dir.display()))?
    {
        let path = entry.path();
        let is_snapshot = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(".json"))
            .unwrap_or(false);
        if is_snapshot {
            files.push(path);
        }
    }
    files.sort();

    match files.pop() {
        Some(path) => Ok(path),
        None => bail!("no raw JSON snapshots found in {}", dir.display()),
    }
}

pub async fn read_snapshot(path: &Path) -> anyhow::Result<ActivitySnapshot> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Upsert one snapshot for `athlete_id` and commit.
pub async fn load_snapshot<T>(
    mut tx: T,
    athlete_id: i64,
    snapshot: ActivitySnapshot,
) -> Result<u64, SyncError>
where
    T: IngestTransaction,
{
    let rows = RawActivity::collect(athlete_id, snapshot.extracted_at_utc, snapshot.activities);
    let written = tx.upsert_raw_activities(&rows).await?;
    tx.commit().await?;
    Ok(written)
}

pub async fn load_latest_snapshot_from_env(
    dir: &Path,
    athlete_id: i64,
) -> Result<SnapshotLoad, SyncError> {
    let database_url = database_url_from_env()?;
    let path = latest_snapshot(dir).await?;
    let snapshot = read_snapshot(&path).await?;
    let extracted_at = snapshot.extracted_at_utc;

    let store = PgStore::connect(&database_url).await?;
    store.ensure_schema().await?;
    let rows_written = load_snapshot(store.begin().await?, athlete_id, snapshot).await?;
    info!(
        athlete_id,
        rows_written,
        path = %path.display(),
        "loaded activity snapshot"
    );

    Ok(SnapshotLoad {
        path,
        extracted_at,
        rows_written,
    })
}
