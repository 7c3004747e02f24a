//! Core domain model for Stride: stored OAuth credentials and raw activity documents.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "stride-core";

/// Stored OAuth token pair for one athlete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub athlete_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch seconds.
    pub expires_at: i64,
}

impl Credential {
    /// True when the access token is missing or `now` has reached the expiry.
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.access_token.is_empty() || now >= self.expires_at
    }
}

/// One provider document stored verbatim under its (athlete, activity) identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawActivity {
    pub athlete_id: i64,
    pub activity_id: i64,
    pub extracted_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl RawActivity {
    /// Keep only JSON objects carrying an integer `id`.
    ///
    /// Documents with a NUL character in any key or string are dropped too, since Postgres
    /// `jsonb` rejects them and one such row would fail the athlete's whole batch.
    ///
    /// Later duplicates of an id replace earlier ones in place, so the output holds at most one
    /// row per activity and preserves first-seen order.
    pub fn collect(
        athlete_id: i64,
        extracted_at: DateTime<Utc>,
        documents: Vec<JsonValue>,
    ) -> Vec<RawActivity> {
        let mut rows: Vec<RawActivity> = Vec::with_capacity(documents.len());
        let mut positions: HashMap<i64, usize> = HashMap::new();

        for payload in documents {
            let Some(activity_id) = activity_id_of(&payload) else {
                continue;
            };
            if contains_nul(&payload) {
                continue;
            }
            let row = RawActivity {
                athlete_id,
                activity_id,
                extracted_at,
                payload,
            };
            match positions.get(&activity_id) {
                Some(&idx) => rows[idx] = row,
                None => {
                    positions.insert(activity_id, rows.len());
                    rows.push(row);
                }
            }
        }

        rows
    }
}

fn activity_id_of(document: &JsonValue) -> Option<i64> {
    document.as_object()?.get("id")?.as_i64()
}

fn contains_nul(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(s) => s.contains('\0'),
        JsonValue::Array(items) => items.iter().any(contains_nul),
        JsonValue::Object(map) => map
            .iter()
            .any(|(key, item)| key.contains('\0') || contains_nul(item)),
        _ => false,
    }
}
