use crate::error::DomainError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn backoff_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(pow);
    delay.min(max_ms)
}

pub fn format_ms_rfc3339(epoch_ms: i64) -> String {
    let fallback = OffsetDateTime::from_unix_timestamp(0).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let value =
        OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000).unwrap_or(fallback);
    value
        .format(&Rfc3339)
        .unwrap_or("1970-01-01T00:00:00Z".to_string())
}

/// Hex SHA-256 of the JSON encoding of `value`.
pub fn content_hash<T>(value: &T) -> crate::DomainResult<String>
where
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|err| {
        DomainError::Validation(format!("failed to serialize hash payload: {err}"))
    })?;
    let digest = Sha256::digest(&payload);
    Ok(hex::encode(digest))
}

/// Collapses repeated ids into occurrence counts, ordered by id.
pub fn collapse_counts<I, S>(ids: I) -> BTreeMap<String, i64>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut counts = BTreeMap::new();
    for id in ids {
        *counts.entry(id.as_ref().to_string()).or_insert(0) += 1;
    }
    counts
}
