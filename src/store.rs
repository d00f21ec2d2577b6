//! State Store (C1)
//!
//! A transactional hash-map-of-records abstraction over Redis, plus the
//! secondary sets/sorted-sets the Credential Registry and rate limiter need
//! for O(1) lookup without scanning the full namespace.
//!
//! Connection management follows the `ConnectionManager` pattern: it
//! reconnects transparently with exponential backoff, so callers never see
//! a broken-pipe error on transient network blips — only genuine backend
//! unavailability surfaces as [`StoreError`].
//!
//! Failure model: every operation here may fail with [`StoreError`]. Callers
//! must treat a failure as "the operation did not happen" and degrade
//! per their own policy (the rate limiter fails open, key validation fails
//! closed) — this module itself never decides that policy.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Thin async client over a Redis-compatible backend. Cheap to clone — the
/// underlying `ConnectionManager` is itself a cloneable handle onto a
/// shared multiplexed connection.
#[derive(Clone)]
pub struct StateStore {
    conn: ConnectionManager,
}

impl StateStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Cheap liveness probe; a failure here means the backend is down, not
    /// that any particular record is missing.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    fn record_key(namespace: &str, id: &str) -> String {
        format!("{namespace}:{id}")
    }

    /// Serializes `record` to JSON and stores it under `namespace:id`,
    /// replacing any prior value wholesale (the registry reads the whole
    /// record, mutates in memory, and writes it back — this is not a
    /// per-field hash update).
    pub async fn put_record<T: Serialize>(
        &self,
        namespace: &str,
        id: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(Self::record_key(namespace, id), serialized)
            .await?;
        Ok(())
    }

    /// Unknown fields in the stored JSON are ignored by serde on
    /// deserialize; a record whose required fields don't parse surfaces as
    /// [`StoreError::Serialization`] rather than a silently-defaulted value.
    pub async fn get_record<T: DeserializeOwned>(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::record_key(namespace, id)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_record(&self, namespace: &str, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(Self::record_key(namespace, id)).await?;
        Ok(deleted > 0)
    }

    pub async fn set_add(&self, set_name: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(set_name, member).await?;
        Ok(())
    }

    pub async fn set_remove(&self, set_name: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(set_name, member).await?;
        Ok(())
    }

    pub async fn set_members(&self, set_name: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(set_name).await?)
    }

    pub async fn set_contains(&self, set_name: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(set_name, member).await?)
    }

    /// Part of the C1 contract; no current caller in the dataplane needs a
    /// score-ordered index, but it's kept as a first-class primitive for
    /// future consumers (e.g. a usage-ranked admin view) rather than bolted
    /// on ad hoc later.
    pub async fn sorted_set_add(&self, name: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(name, member, score).await?;
        Ok(())
    }

    pub async fn sorted_set_range_by_score(
        &self,
        name: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.zrangebyscore(name, min, max).await?)
    }

    /// Atomic increment-and-set-TTL used by the rolling per-minute rate
    /// limiter: the TTL is only (re-)applied on the first increment within
    /// the window so the counter resets at the window boundary rather than
    /// on every request.
    pub async fn atomic_increment_with_ttl(
        &self,
        key: &str,
        ttl_secs: u64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let new_value: i64 = conn.incr(key, 1).await?;
        if new_value == 1 {
            conn.expire::<_, ()>(key, ttl_secs as i64).await?;
        }
        Ok(new_value)
    }

    /// Non-snapshot iteration over every member of `namespace` via SCAN;
    /// callers must tolerate entries added or removed mid-iteration.
    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            ids.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(ids)
    }

    /// Fetches every record in `namespace` whose id appears in `set_name`,
    /// skipping ids whose record has since vanished (set membership is
    /// allowed to briefly diverge from the primary record, per the
    /// eligibility re-check contract).
    pub async fn get_records_in_set<T: DeserializeOwned>(
        &self,
        namespace: &str,
        set_name: &str,
    ) -> Result<HashMap<String, T>, StoreError> {
        let ids = self.set_members(set_name).await?;
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_record::<T>(namespace, &id).await? {
                out.insert(id, record);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        #[serde(default)]
        b: Option<String>,
    }

    #[test]
    fn record_key_joins_namespace_and_id() {
        assert_eq!(StateStore::record_key("upstream-key", "abc"), "upstream-key:abc");
    }

    #[test]
    fn sample_deserializes_with_missing_optional_field() {
        // Mirrors the forward-compatibility contract: fields added later
        // default rather than failing the read.
        let old: Sample = serde_json::from_str(r#"{"a": 1}"#).unwrap();
        assert_eq!(old, Sample { a: 1, b: None });
    }

    #[test]
    fn sample_ignores_unknown_fields_on_read() {
        let value: Sample = serde_json::from_str(r#"{"a": 1, "b": "x", "c": "future-field"}"#).unwrap();
        assert_eq!(value, Sample { a: 1, b: Some("x".to_string()) });
    }
}
