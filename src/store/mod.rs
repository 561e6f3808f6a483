//! Versioned per-symbol state store
//!
//! Owns the key namespace, retention and list caps for everything the rule
//! engine reads: the current bias, its change history, the decision and
//! position logs and date-keyed session summaries.

pub mod keys;
pub mod timestamp;
pub mod types;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::kv::{HealthSnapshot, KvClient, KvOp};

pub use types::{
    Bias, BiasEstablishment, BiasRecord, BiasSnapshot, BlockReason, ChangeEntry, ChangeKind,
    DecisionContent, DecisionRecord, DecisionType, Direction, MarketCondition, PositionEntry,
    SessionClose, SessionRecord, SignalBlocked, SystemReset,
};

/// Outcome of a successful `store_decision`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDecision {
    pub decision_id: String,
    pub decision_type: DecisionType,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Key holding the primary record for this decision
    pub storage_key: String,
    pub history_updated: bool,
}

pub struct StateStore {
    client: Arc<KvClient>,
    config: StorageConfig,
    /// Serializes bias establishment per symbol within this process.
    /// Entries are removed once the last writer for a symbol finishes.
    bias_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StateStore {
    pub fn new(client: Arc<KvClient>, config: StorageConfig) -> Self {
        Self {
            client,
            config,
            bias_locks: DashMap::new(),
        }
    }

    pub fn client(&self) -> &Arc<KvClient> {
        &self.client
    }

    pub fn health_status(&self) -> HealthSnapshot {
        self.client.health()
    }

    /// Current bias with `time_held_minutes` computed against now
    pub async fn get_current_bias(&self, symbol: &str) -> Result<Option<BiasSnapshot>> {
        let record: Option<BiasRecord> = self.client.get_json(&keys::bias(symbol)).await?;
        Ok(record.map(|record| snapshot(record, Utc::now())))
    }

    /// Current bias for several symbols in one round trip
    pub async fn get_biases(&self, symbols: &[String]) -> Result<Vec<(String, Option<BiasSnapshot>)>> {
        let bias_keys: Vec<String> = symbols.iter().map(|s| keys::bias(s)).collect();
        let mut records = self.client.get_multiple::<BiasRecord>(&bias_keys).await?;
        let now = Utc::now();

        Ok(symbols
            .iter()
            .zip(&bias_keys)
            .map(|(symbol, key)| {
                let found = records.remove(key).flatten().map(|r| snapshot(r, now));
                (symbol.clone(), found)
            })
            .collect())
    }

    /// Replace the current bias and record the transition in history
    pub async fn store_bias(&self, symbol: &str, data: BiasEstablishment) -> Result<BiasRecord> {
        data.validate()?;

        let lock = self
            .bias_locks
            .entry(symbol.to_string())
            .or_default()
            .clone();
        let written = {
            let _guard = lock.lock().await;
            self.write_bias(symbol, data).await
        };
        drop(lock);
        self.release_bias_lock(symbol);

        let (record, from) = written?;
        info!(
            symbol = %symbol,
            from = ?from,
            to = %record.bias,
            confidence = record.confidence,
            "Bias established"
        );
        Ok(record)
    }

    /// Write the record and its history entry. Caller holds the symbol lock.
    async fn write_bias(
        &self,
        symbol: &str,
        data: BiasEstablishment,
    ) -> Result<(BiasRecord, Option<Bias>)> {
        let established_at = data.established_at.unwrap_or_else(Utc::now);
        let from = self.previous_bias(symbol).await?;
        let record = data.into_record(symbol, established_at);

        self.client
            .set_json(&keys::bias(symbol), &record, Some(self.config.bias_ttl()))
            .await?;

        let entry = ChangeEntry::bias_change(established_at, from, &record);
        self.append_history(symbol, &entry).await?;
        Ok((record, from))
    }

    /// Drop the symbol's lock once no other writer holds or awaits it
    fn release_bias_lock(&self, symbol: &str) {
        self.bias_locks
            .remove_if(symbol, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    fn bias_lock_count(&self) -> usize {
        self.bias_locks.len()
    }

    /// Destination of the most recent bias change, if any
    async fn previous_bias(&self, symbol: &str) -> Result<Option<Bias>> {
        let history = self.history(symbol).await?;
        Ok(history.iter().find_map(ChangeEntry::destination))
    }

    async fn history(&self, symbol: &str) -> Result<Vec<ChangeEntry>> {
        let stop = list_stop(self.config.history_limit);
        self.client.get_list(&keys::changes(symbol), 0, stop).await
    }

    async fn append_history(&self, symbol: &str, entry: &ChangeEntry) -> Result<()> {
        let key = keys::changes(symbol);
        self.client
            .push_to_list(&key, entry, Some(self.config.history_limit))
            .await?;
        self.client
            .set_expiry(&key, self.config.changes_ttl())
            .await?;
        Ok(())
    }

    /// Validate and persist a decision, fanning out to the record it affects
    pub async fn store_decision(
        &self,
        symbol: &str,
        mut content: DecisionContent,
    ) -> Result<StoredDecision> {
        content.validate()?;

        let now = Utc::now();
        let decision_type = content.decision_type();
        let decision_id = format!(
            "dec_{}_{}",
            symbol.to_lowercase(),
            now.format("%Y%m%d_%H%M%S_%3f")
        );

        let (storage_key, ttl, history_updated) = match &mut content {
            DecisionContent::BiasEstablishment(data) => {
                data.established_at.get_or_insert(now);
                self.store_bias(symbol, data.clone()).await?;
                (keys::bias(symbol), self.config.bias_ttl(), true)
            }
            DecisionContent::PositionEntry(position) => {
                position.timestamp.get_or_insert(now);
                let key = keys::positions(symbol);
                self.client
                    .push_to_list(&key, &*position, Some(self.config.position_limit))
                    .await?;
                self.client
                    .set_expiry(&key, self.config.position_ttl())
                    .await?;
                (key, self.config.position_ttl(), false)
            }
            DecisionContent::SignalBlocked(blocked) => {
                let entry = ChangeEntry::signal_blocked(now, blocked);
                self.append_history(symbol, &entry).await?;
                (keys::decisions(symbol), self.config.decision_ttl(), true)
            }
            DecisionContent::SessionClose(session) => {
                let date = now.date_naive();
                let key = keys::session(date);
                let record = SessionRecord {
                    decision_id: decision_id.clone(),
                    symbol: symbol.to_string(),
                    date: date.format("%Y-%m-%d").to_string(),
                    session: session.clone(),
                    timestamp: Some(now),
                };
                self.client
                    .set_json(&key, &record, Some(self.config.session_ttl()))
                    .await?;

                info!(symbol = %symbol, date = %record.date, "Session summary stored");
                // Sessions live outside the per-symbol decision log
                return Ok(StoredDecision {
                    decision_id,
                    decision_type,
                    stored_at: now,
                    expires_at: expiry(now, self.config.session_ttl()),
                    storage_key: key,
                    history_updated: false,
                });
            }
            DecisionContent::SystemReset(reset) => {
                reset.reset_at.get_or_insert(now);
                (keys::decisions(symbol), self.config.decision_ttl(), false)
            }
        };

        let record = DecisionRecord {
            decision_id: decision_id.clone(),
            symbol: symbol.to_string(),
            content,
            timestamp: Some(now),
        };
        let key = keys::decisions(symbol);
        self.client
            .push_to_list(&key, &record, Some(self.config.decision_limit))
            .await?;
        self.client
            .set_expiry(&key, self.config.decision_ttl())
            .await?;

        info!(
            symbol = %symbol,
            decision_id = %decision_id,
            decision_type = %decision_type,
            "Decision stored"
        );

        Ok(StoredDecision {
            decision_id,
            decision_type,
            stored_at: now,
            expires_at: expiry(now, ttl),
            storage_key,
            history_updated,
        })
    }

    /// History entries from the last `lookback_minutes`, newest first.
    /// Entries whose timestamp cannot be read are left out.
    pub async fn get_recent_changes(
        &self,
        symbol: &str,
        lookback_minutes: i64,
    ) -> Result<Vec<ChangeEntry>> {
        let cutoff = Utc::now() - ChronoDuration::minutes(lookback_minutes);
        let history = self.history(symbol).await?;
        let total = history.len();

        let recent: Vec<ChangeEntry> = history
            .into_iter()
            .filter(|entry| entry.timestamp.is_some_and(|ts| ts >= cutoff))
            .collect();

        debug!(
            symbol = %symbol,
            total = total,
            recent = recent.len(),
            lookback_minutes = lookback_minutes,
            "Loaded recent changes"
        );
        Ok(recent)
    }

    /// Newest-first decisions. At most `limit` entries are read, then filtered by type.
    pub async fn get_decision_history(
        &self,
        symbol: &str,
        limit: usize,
        filter: Option<DecisionType>,
    ) -> Result<Vec<DecisionRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let decisions: Vec<DecisionRecord> = self
            .client
            .get_list(&keys::decisions(symbol), 0, list_stop(limit))
            .await?;

        Ok(match filter {
            Some(kind) => decisions
                .into_iter()
                .filter(|d| d.decision_type() == kind)
                .collect(),
            None => decisions,
        })
    }

    /// Newest-first open position entries
    pub async fn get_position_data(&self, symbol: &str) -> Result<Vec<PositionEntry>> {
        let stop = list_stop(self.config.position_limit);
        self.client.get_list(&keys::positions(symbol), 0, stop).await
    }

    pub async fn get_session(&self, date: NaiveDate) -> Result<Option<SessionRecord>> {
        self.client.get_json(&keys::session(date)).await
    }

    /// Atomically delete every key for `symbol`. Returns how many existed.
    pub async fn clear_symbol_data(&self, symbol: &str) -> Result<usize> {
        let ops: Vec<KvOp> = keys::symbol_keys(symbol)
            .into_iter()
            .map(KvOp::Delete)
            .collect();

        let removed = self
            .client
            .atomic_transaction(&ops)
            .await?
            .into_iter()
            .filter(|removed| *removed)
            .count();

        if removed > 0 {
            warn!(symbol = %symbol, removed = removed, "Symbol data cleared");
        } else {
            debug!(symbol = %symbol, "Nothing to clear");
        }
        Ok(removed)
    }
}

fn snapshot(mut record: BiasRecord, now: DateTime<Utc>) -> BiasSnapshot {
    let time_held_minutes = match record.established_at {
        Some(at) => timestamp::minutes_since(at, now),
        None => {
            warn!(
                symbol = %record.symbol,
                "Bias has no readable established_at, treating as just established"
            );
            record.established_at = Some(now);
            0
        }
    };
    BiasSnapshot {
        record,
        time_held_minutes,
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero())
}

fn list_stop(limit: usize) -> isize {
    isize::try_from(limit).map_or(-1, |limit| limit - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kv::{MemoryConnector, RetryPolicy};
    use serde_json::json;

    fn test_store() -> (StateStore, MemoryConnector) {
        let connector = MemoryConnector::new();
        let client = KvClient::new(
            Arc::new(connector.clone()),
            RetryPolicy::new(1, Duration::from_millis(1), 2.0),
            Duration::from_secs(30),
        );
        (
            StateStore::new(Arc::new(client), StorageConfig::default()),
            connector,
        )
    }

    fn establishment(bias: Bias, minutes_ago: i64) -> BiasEstablishment {
        BiasEstablishment {
            bias,
            confidence: 80,
            reasoning: "Strong momentum above VWAP".to_string(),
            invalidation_level: bias.is_directional().then_some(420.0),
            market_condition: MarketCondition::Normal,
            established_at: Some(Utc::now() - ChronoDuration::minutes(minutes_ago)),
            key_levels: None,
        }
    }

    #[tokio::test]
    async fn test_bias_round_trip() {
        let (store, connector) = test_store();
        store
            .store_bias("SPY", establishment(Bias::Bullish, 0))
            .await
            .unwrap();

        let snap = store.get_current_bias("SPY").await.unwrap().unwrap();
        assert_eq!(snap.bias(), Bias::Bullish);
        assert_eq!(snap.record.confidence, 80);
        assert_eq!(snap.record.invalidation_level, Some(420.0));
        assert!(snap.time_held_minutes <= 1);
        assert!(connector.ttl("bias:SPY").is_some());

        let changes = store.get_recent_changes("SPY", 60).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_bias_change());
    }

    #[tokio::test]
    async fn test_bias_locks_are_released() {
        let (store, connector) = test_store();

        let (first, second, third) = tokio::join!(
            store.store_bias("SPY", establishment(Bias::Bullish, 3)),
            store.store_bias("SPY", establishment(Bias::Bearish, 2)),
            store.store_bias("QQQ", establishment(Bias::Neutral, 1)),
        );
        first.unwrap();
        second.unwrap();
        third.unwrap();
        assert_eq!(store.bias_lock_count(), 0);

        // Writers were serialized, so each entry's "from" is the previous "to"
        let changes = store.get_recent_changes("SPY", 60).await.unwrap();
        assert_eq!(changes.len(), 2);
        match &changes[0].kind {
            ChangeKind::BiasChange { from, .. } => assert_eq!(*from, changes[1].destination()),
            other => panic!("unexpected entry {:?}", other),
        }

        // A failed write still releases its lock
        connector.fail_next(10);
        assert!(store
            .store_bias("IWM", establishment(Bias::Bullish, 0))
            .await
            .is_err());
        assert_eq!(store.bias_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_time_held_is_derived() {
        let (store, _) = test_store();
        store
            .store_bias("SPY", establishment(Bias::Bullish, 5))
            .await
            .unwrap();

        let snap = store.get_current_bias("SPY").await.unwrap().unwrap();
        assert_eq!(snap.time_held_minutes, 5);
    }

    #[tokio::test]
    async fn test_missing_timestamp_counts_as_zero() {
        let (store, connector) = test_store();
        connector.insert_raw(
            "bias:SPY",
            r#"{"symbol":"SPY","bias":"bearish","confidence":60,"reasoning":"Lower highs all day","invalidation_level":430.0,"established_at":"garbage"}"#,
        );

        let snap = store.get_current_bias("SPY").await.unwrap().unwrap();
        assert_eq!(snap.time_held_minutes, 0);
        assert!(snap.record.established_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_stored_shape_reads_as_absent() {
        let (store, connector) = test_store();
        connector.insert_raw("bias:SPY", r#"{"bias":"sideways"}"#);
        assert!(store.get_current_bias("SPY").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_records_previous_bias() {
        let (store, _) = test_store();
        store
            .store_bias("SPY", establishment(Bias::Bullish, 10))
            .await
            .unwrap();
        store
            .store_bias("SPY", establishment(Bias::Bearish, 0))
            .await
            .unwrap();

        let changes = store.get_recent_changes("SPY", 60).await.unwrap();
        assert_eq!(changes.len(), 2);
        match &changes[0].kind {
            ChangeKind::BiasChange { from, to, .. } => {
                assert_eq!(*from, Some(Bias::Bullish));
                assert_eq!(*to, Bias::Bearish);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_bias_is_rejected_before_write() {
        let (store, connector) = test_store();
        let mut data = establishment(Bias::Bullish, 0);
        data.invalidation_level = None;

        let err = store.store_bias("SPY", data).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(connector.key_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_changes_window() {
        let (store, connector) = test_store();
        store
            .store_bias("SPY", establishment(Bias::Bullish, 90))
            .await
            .unwrap();
        store
            .store_bias("SPY", establishment(Bias::Bearish, 30))
            .await
            .unwrap();
        connector.push_raw(
            "changes:SPY",
            r#"{"timestamp":"never","type":"bias_change","from":null,"to":"neutral","reasoning":"x","confidence":1}"#,
        );

        let recent = store.get_recent_changes("SPY", 60).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].destination(), Some(Bias::Bearish));
    }

    #[tokio::test]
    async fn test_store_decision_fans_out() {
        let (store, _) = test_store();

        let position = DecisionContent::parse(
            DecisionType::PositionEntry,
            json!({
                "direction": "long",
                "instrument": "SPY",
                "entry_price": 425.0,
                "size": 10,
                "reasoning": "Breakout with volume",
                "linked_bias": "bullish"
            }),
        )
        .unwrap();
        let stored = store.store_decision("SPY", position).await.unwrap();
        assert!(stored.decision_id.starts_with("dec_spy_"));
        assert_eq!(stored.storage_key, "positions:SPY");
        assert_eq!(
            (stored.expires_at - stored.stored_at).num_hours(),
            24
        );

        let positions = store.get_position_data("SPY").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!(positions[0].timestamp.is_some());

        let blocked = DecisionContent::parse(
            DecisionType::SignalBlocked,
            json!({
                "proposed_bias": "bearish",
                "proposed_reasoning": "Quick flip",
                "block_reason": "holding_period"
            }),
        )
        .unwrap();
        let stored = store.store_decision("SPY", blocked).await.unwrap();
        assert!(stored.history_updated);

        let history = store.get_decision_history("SPY", 10, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].decision_type(), DecisionType::SignalBlocked);

        let only_positions = store
            .get_decision_history("SPY", 10, Some(DecisionType::PositionEntry))
            .await
            .unwrap();
        assert_eq!(only_positions.len(), 1);

        let changes = store.get_recent_changes("SPY", 60).await.unwrap();
        assert!(matches!(changes[0].kind, ChangeKind::SignalBlocked { .. }));
    }

    #[tokio::test]
    async fn test_bias_decision_goes_through_store_bias() {
        let (store, _) = test_store();
        let content = DecisionContent::BiasEstablishment(establishment(Bias::Bearish, 0));
        let stored = store.store_decision("QQQ", content).await.unwrap();
        assert_eq!(stored.storage_key, "bias:QQQ");

        let snap = store.get_current_bias("QQQ").await.unwrap().unwrap();
        assert_eq!(snap.bias(), Bias::Bearish);
        assert_eq!(store.get_decision_history("QQQ", 5, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_close_is_date_keyed() {
        let (store, _) = test_store();
        let content = DecisionContent::SessionClose(SessionClose {
            pnl: Some(-40.0),
            trades_count: 2,
            decisions_count: 4,
            summary: "Choppy session, stayed flat".to_string(),
            key_learnings: vec![],
        });
        let stored = store.store_decision("SPY", content).await.unwrap();
        assert!(stored.storage_key.starts_with("session:"));

        let session = store
            .get_session(stored.stored_at.date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.session.trades_count, 2);
        // Not written to the per-symbol decision log
        assert!(store.get_decision_history("SPY", 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decision_validation_error() {
        let (store, _) = test_store();
        let content = DecisionContent::SessionClose(SessionClose {
            pnl: None,
            trades_count: 0,
            decisions_count: 0,
            summary: "short".to_string(),
            key_learnings: vec![],
        });
        let err = store.store_decision("SPY", content).await.unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "summary"));
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let connector = MemoryConnector::new();
        let client = KvClient::new(
            Arc::new(connector),
            RetryPolicy::none(),
            Duration::from_secs(30),
        );
        let config = StorageConfig {
            history_limit: 3,
            ..StorageConfig::default()
        };
        let store = StateStore::new(Arc::new(client), config);

        for i in 0..5 {
            let bias = if i % 2 == 0 { Bias::Bullish } else { Bias::Bearish };
            store.store_bias("SPY", establishment(bias, 0)).await.unwrap();
        }
        assert_eq!(store.get_recent_changes("SPY", 60).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_clear_symbol_data_is_idempotent() {
        let (store, _) = test_store();
        store
            .store_bias("SPY", establishment(Bias::Bullish, 0))
            .await
            .unwrap();
        store
            .store_bias("QQQ", establishment(Bias::Bearish, 0))
            .await
            .unwrap();

        // bias + changes
        assert_eq!(store.clear_symbol_data("SPY").await.unwrap(), 2);
        assert_eq!(store.clear_symbol_data("SPY").await.unwrap(), 0);
        assert!(store.get_current_bias("SPY").await.unwrap().is_none());
        assert!(store.get_current_bias("QQQ").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_biases() {
        let (store, _) = test_store();
        store
            .store_bias("SPY", establishment(Bias::Bullish, 0))
            .await
            .unwrap();

        let symbols = vec!["SPY".to_string(), "IWM".to_string()];
        let biases = store.get_biases(&symbols).await.unwrap();
        assert_eq!(biases[0].0, "SPY");
        assert_eq!(biases[0].1.as_ref().map(|s| s.bias()), Some(Bias::Bullish));
        assert!(biases[1].1.is_none());
    }
}
