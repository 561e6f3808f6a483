//! Boundary service
//!
//! [`TradingMemory`] wires the KV client, state store and consistency
//! checker together and exposes each operation as a structured result.
//! Nothing here returns a bare error: failures become [`ErrorPayload`]s
//! with guidance for the caller.

pub mod response;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{BackendKind, Config};
use crate::consistency::{ConsistencyChecker, ConsistencyRequest, ConsistencyVerdict};
use crate::error::{Error, Result};
use crate::kv::{KvClient, KvConnector, MemoryConnector, RedisConnector, RetryPolicy};
use crate::store::{keys, DecisionContent, DecisionType, StateStore, StoredDecision, SystemReset};

pub use response::{
    BiasOverview, BiasResponse, ClearReport, DecisionHistory, ErrorCode, ErrorPayload,
    HealthReport, HealthStatus, Outcome, OverviewEntry, PositionList, ResetReport,
};

const MIN_RESET_REASON_CHARS: usize = 10;

lazy_static! {
    static ref SYMBOL_PATTERN: Regex = Regex::new(r"^[A-Z0-9]{1,10}$").expect("valid symbol regex");
}

/// Trim and upper-case a symbol, rejecting anything outside `[A-Z0-9]{1,10}`
pub fn normalize_symbol(raw: &str) -> Result<String> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(Error::validation("symbol", "cannot be empty"));
    }
    if !SYMBOL_PATTERN.is_match(&symbol) {
        return Err(Error::validation(
            "symbol",
            format!("'{}' must be 1-10 letters or digits", raw.trim()),
        ));
    }
    Ok(symbol)
}

pub struct TradingMemory {
    config: Config,
    backend: String,
    client: Arc<KvClient>,
    store: Arc<StateStore>,
    checker: ConsistencyChecker,
    ready: AtomicBool,
    started_at: Instant,
}

impl TradingMemory {
    /// Build against the backend selected in `config.storage.backend`
    pub fn from_config(config: Config) -> Self {
        let connector: Arc<dyn KvConnector> = match config.storage.backend {
            BackendKind::Redis => Arc::new(RedisConnector::new(config.redis.clone())),
            BackendKind::Memory => Arc::new(MemoryConnector::new()),
        };
        Self::new(config, connector)
    }

    pub fn new(config: Config, connector: Arc<dyn KvConnector>) -> Self {
        let backend = connector.describe();
        let client = Arc::new(KvClient::new(
            connector,
            RetryPolicy::from_config(&config.retry),
            Duration::from_secs(config.health.interval_secs),
        ));
        let store = Arc::new(StateStore::new(client.clone(), config.storage.clone()));
        let checker = ConsistencyChecker::new(store.clone(), &config.rules);

        Self {
            config,
            backend,
            client,
            store,
            checker,
            ready: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// Connect to storage and start health monitoring
    pub async fn start(&self) -> Result<()> {
        info!(
            server = %self.config.server.name,
            version = %self.config.server.version,
            backend = %self.backend,
            "Starting trading memory"
        );
        self.client.initialize().await?;
        self.ready.store(true, Ordering::SeqCst);
        info!("Trading memory ready");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.client.close().await;
        info!("Trading memory stopped");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_ready(&self) -> std::result::Result<(), ErrorPayload> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ErrorPayload::not_ready())
        }
    }

    pub async fn get_current_bias(&self, symbol: &str) -> BiasResponse {
        if let Err(payload) = self.ensure_ready() {
            return BiasResponse::Error(payload);
        }
        let symbol = match normalize_symbol(symbol) {
            Ok(symbol) => symbol,
            Err(e) => return BiasResponse::Rejected(ErrorPayload::from_error(&e)),
        };

        match self.store.get_current_bias(&symbol).await {
            Ok(Some(snapshot)) => BiasResponse::Found { symbol, snapshot },
            Ok(None) => BiasResponse::Absent {
                message: format!("No bias established for {}", symbol),
                suggestion: format!(
                    "Store a bias_establishment decision for {} before checking consistency.",
                    symbol
                ),
                symbol,
            },
            Err(e) => {
                error!(symbol = %symbol, "Failed to read bias: {}", e);
                BiasResponse::Error(ErrorPayload::from_error(&e))
            }
        }
    }

    pub async fn store_decision(
        &self,
        symbol: &str,
        decision_type: &str,
        content: Value,
    ) -> Outcome<StoredDecision> {
        if let Err(payload) = self.ensure_ready() {
            return Outcome::Error(payload);
        }

        let result = async {
            let symbol = normalize_symbol(symbol)?;
            let decision_type: DecisionType = decision_type.parse()?;
            let content = DecisionContent::parse(decision_type, content)?;
            self.store.store_decision(&symbol, content).await
        }
        .await;

        if let Err(e) = &result {
            if e.is_validation() {
                warn!(decision_type = %decision_type, "Decision rejected: {}", e);
            } else {
                error!(decision_type = %decision_type, "Failed to store decision: {}", e);
            }
        }
        Outcome::from_result(result)
    }

    pub async fn check_consistency(&self, request: ConsistencyRequest) -> Outcome<ConsistencyVerdict> {
        if let Err(payload) = self.ensure_ready() {
            return Outcome::Error(payload);
        }

        let result = async {
            let mut request = request;
            request.symbol = normalize_symbol(&request.symbol)?;
            self.checker.check(&request).await
        }
        .await;

        match Outcome::from_result(result) {
            // Unverifiable consistency must not read as permission to proceed
            Outcome::Error(payload) => {
                error!("Consistency check failed: {}", payload.message);
                Outcome::Error(ErrorPayload {
                    error: ErrorCode::ConsistencyCheckFailed,
                    guidance: format!(
                        "Consistency could not be verified, treat the signal as blocked. {}",
                        payload.guidance
                    ),
                    ..payload
                })
            }
            other => other,
        }
    }

    pub async fn clear_symbol_data(&self, symbol: &str) -> Outcome<ClearReport> {
        if let Err(payload) = self.ensure_ready() {
            return Outcome::Error(payload);
        }

        let result = async {
            let symbol = normalize_symbol(symbol)?;
            let deleted_keys = self.store.clear_symbol_data(&symbol).await?;
            Ok(ClearReport {
                symbol,
                deleted_keys,
            })
        }
        .await;
        Outcome::from_result(result)
    }

    /// Clear all state for a symbol and leave a `system_reset` audit record
    pub async fn force_reset(&self, symbol: &str, confirm: bool, reason: &str) -> Outcome<ResetReport> {
        if let Err(payload) = self.ensure_ready() {
            return Outcome::Error(payload);
        }

        let symbol = match normalize_symbol(symbol) {
            Ok(symbol) => symbol,
            Err(e) => return Outcome::Rejected(ErrorPayload::from_error(&e)),
        };

        if !confirm {
            return Outcome::Rejected(ErrorPayload::new(
                ErrorCode::ResetNotConfirmed,
                format!("Reset of {} requires explicit confirmation", symbol),
                format!(
                    "Set confirm=true to acknowledge that bias, history, decisions and positions for {} will be deleted.",
                    symbol
                ),
            ));
        }

        let reason = reason.trim();
        if reason.chars().count() < MIN_RESET_REASON_CHARS {
            return Outcome::Rejected(ErrorPayload::from_error(&Error::validation(
                "reason",
                format!("must be at least {} characters", MIN_RESET_REASON_CHARS),
            )));
        }

        let previous_bias = match self.store.get_current_bias(&symbol).await {
            Ok(snapshot) => snapshot.map(|s| s.bias()),
            Err(e) => {
                warn!(symbol = %symbol, "Could not capture pre-reset state: {}", e);
                None
            }
        };
        warn!(
            symbol = %symbol,
            previous_bias = ?previous_bias,
            reason = %reason,
            "Force reset requested"
        );

        let deleted_keys = match self.store.clear_symbol_data(&symbol).await {
            Ok(count) => count,
            Err(e) => {
                error!(symbol = %symbol, "Force reset failed: {}", e);
                return Outcome::Error(ErrorPayload::from_error(&e));
            }
        };

        let reset_at = Utc::now();
        let audit = DecisionContent::SystemReset(SystemReset {
            action: "force_reset".to_string(),
            symbol: symbol.clone(),
            reason: reason.to_string(),
            deleted_keys,
            reset_at: Some(reset_at),
        });
        let audit_decision_id = match self.store.store_decision(&symbol, audit).await {
            Ok(stored) => Some(stored.decision_id),
            Err(e) => {
                warn!(symbol = %symbol, "Reset succeeded but audit record was not written: {}", e);
                None
            }
        };

        info!(symbol = %symbol, deleted_keys = deleted_keys, "Force reset complete");

        Outcome::Success(ResetReport {
            next_steps: vec![
                format!("Establish a fresh bias for {} with a bias_establishment decision", symbol),
                "Re-run check_consistency before acting on new signals".to_string(),
            ],
            keys_attempted: keys::symbol_keys(&symbol).len(),
            symbol,
            deleted_keys,
            previous_bias,
            reason: reason.to_string(),
            reset_at,
            audit_decision_id,
        })
    }

    pub async fn decision_history(
        &self,
        symbol: &str,
        limit: usize,
        decision_type: Option<&str>,
    ) -> Outcome<DecisionHistory> {
        if let Err(payload) = self.ensure_ready() {
            return Outcome::Error(payload);
        }

        let result = async {
            let symbol = normalize_symbol(symbol)?;
            let filter = decision_type.map(str::parse::<DecisionType>).transpose()?;
            let decisions = self.store.get_decision_history(&symbol, limit, filter).await?;
            Ok(DecisionHistory {
                symbol,
                count: decisions.len(),
                decisions,
            })
        }
        .await;
        Outcome::from_result(result)
    }

    pub async fn position_data(&self, symbol: &str) -> Outcome<PositionList> {
        if let Err(payload) = self.ensure_ready() {
            return Outcome::Error(payload);
        }

        let result = async {
            let symbol = normalize_symbol(symbol)?;
            let positions = self.store.get_position_data(&symbol).await?;
            Ok(PositionList {
                symbol,
                count: positions.len(),
                positions,
            })
        }
        .await;
        Outcome::from_result(result)
    }

    /// Current bias across several symbols
    pub async fn bias_overview(&self, symbols: &[String]) -> Outcome<BiasOverview> {
        if let Err(payload) = self.ensure_ready() {
            return Outcome::Error(payload);
        }

        let result = async {
            let symbols = symbols
                .iter()
                .map(|s| normalize_symbol(s))
                .collect::<Result<Vec<_>>>()?;
            let biases = self.store.get_biases(&symbols).await?;
            Ok(BiasOverview {
                biases: biases
                    .into_iter()
                    .map(|(symbol, snapshot)| OverviewEntry {
                        symbol,
                        bias: snapshot.as_ref().map(|s| s.bias()),
                        time_held_minutes: snapshot.as_ref().map(|s| s.time_held_minutes),
                        confidence: snapshot.as_ref().map(|s| s.record.confidence),
                    })
                    .collect(),
            })
        }
        .await;
        Outcome::from_result(result)
    }

    pub fn health(&self) -> HealthReport {
        let storage = self.store.health_status();
        let ready = self.is_ready();
        let status = match (ready, storage.healthy) {
            (false, _) => HealthStatus::Starting,
            (true, true) => HealthStatus::Healthy,
            (true, false) => HealthStatus::Degraded,
        };

        HealthReport {
            status,
            server: self.config.server.name.clone(),
            version: self.config.server.version.clone(),
            backend: self.backend.clone(),
            server_ready: ready,
            storage_healthy: storage.healthy,
            last_health_check: storage.last_health_check,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}
