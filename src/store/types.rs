//! Persisted record types and their validation rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::timestamp;
use crate::error::{Error, Result};

/// Directional stance on a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn is_directional(self) -> bool {
        !matches!(self, Bias::Neutral)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bias::Bullish => "bullish",
            Bias::Bearish => "bearish",
            Bias::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Bias {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" => Ok(Bias::Bullish),
            "bearish" => Ok(Bias::Bearish),
            "neutral" => Ok(Bias::Neutral),
            other => Err(Error::validation(
                "bias",
                format!("'{}' is not one of bullish, bearish, neutral", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketCondition {
    #[default]
    Normal,
    Volatile,
    Choppy,
}

impl MarketCondition {
    /// Volatile and choppy markets get stricter reversal limits
    pub fn is_unsettled(self) -> bool {
        matches!(self, MarketCondition::Volatile | MarketCondition::Choppy)
    }
}

impl fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MarketCondition::Normal => "normal",
            MarketCondition::Volatile => "volatile",
            MarketCondition::Choppy => "choppy",
        })
    }
}

impl std::str::FromStr for MarketCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(MarketCondition::Normal),
            "volatile" => Ok(MarketCondition::Volatile),
            "choppy" => Ok(MarketCondition::Choppy),
            other => Err(Error::validation(
                "market_condition",
                format!("'{}' is not one of normal, volatile, choppy", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Bias a position in this direction is aligned with
    pub fn aligned_bias(self) -> Bias {
        match self {
            Direction::Long => Bias::Bullish,
            Direction::Short => Bias::Bearish,
        }
    }
}

/// Why a proposed signal was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    #[serde(alias = "time_gate")]
    HoldingPeriod,
    #[serde(alias = "whipsaw")]
    Reversal,
    Invalidation,
    Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    BiasEstablishment,
    PositionEntry,
    SignalBlocked,
    SessionClose,
    SystemReset,
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionType::BiasEstablishment => "bias_establishment",
            DecisionType::PositionEntry => "position_entry",
            DecisionType::SignalBlocked => "signal_blocked",
            DecisionType::SessionClose => "session_close",
            DecisionType::SystemReset => "system_reset",
        })
    }
}

impl std::str::FromStr for DecisionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.trim().to_string())).map_err(|_| {
            Error::validation(
                "decision_type",
                format!(
                    "'{}' is not one of bias_establishment, position_entry, signal_blocked, session_close, system_reset",
                    s
                ),
            )
        })
    }
}

fn require_min_chars(field: &str, value: &str, min: usize) -> Result<()> {
    let len = value.trim().chars().count();
    if len < min {
        return Err(Error::validation(
            field,
            format!("must be at least {} characters, got {}", min, len),
        ));
    }
    Ok(())
}

fn require_positive(field: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(Error::validation(field, format!("must be positive, got {}", value)));
    }
    Ok(())
}

/// Current stance on a symbol as persisted under `bias:{symbol}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasRecord {
    pub symbol: String,
    pub bias: Bias,
    pub confidence: u32,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidation_level: Option<f64>,
    #[serde(default)]
    pub market_condition: MarketCondition,
    #[serde(default, deserialize_with = "timestamp::lenient")]
    pub established_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_levels: Option<Value>,
}

/// Bias establishment request content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasEstablishment {
    pub bias: Bias,
    pub confidence: u32,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidation_level: Option<f64>,
    #[serde(default)]
    pub market_condition: MarketCondition,
    #[serde(
        default,
        deserialize_with = "timestamp::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub established_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_levels: Option<Value>,
}

impl BiasEstablishment {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.confidence) {
            return Err(Error::validation(
                "confidence",
                format!("must be between 1 and 100, got {}", self.confidence),
            ));
        }

        require_min_chars("reasoning", &self.reasoning, 10)?;

        match (self.bias.is_directional(), self.invalidation_level) {
            (true, None) => Err(Error::validation(
                "invalidation_level",
                format!("required for {} bias", self.bias),
            )),
            (true, Some(level)) => require_positive("invalidation_level", level),
            (false, Some(_)) => Err(Error::validation(
                "invalidation_level",
                "must be absent for neutral bias",
            )),
            (false, None) => Ok(()),
        }
    }

    pub fn into_record(self, symbol: &str, established_at: DateTime<Utc>) -> BiasRecord {
        BiasRecord {
            symbol: symbol.to_string(),
            bias: self.bias,
            confidence: self.confidence,
            reasoning: self.reasoning,
            invalidation_level: self.invalidation_level,
            market_condition: self.market_condition,
            established_at: Some(established_at),
            key_levels: self.key_levels,
        }
    }
}

/// Bias record plus the derived holding time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BiasSnapshot {
    #[serde(flatten)]
    pub record: BiasRecord,
    /// Whole minutes since `established_at`, recomputed on each read
    pub time_held_minutes: i64,
}

impl BiasSnapshot {
    pub fn bias(&self) -> Bias {
        self.record.bias
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub direction: Direction,
    pub instrument: String,
    pub entry_price: f64,
    pub size: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_bias: Option<Bias>,
    #[serde(
        default,
        deserialize_with = "timestamp::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PositionEntry {
    pub fn validate(&self) -> Result<()> {
        require_min_chars("instrument", &self.instrument, 3)?;
        require_positive("entry_price", self.entry_price)?;
        require_positive("size", self.size)?;
        require_min_chars("reasoning", &self.reasoning, 10)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBlocked {
    pub proposed_bias: Bias,
    pub proposed_reasoning: String,
    pub block_reason: BlockReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_details: Option<Map<String, Value>>,
}

impl SignalBlocked {
    pub fn validate(&self) -> Result<()> {
        require_min_chars("proposed_reasoning", &self.proposed_reasoning, 5)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClose {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub trades_count: u32,
    #[serde(default)]
    pub decisions_count: u32,
    pub summary: String,
    #[serde(default)]
    pub key_learnings: Vec<String>,
}

impl SessionClose {
    pub fn validate(&self) -> Result<()> {
        require_min_chars("summary", &self.summary, 10)
    }
}

fn default_reset_action() -> String {
    "force_reset".to_string()
}

/// Audit record left behind by a forced symbol reset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReset {
    #[serde(default = "default_reset_action")]
    pub action: String,
    pub symbol: String,
    pub reason: String,
    #[serde(default)]
    pub deleted_keys: usize,
    #[serde(
        default,
        deserialize_with = "timestamp::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub reset_at: Option<DateTime<Utc>>,
}

impl SystemReset {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(Error::validation("symbol", "cannot be empty"));
        }
        require_min_chars("reason", &self.reason, 5)
    }
}

/// Type-specific decision content, tagged by `decision_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision_type", content = "content", rename_all = "snake_case")]
pub enum DecisionContent {
    BiasEstablishment(BiasEstablishment),
    PositionEntry(PositionEntry),
    SignalBlocked(SignalBlocked),
    SessionClose(SessionClose),
    SystemReset(SystemReset),
}

impl DecisionContent {
    /// Parse untyped content for a named decision type
    pub fn parse(decision_type: DecisionType, content: Value) -> Result<Self> {
        if !content.is_object() {
            return Err(Error::validation("content", "must be a JSON object"));
        }

        let tagged = serde_json::json!({
            "decision_type": decision_type,
            "content": content,
        });
        serde_json::from_value(tagged).map_err(|e| Error::validation("content", e.to_string()))
    }

    pub fn decision_type(&self) -> DecisionType {
        match self {
            DecisionContent::BiasEstablishment(_) => DecisionType::BiasEstablishment,
            DecisionContent::PositionEntry(_) => DecisionType::PositionEntry,
            DecisionContent::SignalBlocked(_) => DecisionType::SignalBlocked,
            DecisionContent::SessionClose(_) => DecisionType::SessionClose,
            DecisionContent::SystemReset(_) => DecisionType::SystemReset,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            DecisionContent::BiasEstablishment(c) => c.validate(),
            DecisionContent::PositionEntry(c) => c.validate(),
            DecisionContent::SignalBlocked(c) => c.validate(),
            DecisionContent::SessionClose(c) => c.validate(),
            DecisionContent::SystemReset(c) => c.validate(),
        }
    }
}

/// Entry in the per-symbol decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub symbol: String,
    #[serde(flatten)]
    pub content: DecisionContent,
    #[serde(default, deserialize_with = "timestamp::lenient")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl DecisionRecord {
    pub fn decision_type(&self) -> DecisionType {
        self.content.decision_type()
    }
}

/// Date-keyed end-of-session summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub decision_id: String,
    pub symbol: String,
    pub date: String,
    #[serde(flatten)]
    pub session: SessionClose,
    #[serde(default, deserialize_with = "timestamp::lenient")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// What happened in a change-history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    BiasChange {
        from: Option<Bias>,
        to: Bias,
        reasoning: String,
        confidence: u32,
        #[serde(default)]
        invalidation_level: Option<f64>,
    },
    SignalBlocked {
        proposed_bias: Bias,
        block_reason: BlockReason,
    },
}

/// Entry in the per-symbol change history (newest first)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    #[serde(default, deserialize_with = "timestamp::lenient")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: ChangeKind,
}

impl ChangeEntry {
    pub fn bias_change(
        timestamp: DateTime<Utc>,
        from: Option<Bias>,
        record: &BiasRecord,
    ) -> Self {
        Self {
            timestamp: Some(timestamp),
            kind: ChangeKind::BiasChange {
                from,
                to: record.bias,
                reasoning: record.reasoning.clone(),
                confidence: record.confidence,
                invalidation_level: record.invalidation_level,
            },
        }
    }

    pub fn signal_blocked(timestamp: DateTime<Utc>, blocked: &SignalBlocked) -> Self {
        Self {
            timestamp: Some(timestamp),
            kind: ChangeKind::SignalBlocked {
                proposed_bias: blocked.proposed_bias,
                block_reason: blocked.block_reason,
            },
        }
    }

    pub fn is_bias_change(&self) -> bool {
        matches!(self.kind, ChangeKind::BiasChange { .. })
    }

    /// Destination bias of a bias change
    pub fn destination(&self) -> Option<Bias> {
        match self.kind {
            ChangeKind::BiasChange { to, .. } => Some(to),
            ChangeKind::SignalBlocked { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bullish() -> BiasEstablishment {
        BiasEstablishment {
            bias: Bias::Bullish,
            confidence: 80,
            reasoning: "Strong momentum above VWAP".to_string(),
            invalidation_level: Some(420.0),
            market_condition: MarketCondition::Normal,
            established_at: None,
            key_levels: None,
        }
    }

    #[test]
    fn test_bias_establishment_validation() {
        assert!(bullish().validate().is_ok());

        let mut missing_level = bullish();
        missing_level.invalidation_level = None;
        assert!(matches!(
            missing_level.validate(),
            Err(Error::Validation { ref field, .. }) if field == "invalidation_level"
        ));

        let mut neutral_with_level = bullish();
        neutral_with_level.bias = Bias::Neutral;
        assert!(neutral_with_level.validate().is_err());

        let mut low_confidence = bullish();
        low_confidence.confidence = 0;
        assert!(low_confidence.validate().is_err());

        let mut short_reasoning = bullish();
        short_reasoning.reasoning = "   up   ".to_string();
        assert!(short_reasoning.validate().is_err());
    }

    #[test]
    fn test_decision_content_parse() {
        let content = DecisionContent::parse(
            DecisionType::PositionEntry,
            json!({
                "direction": "long",
                "instrument": "SPY",
                "entry_price": 425.5,
                "size": 10,
                "reasoning": "Breakout confirmed on volume"
            }),
        )
        .unwrap();
        assert_eq!(content.decision_type(), DecisionType::PositionEntry);
        assert!(content.validate().is_ok());

        let bad = DecisionContent::parse(DecisionType::PositionEntry, json!({"direction": "up"}));
        assert!(matches!(bad, Err(Error::Validation { .. })));

        let not_object = DecisionContent::parse(DecisionType::SessionClose, json!("text"));
        assert!(not_object.is_err());
    }

    #[test]
    fn test_block_reason_aliases() {
        let blocked: SignalBlocked = serde_json::from_value(json!({
            "proposed_bias": "bearish",
            "proposed_reasoning": "Flip attempt",
            "block_reason": "time_gate"
        }))
        .unwrap();
        assert_eq!(blocked.block_reason, BlockReason::HoldingPeriod);
    }

    #[test]
    fn test_decision_record_shape() {
        let record = DecisionRecord {
            decision_id: "dec_spy_20240301_143000_000".to_string(),
            symbol: "SPY".to_string(),
            content: DecisionContent::SessionClose(SessionClose {
                pnl: Some(125.0),
                trades_count: 3,
                decisions_count: 5,
                summary: "Trend day, held bias".to_string(),
                key_learnings: vec!["Patience paid".to_string()],
            }),
            timestamp: parse_ts("2024-03-01T14:30:00Z"),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["decision_type"], "session_close");
        assert_eq!(value["content"]["trades_count"], 3);

        let back: DecisionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_change_entry_with_bad_timestamp_still_decodes() {
        let entry: ChangeEntry = serde_json::from_value(json!({
            "timestamp": "not-a-time",
            "type": "bias_change",
            "from": null,
            "to": "bullish",
            "reasoning": "Initial read",
            "confidence": 70
        }))
        .unwrap();
        assert!(entry.timestamp.is_none());
        assert_eq!(entry.destination(), Some(Bias::Bullish));
    }

    #[test]
    fn test_parse_enums_from_str() {
        assert_eq!("Bearish".parse::<Bias>().unwrap(), Bias::Bearish);
        assert!("sideways".parse::<Bias>().is_err());
        assert_eq!("choppy".parse::<MarketCondition>().unwrap(), MarketCondition::Choppy);
        assert_eq!(
            "signal_blocked".parse::<DecisionType>().unwrap(),
            DecisionType::SignalBlocked
        );
        assert!("trade".parse::<DecisionType>().is_err());
    }

    fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
        timestamp::parse_str(raw)
    }
}
