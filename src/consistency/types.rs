//! Rule verdicts and the aggregated consistency verdict

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PriceThreshold;
use crate::store::{Bias, ChangeEntry, MarketCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Medium,
    High,
    Critical,
}

/// The three consistency rules, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    HoldingPeriod,
    Reversal,
    Invalidation,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rule::HoldingPeriod => "holding_period",
            Rule::Reversal => "reversal",
            Rule::Invalidation => "invalidation",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    HoldingPeriod,
    Reversal,
    Invalidation,
    AdversePriceMovement,
}

impl ConflictKind {
    /// Rule that raises this kind of conflict
    pub fn rule(self) -> Rule {
        match self {
            ConflictKind::HoldingPeriod => Rule::HoldingPeriod,
            ConflictKind::Reversal => Rule::Reversal,
            ConflictKind::Invalidation | ConflictKind::AdversePriceMovement => Rule::Invalidation,
        }
    }
}

/// Rule-specific numbers behind a conflict
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum ConflictDetail {
    HoldingPeriod {
        time_held_minutes: i64,
        threshold_minutes: i64,
        remaining_minutes: i64,
    },
    ReversalCount {
        change_count: usize,
        max_allowed: usize,
        lookback_minutes: i64,
        recent_changes: Vec<ChangeEntry>,
    },
    ReversalPattern {
        pattern: [Bias; 3],
    },
    InvalidationNotBreached {
        current_price: f64,
        invalidation_level: f64,
        effective_threshold: f64,
        buffer_pct: f64,
    },
    AdverseMovement {
        entry_price: f64,
        current_price: f64,
        adverse_move_pct: f64,
        breached: Vec<PriceThreshold>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub severity: Severity,
    pub message: String,
    pub guidance: String,
    pub detail: ConflictDetail,
}

/// Outcome of a single rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleVerdict {
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Conflict>,
}

impl RuleVerdict {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            warning: None,
            conflict: None,
        }
    }

    /// Pass, but flag that the rule could not fully evaluate
    pub fn pass_with_warning(message: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            warning: Some(warning.into()),
            conflict: None,
        }
    }

    pub fn fail(conflict: Conflict) -> Self {
        Self {
            passed: false,
            message: conflict.message.clone(),
            warning: None,
            conflict: Some(conflict),
        }
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        self.conflict.as_ref().map(|c| c.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    BlockSignal,
}

/// A proposed bias change to evaluate
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsistencyRequest {
    pub symbol: String,
    pub proposed_bias: Bias,
    pub reasoning: String,
    #[serde(default)]
    pub proposed_action: Option<String>,
    #[serde(default)]
    pub override_time_gate: bool,
    #[serde(default)]
    pub market_condition: MarketCondition,
    #[serde(default)]
    pub current_price: Option<f64>,
}

impl ConsistencyRequest {
    pub fn new(symbol: impl Into<String>, proposed_bias: Bias, reasoning: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            proposed_bias,
            reasoning: reasoning.into(),
            proposed_action: None,
            override_time_gate: false,
            market_condition: MarketCondition::Normal,
            current_price: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.current_price = Some(price);
        self
    }

    pub fn with_market_condition(mut self, condition: MarketCondition) -> Self {
        self.market_condition = condition;
        self
    }

    pub fn with_override(mut self) -> Self {
        self.override_time_gate = true;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.proposed_action = Some(action.into());
        self
    }
}

/// State the verdict was computed against
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictContext {
    pub current_bias: Option<Bias>,
    pub proposed_bias: Bias,
    pub established_at: Option<DateTime<Utc>>,
    pub time_held_minutes: Option<i64>,
    pub confidence: Option<u32>,
    pub invalidation_level: Option<f64>,
    pub recent_changes: usize,
    pub market_condition: MarketCondition,
    pub reasoning_length: usize,
    pub proposed_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictDebug {
    pub rules_checked: Vec<Rule>,
    pub current_price: Option<f64>,
    pub override_time_gate: bool,
    pub rules_passed: usize,
    pub rules_failed: usize,
    pub warnings: Vec<String>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyVerdict {
    pub consistent: bool,
    pub conflicts: Vec<Conflict>,
    pub recommendation: Recommendation,
    pub guidance: String,
    pub context: VerdictContext,
    pub debug: VerdictDebug,
}

impl ConsistencyVerdict {
    pub fn has_conflict(&self, kind: ConflictKind) -> bool {
        self.conflicts.iter().any(|c| c.kind == kind)
    }
}
