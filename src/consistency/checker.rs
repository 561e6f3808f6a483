//! Consistency orchestrator
//!
//! Loads the symbol's state once, runs the rules in a fixed order and folds
//! their verdicts into a single recommendation.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::holding_period::HoldingPeriodGate;
use super::invalidation::InvalidationChecker;
use super::reversal::ReversalDetector;
use super::types::{
    Conflict, ConflictKind, ConsistencyRequest, ConsistencyVerdict, Recommendation, Rule,
    RuleVerdict, VerdictContext, VerdictDebug,
};
use crate::config::RulesConfig;
use crate::error::{Error, Result};
use crate::store::{BiasSnapshot, DecisionRecord, DecisionType, MarketCondition, StateStore};

const MIN_REASONING_CHARS: usize = 10;
const MIN_CHOPPY_REASONING_CHARS: usize = 50;

/// Order in which conflicts drive the overall guidance
const GUIDANCE_PRIORITY: [ConflictKind; 4] = [
    ConflictKind::HoldingPeriod,
    ConflictKind::Reversal,
    ConflictKind::Invalidation,
    ConflictKind::AdversePriceMovement,
];

pub struct ConsistencyChecker {
    store: Arc<StateStore>,
    holding_period: HoldingPeriodGate,
    reversal: ReversalDetector,
    invalidation: InvalidationChecker,
    adverse_lookback_decisions: usize,
}

impl ConsistencyChecker {
    pub fn new(store: Arc<StateStore>, rules: &RulesConfig) -> Self {
        Self {
            store,
            holding_period: HoldingPeriodGate::new(rules.holding_period_minutes),
            reversal: ReversalDetector::new(
                rules.reversal_max_changes,
                rules.reversal_lookback_minutes,
            ),
            invalidation: InvalidationChecker::new(
                rules.invalidation_buffer_pct,
                rules.adverse_thresholds.clone(),
            ),
            adverse_lookback_decisions: rules.adverse_lookback_decisions,
        }
    }

    /// Evaluate a proposed bias against the symbol's current state
    pub async fn check(&self, request: &ConsistencyRequest) -> Result<ConsistencyVerdict> {
        let started = Instant::now();
        validate_request(request)?;

        let symbol = request.symbol.as_str();
        let current = self.store.get_current_bias(symbol).await?;
        let recent_changes = self
            .store
            .get_recent_changes(symbol, self.reversal.lookback_minutes())
            .await?;

        debug!(
            symbol = %symbol,
            current = ?current.as_ref().map(BiasSnapshot::bias),
            proposed = %request.proposed_bias,
            recent_changes = recent_changes.len(),
            "Running consistency rules"
        );

        let mut verdicts: Vec<(Rule, RuleVerdict)> = vec![
            (
                Rule::HoldingPeriod,
                self.holding_period.check(
                    current.as_ref(),
                    request.proposed_bias,
                    request.market_condition,
                    request.override_time_gate,
                ),
            ),
            (
                Rule::Reversal,
                self.reversal.check(
                    current.as_ref(),
                    request.proposed_bias,
                    &recent_changes,
                    request.market_condition,
                ),
            ),
        ];

        if request.current_price.is_some() {
            let positions = self.position_entries(symbol, current.as_ref(), request).await;
            verdicts.push((
                Rule::Invalidation,
                self.invalidation.check(
                    current.as_ref(),
                    request.proposed_bias,
                    request.current_price,
                    positions.as_deref(),
                ),
            ));
        }

        let rules_checked: Vec<Rule> = verdicts.iter().map(|(rule, _)| *rule).collect();
        let warnings: Vec<String> = verdicts
            .iter()
            .filter_map(|(_, verdict)| verdict.warning.clone())
            .collect();
        let conflicts: Vec<Conflict> = verdicts
            .into_iter()
            .filter_map(|(_, verdict)| verdict.conflict)
            .collect();

        let consistent = conflicts.is_empty();
        let recommendation = if consistent {
            Recommendation::Proceed
        } else {
            Recommendation::BlockSignal
        };

        if consistent {
            info!(
                symbol = %symbol,
                proposed = %request.proposed_bias,
                "Consistency check passed"
            );
        } else {
            warn!(
                symbol = %symbol,
                proposed = %request.proposed_bias,
                conflicts = ?conflicts.iter().map(|c| c.kind).collect::<Vec<_>>(),
                "Consistency check blocked signal"
            );
        }

        let context = VerdictContext {
            current_bias: current.as_ref().map(BiasSnapshot::bias),
            proposed_bias: request.proposed_bias,
            established_at: current.as_ref().and_then(|c| c.record.established_at),
            time_held_minutes: current.as_ref().map(|c| c.time_held_minutes),
            confidence: current.as_ref().map(|c| c.record.confidence),
            invalidation_level: current.as_ref().and_then(|c| c.record.invalidation_level),
            recent_changes: recent_changes.len(),
            market_condition: request.market_condition,
            reasoning_length: request.reasoning.trim().chars().count(),
            proposed_action: request.proposed_action.clone(),
        };

        let debug = VerdictDebug {
            rules_passed: rules_checked.len() - conflicts.len(),
            rules_failed: conflicts.len(),
            rules_checked,
            current_price: request.current_price,
            override_time_gate: request.override_time_gate,
            warnings,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        Ok(ConsistencyVerdict {
            consistent,
            guidance: overall_guidance(&conflicts),
            conflicts,
            recommendation,
            context,
            debug,
        })
    }

    /// Recent position entries, needed only when the bias is being kept.
    /// A failed load is reported as `None` so the adverse check can pass.
    async fn position_entries(
        &self,
        symbol: &str,
        current: Option<&BiasSnapshot>,
        request: &ConsistencyRequest,
    ) -> Option<Vec<DecisionRecord>> {
        if current.map(BiasSnapshot::bias) != Some(request.proposed_bias) {
            return None;
        }

        match self
            .store
            .get_decision_history(
                symbol,
                self.adverse_lookback_decisions,
                Some(DecisionType::PositionEntry),
            )
            .await
        {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(symbol = %symbol, "Could not load positions for adverse check: {}", e);
                None
            }
        }
    }
}

fn validate_request(request: &ConsistencyRequest) -> Result<()> {
    let reasoning_len = request.reasoning.trim().chars().count();
    if reasoning_len < MIN_REASONING_CHARS {
        return Err(Error::validation(
            "reasoning",
            format!(
                "must be at least {} characters, got {}",
                MIN_REASONING_CHARS, reasoning_len
            ),
        ));
    }

    if request.market_condition == MarketCondition::Choppy
        && reasoning_len < MIN_CHOPPY_REASONING_CHARS
    {
        return Err(Error::validation(
            "reasoning",
            format!(
                "choppy markets need at least {} characters of reasoning, got {}",
                MIN_CHOPPY_REASONING_CHARS, reasoning_len
            ),
        ));
    }

    if let Some(price) = request.current_price {
        if !(price.is_finite() && price > 0.0) {
            return Err(Error::validation(
                "current_price",
                format!("must be positive, got {}", price),
            ));
        }
    }

    Ok(())
}

fn label(kind: ConflictKind) -> &'static str {
    match kind {
        ConflictKind::HoldingPeriod => "HOLDING PERIOD",
        ConflictKind::Reversal => "REVERSAL LIMIT",
        ConflictKind::Invalidation => "THESIS STILL VALID",
        ConflictKind::AdversePriceMovement => "ADVERSE MOVE",
    }
}

fn overall_guidance(conflicts: &[Conflict]) -> String {
    if conflicts.is_empty() {
        return "All consistency checks passed. The proposed bias is consistent with trading discipline."
            .to_string();
    }

    // Highest-priority conflict speaks for the whole verdict
    let primary = GUIDANCE_PRIORITY
        .iter()
        .find_map(|kind| conflicts.iter().find(|c| c.kind == *kind));

    match primary {
        Some(conflict) => format!("{}: {}", label(conflict.kind), conflict.guidance),
        None => format!(
            "MULTIPLE RULE VIOLATIONS ({}). Review each conflict before changing bias.",
            conflicts
                .iter()
                .map(|c| c.kind.rule().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
