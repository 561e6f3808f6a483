//! Reversal (whipsaw) detector
//!
//! Limits how many bias changes may happen inside the lookback window and
//! catches A -> B -> A flip-flops.

use super::types::{Conflict, ConflictDetail, ConflictKind, RuleVerdict, Severity};
use crate::store::{Bias, BiasSnapshot, ChangeEntry, MarketCondition};

/// Three most recent entries are echoed back on a count failure
const RECENT_CONTEXT: usize = 3;

#[derive(Debug, Clone)]
pub struct ReversalDetector {
    max_changes: usize,
    lookback_minutes: i64,
}

impl ReversalDetector {
    pub fn new(max_changes: usize, lookback_minutes: i64) -> Self {
        Self {
            max_changes,
            lookback_minutes,
        }
    }

    pub fn lookback_minutes(&self) -> i64 {
        self.lookback_minutes
    }

    /// Changes allowed inside the window for a market condition
    pub fn max_allowed(&self, market_condition: MarketCondition) -> usize {
        if market_condition.is_unsettled() {
            1
        } else {
            self.max_changes
        }
    }

    /// `recent_changes` must already be restricted to the lookback window, newest first
    pub fn check(
        &self,
        current: Option<&BiasSnapshot>,
        proposed: Bias,
        recent_changes: &[ChangeEntry],
        market_condition: MarketCondition,
    ) -> RuleVerdict {
        if recent_changes.is_empty() {
            return RuleVerdict::pass("No recent bias changes");
        }

        let current_bias = current.map(BiasSnapshot::bias);
        if current_bias == Some(proposed) {
            return RuleVerdict::pass(format!("Proposed bias matches current {} bias", proposed));
        }

        let changes: Vec<&ChangeEntry> = recent_changes
            .iter()
            .filter(|entry| entry.is_bias_change())
            .collect();
        let max_allowed = self.max_allowed(market_condition);

        if changes.len() >= max_allowed {
            return RuleVerdict::fail(Conflict {
                kind: ConflictKind::Reversal,
                severity: Severity::High,
                message: format!(
                    "{} bias changes in the last {} minutes, maximum is {} in a {} market",
                    changes.len(),
                    self.lookback_minutes,
                    max_allowed,
                    market_condition
                ),
                guidance: format!(
                    "Too many reversals. Hold the current bias and let the {}-minute window clear before changing again.",
                    self.lookback_minutes
                ),
                detail: ConflictDetail::ReversalCount {
                    change_count: changes.len(),
                    max_allowed,
                    lookback_minutes: self.lookback_minutes,
                    recent_changes: changes
                        .iter()
                        .take(RECENT_CONTEXT)
                        .map(|entry| (*entry).clone())
                        .collect(),
                },
            });
        }

        if let (Some(current_bias), [latest, previous, ..]) = (current_bias, changes.as_slice()) {
            if latest.destination() == Some(current_bias) && previous.destination() == Some(proposed)
            {
                return RuleVerdict::fail(Conflict {
                    kind: ConflictKind::Reversal,
                    severity: Severity::Medium,
                    message: format!(
                        "Flip-flop pattern: {} -> {} -> {}",
                        proposed, current_bias, proposed
                    ),
                    guidance: format!(
                        "Returning to {} right after leaving it suggests indecision. Wait for new information.",
                        proposed
                    ),
                    detail: ConflictDetail::ReversalPattern {
                        pattern: [proposed, current_bias, proposed],
                    },
                });
            }
        }

        RuleVerdict::pass(format!(
            "{} of {} allowed bias changes used in the last {} minutes",
            changes.len(),
            max_allowed,
            self.lookback_minutes
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BiasRecord, BlockReason, ChangeKind};
    use chrono::Utc;

    fn held(bias: Bias) -> BiasSnapshot {
        BiasSnapshot {
            record: BiasRecord {
                symbol: "SPY".to_string(),
                bias,
                confidence: 80,
                reasoning: "Strong momentum above VWAP".to_string(),
                invalidation_level: bias.is_directional().then_some(420.0),
                market_condition: MarketCondition::Normal,
                established_at: None,
                key_levels: None,
            },
            time_held_minutes: 10,
        }
    }

    fn change(from: Option<Bias>, to: Bias) -> ChangeEntry {
        ChangeEntry {
            timestamp: Some(Utc::now()),
            kind: ChangeKind::BiasChange {
                from,
                to,
                reasoning: "test".to_string(),
                confidence: 70,
                invalidation_level: None,
            },
        }
    }

    fn blocked() -> ChangeEntry {
        ChangeEntry {
            timestamp: Some(Utc::now()),
            kind: ChangeKind::SignalBlocked {
                proposed_bias: Bias::Bearish,
                block_reason: BlockReason::HoldingPeriod,
            },
        }
    }

    #[test]
    fn test_no_history_passes() {
        let detector = ReversalDetector::new(2, 60);
        let current = held(Bias::Bullish);
        assert!(detector
            .check(Some(&current), Bias::Bearish, &[], MarketCondition::Normal)
            .passed);
    }

    #[test]
    fn test_same_bias_passes() {
        let detector = ReversalDetector::new(2, 60);
        let current = held(Bias::Bullish);
        let history = vec![change(Some(Bias::Bearish), Bias::Bullish), change(None, Bias::Bearish)];
        assert!(detector
            .check(Some(&current), Bias::Bullish, &history, MarketCondition::Normal)
            .passed);
    }

    #[test]
    fn test_count_limit_normal_market() {
        let detector = ReversalDetector::new(2, 60);
        let current = held(Bias::Bullish);

        let one = vec![change(None, Bias::Bullish)];
        assert!(detector
            .check(Some(&current), Bias::Bearish, &one, MarketCondition::Normal)
            .passed);

        let two = vec![change(Some(Bias::Bearish), Bias::Bullish), change(None, Bias::Bearish)];
        let verdict = detector.check(Some(&current), Bias::Bearish, &two, MarketCondition::Normal);
        assert!(!verdict.passed);
        let conflict = verdict.conflict.unwrap();
        assert_eq!(conflict.severity, Severity::High);
        assert!(matches!(
            conflict.detail,
            ConflictDetail::ReversalCount { change_count: 2, max_allowed: 2, .. }
        ));
    }

    #[test]
    fn test_unsettled_markets_allow_one_change() {
        let detector = ReversalDetector::new(2, 60);
        let current = held(Bias::Bullish);
        let one = vec![change(None, Bias::Bullish)];

        for condition in [MarketCondition::Volatile, MarketCondition::Choppy] {
            let verdict = detector.check(Some(&current), Bias::Bearish, &one, condition);
            assert!(!verdict.passed);
            assert!(matches!(
                verdict.conflict.unwrap().detail,
                ConflictDetail::ReversalCount { max_allowed: 1, .. }
            ));
        }
    }

    #[test]
    fn test_blocked_signals_do_not_count() {
        let detector = ReversalDetector::new(2, 60);
        let current = held(Bias::Bullish);
        let history = vec![blocked(), blocked(), change(None, Bias::Bullish)];
        assert!(detector
            .check(Some(&current), Bias::Bearish, &history, MarketCondition::Normal)
            .passed);
    }

    #[test]
    fn test_count_failure_returns_three_most_recent() {
        let detector = ReversalDetector::new(2, 60);
        let current = held(Bias::Neutral);
        let history = vec![
            change(Some(Bias::Bearish), Bias::Neutral),
            change(Some(Bias::Bullish), Bias::Bearish),
            change(Some(Bias::Neutral), Bias::Bullish),
            change(None, Bias::Neutral),
        ];
        let verdict = detector.check(Some(&current), Bias::Bullish, &history, MarketCondition::Normal);
        match verdict.conflict.unwrap().detail {
            ConflictDetail::ReversalCount { recent_changes, change_count, .. } => {
                assert_eq!(change_count, 4);
                assert_eq!(recent_changes.len(), 3);
                assert_eq!(recent_changes[0].destination(), Some(Bias::Neutral));
                assert_eq!(recent_changes[2].destination(), Some(Bias::Bullish));
            }
            other => panic!("unexpected detail {:?}", other),
        }
    }

    #[test]
    fn test_flip_flop_pattern_when_count_allows() {
        let detector = ReversalDetector::new(3, 60);
        let current = held(Bias::Bearish);
        let history = vec![
            change(Some(Bias::Bullish), Bias::Bearish),
            change(None, Bias::Bullish),
        ];
        let verdict = detector.check(Some(&current), Bias::Bullish, &history, MarketCondition::Normal);
        assert!(!verdict.passed);
        let conflict = verdict.conflict.unwrap();
        assert_eq!(conflict.severity, Severity::Medium);
        assert_eq!(
            conflict.detail,
            ConflictDetail::ReversalPattern {
                pattern: [Bias::Bullish, Bias::Bearish, Bias::Bullish]
            }
        );
    }
}
