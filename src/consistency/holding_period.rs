//! Holding-period gate
//!
//! A newly established bias must be held for a minimum number of minutes
//! before it can be replaced by a different one.

use super::types::{Conflict, ConflictDetail, ConflictKind, RuleVerdict, Severity};
use crate::store::{Bias, BiasSnapshot, MarketCondition};

#[derive(Debug, Clone)]
pub struct HoldingPeriodGate {
    threshold_minutes: i64,
}

impl HoldingPeriodGate {
    pub fn new(threshold_minutes: i64) -> Self {
        Self { threshold_minutes }
    }

    pub fn threshold_minutes(&self) -> i64 {
        self.threshold_minutes
    }

    pub fn check(
        &self,
        current: Option<&BiasSnapshot>,
        proposed: Bias,
        _market_condition: MarketCondition,
        override_gate: bool,
    ) -> RuleVerdict {
        if override_gate {
            return RuleVerdict::pass(
                "Holding period overridden - HIGH RISK: bias change allowed without minimum hold",
            );
        }

        let Some(current) = current else {
            return RuleVerdict::pass("No existing bias, holding period does not apply");
        };

        if current.bias() == proposed {
            return RuleVerdict::pass(format!("Proposed bias matches current {} bias", proposed));
        }

        // Same threshold under every market condition
        let held = current.time_held_minutes;
        if held >= self.threshold_minutes {
            return RuleVerdict::pass(format!(
                "{} bias held {} minutes, minimum is {}",
                current.bias(),
                held,
                self.threshold_minutes
            ));
        }

        let remaining = self.threshold_minutes - held;
        RuleVerdict::fail(Conflict {
            kind: ConflictKind::HoldingPeriod,
            severity: Severity::High,
            message: format!(
                "Cannot change from {} to {}: bias held {} of {} minutes",
                current.bias(),
                proposed,
                held,
                self.threshold_minutes
            ),
            guidance: format!(
                "Wait {} more minute{} before changing bias. Premature changes are usually noise, not signal.",
                remaining,
                if remaining == 1 { "" } else { "s" }
            ),
            detail: ConflictDetail::HoldingPeriod {
                time_held_minutes: held,
                threshold_minutes: self.threshold_minutes,
                remaining_minutes: remaining,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BiasRecord;

    fn held(bias: Bias, minutes: i64) -> BiasSnapshot {
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
            time_held_minutes: minutes,
        }
    }

    #[test]
    fn test_blocks_early_change() {
        let gate = HoldingPeriodGate::new(3);
        let current = held(Bias::Bullish, 1);
        let verdict = gate.check(Some(&current), Bias::Bearish, MarketCondition::Normal, false);

        assert!(!verdict.passed);
        let conflict = verdict.conflict.unwrap();
        assert_eq!(conflict.severity, Severity::High);
        assert_eq!(
            conflict.detail,
            ConflictDetail::HoldingPeriod {
                time_held_minutes: 1,
                threshold_minutes: 3,
                remaining_minutes: 2,
            }
        );
    }

    #[test]
    fn test_allows_after_threshold() {
        let gate = HoldingPeriodGate::new(3);
        for minutes in [3, 5, 600] {
            let current = held(Bias::Bullish, minutes);
            assert!(
                gate.check(Some(&current), Bias::Bearish, MarketCondition::Normal, false)
                    .passed
            );
        }
    }

    #[test]
    fn test_same_bias_always_passes() {
        let gate = HoldingPeriodGate::new(3);
        for bias in [Bias::Bullish, Bias::Bearish, Bias::Neutral] {
            let current = held(bias, 0);
            assert!(gate.check(Some(&current), bias, MarketCondition::Normal, false).passed);
        }
    }

    #[test]
    fn test_no_current_bias_passes() {
        let gate = HoldingPeriodGate::new(3);
        assert!(gate.check(None, Bias::Bullish, MarketCondition::Normal, false).passed);
    }

    #[test]
    fn test_override_passes_with_risk_message() {
        let gate = HoldingPeriodGate::new(3);
        let current = held(Bias::Bullish, 0);
        let verdict = gate.check(Some(&current), Bias::Bearish, MarketCondition::Normal, true);
        assert!(verdict.passed);
        assert!(verdict.message.contains("HIGH RISK"));
    }

    #[test]
    fn test_market_condition_does_not_change_threshold() {
        let gate = HoldingPeriodGate::new(3);
        let current = held(Bias::Bullish, 3);
        for condition in [
            MarketCondition::Normal,
            MarketCondition::Volatile,
            MarketCondition::Choppy,
        ] {
            assert!(gate.check(Some(&current), Bias::Bearish, condition, false).passed);
        }
    }
}
