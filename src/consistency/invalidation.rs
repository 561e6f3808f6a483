//! Price-invalidation checker
//!
//! Two independent checks depending on the proposal:
//! - changing bias: the current thesis must have been invalidated by price
//!   (with a tolerance buffer around the invalidation level)
//! - keeping bias: an open aligned position must not be deep underwater

use super::types::{Conflict, ConflictDetail, ConflictKind, RuleVerdict, Severity};
use crate::config::PriceThreshold;
use crate::store::{Bias, BiasSnapshot, DecisionContent, DecisionRecord, PositionEntry};

#[derive(Debug, Clone)]
pub struct InvalidationChecker {
    buffer_pct: f64,
    thresholds: Vec<PriceThreshold>,
}

impl InvalidationChecker {
    /// `thresholds` must be ascending by percent
    pub fn new(buffer_pct: f64, thresholds: Vec<PriceThreshold>) -> Self {
        Self {
            buffer_pct,
            thresholds,
        }
    }

    /// `position_entries` is the recent decision log filtered to position
    /// entries, or `None` when it could not be loaded.
    pub fn check(
        &self,
        current: Option<&BiasSnapshot>,
        proposed: Bias,
        current_price: Option<f64>,
        position_entries: Option<&[DecisionRecord]>,
    ) -> RuleVerdict {
        let Some(current) = current else {
            return RuleVerdict::pass("No existing bias to invalidate");
        };

        if current.bias() == proposed {
            self.check_adverse_movement(current, current_price, position_entries)
        } else {
            self.check_breach(current, proposed, current_price)
        }
    }

    fn check_breach(
        &self,
        current: &BiasSnapshot,
        proposed: Bias,
        current_price: Option<f64>,
    ) -> RuleVerdict {
        let (Some(level), Some(price)) = (current.record.invalidation_level, current_price) else {
            return RuleVerdict::pass_with_warning(
                "Invalidation not evaluated",
                "Invalidation level or current price missing, change allowed without a price check",
            );
        };

        // Buffer widens the level in the direction of the current thesis
        let (effective, still_valid) = match (current.bias(), proposed) {
            (Bias::Bullish, Bias::Bearish | Bias::Neutral) => {
                let effective = level * (1.0 - self.buffer_pct);
                (effective, price > effective)
            }
            (Bias::Bearish, Bias::Bullish | Bias::Neutral) => {
                let effective = level * (1.0 + self.buffer_pct);
                (effective, price < effective)
            }
            _ => {
                return RuleVerdict::pass(format!(
                    "No invalidation level applies to a {} -> {} change",
                    current.bias(),
                    proposed
                ))
            }
        };

        if !still_valid {
            return RuleVerdict::pass(format!(
                "{} thesis invalidated: price {:.2} crossed {:.2}",
                current.bias(),
                price,
                effective
            ));
        }

        RuleVerdict::fail(Conflict {
            kind: ConflictKind::Invalidation,
            severity: Severity::Medium,
            message: format!(
                "{} thesis still valid: price {:.2} has not crossed invalidation {:.2} (level {:.2}, {:.1}% buffer)",
                current.bias(),
                price,
                effective,
                level,
                self.buffer_pct * 100.0
            ),
            guidance: format!(
                "Price {:.2} hasn't breached the invalidation level {:.2}. Your {} thesis is still valid, so stick with it until price proves it wrong.",
                price,
                level,
                current.bias()
            ),
            detail: ConflictDetail::InvalidationNotBreached {
                current_price: price,
                invalidation_level: level,
                effective_threshold: effective,
                buffer_pct: self.buffer_pct,
            },
        })
    }

    fn check_adverse_movement(
        &self,
        current: &BiasSnapshot,
        current_price: Option<f64>,
        position_entries: Option<&[DecisionRecord]>,
    ) -> RuleVerdict {
        let Some(price) = current_price else {
            return RuleVerdict::pass("Same bias, no price supplied for position check");
        };

        let Some(entries) = position_entries else {
            return RuleVerdict::pass_with_warning(
                "Adverse movement not evaluated",
                "Position history unavailable",
            );
        };

        let Some(position) = latest_aligned_position(entries, current.bias()) else {
            return RuleVerdict::pass(format!("No open {} position to monitor", current.bias()));
        };

        if !(position.entry_price.is_finite() && position.entry_price > 0.0) {
            return RuleVerdict::pass_with_warning(
                "Adverse movement not evaluated",
                format!("Position has unusable entry price {}", position.entry_price),
            );
        }

        let entry = position.entry_price;
        let adverse = match current.bias() {
            Bias::Bullish => (entry - price) / entry,
            _ => (price - entry) / entry,
        };

        let breached: Vec<PriceThreshold> = self
            .thresholds
            .iter()
            .filter(|t| adverse >= t.percent)
            .cloned()
            .collect();

        let Some(worst) = breached
            .iter()
            .max_by(|a, b| a.percent.total_cmp(&b.percent))
            .cloned()
        else {
            return RuleVerdict::pass(format!(
                "Position within tolerance: {:.2}% adverse from entry {:.2}",
                adverse.max(0.0) * 100.0,
                entry
            ));
        };

        RuleVerdict::fail(Conflict {
            kind: ConflictKind::AdversePriceMovement,
            severity: worst.severity,
            message: format!(
                "{}: price {:.2} is {:.2}% against {} entry at {:.2}",
                worst.message,
                price,
                adverse * 100.0,
                current.bias(),
                entry
            ),
            guidance: format!(
                "Re-examine the {} thesis before adding to it. {}",
                current.bias(),
                worst.message
            ),
            detail: ConflictDetail::AdverseMovement {
                entry_price: entry,
                current_price: price,
                adverse_move_pct: adverse,
                breached,
            },
        })
    }
}

/// Most recent position entry whose direction matches `bias`
fn latest_aligned_position(entries: &[DecisionRecord], bias: Bias) -> Option<&PositionEntry> {
    entries.iter().find_map(|record| match &record.content {
        DecisionContent::PositionEntry(position) if position.direction.aligned_bias() == bias => {
            Some(position)
        }
        _ => None,
    })
}
