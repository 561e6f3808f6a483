//! Consistency rule engine
//!
//! Three independent rules guard bias changes:
//! - [`HoldingPeriodGate`]: minimum time a bias must be held
//! - [`ReversalDetector`]: change frequency and flip-flop patterns
//! - [`InvalidationChecker`]: price must invalidate the thesis before a
//!   change, and open positions must not be deep underwater
//!
//! [`ConsistencyChecker`] runs them against the state store and aggregates
//! the result.

pub mod checker;
pub mod holding_period;
pub mod invalidation;
pub mod reversal;
pub mod types;

pub use checker::ConsistencyChecker;
pub use holding_period::HoldingPeriodGate;
pub use invalidation::InvalidationChecker;
pub use reversal::ReversalDetector;
pub use types::{
    Conflict, ConflictDetail, ConflictKind, ConsistencyRequest, ConsistencyVerdict,
    Recommendation, Rule, RuleVerdict, Severity, VerdictContext, VerdictDebug,
};
