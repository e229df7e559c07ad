//! Detection rules: data types, compilation, stores and the snapshot cache.
//!
//! ```text
//! RuleStore (db / yaml dir / memory)
//!     -> RuleCache::refresh -> RuleSnapshot (compiled, ordered)
//!     -> engine::score
//! ```

pub mod cache;
pub mod compiled;
pub mod expr;
pub mod store;
pub mod types;

pub use cache::{DroppedRule, RuleCache, RuleSnapshot};
pub use compiled::{CompiledRule, RuleMatcher};
pub use expr::{CompareOp, ScoreExpr, ScoreField};
pub use store::{FileRuleStore, MemoryRuleStore, RuleSource, RuleStore};
pub use types::{DetectionRule, RuleType};
