//! Keyword rules — vocabularies, immutable snapshots and the reloading service.

pub mod keywords;
pub mod service;

pub use keywords::{DEFAULT_RULES, KeywordIndex, RuleKind, RuleSnapshot, default_rule_pairs};
pub use service::{KeywordService, spawn_refresh_task};
