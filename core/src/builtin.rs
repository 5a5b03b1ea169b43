//! Built-in STRIDE rule set, embedded at compile time.

use crate::document::{load_rules, DocumentFormat, LoadError};
use crate::rules::RuleSet;

/// RON source of the default rule set.
pub const DEFAULT_RULES: &str = include_str!("../rules/stride.ron");

/// Compiles the embedded rule set.
pub fn default_rules() -> Result<RuleSet, LoadError> {
    load_rules(DEFAULT_RULES, DocumentFormat::Ron)
}
