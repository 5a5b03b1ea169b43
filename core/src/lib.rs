//! # STRIDE core
//!
//! Data-flow graph model and rule engine for reproducible STRIDE threat
//! models.
//!
//! ## Architecture
//!
//! A threat model is a data-flow diagram: external entities, processes and
//! data stores connected by directed flows, with trust boundaries naming the
//! flows that cross them. Evaluation is one linear pass:
//!
//! ```text
//! [Build graph] ──► [Load rules] ──► [Evaluate] ──► [Aggregate] ──► [Export]
//!  GraphError        RuleError        (total)        dedupe+sort     ReportFormat
//! ```
//!
//! Construction and rule loading fail fast; evaluation cannot fail.
//!
//! ## Modules
//!
//! - `graph` - Elements, edges, trust boundaries and the validated graph
//! - `rules` - Declarative threat rules and their compilation
//! - `interpreter` - Rule engine producing findings
//! - `aggregate` - Deduplication and stable ordering of findings
//! - `report` - Table, Markdown and JSON exporters
//! - `document` - JSON/RON/packed model and rule documents
//! - `builtin` - The embedded default STRIDE rule set

mod aggregate;
mod builtin;
mod document;
mod graph;
mod interpreter;
mod report;
mod rules;

pub use aggregate::*;
pub use builtin::*;
pub use document::*;
pub use graph::*;
pub use interpreter::*;
pub use report::*;
pub use rules::{CompiledRule, Flag, PredicateSpec, RuleError, RuleSet, StrideCategory, TargetKind, ThreatRule};

/// Evaluates `rules` against `graph` and returns the deduplicated, ordered findings.
pub fn evaluate(graph: &DataFlowGraph, rules: &RuleSet) -> Vec<Finding> {
    let aggregator: FindingAggregator = RuleEngine::new(graph, rules).evaluate().into_iter().collect();
    if aggregator.is_empty() && !rules.is_empty() {
        tracing::warn!(graph = %graph.name, "no rule matched any target");
    }
    aggregator.findings()
}

/// Runs the full pipeline and packages the result for export.
pub fn analyze(graph: &DataFlowGraph, rules: &RuleSet) -> Report {
    Report {
        model: graph.name.clone(),
        rule_digest: rules.digest().to_string(),
        findings: evaluate(graph, rules),
    }
}
