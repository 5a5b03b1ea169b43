//! Rule engine.
//!
//! Walks a [`DataFlowGraph`] in three passes (elements, edges, boundaries)
//! and classifies every target against the rules whose `appliesTo` matches
//! it. Evaluation only reads the graph and the rule set; it cannot fail.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::graph::{DataFlowGraph, Edge, EdgeFlags, Element, TrustBoundary};
use crate::rules::{CompiledRule, Flag, Predicate, RuleSet, StrideCategory, TargetKind, TemplateContext};

/// A single derived threat on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub target_id: String,
    pub target_kind: TargetKind,
    pub category: StrideCategory,
    pub threat: String,
    pub mitigation: String,
    pub severity: u32,
    /// Id of the rule that produced this finding.
    pub rule: String,
}

/// Names and flags a predicate sees while it is scoped to one target.
#[derive(Debug, Clone, Copy)]
struct View<'g> {
    id: &'g str,
    name: &'g str,
    flags: FlagBag,
}

impl<'g> View<'g> {
    fn of_edge(graph: &DataFlowGraph, edge: &'g Edge) -> Self {
        Self {
            id: &edge.id,
            name: edge.name(),
            flags: FlagBag::from_edge(graph.effective_edge_flags(edge)),
        }
    }
}

/// Everything visible to a predicate for one target.
struct Subject<'g> {
    own: View<'g>,
    /// Incident edges for elements, crossing edges for boundaries.
    edges: Vec<View<'g>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct FlagBag {
    handles_sensitive_data: bool,
    is_authentication_boundary: bool,
    is_externally_hosted: bool,
    is_logging_target: bool,
    crosses_boundary: bool,
    crosses_trust_boundary: bool,
    carries_credentials: bool,
    is_encrypted_in_transit: bool,
}

impl FlagBag {
    fn get(&self, flag: Flag) -> bool {
        match flag {
            Flag::HandlesSensitiveData => self.handles_sensitive_data,
            Flag::IsAuthenticationBoundary => self.is_authentication_boundary,
            Flag::IsExternallyHosted => self.is_externally_hosted,
            Flag::IsLoggingTarget => self.is_logging_target,
            Flag::CrossesBoundary => self.crosses_boundary,
            Flag::CrossesTrustBoundary => self.crosses_trust_boundary,
            Flag::CarriesCredentials => self.carries_credentials,
            Flag::IsEncryptedInTransit => self.is_encrypted_in_transit,
        }
    }

    fn from_edge(flags: EdgeFlags) -> Self {
        Self {
            crosses_trust_boundary: flags.crosses_trust_boundary,
            carries_credentials: flags.carries_credentials,
            is_encrypted_in_transit: flags.is_encrypted_in_transit,
            ..Self::default()
        }
    }
}

/// Evaluates a rule set against a graph.
pub struct RuleEngine<'a> {
    graph: &'a DataFlowGraph,
    rules: &'a RuleSet,
}

impl<'a> RuleEngine<'a> {
    pub fn new(graph: &'a DataFlowGraph, rules: &'a RuleSet) -> Self {
        Self { graph, rules }
    }

    /// Runs all three passes. Findings come out in production order: targets
    /// in pass then insertion order, rules in declaration order per target.
    pub fn evaluate(&self) -> Vec<Finding> {
        let mut findings = Vec::new();

        for element in self.graph.elements() {
            findings.extend(self.evaluate_element(element));
        }
        for edge in self.graph.edges() {
            findings.extend(self.evaluate_edge(edge));
        }
        for boundary in self.graph.boundaries() {
            findings.extend(self.evaluate_boundary(boundary));
        }

        info!(
            graph = %self.graph.name,
            targets = self.graph.len(),
            findings = findings.len(),
            "rule evaluation complete"
        );
        findings
    }

    /// Findings for one element, using its own flags plus the derived
    /// `crossesBoundary` from incident edges.
    pub fn evaluate_element(&self, element: &Element) -> Vec<Finding> {
        let edges: Vec<View<'_>> = self
            .graph
            .incident_edges(&element.id)
            .map(|e| View::of_edge(self.graph, e))
            .collect();

        let own = FlagBag {
            handles_sensitive_data: element.flags.handles_sensitive_data,
            is_authentication_boundary: element.flags.is_authentication_boundary,
            is_externally_hosted: element.flags.is_externally_hosted,
            is_logging_target: element.flags.is_logging_target,
            crosses_boundary: edges.iter().any(|e| e.flags.crosses_trust_boundary),
            ..FlagBag::default()
        };

        let subject = Subject {
            own: View {
                id: &element.id,
                name: &element.name,
                flags: own,
            },
            edges,
        };
        let ctx = TemplateContext {
            id: &element.id,
            name: &element.name,
            kind: element.kind.into(),
            source: None,
            destination: None,
        };
        self.apply(element.kind.into(), &subject, &ctx)
    }

    pub fn evaluate_edge(&self, edge: &Edge) -> Vec<Finding> {
        let subject = Subject {
            own: View::of_edge(self.graph, edge),
            edges: Vec::new(),
        };
        let ctx = TemplateContext {
            id: &edge.id,
            name: edge.name(),
            kind: TargetKind::Edge,
            source: Some(&edge.source),
            destination: Some(&edge.destination),
        };
        self.apply(TargetKind::Edge, &subject, &ctx)
    }

    /// Findings for one boundary, quantifying over its crossing edges.
    pub fn evaluate_boundary(&self, boundary: &TrustBoundary) -> Vec<Finding> {
        let edges = boundary
            .crossing_edges
            .iter()
            .filter_map(|id| self.graph.edge(id))
            .map(|e| View::of_edge(self.graph, e))
            .collect();

        let subject = Subject {
            own: View {
                id: &boundary.id,
                name: &boundary.name,
                flags: FlagBag::default(),
            },
            edges,
        };
        let ctx = TemplateContext {
            id: &boundary.id,
            name: &boundary.name,
            kind: TargetKind::Boundary,
            source: None,
            destination: None,
        };
        self.apply(TargetKind::Boundary, &subject, &ctx)
    }

    fn apply(&self, kind: TargetKind, subject: &Subject<'_>, ctx: &TemplateContext<'_>) -> Vec<Finding> {
        self.rules
            .for_target(kind)
            .filter(|rule| {
                let fired = matches(&rule.predicate, subject, &subject.own);
                debug!(rule = %rule.id, subject = subject.own.id, fired, "evaluated rule");
                fired
            })
            .map(|rule| render(rule, ctx))
            .collect()
    }
}

fn render(rule: &CompiledRule, ctx: &TemplateContext<'_>) -> Finding {
    Finding {
        target_id: ctx.id.to_string(),
        target_kind: ctx.kind,
        category: rule.category,
        threat: rule.threat.render(ctx),
        mitigation: rule.mitigation.render(ctx),
        severity: rule.severity,
        rule: rule.id.clone(),
    }
}

/// Evaluates `predicate` against `scope`. Edge quantifiers rebind the scope,
/// names included, to each of the subject's edges.
fn matches(predicate: &Predicate, subject: &Subject<'_>, scope: &View<'_>) -> bool {
    match predicate {
        Predicate::Always => true,
        Predicate::Flag(flag) => scope.flags.get(*flag),
        Predicate::Not(inner) => !matches(inner, subject, scope),
        Predicate::All(items) => items.iter().all(|p| matches(p, subject, scope)),
        Predicate::Any(items) => items.iter().any(|p| matches(p, subject, scope)),
        Predicate::AnyEdge(inner) => subject.edges.iter().any(|e| matches(inner, subject, e)),
        Predicate::EveryEdge(inner) => {
            !subject.edges.is_empty() && subject.edges.iter().all(|e| matches(inner, subject, e))
        }
        Predicate::NameMatches(re) => re.is_match(scope.id) || re.is_match(scope.name),
    }
}
