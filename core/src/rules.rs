//! Declarative threat rules.
//!
//! Rules are written as plain data (JSON or RON) and compiled once into a
//! [`RuleSet`]. Compilation resolves every flag name, checks that each flag
//! is meaningful for the rule's target, parses templates, and compiles name
//! patterns. A single bad rule rejects the whole set.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::graph::ElementKind;

// ============================================================================
// STRIDE categories and targets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrideCategory {
    Spoofing,
    Tampering,
    Repudiation,
    InformationDisclosure,
    DenialOfService,
    ElevationOfPrivilege,
}

impl StrideCategory {
    pub fn all() -> [StrideCategory; 6] {
        [
            StrideCategory::Spoofing,
            StrideCategory::Tampering,
            StrideCategory::Repudiation,
            StrideCategory::InformationDisclosure,
            StrideCategory::DenialOfService,
            StrideCategory::ElevationOfPrivilege,
        ]
    }

    /// Stable identifier, also the secondary sort key of a report.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrideCategory::Spoofing => "Spoofing",
            StrideCategory::Tampering => "Tampering",
            StrideCategory::Repudiation => "Repudiation",
            StrideCategory::InformationDisclosure => "InformationDisclosure",
            StrideCategory::DenialOfService => "DenialOfService",
            StrideCategory::ElevationOfPrivilege => "ElevationOfPrivilege",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StrideCategory::Spoofing => "Spoofing",
            StrideCategory::Tampering => "Tampering",
            StrideCategory::Repudiation => "Repudiation",
            StrideCategory::InformationDisclosure => "Information Disclosure",
            StrideCategory::DenialOfService => "Denial of Service",
            StrideCategory::ElevationOfPrivilege => "Elevation of Privilege",
        }
    }
}

impl fmt::Display for StrideCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rule applies to, and what a finding points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    ExternalEntity,
    Process,
    DataStore,
    Edge,
    Boundary,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::ExternalEntity => "ExternalEntity",
            TargetKind::Process => "Process",
            TargetKind::DataStore => "DataStore",
            TargetKind::Edge => "Edge",
            TargetKind::Boundary => "Boundary",
        }
    }

    fn scope(&self) -> Scope {
        match self {
            TargetKind::ExternalEntity | TargetKind::Process | TargetKind::DataStore => Scope::Element,
            TargetKind::Edge => Scope::Edge,
            TargetKind::Boundary => Scope::Boundary,
        }
    }
}

impl From<ElementKind> for TargetKind {
    fn from(kind: ElementKind) -> Self {
        match kind {
            ElementKind::ExternalEntity => TargetKind::ExternalEntity,
            ElementKind::Process => TargetKind::Process,
            ElementKind::DataStore => TargetKind::DataStore,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Flags
// ============================================================================

/// Every flag a predicate may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    HandlesSensitiveData,
    IsAuthenticationBoundary,
    IsExternallyHosted,
    IsLoggingTarget,
    /// Derived: some incident edge crosses a trust boundary.
    CrossesBoundary,
    CrossesTrustBoundary,
    CarriesCredentials,
    IsEncryptedInTransit,
}

impl Flag {
    pub fn from_name(name: &str) -> Option<Flag> {
        let flag = match name {
            "handlesSensitiveData" => Flag::HandlesSensitiveData,
            "isAuthenticationBoundary" => Flag::IsAuthenticationBoundary,
            "isExternallyHosted" => Flag::IsExternallyHosted,
            "isLoggingTarget" => Flag::IsLoggingTarget,
            "crossesBoundary" => Flag::CrossesBoundary,
            "crossesTrustBoundary" => Flag::CrossesTrustBoundary,
            "carriesCredentials" => Flag::CarriesCredentials,
            "isEncryptedInTransit" => Flag::IsEncryptedInTransit,
            _ => return None,
        };
        Some(flag)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Flag::HandlesSensitiveData => "handlesSensitiveData",
            Flag::IsAuthenticationBoundary => "isAuthenticationBoundary",
            Flag::IsExternallyHosted => "isExternallyHosted",
            Flag::IsLoggingTarget => "isLoggingTarget",
            Flag::CrossesBoundary => "crossesBoundary",
            Flag::CrossesTrustBoundary => "crossesTrustBoundary",
            Flag::CarriesCredentials => "carriesCredentials",
            Flag::IsEncryptedInTransit => "isEncryptedInTransit",
        }
    }

    fn scope(&self) -> Scope {
        match self {
            Flag::CrossesTrustBoundary | Flag::CarriesCredentials | Flag::IsEncryptedInTransit => Scope::Edge,
            _ => Scope::Element,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Element,
    Edge,
    Boundary,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Element => "element",
            Scope::Edge => "edge",
            Scope::Boundary => "boundary",
        }
    }
}

// ============================================================================
// Rule documents
// ============================================================================

/// Predicate as written in a rule document.
///
/// ```text
/// All([Flag("crossesTrustBoundary"), Not(Flag("isEncryptedInTransit"))])
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PredicateSpec {
    #[default]
    Always,
    Flag(String),
    Not(Box<PredicateSpec>),
    All(Vec<PredicateSpec>),
    Any(Vec<PredicateSpec>),
    /// Some incident (element) or crossing (boundary) edge satisfies the inner predicate.
    AnyEdge(Box<PredicateSpec>),
    /// Every incident or crossing edge satisfies the inner predicate. False when there are none.
    EveryEdge(Box<PredicateSpec>),
    /// The target's id or name matches the regex.
    NameMatches(String),
}

impl PredicateSpec {
    pub fn flag(name: &str) -> Self {
        PredicateSpec::Flag(name.to_string())
    }

    pub fn not(inner: PredicateSpec) -> Self {
        PredicateSpec::Not(Box::new(inner))
    }
}

/// A single threat rule, as loaded from a rule document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub applies_to: TargetKind,
    pub category: StrideCategory,
    #[serde(default)]
    pub predicate: PredicateSpec,
    pub threat: String,
    pub mitigation: String,
    pub severity: u32,
}

/// Rule-set load failure. Carries the rule index and id so the document can be fixed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule #{index} ('{rule}'): {reason}")]
    InvalidRule { index: usize, rule: String, reason: String },
}

// ============================================================================
// Compiled predicates
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    Always,
    Flag(Flag),
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    AnyEdge(Box<Predicate>),
    EveryEdge(Box<Predicate>),
    NameMatches(Regex),
}

fn compile_predicate(spec: &PredicateSpec, scope: Scope) -> Result<Predicate, String> {
    compile_in(spec, scope, false)
}

/// `quantified` is set inside an `AnyEdge`/`EveryEdge` body.
fn compile_in(spec: &PredicateSpec, scope: Scope, quantified: bool) -> Result<Predicate, String> {
    let compiled = match spec {
        PredicateSpec::Always => Predicate::Always,
        PredicateSpec::Flag(name) => {
            let flag = Flag::from_name(name).ok_or_else(|| format!("undefined flag '{}'", name))?;
            if scope == Scope::Boundary {
                return Err("boundary rules must test flags through AnyEdge or EveryEdge".to_string());
            }
            if flag.scope() != scope {
                return Err(format!("flag '{}' is not defined for {} targets", name, scope.as_str()));
            }
            Predicate::Flag(flag)
        }
        PredicateSpec::Not(inner) => Predicate::Not(Box::new(compile_in(inner, scope, quantified)?)),
        PredicateSpec::All(items) => Predicate::All(
            items.iter().map(|p| compile_in(p, scope, quantified)).collect::<Result<_, _>>()?,
        ),
        PredicateSpec::Any(items) => Predicate::Any(
            items.iter().map(|p| compile_in(p, scope, quantified)).collect::<Result<_, _>>()?,
        ),
        PredicateSpec::AnyEdge(inner) | PredicateSpec::EveryEdge(inner) => {
            if quantified {
                return Err("edge quantifiers cannot be nested".to_string());
            }
            if scope == Scope::Edge {
                return Err("edge quantifiers are not available in edge rules".to_string());
            }
            let inner = Box::new(compile_in(inner, Scope::Edge, true)?);
            if matches!(spec, PredicateSpec::AnyEdge(_)) {
                Predicate::AnyEdge(inner)
            } else {
                Predicate::EveryEdge(inner)
            }
        }
        PredicateSpec::NameMatches(pattern) => Predicate::NameMatches(
            Regex::new(pattern).map_err(|e| format!("invalid name pattern '{}': {}", pattern, e))?,
        ),
    };
    Ok(compiled)
}

// ============================================================================
// Templates
// ============================================================================

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placeholder {
    Id,
    Name,
    Kind,
    Source,
    Destination,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Placeholder),
}

/// Values a template can interpolate for one target.
pub(crate) struct TemplateContext<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub kind: TargetKind,
    pub source: Option<&'a str>,
    pub destination: Option<&'a str>,
}

/// A threat or mitigation text with `{placeholder}` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Template {
    segments: Vec<Segment>,
}

impl Template {
    fn parse(text: &str, scope: Scope) -> Result<Self, String> {
        if text.trim().is_empty() {
            return Err("template is empty".to_string());
        }

        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let (Some(whole), Some(field)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(text[last..whole.start()].to_string()));
            }
            let placeholder = match field.as_str() {
                "id" => Placeholder::Id,
                "name" => Placeholder::Name,
                "kind" => Placeholder::Kind,
                "source" if scope == Scope::Edge => Placeholder::Source,
                "destination" if scope == Scope::Edge => Placeholder::Destination,
                other => {
                    return Err(format!(
                        "unknown placeholder '{{{}}}' for {} targets",
                        other,
                        scope.as_str()
                    ))
                }
            };
            segments.push(Segment::Field(placeholder));
            last = whole.end();
        }
        if last < text.len() {
            segments.push(Segment::Literal(text[last..].to_string()));
        }
        Ok(Self { segments })
    }

    pub(crate) fn render(&self, ctx: &TemplateContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(Placeholder::Id) => out.push_str(ctx.id),
                Segment::Field(Placeholder::Name) => out.push_str(ctx.name),
                Segment::Field(Placeholder::Kind) => out.push_str(ctx.kind.as_str()),
                Segment::Field(Placeholder::Source) => out.push_str(ctx.source.unwrap_or_default()),
                Segment::Field(Placeholder::Destination) => out.push_str(ctx.destination.unwrap_or_default()),
            }
        }
        out
    }
}

// ============================================================================
// Rule set
// ============================================================================

/// A rule after validation, ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub index: usize,
    pub applies_to: TargetKind,
    pub category: StrideCategory,
    pub severity: u32,
    pub(crate) predicate: Predicate,
    pub(crate) threat: Template,
    pub(crate) mitigation: Template,
    spec: ThreatRule,
}

impl CompiledRule {
    fn compile(index: usize, spec: ThreatRule) -> Result<Self, RuleError> {
        let id = spec.id.clone().unwrap_or_else(|| format!("rule-{}", index));
        let invalid = |reason: String| RuleError::InvalidRule {
            index,
            rule: id.clone(),
            reason,
        };

        if id.trim().is_empty() {
            return Err(invalid("rule id is empty".to_string()));
        }
        let scope = spec.applies_to.scope();
        let predicate = compile_predicate(&spec.predicate, scope).map_err(&invalid)?;
        let threat = Template::parse(&spec.threat, scope).map_err(|e| invalid(format!("threat {}", e)))?;
        let mitigation =
            Template::parse(&spec.mitigation, scope).map_err(|e| invalid(format!("mitigation {}", e)))?;

        Ok(Self {
            id: id.clone(),
            index,
            applies_to: spec.applies_to,
            category: spec.category,
            severity: spec.severity,
            predicate,
            threat,
            mitigation,
            spec,
        })
    }

    /// The rule as it was declared.
    pub fn spec(&self) -> &ThreatRule {
        &self.spec
    }
}

/// An immutable, fully validated, ordered rule set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    digest: String,
}

impl RuleSet {
    /// Validates and compiles `rules` in declaration order. Either every rule
    /// loads or none do.
    pub fn load(rules: Vec<ThreatRule>) -> Result<Self, RuleError> {
        let digest = digest_rules(&rules);
        let mut compiled = Vec::with_capacity(rules.len());
        let mut seen = std::collections::HashSet::new();
        for (index, spec) in rules.into_iter().enumerate() {
            let rule = CompiledRule::compile(index, spec)?;
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::InvalidRule {
                    index,
                    rule: rule.id,
                    reason: "duplicate rule id".to_string(),
                });
            }
            debug!(rule = %rule.id, applies_to = %rule.applies_to, category = %rule.category, "compiled rule");
            compiled.push(rule);
        }

        info!(rules = compiled.len(), digest = %digest, "rule set loaded");
        Ok(Self { rules: compiled, digest })
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Rules for one target kind, in declaration order.
    pub fn for_target(&self, kind: TargetKind) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(move |r| r.applies_to == kind)
    }

    /// Short hex fingerprint of the declared rules.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// First 8 bytes of SHA-256 over the canonical JSON of the rules.
fn digest_rules(rules: &[ThreatRule]) -> String {
    let mut hasher = Sha256::new();
    for rule in rules {
        // Plain data with string keys; serialization cannot fail.
        let json = serde_json::to_vec(rule).unwrap_or_default();
        hasher.update(&json);
        hasher.update(b"\n");
    }
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}
