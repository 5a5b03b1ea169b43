use std::io;
use std::sync::{Arc, Mutex};

use stride_core::{
    analyze, default_rules, evaluate, load_model, DataFlowGraph, DocumentFormat, Edge, EdgeFlags, Element,
    ElementFlags, ElementKind, GraphError, JsonFormat, MarkdownFormat, PredicateSpec, ReportFormat, RuleError,
    RuleSet, StrideCategory, TableFormat, TargetKind, ThreatRule, TrustBoundary,
};

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, logs.contents())
}

fn shop_graph() -> DataFlowGraph {
    let mut graph = DataFlowGraph::new("shop");
    graph
        .add_element(Element::new("browser", "Browser", ElementKind::ExternalEntity))
        .unwrap();
    graph
        .add_element(Element::new("gateway", "Gateway", ElementKind::Process))
        .unwrap();
    graph
        .add_element(Element::new("db", "Orders DB", ElementKind::DataStore).with_flags(ElementFlags {
            handles_sensitive_data: true,
            ..ElementFlags::default()
        }))
        .unwrap();
    graph
        .add_edge(Edge::new("browser", "gateway").with_flags(EdgeFlags {
            crosses_trust_boundary: true,
            is_encrypted_in_transit: false,
            ..EdgeFlags::default()
        }))
        .unwrap();
    graph
}

fn plaintext_rule() -> ThreatRule {
    ThreatRule {
        id: Some("flow-plaintext".to_string()),
        applies_to: TargetKind::Edge,
        category: StrideCategory::InformationDisclosure,
        predicate: PredicateSpec::All(vec![
            PredicateSpec::flag("crossesTrustBoundary"),
            PredicateSpec::not(PredicateSpec::flag("isEncryptedInTransit")),
        ]),
        threat: "{source} to {destination} is readable in transit".to_string(),
        mitigation: "Enforce TLS on {id}".to_string(),
        severity: 8,
    }
}

#[test]
fn test_single_plaintext_flow_scenario() {
    let graph = shop_graph();
    let rules = RuleSet::load(vec![plaintext_rule()]).unwrap();

    let findings = evaluate(&graph, &rules);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].target_id, "browser→gateway");
    assert_eq!(findings[0].target_kind, TargetKind::Edge);
    assert_eq!(findings[0].category, StrideCategory::InformationDisclosure);
    assert_eq!(findings[0].severity, 8);
    assert_eq!(findings[0].threat, "browser to gateway is readable in transit");
}

#[test]
fn test_elevation_on_crossing_process_pair() {
    let mut graph = DataFlowGraph::new("pair");
    graph.add_element(Element::new("front", "Front", ElementKind::Process)).unwrap();
    graph
        .add_element(Element::new("back", "Back", ElementKind::Process).with_flags(ElementFlags {
            is_authentication_boundary: true,
            ..ElementFlags::default()
        }))
        .unwrap();
    graph
        .add_edge(Edge::new("front", "back").with_flags(EdgeFlags {
            crosses_trust_boundary: true,
            ..EdgeFlags::default()
        }))
        .unwrap();

    let rules = RuleSet::load(vec![ThreatRule {
        id: None,
        applies_to: TargetKind::Process,
        category: StrideCategory::ElevationOfPrivilege,
        predicate: PredicateSpec::All(vec![
            PredicateSpec::flag("crossesBoundary"),
            PredicateSpec::not(PredicateSpec::flag("isAuthenticationBoundary")),
        ]),
        threat: "{name} lacks authorization".to_string(),
        mitigation: "Authorize calls to {name}".to_string(),
        severity: 9,
    }])
    .unwrap();

    let findings = evaluate(&graph, &rules);
    let elevation: Vec<_> = findings
        .iter()
        .filter(|f| f.category == StrideCategory::ElevationOfPrivilege)
        .collect();
    assert_eq!(elevation.len(), 1);
    assert_eq!(elevation[0].target_id, "front");
}

#[test]
fn test_evaluation_is_deterministic() {
    let mut graph = shop_graph();
    graph
        .add_edge(Edge::new("gateway", "db").with_flags(EdgeFlags {
            carries_credentials: true,
            ..EdgeFlags::default()
        }))
        .unwrap();
    graph
        .add_trust_boundary(TrustBoundary::new("internet", "Internet").crossing("browser→gateway"))
        .unwrap();
    let rules = default_rules().unwrap();

    let first = JsonFormat.render(&analyze(&graph, &rules)).unwrap();
    let second = JsonFormat.render(&analyze(&graph, &rules)).unwrap();
    assert_eq!(first, second);

    let table_a = TableFormat.render(&analyze(&graph, &rules)).unwrap();
    let table_b = TableFormat.render(&analyze(&graph, &rules)).unwrap();
    assert_eq!(table_a, table_b);
}

#[test]
fn test_no_duplicate_target_category_pairs() {
    let graph = shop_graph();
    let mut weaker = plaintext_rule();
    weaker.id = Some("flow-plaintext-weak".to_string());
    weaker.severity = 2;
    weaker.mitigation = "Consider TLS".to_string();
    let rules = RuleSet::load(vec![plaintext_rule(), weaker]).unwrap();

    let findings = evaluate(&graph, &rules);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].rule, "flow-plaintext");
    assert_eq!(findings[0].severity, 8);

    let full = evaluate(&graph, &default_rules().unwrap());
    let mut keys: Vec<_> = full.iter().map(|f| (f.target_id.clone(), f.category)).collect();
    let before = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), before);
}

#[test]
fn test_default_rules_ordering_contract() {
    let mut graph = shop_graph();
    graph
        .add_edge(Edge::new("gateway", "db").with_flags(EdgeFlags {
            carries_credentials: true,
            ..EdgeFlags::default()
        }))
        .unwrap();
    let findings = evaluate(&graph, &default_rules().unwrap());
    assert!(!findings.is_empty());
    for pair in findings.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let in_order = a.severity > b.severity
            || (a.severity == b.severity
                && (a.target_id < b.target_id
                    || (a.target_id == b.target_id && a.category.as_str() < b.category.as_str())));
        assert!(in_order, "{:?} before {:?}", a, b);
    }

    // Credentials in plaintext outrank plain disclosure on the same flow.
    let creds = findings
        .iter()
        .find(|f| f.target_id == "gateway→db" && f.category == StrideCategory::InformationDisclosure)
        .unwrap();
    assert_eq!(creds.rule, "flow-credential-disclosure");
}

#[test]
fn test_missing_destination_fails_and_adds_nothing() {
    let mut graph = shop_graph();
    let err = graph.add_edge(Edge::new("gateway", "cache")).unwrap_err();
    assert!(matches!(err, GraphError::UnknownElement { .. }));
    assert_eq!(graph.edges().len(), 1);
}

#[test]
fn test_empty_boundary_fails() {
    let mut graph = shop_graph();
    let err = graph
        .add_trust_boundary(TrustBoundary::new("dmz", "DMZ"))
        .unwrap_err();
    assert_eq!(err, GraphError::EmptyBoundary("dmz".to_string()));
}

#[test]
fn test_undeclared_flag_fails_at_load() {
    let mut bad = plaintext_rule();
    bad.predicate = PredicateSpec::flag("isQuantumSafe");
    let err = RuleSet::load(vec![plaintext_rule(), bad]).unwrap_err();
    let RuleError::InvalidRule { index, .. } = err;
    assert_eq!(index, 1);
}

#[test]
fn test_document_to_markdown() {
    let json = r#"{
        "name": "rag-chatbot",
        "elements": [
            { "id": "user", "name": "User", "kind": "ExternalEntity" },
            { "id": "api", "name": "Chat API", "kind": "Process", "flags": { "isLoggingTarget": true } },
            { "id": "vectors", "name": "Vector store", "kind": "DataStore", "flags": { "handlesSensitiveData": true } },
            { "id": "llm", "name": "LLM provider", "kind": "ExternalEntity" }
        ],
        "edges": [
            { "source": "user", "destination": "api", "flags": { "isEncryptedInTransit": true } },
            { "source": "api", "destination": "vectors", "flags": { "isEncryptedInTransit": true } },
            { "source": "api", "destination": "llm", "flags": { "carriesCredentials": true, "isEncryptedInTransit": true } }
        ],
        "boundaries": [
            { "id": "internet", "name": "Internet", "crossingEdges": ["user→api", "api→llm"] }
        ]
    }"#;
    let graph = load_model(json, DocumentFormat::Json).unwrap();
    let rules = default_rules().unwrap();
    let report = analyze(&graph, &rules);
    let text = MarkdownFormat.render(&report).unwrap();

    assert!(text.starts_with("## Threat model: rag-chatbot"));
    assert_eq!(
        text.lines().filter(|l| l.starts_with("| ") && !l.starts_with("| Kind")).count(),
        report.findings.len()
    );
    // The API is reached across the boundary and is not an auth boundary.
    assert!(report
        .findings
        .iter()
        .any(|f| f.target_id == "api" && f.category == StrideCategory::ElevationOfPrivilege));
    // Every crossing flow is encrypted, so the boundary has no disclosure finding.
    assert!(!report
        .findings
        .iter()
        .any(|f| f.target_id == "internet" && f.category == StrideCategory::InformationDisclosure));
}

#[test]
fn test_demo_models_load_and_evaluate() {
    let rules = default_rules().unwrap();
    for (name, text, format) in [
        ("rag-chatbot", include_str!("../../demos/rag-chatbot.json"), DocumentFormat::Json),
        ("ci-pipeline", include_str!("../../demos/ci-pipeline.ron"), DocumentFormat::Ron),
    ] {
        let graph = load_model(text, format).unwrap();
        assert_eq!(graph.name, name);
        let report = analyze(&graph, &rules);
        assert!(!report.findings.is_empty(), "{} produced no findings", name);
    }
}

#[test]
fn test_warns_when_no_rule_matches() {
    let graph = shop_graph();
    let rules = RuleSet::load(vec![ThreatRule {
        id: Some("store-only".to_string()),
        applies_to: TargetKind::DataStore,
        category: StrideCategory::Tampering,
        predicate: PredicateSpec::NameMatches("^ledger$".to_string()),
        threat: "{name} can be altered".to_string(),
        mitigation: "Sign {name}".to_string(),
        severity: 4,
    }])
    .unwrap();

    let (findings, logs) = with_captured_logs(|| evaluate(&graph, &rules));
    assert!(findings.is_empty());
    assert!(logs.contains("WARN"), "{}", logs);
    assert!(logs.contains("no rule matched any target"), "{}", logs);

    let (findings, logs) = with_captured_logs(|| evaluate(&graph, &RuleSet::load(vec![plaintext_rule()]).unwrap()));
    assert_eq!(findings.len(), 1);
    assert!(!logs.contains("no rule matched"), "{}", logs);
}
