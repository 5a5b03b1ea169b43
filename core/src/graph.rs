//! Data-flow graph model.
//!
//! A threat model is a directed graph of elements (external entities,
//! processes, data stores) connected by data flows, partitioned by trust
//! boundaries. Every identifier lives in a single namespace shared by
//! elements, edges, and boundaries, so a finding's target id is never
//! ambiguous.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Elements
// ============================================================================

/// The DFD shape of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementKind {
    ExternalEntity,
    Process,
    DataStore,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::ExternalEntity => "ExternalEntity",
            ElementKind::Process => "Process",
            ElementKind::DataStore => "DataStore",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability flags declared on an element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementFlags {
    pub handles_sensitive_data: bool,
    pub is_authentication_boundary: bool,
    pub is_externally_hosted: bool,
    pub is_logging_target: bool,
}

/// A node in the data-flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub name: String,
    pub kind: ElementKind,
    #[serde(default)]
    pub flags: ElementFlags,
}

impl Element {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            flags: ElementFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: ElementFlags) -> Self {
        self.flags = flags;
        self
    }
}

// ============================================================================
// Edges
// ============================================================================

/// Flags declared on a data flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeFlags {
    pub crosses_trust_boundary: bool,
    pub carries_credentials: bool,
    pub is_encrypted_in_transit: bool,
}

/// A directed data flow between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub flags: EdgeFlags,
}

impl Edge {
    /// Creates an edge whose id is `"<source>→<destination>"`.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        let source = source.into();
        let destination = destination.into();
        Self {
            id: Self::default_id(&source, &destination),
            source,
            destination,
            label: None,
            flags: EdgeFlags::default(),
        }
    }

    pub fn default_id(source: &str, destination: &str) -> String {
        format!("{}→{}", source, destination)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_flags(mut self, flags: EdgeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Display name used in rendered findings.
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// Whether `element_id` is one of this edge's endpoints.
    pub fn touches(&self, element_id: &str) -> bool {
        self.source == element_id || self.destination == element_id
    }
}

// ============================================================================
// Trust boundaries
// ============================================================================

/// A named partition of the graph and the flows that cross it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustBoundary {
    pub id: String,
    pub name: String,
    /// Elements grouped inside the boundary. Optional; purely descriptive.
    #[serde(default)]
    pub elements: Vec<String>,
    pub crossing_edges: Vec<String>,
}

impl TrustBoundary {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            elements: Vec::new(),
            crossing_edges: Vec::new(),
        }
    }

    pub fn crossing(mut self, edge_id: impl Into<String>) -> Self {
        self.crossing_edges.push(edge_id.into());
        self
    }

    pub fn containing(mut self, element_id: impl Into<String>) -> Self {
        self.elements.push(element_id.into());
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building a graph. The graph is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate id '{0}'")]
    DuplicateId(String),

    #[error("'{referrer}' references unknown element '{element}'")]
    UnknownElement { referrer: String, element: String },

    #[error("edge '{0}' starts and ends at the same element")]
    SelfLoop(String),

    #[error("trust boundary '{0}' has no crossing edges")]
    EmptyBoundary(String),

    #[error("trust boundary '{boundary}' references unknown edge '{edge}'")]
    UnknownEdge { boundary: String, edge: String },
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Element(usize),
    Edge(usize),
    Boundary(usize),
}

/// A validated data-flow graph.
///
/// Every mutation checks its invariants before touching any state, so a
/// rejected `add_*` call never leaves a partial entry behind.
#[derive(Debug, Clone, Default)]
pub struct DataFlowGraph {
    pub name: String,
    elements: Vec<Element>,
    edges: Vec<Edge>,
    boundaries: Vec<TrustBoundary>,
    ids: HashMap<String, Slot>,
    /// Element id -> indices into `edges`, in insertion order.
    incident: HashMap<String, Vec<usize>>,
    /// Edge id -> indices into `boundaries` that list it as crossing.
    crossed_by: HashMap<String, Vec<usize>>,
}

impl DataFlowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_element(&mut self, element: Element) -> Result<(), GraphError> {
        self.ensure_free(&element.id)?;

        debug!(id = %element.id, kind = %element.kind, "adding element");
        self.ids.insert(element.id.clone(), Slot::Element(self.elements.len()));
        self.incident.insert(element.id.clone(), Vec::new());
        self.elements.push(element);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        self.ensure_free(&edge.id)?;
        for endpoint in [&edge.source, &edge.destination] {
            if self.element(endpoint).is_none() {
                return Err(GraphError::UnknownElement {
                    referrer: edge.id.clone(),
                    element: endpoint.clone(),
                });
            }
        }
        if edge.source == edge.destination {
            return Err(GraphError::SelfLoop(edge.id));
        }

        debug!(id = %edge.id, source = %edge.source, destination = %edge.destination, "adding edge");
        let index = self.edges.len();
        self.ids.insert(edge.id.clone(), Slot::Edge(index));
        for endpoint in [&edge.source, &edge.destination] {
            self.incident.entry(endpoint.clone()).or_default().push(index);
        }
        self.edges.push(edge);
        Ok(())
    }

    pub fn add_trust_boundary(&mut self, boundary: TrustBoundary) -> Result<(), GraphError> {
        self.ensure_free(&boundary.id)?;
        if boundary.crossing_edges.is_empty() {
            return Err(GraphError::EmptyBoundary(boundary.id));
        }
        if let Some(edge) = boundary.crossing_edges.iter().find(|e| self.edge(e).is_none()) {
            return Err(GraphError::UnknownEdge {
                boundary: boundary.id.clone(),
                edge: edge.clone(),
            });
        }
        if let Some(element) = boundary.elements.iter().find(|e| self.element(e).is_none()) {
            return Err(GraphError::UnknownElement {
                referrer: boundary.id.clone(),
                element: element.clone(),
            });
        }

        debug!(id = %boundary.id, crossing = boundary.crossing_edges.len(), "adding trust boundary");
        let index = self.boundaries.len();
        self.ids.insert(boundary.id.clone(), Slot::Boundary(index));
        for edge in &boundary.crossing_edges {
            let owners = self.crossed_by.entry(edge.clone()).or_default();
            if !owners.contains(&index) {
                owners.push(index);
            }
        }
        self.boundaries.push(boundary);
        Ok(())
    }

    fn ensure_free(&self, id: &str) -> Result<(), GraphError> {
        if self.ids.contains_key(id) {
            return Err(GraphError::DuplicateId(id.to_string()));
        }
        Ok(())
    }

    /// All elements in insertion order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// All trust boundaries in insertion order.
    pub fn boundaries(&self) -> &[TrustBoundary] {
        &self.boundaries
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        match self.ids.get(id) {
            Some(Slot::Element(i)) => self.elements.get(*i),
            _ => None,
        }
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        match self.ids.get(id) {
            Some(Slot::Edge(i)) => self.edges.get(*i),
            _ => None,
        }
    }

    pub fn boundary(&self, id: &str) -> Option<&TrustBoundary> {
        match self.ids.get(id) {
            Some(Slot::Boundary(i)) => self.boundaries.get(*i),
            _ => None,
        }
    }

    /// Edges with `element_id` as source or destination, in insertion order.
    pub fn incident_edges<'a>(&'a self, element_id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.incident
            .get(element_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |&i| self.edges.get(i))
    }

    /// Boundaries that list `edge_id` as a crossing edge.
    pub fn boundaries_for_edge<'a>(&'a self, edge_id: &str) -> impl Iterator<Item = &'a TrustBoundary> + 'a {
        self.crossed_by
            .get(edge_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |&i| self.boundaries.get(i))
    }

    /// Edge flags as seen by the rule engine: an edge named by any boundary
    /// crosses a trust boundary even if its own flag is unset.
    pub fn effective_edge_flags(&self, edge: &Edge) -> EdgeFlags {
        let mut flags = edge.flags;
        if self.crossed_by.get(&edge.id).is_some_and(|b| !b.is_empty()) {
            flags.crosses_trust_boundary = true;
        }
        flags
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
