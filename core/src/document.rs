//! Threat-model and rule-set documents.
//!
//! Documents are plain JSON, RON, or the packed transport form used to ship
//! them through environment variables and CI secrets:
//! `base64(gzip(json))`, or `"raw:" + base64(json)` uncompressed.

use std::io::{Read, Write};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::graph::{DataFlowGraph, Edge, EdgeFlags, Element, GraphError, TrustBoundary};
use crate::rules::{RuleError, RuleSet, ThreatRule};

// ============================================================================
// Document types
// ============================================================================

/// A data-flow diagram as written by hand.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub elements: Vec<Element>,
    #[serde(default)]
    pub edges: Vec<EdgeDocument>,
    #[serde(default)]
    pub boundaries: Vec<TrustBoundary>,
}

/// An edge whose id may be omitted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EdgeDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub flags: EdgeFlags,
}

impl From<EdgeDocument> for Edge {
    fn from(doc: EdgeDocument) -> Self {
        let mut edge = Edge::new(doc.source, doc.destination).with_flags(doc.flags);
        if let Some(id) = doc.id {
            edge = edge.with_id(id);
        }
        edge.label = doc.label;
        edge
    }
}

impl ModelDocument {
    /// Builds the graph in document order: elements, then edges, then
    /// boundaries. Stops at the first construction error.
    pub fn into_graph(self) -> Result<DataFlowGraph, GraphError> {
        let mut graph = DataFlowGraph::new(self.name);
        for element in self.elements {
            graph.add_element(element)?;
        }
        for edge in self.edges {
            graph.add_edge(edge.into())?;
        }
        for boundary in self.boundaries {
            graph.add_trust_boundary(boundary)?;
        }
        Ok(graph)
    }
}

/// An ordered list of threat rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleDocument {
    pub rules: Vec<ThreatRule>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("Gzip error: {0}")]
    DecompressError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("RON parse error: {0}")]
    RonError(#[from] ron::error::SpannedError),

    #[error("Invalid document: missing '{0}'")]
    InvalidFormat(&'static str),

    #[error("Empty document")]
    EmptyDocument,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Rules(#[from] RuleError),
}

// ============================================================================
// Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Ron,
    Packed,
}

impl DocumentFormat {
    /// Picks a format from the file extension, falling back to the content.
    pub fn detect(path: Option<&Path>, text: &str) -> Self {
        let ext = path
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => return DocumentFormat::Json,
            Some("ron") => return DocumentFormat::Ron,
            Some("packed") | Some("b64") => return DocumentFormat::Packed,
            _ => {}
        }

        let trimmed = text.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            DocumentFormat::Json
        } else if trimmed.starts_with("raw:")
            || (!trimmed.is_empty()
                && trimmed
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')))
        {
            DocumentFormat::Packed
        } else {
            DocumentFormat::Ron
        }
    }
}

/// Unpacks `base64(gzip(json))` or `"raw:" + base64(json)` to JSON text.
pub fn decompress(packed: &str) -> Result<String, LoadError> {
    let packed = packed.trim();
    if packed.is_empty() {
        return Err(LoadError::EmptyDocument);
    }

    let json = if let Some(b64) = packed.strip_prefix("raw:") {
        let bytes = BASE64.decode(b64)?;
        String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
    } else {
        let compressed = BASE64.decode(packed)?;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut json = String::new();
        decoder.read_to_string(&mut json)?;
        json
    };
    Ok(json)
}

/// Packs JSON text as `base64(gzip(json))`.
pub fn pack(json: &str) -> Result<String, LoadError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(json.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Parses a document, requiring `required_key` at the top level of JSON input.
fn parse<T: DeserializeOwned>(text: &str, format: DocumentFormat, required_key: &'static str) -> Result<T, LoadError> {
    if text.trim().is_empty() {
        return Err(LoadError::EmptyDocument);
    }

    let json = match format {
        DocumentFormat::Ron => {
            return ron::from_str(text).map_err(|e| match e.code {
                ron::Error::MissingStructField { field, .. } if field == required_key => {
                    LoadError::InvalidFormat(required_key)
                }
                _ => e.into(),
            })
        }
        DocumentFormat::Json => text.to_string(),
        DocumentFormat::Packed => decompress(text)?,
    };

    let value: serde_json::Value = serde_json::from_str(&json)?;
    if value.get(required_key).is_none() {
        return Err(LoadError::InvalidFormat(required_key));
    }
    Ok(serde_json::from_value(value)?)
}

/// Reads a model document and validates it into a graph.
pub fn load_model(text: &str, format: DocumentFormat) -> Result<DataFlowGraph, LoadError> {
    let doc: ModelDocument = parse(text, format, "elements")?;
    let graph = doc.into_graph()?;
    info!(
        model = %graph.name,
        elements = graph.elements().len(),
        edges = graph.edges().len(),
        boundaries = graph.boundaries().len(),
        "threat model loaded"
    );
    Ok(graph)
}

/// Reads a rule document and compiles it.
pub fn load_rules(text: &str, format: DocumentFormat) -> Result<RuleSet, LoadError> {
    let doc: RuleDocument = parse(text, format, "rules")?;
    Ok(RuleSet::load(doc.rules)?)
}
