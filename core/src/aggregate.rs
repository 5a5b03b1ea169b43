//! Finding aggregation: dedupe by (target, category), then sort.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::interpreter::Finding;
use crate::rules::StrideCategory;

/// Collects findings from one evaluation run.
///
/// The first finding seen for a `(target_id, category)` pair wins; since the
/// engine produces findings in rule declaration order per target, that is
/// the first-declared rule.
#[derive(Debug, Default)]
pub struct FindingAggregator {
    findings: Vec<Finding>,
    seen: HashSet<(String, StrideCategory)>,
    dropped: usize,
}

/// Counts over an aggregated finding set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub by_category: BTreeMap<StrideCategory, usize>,
    pub max_severity: Option<u32>,
}

impl FindingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, finding: Finding) {
        let key = (finding.target_id.clone(), finding.category);
        if self.seen.insert(key) {
            self.findings.push(finding);
        } else {
            debug!(
                target_id = %finding.target_id,
                category = %finding.category,
                rule = %finding.rule,
                "dropping duplicate finding"
            );
            self.dropped += 1;
        }
    }

    /// Merges a batch, such as one worker's private buffer.
    pub fn extend(&mut self, findings: impl IntoIterator<Item = Finding>) {
        for finding in findings {
            self.push(finding);
        }
    }

    /// Ordered snapshot: severity descending, then target id, then category name.
    pub fn findings(&self) -> Vec<Finding> {
        let mut ordered = self.findings.clone();
        ordered.sort_by(|a, b| {
            (Reverse(a.severity), &a.target_id, a.category.as_str())
                .cmp(&(Reverse(b.severity), &b.target_id, b.category.as_str()))
        });
        ordered
    }

    /// Number of duplicates discarded so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn summary(&self) -> Summary {
        let mut by_category = BTreeMap::new();
        for finding in &self.findings {
            *by_category.entry(finding.category).or_insert(0) += 1;
        }
        Summary {
            total: self.findings.len(),
            by_category,
            max_severity: self.findings.iter().map(|f| f.severity).max(),
        }
    }
}

impl FromIterator<Finding> for FindingAggregator {
    fn from_iter<I: IntoIterator<Item = Finding>>(iter: I) -> Self {
        let mut aggregator = Self::new();
        aggregator.extend(iter);
        aggregator
    }
}
