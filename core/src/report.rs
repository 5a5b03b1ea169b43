//! Report export.
//!
//! A [`Report`] is the ordered finding list plus the context needed to
//! reproduce it. Formats are pure projections: one row per finding, in the
//! order given, nothing filtered.

use serde::Serialize;

use crate::interpreter::Finding;

/// The exported result of one evaluation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub model: String,
    pub rule_digest: String,
    pub findings: Vec<Finding>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An output format for reports.
pub trait ReportFormat {
    fn render(&self, report: &Report) -> Result<String, ReportError>;
}

const HEADERS: [&str; 6] = ["Kind", "Target", "Category", "Threat", "Mitigation", "Severity"];

fn row(finding: &Finding) -> [String; 6] {
    [
        finding.target_kind.to_string(),
        finding.target_id.clone(),
        finding.category.display_name().to_string(),
        finding.threat.clone(),
        finding.mitigation.clone(),
        finding.severity.to_string(),
    ]
}

fn pad_line(cells: &[String], widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths.iter())
        .map(|(cell, width)| {
            let pad = width.saturating_sub(cell.chars().count());
            format!("{}{}", cell, " ".repeat(pad))
        })
        .collect();
    padded.join("  ").trim_end().to_string()
}

/// Column-aligned plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableFormat;

impl ReportFormat for TableFormat {
    fn render(&self, report: &Report) -> Result<String, ReportError> {
        let rows: Vec<[String; 6]> = report.findings.iter().map(row).collect();

        let mut widths = HEADERS.map(|h| h.chars().count());
        for r in &rows {
            for (width, cell) in widths.iter_mut().zip(r.iter()) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        out.push_str(&format!("Threat model: {}\n\n", report.model));
        out.push_str(&pad_line(&HEADERS.map(String::from), &widths));
        out.push('\n');
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&pad_line(&rule, &widths));
        out.push('\n');
        for r in &rows {
            out.push_str(&pad_line(r, &widths));
            out.push('\n');
        }
        out.push_str(&format!(
            "\n{} finding(s), rules {}\n",
            report.findings.len(),
            report.rule_digest
        ));
        Ok(out)
    }
}

/// GitHub-flavoured Markdown table.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownFormat;

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', " ")
}

impl ReportFormat for MarkdownFormat {
    fn render(&self, report: &Report) -> Result<String, ReportError> {
        let mut out = String::new();
        out.push_str(&format!("## Threat model: {}\n\n", escape_cell(&report.model)));
        out.push_str(&format!("| {} |\n", HEADERS.join(" | ")));
        out.push_str(&format!("|{}\n", "---|".repeat(HEADERS.len())));
        for finding in &report.findings {
            let cells: Vec<String> = row(finding).iter().map(|c| escape_cell(c)).collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out.push_str(&format!(
            "\n_{} finding(s), rule set `{}`_\n",
            report.findings.len(),
            report.rule_digest
        ));
        Ok(out)
    }
}

/// Pretty-printed JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl ReportFormat for JsonFormat {
    fn render(&self, report: &Report) -> Result<String, ReportError> {
        let mut json = serde_json::to_string_pretty(report)?;
        json.push('\n');
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{StrideCategory, TargetKind};

    fn report() -> Report {
        Report {
            model: "shop".to_string(),
            rule_digest: "00112233aabbccdd".to_string(),
            findings: vec![
                Finding {
                    target_id: "browser→gateway".to_string(),
                    target_kind: TargetKind::Edge,
                    category: StrideCategory::InformationDisclosure,
                    threat: "Plaintext | sniffable".to_string(),
                    mitigation: "Enforce TLS".to_string(),
                    severity: 8,
                    rule: "edge-plaintext".to_string(),
                },
                Finding {
                    target_id: "db".to_string(),
                    target_kind: TargetKind::DataStore,
                    category: StrideCategory::Tampering,
                    threat: "Rows altered".to_string(),
                    mitigation: "Restrict writes".to_string(),
                    severity: 5,
                    rule: "store-tampering".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_table_keeps_order_and_aligns() {
        let text = TableFormat.render(&report()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Threat model: shop");
        assert!(lines[2].starts_with("Kind "));
        assert!(lines[4].starts_with("Edge "));
        assert!(lines[5].starts_with("DataStore "));
        // Target column starts at the same offset on every row.
        let offset = lines[2].find("Target").unwrap();
        assert_eq!(lines[4].chars().skip(offset).take(7).collect::<String>(), "browser");
        assert_eq!(lines[5].chars().skip(offset).take(2).collect::<String>(), "db");
        assert!(text.ends_with("2 finding(s), rules 00112233aabbccdd\n"));
    }

    #[test]
    fn test_markdown_escapes_pipes() {
        let text = MarkdownFormat.render(&report()).unwrap();
        assert!(text.contains("| Kind | Target | Category | Threat | Mitigation | Severity |"));
        assert!(text.contains("|---|---|---|---|---|---|"));
        assert!(text.contains("Plaintext \\| sniffable"));
        assert!(text.contains("| Edge | browser→gateway | Information Disclosure |"));
    }

    #[test]
    fn test_json_projection() {
        let text = JsonFormat.render(&report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["model"], "shop");
        assert_eq!(value["ruleDigest"], "00112233aabbccdd");
        assert_eq!(value["findings"][0]["targetId"], "browser→gateway");
        assert_eq!(value["findings"][0]["category"], "InformationDisclosure");
        assert_eq!(value["findings"][1]["severity"], 5);
    }

    #[test]
    fn test_empty_report_renders() {
        let empty = Report {
            model: "empty".to_string(),
            rule_digest: "0".repeat(16),
            findings: Vec::new(),
        };
        let text = TableFormat.render(&empty).unwrap();
        assert!(text.contains("0 finding(s)"));
    }
}
