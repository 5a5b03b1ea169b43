//! STRIDE threat-model runner.
//!
//! Loads a data-flow model and a rule set, evaluates them and prints the
//! report:
//! - `analyze` runs the full pipeline, optionally gating on severity
//! - `validate` checks the model and rules without evaluating
//! - `rules` lists the loaded rule set
//! - `pack` encodes a document for transport
//!
//! Without `--rules` the built-in STRIDE rule set is used.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use stride_core::{
    analyze, default_rules, load_model, load_rules, pack, DataFlowGraph, DocumentFormat, Finding, JsonFormat,
    MarkdownFormat, ReportFormat, RuleSet, TableFormat,
};
use tracing::info;

mod logging;

#[derive(Parser)]
#[command(name = "stride-model", version, about = "Evaluate STRIDE threat models")]
struct Args {
    /// Log at debug level regardless of STRIDE_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a model and print the report
    Analyze {
        #[arg(short, long)]
        model: PathBuf,
        #[arg(short, long)]
        rules: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = Format::Table)]
        format: Format,
        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Exit with status 2 when any finding reaches this severity
        #[arg(long)]
        fail_on: Option<u32>,
    },
    /// Build the graph and load the rules without evaluating
    Validate {
        #[arg(short, long)]
        model: PathBuf,
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },
    /// List the rules that would be applied
    Rules {
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },
    /// Print the packed (base64 gzip) form of a JSON document
    Pack { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Markdown,
    Json,
}

impl Format {
    fn exporter(self) -> Box<dyn ReportFormat> {
        match self {
            Format::Table => Box::new(TableFormat),
            Format::Markdown => Box::new(MarkdownFormat),
            Format::Json => Box::new(JsonFormat),
        }
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    logging::init(args.verbose);

    match args.command {
        Command::Analyze {
            model,
            rules,
            format,
            output,
            fail_on,
        } => {
            let graph = read_model(&model)?;
            let rules = read_rules(rules.as_deref())?;
            let report = analyze(&graph, &rules);
            let rendered = format.exporter().render(&report)?;

            match output {
                Some(path) => {
                    fs::write(&path, &rendered).with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), findings = report.findings.len(), "report written");
                }
                None => print!("{}", rendered),
            }

            if let Some(threshold) = fail_on {
                let blocking = count_at_or_above(&report.findings, threshold);
                if blocking > 0 {
                    eprintln!("{} finding(s) at severity {} or above", blocking, threshold);
                    return Ok(ExitCode::from(2));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate { model, rules } => {
            let graph = read_model(&model)?;
            let rules = read_rules(rules.as_deref())?;
            println!(
                "{}: {} elements, {} edges, {} boundaries; {} rules (digest {})",
                graph.name,
                graph.elements().len(),
                graph.edges().len(),
                graph.boundaries().len(),
                rules.len(),
                rules.digest()
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Rules { rules } => {
            let rules = read_rules(rules.as_deref())?;
            for rule in rules.rules() {
                println!(
                    "{:>3}  {:<28} {:<14} {:<22} {}",
                    rule.index,
                    rule.id,
                    rule.applies_to.as_str(),
                    rule.category.as_str(),
                    rule.severity
                );
            }
            println!("{} rules, digest {}", rules.len(), rules.digest());
            Ok(ExitCode::SUCCESS)
        }

        Command::Pack { path } => {
            let text = read_text(&path)?;
            // Normalise through serde_json so the packed payload is compact JSON.
            let value: serde_json::Value =
                serde_json::from_str(&text).with_context(|| format!("{} is not JSON", path.display()))?;
            println!("{}", pack(&value.to_string())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_model(path: &Path) -> Result<DataFlowGraph> {
    let text = read_text(path)?;
    let format = DocumentFormat::detect(Some(path), &text);
    load_model(&text, format).with_context(|| format!("loading model {}", path.display()))
}

fn read_rules(path: Option<&Path>) -> Result<RuleSet> {
    match path {
        Some(path) => {
            let text = read_text(path)?;
            let format = DocumentFormat::detect(Some(path), &text);
            load_rules(&text, format).with_context(|| format!("loading rules {}", path.display()))
        }
        None => default_rules().context("loading built-in rules"),
    }
}

fn count_at_or_above(findings: &[Finding], threshold: u32) -> usize {
    findings.iter().filter(|f| f.severity >= threshold).count()
}
