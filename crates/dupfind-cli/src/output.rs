//! Output layer for pretty/text/JSON rendering of run results.
//!
//! # Output mode resolution
//!
//! 1. `FORMAT` env var → `"pretty"` | `"text"` | `"json"`
//! 2. Default: [`OutputMode::Pretty`] if stdout is a TTY; [`OutputMode::Text`] if piped.

use std::io::{self, IsTerminal, Write};

use dupfind_search::RunReport;
use serde::Serialize;

/// Shared width for human pretty separators.
pub const PRETTY_RULE_WIDTH: usize = 72;

pub fn pretty_rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = PRETTY_RULE_WIDTH)
}

pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    pretty_rule(w)
}

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<12} {}", format!("{key}:"), value.as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-optimized output with sections and labels.
    Pretty,
    /// Tab-separated rows for scripts and pipes.
    Text,
    /// Machine-readable JSON.
    Json,
}

fn resolve_output_mode_inner(format_env: Option<&str>, is_tty: bool) -> OutputMode {
    if let Some(val) = format_env {
        match val.to_lowercase().as_str() {
            "json" => return OutputMode::Json,
            "text" => return OutputMode::Text,
            "pretty" => return OutputMode::Pretty,
            _ => {} // unknown value, fall through to TTY detection
        }
    }
    if is_tty {
        OutputMode::Pretty
    } else {
        OutputMode::Text
    }
}

/// Resolve the output mode from the environment and TTY defaults.
pub fn resolve_output_mode() -> OutputMode {
    let env_val = std::env::var("FORMAT").ok();
    let is_tty = io::stdout().is_terminal();
    resolve_output_mode_inner(env_val.as_deref(), is_tty)
}

/// Write the run summary in `mode`.
///
/// # Errors
///
/// Fails if writing or JSON serialization fails.
pub fn render_report(mode: OutputMode, report: &RunReport, w: &mut dyn Write) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut *w, report)?;
            writeln!(w)?;
        }
        OutputMode::Text => render_report_text(report, w)?,
        OutputMode::Pretty => render_report_pretty(report, w)?,
    }
    Ok(())
}

fn render_report_text(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "dataset\t{}", report.dataset)?;
    writeln!(w, "model\t{}", report.model)?;
    writeln!(w, "buckets\t{}\t{}", report.buckets, report.bucketed_bugs)?;
    writeln!(w, "train\t{}\t{}", report.train_pairs, report.train_vectors)?;
    writeln!(w, "test\t{}\t{}", report.test_pairs, report.test_entries)?;
    for cutoff in &report.recall.cutoffs {
        writeln!(
            w,
            "recall@{}\t{:.4}\t{}/{}",
            cutoff.k, cutoff.recall, cutoff.hits, report.recall.queries
        )?;
    }
    if let Some(purity) = report.train_neighbor_purity {
        writeln!(w, "purity\t{purity:.4}")?;
    }
    if let Some(path) = &report.ranks_path {
        writeln!(w, "ranks\t{}", path.display())?;
    }
    Ok(())
}

fn render_report_pretty(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(
        w,
        &format!("dupfind run: {} (model {})", report.dataset, report.model),
    )?;
    pretty_kv(
        w,
        "buckets",
        format!("{} ({} bugs)", report.buckets, report.bucketed_bugs),
    )?;
    pretty_kv(
        w,
        "train",
        format!("{} pairs, {} vectors", report.train_pairs, report.train_vectors),
    )?;
    pretty_kv(
        w,
        "test",
        format!("{} pairs, {} queries", report.test_pairs, report.test_entries),
    )?;
    pretty_kv(w, "k", report.k.to_string())?;
    writeln!(w)?;

    pretty_section(w, "recall")?;
    for cutoff in &report.recall.cutoffs {
        pretty_kv(
            w,
            &format!("@{}", cutoff.k),
            format!(
                "{:>6.2}%  ({}/{})",
                cutoff.recall * 100.0,
                cutoff.hits,
                report.recall.queries
            ),
        )?;
    }
    match report.train_neighbor_purity {
        Some(purity) => pretty_kv(w, "purity", format!("{:>6.2}%", purity * 100.0))?,
        None => pretty_kv(w, "purity", "n/a")?,
    }
    if let Some(path) = &report.ranks_path {
        writeln!(w)?;
        pretty_kv(w, "ranks", path.display().to_string())?;
    }
    Ok(())
}

/// A structured error with optional suggestion and error code.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Stable `E####` code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Render an error to stderr in the requested format.
///
/// # Errors
///
/// Fails if writing to stderr fails.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({ "error": error });
            serde_json::to_writer_pretty(&mut out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Pretty | OutputMode::Text => {
            match &error.error_code {
                Some(code) => writeln!(out, "error[{code}]: {}", error.message)?,
                None => writeln!(out, "error: {}", error.message)?,
            }
            if let Some(suggestion) = &error.suggestion {
                writeln!(out, "  suggestion: {suggestion}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupfind_core::timing::StageTimings;
    use dupfind_search::rank::{RecallAt, RecallReport};
    use std::path::PathBuf;

    fn report() -> RunReport {
        RunReport {
            dataset: "eclipse.csv".into(),
            model: "eclipse".into(),
            buckets: 2,
            bucketed_bugs: 6,
            train_pairs: 2,
            test_pairs: 1,
            train_vectors: 4,
            test_entries: 2,
            k: 20,
            recall: RecallReport {
                queries: 2,
                cutoffs: vec![
                    RecallAt {
                        k: 1,
                        hits: 1,
                        recall: 0.5,
                    },
                    RecallAt {
                        k: 20,
                        hits: 2,
                        recall: 1.0,
                    },
                ],
            },
            partner_buckets: 1,
            train_neighbor_purity: Some(0.25),
            ranks_path: Some(PathBuf::from("/data/eclipse/ranks.jsonl")),
            timings: StageTimings::new(),
        }
    }

    fn rendered(mode: OutputMode) -> String {
        let mut buf = Vec::new();
        render_report(mode, &report(), &mut buf).expect("render");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn env_beats_tty_default() {
        assert_eq!(resolve_output_mode_inner(Some("JSON"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode_inner(Some("pretty"), false), OutputMode::Pretty);
        assert_eq!(resolve_output_mode_inner(Some("text"), true), OutputMode::Text);
    }

    #[test]
    fn unknown_env_falls_back_to_tty_detection() {
        assert_eq!(resolve_output_mode_inner(Some("bogus"), true), OutputMode::Pretty);
        assert_eq!(resolve_output_mode_inner(None, false), OutputMode::Text);
    }

    #[test]
    fn text_report_has_one_row_per_cutoff() {
        let text = rendered(OutputMode::Text);
        assert!(text.contains("recall@1\t0.5000\t1/2"), "got:\n{text}");
        assert!(text.contains("recall@20\t1.0000\t2/2"), "got:\n{text}");
        assert!(text.contains("purity\t0.2500"));
        assert!(text.contains("ranks\t/data/eclipse/ranks.jsonl"));
    }

    #[test]
    fn pretty_report_has_sections() {
        let pretty = rendered(OutputMode::Pretty);
        assert!(pretty.starts_with("dupfind run: eclipse.csv (model eclipse)\n"));
        assert!(pretty.contains(" 50.00%  (1/2)"), "got:\n{pretty}");
        assert!(pretty.contains("purity:"));
    }

    #[test]
    fn json_report_is_parseable() {
        let json: serde_json::Value =
            serde_json::from_str(&rendered(OutputMode::Json)).expect("json");
        assert_eq!(json["model"], "eclipse");
        assert_eq!(json["recall"]["cutoffs"][1]["hits"], 2);
    }
}
