#![forbid(unsafe_code)]

mod output;

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dupfind_core::{ErrorCode, RetrievalError};
use dupfind_core::timing::timing_enabled_from_env;
use output::{CliError, OutputMode};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "dupfind: duplicate bug report retrieval",
    long_about = "dupfind: duplicate bug report retrieval\n\n\
        Summary format follows FORMAT (pretty|text|json); DUPFIND_TIMING=1 adds a \
        stage timing report on stderr."
)]
struct Cli {
    /// Dataset directory holding bugs.jsonl, info_dict.json, models/ and dupfind.toml.
    base_path: PathBuf,

    /// Dataset name; its file stem names the model (`eclipse.csv` -> `eclipse`).
    dataset_name: String,

    /// Bucket table CSV with `bug_id` and `dup_id` columns.
    bucket_csv_path: PathBuf,

    /// Training pairs, one anchor and its duplicates per line.
    train_pairs_path: PathBuf,

    /// Test pairs, same format as the training pairs.
    test_pairs_path: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("DUPFIND_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "dupfind=debug,info"
        } else {
            "dupfind=info,warn"
        })
    });

    let format = env::var("DUPFIND_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }
}

fn execute(cli: &Cli, mode: OutputMode, timing_enabled: bool) -> anyhow::Result<()> {
    info!(dataset = %cli.dataset_name, base = %cli.base_path.display(), "starting run");
    let report = dupfind_search::run(
        &cli.base_path,
        &cli.dataset_name,
        &cli.bucket_csv_path,
        &cli.train_pairs_path,
        &cli.test_pairs_path,
    )?;

    let stdout = io::stdout();
    output::render_report(mode, &report, &mut stdout.lock())?;

    if timing_enabled {
        eprintln!("timing report:");
        eprintln!("{}", report.timings.display_table());
        eprintln!("timing report (json):");
        eprintln!("{}", serde_json::to_string_pretty(&report.timings.to_json())?);
    }
    Ok(())
}

fn cli_error(err: &anyhow::Error) -> CliError {
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<RetrievalError>())
        .map_or(ErrorCode::InternalUnexpected, RetrievalError::code);
    CliError {
        message: format!("{err:#}"),
        suggestion: code.hint().map(str::to_string),
        error_code: Some(code.code().to_string()),
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let mode = output::resolve_output_mode();
    let timing_enabled = timing_enabled_from_env();

    match execute(&cli, mode, timing_enabled) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let details = cli_error(&err);
            error!(
                code = details.error_code.as_deref().unwrap_or_default(),
                error = %details.message,
                "run failed"
            );
            if output::render_error(mode, &details).is_err() {
                eprintln!("error: {}", details.message);
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupfind_core::Stage;

    #[test]
    fn five_positionals_are_required() {
        let cli = Cli::parse_from([
            "dupfind",
            "/data/eclipse",
            "eclipse.csv",
            "/data/eclipse/eclipse.csv",
            "/data/eclipse/train.txt",
            "/data/eclipse/test.txt",
        ]);
        assert_eq!(cli.base_path, PathBuf::from("/data/eclipse"));
        assert_eq!(cli.dataset_name, "eclipse.csv");
        assert_eq!(cli.test_pairs_path, PathBuf::from("/data/eclipse/test.txt"));

        let missing_test_pairs = ["dupfind", "/data", "eclipse.csv", "b.csv", "train.txt"];
        assert!(Cli::try_parse_from(missing_test_pairs).is_err());
    }

    #[test]
    fn flags_beyond_the_positionals_are_rejected() {
        let positionals = ["dupfind", "base", "name", "b.csv", "train.txt", "test.txt"];
        let extras: [&[&str]; 4] = [&["--format", "json"], &["--timing"], &["--json"], &["extra"]];
        for extra in extras {
            let args: Vec<&str> = positionals.iter().chain(extra).copied().collect();
            assert!(Cli::try_parse_from(args).is_err(), "accepted {extra:?}");
        }
    }

    #[test]
    fn error_details_carry_code_and_hint() {
        let err = anyhow::Error::new(RetrievalError::BugNotFound {
            bug_id: 9,
            stage: Stage::TestInference,
        })
        .context("stage test-inference failed");

        let details = cli_error(&err);
        assert_eq!(details.error_code.as_deref(), Some("E2001"));
        assert!(details.suggestion.is_some());
        assert!(details.message.starts_with("stage test-inference failed: bug 9"));
    }

    #[test]
    fn untyped_errors_are_internal() {
        let details = cli_error(&anyhow::anyhow!("boom"));
        assert_eq!(details.error_code.as_deref(), Some("E9001"));
        assert_eq!(details.message, "boom");
    }
}
