//! `flashsync-validate`: judge a recorded session's flash alignment.
//!
//! Exit status is 0 on PASS, 1 on FAIL and 2 when the session cannot be
//! validated at all.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flashsync_validate::alignment::DEFAULT_TOLERANCE_MS;
use flashsync_validate::flash::DEFAULT_MIN_SEPARATION;
use flashsync_validate::{run_validation, ValidateOptions};

/// Validate flash-based synchronisation of a recorded session.
#[derive(Parser)]
#[command(name = "flashsync-validate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Session directory name under the base dir
    #[arg(long)]
    session_id: String,

    /// Session storage root
    #[arg(long, default_value = "./pc_controller_data")]
    base_dir: PathBuf,

    /// Max allowed per-event spread in milliseconds
    #[arg(long, default_value_t = DEFAULT_TOLERANCE_MS)]
    tolerance_ms: f64,

    /// Reference device (default: first device name with events)
    #[arg(long)]
    reference: Option<String>,

    /// Suppression half-width around a detected flash, in frames
    #[arg(long, default_value_t = DEFAULT_MIN_SEPARATION)]
    min_separation: usize,

    /// Print the result as JSON instead of the text report
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if !(cli.tolerance_ms >= 0.0) {
        eprintln!("error: --tolerance-ms must be a non-negative number");
        return ExitCode::from(2);
    }

    let opts = ValidateOptions {
        tolerance_ms: cli.tolerance_ms,
        reference: cli.reference,
        min_separation: cli.min_separation,
    };

    let report = match run_validation(&cli.base_dir, &cli.session_id, &opts) {
        Ok(report) => report,
        Err(e) => {
            error!("Validation of {} failed: {e}", cli.session_id);
            eprintln!("error [{}]: {e}", e.code());
            return ExitCode::from(2);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("error: cannot serialize report: {e}");
                return ExitCode::from(2);
            }
        }
    } else {
        println!("{report}");
    }

    info!(
        "Session {}: {}",
        cli.session_id,
        if report.passed() { "PASS" } else { "FAIL" }
    );
    if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
