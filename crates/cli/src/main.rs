//! screentest - compare screenshots of a candidate against goldens
//!
//! ```text
//! screentest [flags] CANDIDATE GOLDEN [GLOB]...
//! ```
//!
//! CANDIDATE and GOLDEN are each an http(s) origin to capture live or a
//! store location (local path, `file:`, `gs://`, `s3://`) holding images.

mod config;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Overrides;

/// Visual regression tests driven by script files
#[derive(Parser)]
#[command(name = "screentest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// URL or store location of the images under test
    candidate: String,

    /// URL or store location of the expected images
    golden: String,

    /// Script files to run, as glob patterns
    #[arg(value_name = "GLOB")]
    files: Vec<String>,

    /// Glob of script files, used when no GLOB is given
    #[arg(long, default_value = "testdata/*.txt")]
    testdata: String,

    /// Overwrite goldens with the candidate instead of comparing
    #[arg(short, long)]
    update: bool,

    /// Only run testcases whose name matches this regex
    #[arg(long)]
    run: Option<String>,

    /// Extra request headers, as comma-separated name:value pairs
    #[arg(long)]
    headers: Option<String>,

    /// Template variables, as comma-separated name:value pairs
    #[arg(short, long)]
    vars: Option<String>,

    /// Where to write failure images
    #[arg(long, env = "SCREENTEST_OUTPUT")]
    output: Option<String>,

    /// Testcases run concurrently per file
    #[arg(short = 'c', long, env = "SCREENTEST_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Attach to a running Chrome instead of launching one
    #[arg(short, long, env = "SCREENTEST_DEBUGGER_URL")]
    debugger_url: Option<String>,

    /// Seconds before a single capture is abandoned
    #[arg(long)]
    capture_timeout: Option<u64>,

    /// Options file (default: screentest.toml, if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a JSON summary of the run here
    #[arg(long)]
    results: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            update: self.update,
            run: self.run.clone(),
            headers: self.headers.clone(),
            vars: self.vars.clone(),
            output: self.output.clone(),
            max_concurrency: self.max_concurrency,
            debugger_url: self.debugger_url.clone(),
            capture_timeout_secs: self.capture_timeout,
        }
    }

    /// Expand the glob patterns, in pattern order then path order.
    fn script_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let patterns = if self.files.is_empty() {
            std::slice::from_ref(&self.testdata)
        } else {
            self.files.as_slice()
        };

        let mut files = Vec::new();
        for pattern in patterns {
            let before = files.len();
            for entry in glob::glob(pattern).with_context(|| format!("bad glob {pattern:?}"))? {
                let path = entry?;
                if path.is_file() {
                    files.push(path);
                }
            }
            if files.len() == before {
                warn!("No files match {}", pattern);
            }
        }
        if files.is_empty() {
            bail!("no files to run");
        }
        Ok(files)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let opts = cli.overrides().apply(config::load(cli.config.as_deref())?)?;
    let files = cli.script_files()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let summary = screentest::run(&cli.candidate, &cli.golden, &files, &opts, &cancel).await?;
    if let Some(path) = &cli.results {
        summary.write_results(path)?;
    }
    summary.check()?;
    Ok(())
}
