//! Runs script files: parse, purge old failures, fan out testcases

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::browser::Driver;
use crate::config::{Common, DEFAULT_MAX_CONCURRENCY};
use crate::error::{Result, ScreentestError};
use crate::script::{file_dir, read_tests};
use crate::testcase::{format_elapsed, Outcome};

/// Result of a single testcase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    /// Failure images were written
    pub wrote_diff: bool,
    pub error: Option<String>,
    pub output: String,
}

/// Result of one script file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub file: String,
    /// Set when the file could not be run at all
    pub error: Option<String>,
    /// In completion order
    pub tests: Vec<TestSummary>,
}

impl FileSummary {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.tests.iter().any(|t| !t.passed)
    }
}

/// Result of a whole invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub tests_run: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub update: bool,
    /// Failure store location
    pub output: String,
    pub files: Vec<FileSummary>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self.files.iter().any(FileSummary::failed)
    }

    /// The aggregate error if anything failed.
    pub fn check(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(ScreentestError::Failed {
                location: self.output.clone(),
            })
        }
    }

    /// Write the summary as pretty JSON.
    pub fn write_results(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScreentestError::io(parent.display().to_string(), e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| ScreentestError::io(path.display().to_string(), e))?;
        info!("Results written to: {}", path.display());
        Ok(())
    }
}

/// Runs script files against one driver
pub struct TestRunner {
    common: Arc<Common>,
    driver: Arc<dyn Driver>,
    update: bool,
    max_concurrency: usize,
}

impl TestRunner {
    pub fn new(common: Common, driver: Arc<dyn Driver>) -> Self {
        Self {
            common: Arc::new(common),
            driver,
            update: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    /// Testcases in flight per file; at least one
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    /// Run `files` in order. Per-testcase blocks go to stdout as they
    /// complete; failures are collected in the summary rather than returned.
    pub async fn run(&self, files: &[PathBuf], cancel: &CancellationToken) -> RunSummary {
        let start = Instant::now();
        let mut summaries = Vec::with_capacity(files.len());

        for file in files {
            if cancel.is_cancelled() {
                summaries.push(FileSummary {
                    file: file.display().to_string(),
                    error: Some(ScreentestError::Cancelled.to_string()),
                    tests: Vec::new(),
                });
                continue;
            }
            summaries.push(self.run_file(file, &cancel.child_token()).await);
        }

        let tests_run: usize = summaries.iter().map(|f| f.tests.len()).sum();
        let passed = summaries
            .iter()
            .flat_map(|f| &f.tests)
            .filter(|t| t.passed)
            .count();
        let elapsed = start.elapsed();

        let summary = RunSummary {
            tests_run,
            passed,
            failed: tests_run - passed,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            update: self.update,
            output: self.common.failure_store.location(),
            files: summaries,
        };

        if tests_run > 0 {
            info!("ran {} tests in {}", tests_run, format_elapsed(elapsed));
        } else {
            info!("no tests to run");
        }

        if summary.is_success() {
            info!("{}", if self.update { "UPDATED" } else { "PASS" });
        } else {
            print_block(&failure_banner(&summary));
        }
        summary
    }

    async fn run_file(&self, file: &Path, cancel: &CancellationToken) -> FileSummary {
        let name = file.display().to_string();
        let mut summary = FileSummary {
            file: name.clone(),
            error: None,
            tests: Vec::new(),
        };

        let tests = match read_tests(file, &self.common).await {
            Ok(tests) => tests,
            Err(e) => {
                error!("{}", e);
                summary.error = Some(e.to_string());
                return summary;
            }
        };
        if tests.is_empty() {
            if !self.common.filter.is_set() {
                summary.error = Some(ScreentestError::NoTests(name).to_string());
            } else {
                debug!("No tests in {} match the filter", name);
            }
            return summary;
        }

        // Purge the previous run's artifacts before capturing anything.
        let dir = file_dir(&name);
        if let Err(e) = self.common.failure_store.remove_tree(&dir).await {
            error!("{}", e);
            summary.error = Some(e.to_string());
            return summary;
        }

        info!("Running {} test(s) from {}", tests.len(), name);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut set = JoinSet::new();
        let mut skipped = Vec::new();
        let mut pending = tests.into_iter();
        while let Some(tc) = pending.next() {
            // Acquire before spawning so testcases start in script order.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                skipped.push(tc);
                skipped.extend(pending.by_ref());
                break;
            };
            let common = Arc::clone(&self.common);
            let driver = Arc::clone(&self.driver);
            let token = cancel.child_token();
            let update = self.update;
            set.spawn(async move {
                let outcome = tc.run(&common, driver.as_ref(), update, &token).await;
                drop(permit);
                print_block(&outcome.output);
                outcome
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => summary.tests.push(test_summary(outcome)),
                Err(e) => {
                    let e = ScreentestError::from(e);
                    error!("{}", e);
                    summary.error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        if !skipped.is_empty() {
            info!("Cancelled {} test(s) from {} before they started", skipped.len(), name);
        }
        summary
            .tests
            .extend(skipped.iter().map(|tc| test_summary(tc.cancelled())));
        summary
    }
}

fn test_summary(outcome: Outcome) -> TestSummary {
    let passed = outcome.passed();
    if passed {
        debug!("✓ {} ({})", outcome.name, format_elapsed(outcome.elapsed));
    } else {
        debug!("✗ {}", outcome.name);
    }
    TestSummary {
        passed,
        duration_ms: u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
        wrote_diff: outcome.wrote_diff,
        error: outcome.error.map(|e| e.to_string()),
        output: outcome.output,
        name: outcome.name,
    }
}

/// Failing files, each followed by its errors
fn failure_banner(summary: &RunSummary) -> String {
    let mut banner = String::new();
    for file in summary.files.iter().filter(|f| f.failed()) {
        banner.push_str(&file.file);
        banner.push('\n');
        if let Some(e) = &file.error {
            banner.push_str(e);
            banner.push('\n');
        }
        for e in file.tests.iter().filter_map(|t| t.error.as_deref()) {
            banner.push_str(e);
            banner.push('\n');
        }
    }
    banner.trim_end().to_string()
}

/// Print a block to stdout in one piece.
fn print_block(block: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{block}");
}
