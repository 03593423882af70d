//! Screentest: script-driven visual regression testing
//!
//! Each testcase captures a screenshot from a candidate and a golden source,
//! diffs them, and on mismatch writes `.got`, `.want` and `.diff` images to a
//! failure store. With `update` set, goldens are rewritten from the candidate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TestRunner::run(files)                                     │
//! │    ├── script::read_tests(file) -> [Testcase]               │
//! │    ├── failure_store.remove_tree(file_dir)                  │
//! │    └── Testcase::run()   (bounded by max_concurrency)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Testcase::run                                              │
//! │    ├── candidate: Driver::capture(url) | store.read(path)   │
//! │    ├── golden:    Driver::capture(url) | store.read(path)   │
//! │    ├── visual::diff(candidate, golden)                      │
//! │    └── failure_store.write(got, want, diff)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ImageStore                                                 │
//! │    ├── DirStore     (local paths, file:)                    │
//! │    └── BucketStore  (gs:, s3:)                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod config;
pub mod error;
pub mod runner;
pub mod script;
pub mod store;
pub mod testcase;
pub mod visual;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use browser::{ChromeDriver, Driver};
pub use config::{CheckOptions, Common};
pub use error::{Result, ScreentestError};
pub use runner::{RunSummary, TestRunner};
pub use store::{Endpoint, ImageStore};
pub use testcase::{CaptureMode, Task, Testcase};

/// Compare `candidate` against `golden` for every testcase in `files`,
/// using a Chrome browser. Errors here are configuration or launch
/// failures; test failures are in the summary (see [`RunSummary::check`]).
pub async fn run(
    candidate: &str,
    golden: &str,
    files: &[PathBuf],
    opts: &CheckOptions,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    if files.is_empty() {
        return Err(ScreentestError::Config("no files to run".into()));
    }
    let common = Common::new(candidate, golden, opts)?;

    let debugger_url = opts.debugger_url.clone();
    let driver = tokio::task::spawn_blocking(move || {
        ChromeDriver::launch(debugger_url.as_deref().filter(|u| !u.is_empty()))
    })
    .await??
    .with_headers(common.headers.clone())
    .with_timeout(opts.capture_timeout());

    let summary = TestRunner::new(common, Arc::new(driver))
        .with_update(opts.update)
        .with_max_concurrency(opts.max_concurrency())
        .run(files, cancel)
        .await;
    Ok(summary)
}
