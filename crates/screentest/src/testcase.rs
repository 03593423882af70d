//! Testcases and running a single one
//!
//! A testcase has two image sources, the candidate and the golden. Each is
//! either captured live by the [`Driver`] or read from a store. Compare mode
//! diffs the two and writes `.got`, `.want` and `.diff` images to the failure
//! store on mismatch. Update mode writes the candidate over the golden.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use image::DynamicImage;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::browser::Driver;
use crate::config::Common;
use crate::error::{Result, ScreentestError};
use crate::store::{decode_png, Endpoint, ImageStore};
use crate::visual::{self, DiffOptions};

/// A browser action run after navigation and before the screenshot
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Click the first element matching a selector
    Click(String),
    /// Wait until an element matching a selector is present
    WaitReady(String),
    /// Evaluate a script, discarding its result
    Evaluate(String),
    /// Pause
    Sleep(Duration),
}

/// How the screenshot is framed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    Viewport,
    FullPage,
    /// A single element, by selector
    Element(String),
}

/// One fully specified unit of work, immutable once parsed
#[derive(Debug, Clone, PartialEq)]
pub struct Testcase {
    pub name: String,
    pub pathname: String,
    /// Set only when the candidate is captured live
    pub candidate_url: String,
    /// Set only when the golden is captured live
    pub golden_url: String,
    pub tasks: Vec<Task>,
    pub blocked_urls: Vec<String>,
    /// Expected HTTP status of the main document
    pub status: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub capture: CaptureMode,
    pub candidate_path: String,
    pub golden_path: String,
    pub diff_path: String,
}

/// Where one image comes from
enum Source<'a> {
    Live(&'a str),
    Stored(&'a dyn ImageStore, &'a str),
}

/// What running a testcase produced
#[derive(Debug)]
pub struct Outcome {
    pub name: String,
    /// Human-readable block, printed as a unit
    pub output: String,
    pub error: Option<ScreentestError>,
    /// Failure artifacts were written
    pub wrote_diff: bool,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

impl Testcase {
    /// Candidate origin for messages: the live URL, else the store path.
    pub fn candidate_origin(&self) -> &str {
        origin(&self.candidate_url, &self.candidate_path)
    }

    pub fn golden_origin(&self) -> &str {
        origin(&self.golden_url, &self.golden_path)
    }

    /// Both sources are live on the same host and port.
    pub fn same_host(&self) -> bool {
        let host = |u: &str| {
            let u = url::Url::parse(u).ok()?;
            Some((u.host_str()?.to_ascii_lowercase(), u.port_or_known_default()))
        };
        match (host(&self.candidate_url), host(&self.golden_url)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Run the testcase. Never panics on failure; the error is recorded in
    /// the outcome, wrapped with the testcase name. Nothing is captured once
    /// `cancel` has fired, and captures already started run to their end.
    pub async fn run(
        &self,
        common: &Common,
        driver: &dyn Driver,
        update: bool,
        cancel: &CancellationToken,
    ) -> Outcome {
        let start = Instant::now();
        let mut output = format!("test {} ", self.name);

        let result = if cancel.is_cancelled() {
            Err(ScreentestError::Cancelled)
        } else {
            self.execute(common, driver, update, start, &mut output, cancel).await
        };
        self.finish(start, output, result)
    }

    /// Outcome for a testcase that was never started.
    pub fn cancelled(&self) -> Outcome {
        let output = format!("test {} ", self.name);
        self.finish(Instant::now(), output, Err(ScreentestError::Cancelled))
    }

    fn finish(
        &self,
        start: Instant,
        mut output: String,
        result: Result<()>,
    ) -> Outcome {
        // Failure images are written exactly when the images differ.
        let wrote_diff = matches!(result, Err(ScreentestError::ImageMismatch { .. }));
        if let Err(e) = &result {
            if !matches!(e, ScreentestError::ImageMismatch { .. }) {
                let _ = write!(output, "\n    FAIL {e}");
            }
        }

        Outcome {
            name: self.name.clone(),
            output,
            error: result.err().map(|source| ScreentestError::Test {
                name: self.name.clone(),
                source: Box::new(source),
            }),
            wrote_diff,
            elapsed: start.elapsed(),
        }
    }

    async fn execute(
        &self,
        common: &Common,
        driver: &dyn Driver,
        update: bool,
        start: Instant,
        out: &mut String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let candidate = source(&common.candidate, &self.candidate_url, &self.candidate_path);

        if update {
            let store = common.golden.store().ok_or_else(|| {
                ScreentestError::Config("cannot update a non-storage golden".into())
            })?;
            let img = self.screenshot(candidate, driver, cancel).await?;
            check_cancel(cancel)?;
            let _ = write!(
                out,
                "- updating {}",
                display_path(&store.location(), &self.golden_path)
            );
            return store.write(&self.golden_path, &img).await;
        }

        let golden = source(&common.golden, &self.golden_url, &self.golden_path);
        let (candidate_img, golden_img) = if self.same_host() {
            debug!("Capturing {} sequentially (same host)", self.name);
            let c = self.screenshot(candidate, driver, cancel).await?;
            let g = self.screenshot(golden, driver, cancel).await?;
            (c, g)
        } else {
            // Both captures run to completion even when one fails.
            let (c, g) = tokio::join!(
                self.screenshot(candidate, driver, cancel),
                self.screenshot(golden, driver, cancel)
            );
            (c?, g?)
        };
        check_cancel(cancel)?;

        let candidate_img = candidate_img.to_rgba8();
        let golden_img = golden_img.to_rgba8();

        // Differently sized images are not diffed.
        let (reason, diff_img) = if candidate_img.dimensions() != golden_img.dimensions() {
            let (cw, ch) = candidate_img.dimensions();
            let (gw, gh) = golden_img.dimensions();
            (
                format!("candidate image is {cw}x{ch} but golden image is {gw}x{gh}"),
                None,
            )
        } else {
            let result = visual::diff(&candidate_img, &golden_img, &DiffOptions::default());
            if result.equal {
                let _ = write!(out, "({})", format_elapsed(start.elapsed()));
                return Ok(());
            }
            (
                format!("{} pixels differ", result.pixels_differing),
                result.image,
            )
        };

        let _ = write!(
            out,
            "({})\n    FAIL {} != {} ({})\n",
            format_elapsed(start.elapsed()),
            self.candidate_origin(),
            self.golden_origin(),
            reason
        );

        let failures = &common.failure_store;
        let candidate_img = DynamicImage::ImageRgba8(candidate_img);
        let golden_img = DynamicImage::ImageRgba8(golden_img);
        let diff_img = diff_img.map(DynamicImage::ImageRgba8);
        let write_diff = async {
            match &diff_img {
                Some(img) => failures.write(&self.diff_path, img).await,
                None => Ok(()),
            }
        };
        tokio::try_join!(
            failures.write(&self.candidate_path, &candidate_img),
            failures.write(&self.golden_path, &golden_img),
            write_diff,
        )?;

        let location = failures.location();
        if diff_img.is_some() {
            let _ = write!(out, "    wrote diff to {}", display_path(&location, &self.diff_path));
        } else {
            let _ = write!(
                out,
                "    wrote images to {}",
                display_path(&location, &self.candidate_path)
            );
        }

        Err(ScreentestError::ImageMismatch {
            candidate: self.candidate_origin().to_string(),
            golden: self.golden_origin().to_string(),
            reason,
        })
    }

    async fn screenshot(
        &self,
        source: Source<'_>,
        driver: &dyn Driver,
        cancel: &CancellationToken,
    ) -> Result<DynamicImage> {
        match source {
            Source::Stored(store, path) => store.read(path).await,
            Source::Live(url) => {
                let data = driver.capture(self, url, cancel).await?;
                decode_png(url, &data)
            }
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ScreentestError::Cancelled)
    } else {
        Ok(())
    }
}

fn source<'a>(endpoint: &'a Endpoint, url: &'a str, path: &'a str) -> Source<'a> {
    match endpoint {
        Endpoint::Live(_) => Source::Live(url),
        Endpoint::Stored(store) => Source::Stored(store.as_ref(), path),
    }
}

fn origin<'a>(url: &'a str, path: &'a str) -> &'a str {
    if url.is_empty() {
        path
    } else {
        url
    }
}

fn display_path(location: &str, path: &str) -> String {
    format!("{}/{}", location.trim_end_matches('/'), path)
}

/// Elapsed time truncated to milliseconds, e.g. `1.204s` or `87ms`.
pub fn format_elapsed(d: Duration) -> String {
    let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    format!("{:?}", Duration::from_millis(millis))
}
