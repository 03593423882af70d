//! Shared fixtures: an in-process driver serving generated PNGs

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use screentest::browser::check_status;
use screentest::config::CheckOptions;
use screentest::{Driver, Result, ScreentestError, Testcase};

pub const RED: [u8; 4] = [255, 0, 0, 255];
pub const BLUE: [u8; 4] = [0, 0, 255, 255];
pub const WHITE: [u8; 4] = [255, 255, 255, 255];

pub fn testdata(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/testdata")
        .join(name)
}

pub fn solid(width: u32, height: u32, px: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba(px))
}

pub fn png(img: &RgbaImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub fn options(output: &Path) -> CheckOptions {
    CheckOptions {
        output: Some(slash(output)),
        ..Default::default()
    }
}

pub fn write_script(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// What the fake browser finds at a URL
#[derive(Clone)]
pub enum Page {
    Image(RgbaImage),
    /// Main document answers with this status and a blank page
    Status(u32),
}

/// A capture as seen by the fake browser
#[derive(Debug, Clone)]
pub struct Call {
    pub testcase: String,
    pub url: String,
    pub start: Instant,
    pub end: Instant,
}

/// Serves pages from memory, recording concurrency and call windows.
pub struct FakeDriver {
    pages: HashMap<String, Page>,
    delay: Duration,
    entries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<Call>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            delay: Duration::ZERO,
            entries: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn page(mut self, url: &str, page: Page) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Captures started, including ones that were later cancelled
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Whether two captures for `testcase` overlapped in time
    pub fn overlapped(&self, testcase: &str) -> bool {
        let calls: Vec<Call> = self
            .calls()
            .into_iter()
            .filter(|c| c.testcase == testcase)
            .collect();
        calls.iter().enumerate().any(|(i, a)| {
            calls[i + 1..]
                .iter()
                .any(|b| a.start < b.end && b.start < a.end)
        })
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn capture(
        &self,
        tc: &Testcase,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let start = Instant::now();
        self.entries.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.delay) => false,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().push(Call {
            testcase: tc.name.clone(),
            url: url.to_string(),
            start,
            end: Instant::now(),
        });
        if cancelled {
            return Err(ScreentestError::Cancelled);
        }

        match self.pages.get(url) {
            Some(Page::Image(img)) => {
                check_status(200, tc.status)?;
                Ok(png(img))
            }
            Some(Page::Status(status)) => {
                check_status(*status, tc.status)?;
                Ok(png(&solid(tc.viewport_width, tc.viewport_height, WHITE)))
            }
            None => Err(ScreentestError::Browser(format!("no page at {url}"))),
        }
    }
}
