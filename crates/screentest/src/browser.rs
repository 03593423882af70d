//! Headless Chrome driver
//!
//! One browser per invocation, launched locally or attached through a
//! DevTools URL. Each capture gets its own browser context and tab, so
//! cookies and storage never leak between testcases. The blocking
//! `headless_chrome` calls run on the blocking pool under a timeout and
//! poll the cancellation token between steps; a capture returns only once
//! its blocking job has finished.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::protocol::cdp::Page::{self, CaptureScreenshotFormatOption};
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions, Tab};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_CAPTURE_TIMEOUT, DEFAULT_WINDOW_HEIGHT, DEFAULT_WINDOW_WIDTH};
use crate::error::{Result, ScreentestError};
use crate::testcase::{CaptureMode, Task, Testcase};

/// Zero out animations and transitions so captures are pixel-stable.
const REDUCE_MOTION: &str = r#"(() => {
    const style = document.createElement('style');
    style.type = 'text/css';
    style.appendChild(document.createTextNode(`*, ::before, ::after {
        animation-delay: -1ms !important;
        animation-duration: 1ms !important;
        animation-iteration-count: 1 !important;
        background-attachment: initial !important;
        caret-color: transparent;
        scroll-behavior: auto !important;
        transition-duration: 0s !important;
        transition-delay: 0s !important;
    }`));
    document.head.appendChild(style);
})()"#;

/// How often blocking waits look at the cancellation token
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const PAGE_SIZE: &str = r#"JSON.stringify({
    width: Math.ceil(document.documentElement.scrollWidth),
    height: Math.ceil(document.documentElement.scrollHeight)
})"#;

/// Produces PNG screenshots of live pages.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Navigate to `url` under `tc`'s conditions and return the PNG bytes.
    /// Returns [`ScreentestError::Cancelled`] soon after `cancel` fires, and
    /// only once no work for this capture is left running.
    async fn capture(
        &self,
        tc: &Testcase,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;
}

/// [`Driver`] backed by a Chrome instance
pub struct ChromeDriver {
    browser: Arc<Browser>,
    headers: Arc<HashMap<String, String>>,
    timeout: Duration,
}

impl ChromeDriver {
    /// Launch headless Chrome, or attach to `debugger_url` when given.
    pub fn launch(debugger_url: Option<&str>) -> Result<Self> {
        let browser = match debugger_url {
            Some(url) => {
                info!("Attaching to browser at {}", url);
                Browser::connect(url.to_string()).map_err(browser_err)?
            }
            None => {
                info!(
                    "Launching headless browser ({}x{})",
                    DEFAULT_WINDOW_WIDTH, DEFAULT_WINDOW_HEIGHT
                );
                Browser::new(LaunchOptions {
                    headless: true,
                    window_size: Some((DEFAULT_WINDOW_WIDTH, DEFAULT_WINDOW_HEIGHT)),
                    idle_browser_timeout: Duration::from_secs(60 * 60),
                    ..Default::default()
                })
                .map_err(browser_err)?
            }
        };

        Ok(Self {
            browser: Arc::new(browser),
            headers: Arc::new(HashMap::new()),
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        })
    }

    /// Extra request headers sent with every capture
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Driver for ChromeDriver {
    async fn capture(
        &self,
        tc: &Testcase,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let browser = Arc::clone(&self.browser);
        let headers = Arc::clone(&self.headers);
        let tc = tc.clone();
        let url = url.to_string();
        let timeout = self.timeout;
        let job_cancel = cancel.child_token();
        let token = job_cancel.clone();

        let mut job = tokio::task::spawn_blocking(move || {
            capture_blocking(&browser, &headers, &tc, &url, timeout, &token)
        });
        tokio::select! {
            joined = &mut job => joined?,
            _ = tokio::time::sleep(timeout) => {
                // The blocking job cannot be aborted; wait for it to notice.
                job_cancel.cancel();
                let _ = job.await;
                Err(ScreentestError::CaptureTimeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }
}

fn capture_blocking(
    browser: &Browser,
    headers: &HashMap<String, String>,
    tc: &Testcase,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    check_cancel(cancel)?;
    let context = browser.new_context().map_err(browser_err)?;
    let tab = context.new_tab().map_err(browser_err)?;
    tab.set_default_timeout(timeout);

    let result = drive_tab(&tab, headers, tc, url, timeout, cancel);

    if let Err(e) = tab.close(true) {
        warn!("Failed to close tab for {}: {}", tc.name, e);
    }
    result
}

fn drive_tab(
    tab: &Arc<Tab>,
    headers: &HashMap<String, String>,
    tc: &Testcase,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let status: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let target = strip_fragment(url);

    // Status of the main document, including one answered with a redirect
    {
        let status = Arc::clone(&status);
        let target = target.clone();
        tab.register_response_handling(
            "screentest-status",
            Box::new(move |params, _body| {
                if params.response.url == target {
                    *status.lock() = Some(params.response.status as u32);
                }
            }),
        )
        .map_err(browser_err)?;
    }

    let (idle_tx, idle_rx) = mpsc::channel::<()>();
    {
        let status = Arc::clone(&status);
        let target = target.clone();
        let idle_tx = Mutex::new(idle_tx);
        let seen_init = Mutex::new(false);
        tab.add_event_listener(Arc::new(move |event: &Event| match event {
            Event::NetworkRequestWillBeSent(ev) => {
                if let Some(redirect) = &ev.params.redirect_response {
                    if redirect.url == target {
                        *status.lock() = Some(redirect.status as u32);
                    }
                }
            }
            Event::PageLifecycleEvent(ev) => match ev.params.name.as_str() {
                "init" => *seen_init.lock() = true,
                "networkIdle" if *seen_init.lock() => {
                    let _ = idle_tx.lock().send(());
                }
                _ => {}
            },
            _ => {}
        }))
        .map_err(browser_err)?;
    }
    tab.call_method(Page::SetLifecycleEventsEnabled { enabled: true })
        .map_err(browser_err)?;

    if !headers.is_empty() {
        let headers: HashMap<&str, &str> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        tab.set_extra_http_headers(headers).map_err(browser_err)?;
    }
    if !tc.blocked_urls.is_empty() {
        tab.call_method(Network::SetBlockedURLs {
            urls: tc.blocked_urls.clone(),
        })
        .map_err(browser_err)?;
    }

    set_viewport(tab, tc.viewport_width, tc.viewport_height)?;

    debug!("Navigating to {}", url);
    tab.navigate_to(url).map_err(browser_err)?;
    tab.wait_until_navigated().map_err(browser_err)?;
    wait_idle(&idle_rx, timeout, cancel)?;

    tab.evaluate(REDUCE_MOTION, false).map_err(browser_err)?;

    let got = status.lock().unwrap_or(0);
    check_status(got, tc.status)?;

    for task in &tc.tasks {
        check_cancel(cancel)?;
        run_task(tab, task, cancel)?;
    }

    check_cancel(cancel)?;
    screenshot(tab, tc)
}

/// Block until the page reports network idle.
fn wait_idle(
    idle_rx: &mpsc::Receiver<()>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    loop {
        check_cancel(cancel)?;
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(ScreentestError::CaptureTimeout {
                seconds: timeout.as_secs(),
            });
        }
        match idle_rx.recv_timeout((timeout - waited).min(POLL_INTERVAL)) {
            Ok(()) => return Ok(()),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(ScreentestError::Browser("page event stream closed".into()))
            }
        }
    }
}

/// Sleep for `duration`, waking early with an error on cancellation.
fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    let mut left = duration;
    while !left.is_zero() {
        check_cancel(cancel)?;
        let step = left.min(POLL_INTERVAL);
        std::thread::sleep(step);
        left -= step;
    }
    check_cancel(cancel)
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ScreentestError::Cancelled)
    } else {
        Ok(())
    }
}

fn run_task(tab: &Tab, task: &Task, cancel: &CancellationToken) -> Result<()> {
    debug!("Running {:?}", task);
    match task {
        Task::Click(selector) => {
            tab.wait_for_element(selector)
                .map_err(browser_err)?
                .click()
                .map_err(browser_err)?;
        }
        Task::WaitReady(selector) => {
            tab.wait_for_element(selector).map_err(browser_err)?;
        }
        Task::Evaluate(script) => {
            tab.evaluate(script, false).map_err(browser_err)?;
        }
        Task::Sleep(duration) => pause(*duration, cancel)?,
    }
    Ok(())
}

fn screenshot(tab: &Tab, tc: &Testcase) -> Result<Vec<u8>> {
    match &tc.capture {
        CaptureMode::Viewport => capture_viewport(tab),
        CaptureMode::FullPage => {
            let (width, height) = page_size(tab)?;
            set_viewport(tab, width.max(tc.viewport_width), height.max(1))?;
            capture_viewport(tab)
        }
        // A missing element fails the capture.
        CaptureMode::Element(selector) => tab
            .wait_for_element(selector)
            .map_err(browser_err)?
            .capture_screenshot(CaptureScreenshotFormatOption::Png)
            .map_err(browser_err),
    }
}

fn capture_viewport(tab: &Tab) -> Result<Vec<u8>> {
    tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        .map_err(browser_err)
}

fn set_viewport(tab: &Tab, width: u32, height: u32) -> Result<()> {
    tab.set_bounds(Bounds::Normal {
        left: Some(0),
        top: Some(0),
        width: Some(f64::from(width)),
        height: Some(f64::from(height)),
    })
    .map_err(browser_err)?;
    Ok(())
}

fn page_size(tab: &Tab) -> Result<(u32, u32)> {
    let value = tab
        .evaluate(PAGE_SIZE, false)
        .map_err(browser_err)?
        .value
        .ok_or_else(|| ScreentestError::Browser("page size unavailable".into()))?;
    let text = value
        .as_str()
        .ok_or_else(|| ScreentestError::Browser("page size is not a string".into()))?;
    let size: serde_json::Value = serde_json::from_str(text)?;
    let dim = |key: &str| {
        size[key]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ScreentestError::Browser(format!("invalid page {key}")))
    };
    Ok((dim("width")?, dim("height")?))
}

/// Compare the main document status against the expected one.
pub fn check_status(got: u32, want: u32) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(ScreentestError::StatusMismatch { got, want })
    }
}

/// Request targets never carry a fragment.
fn strip_fragment(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.split('#').next().unwrap_or(url).to_string(),
    }
}

fn browser_err(e: impl std::fmt::Display) -> ScreentestError {
    ScreentestError::Browser(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status() {
        assert!(check_status(200, 200).is_ok());
        let err = check_status(404, 200).unwrap_err();
        assert_eq!(err.to_string(), "http status mismatch: got 404; want 200");
    }

    #[test]
    fn test_strip_fragment() {
        assert_eq!(strip_fragment("https://go.dev/doc#install"), "https://go.dev/doc");
        assert_eq!(strip_fragment("https://go.dev/"), "https://go.dev/");
        assert_eq!(strip_fragment("not a url#frag"), "not a url");
    }

    #[test]
    fn test_pause_wakes_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        let err = pause(Duration::from_secs(3600), &cancel).unwrap_err();
        assert!(matches!(err, ScreentestError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(pause(Duration::from_millis(5), &CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_wait_idle_honours_cancel_and_timeout() {
        let (tx, rx) = mpsc::channel::<()>();
        let cancel = CancellationToken::new();
        let err = wait_idle(&rx, Duration::from_millis(120), &cancel).unwrap_err();
        assert!(matches!(err, ScreentestError::CaptureTimeout { .. }), "{err}");

        cancel.cancel();
        let err = wait_idle(&rx, Duration::from_secs(3600), &cancel).unwrap_err();
        assert!(matches!(err, ScreentestError::Cancelled), "{err}");

        tx.send(()).unwrap();
        assert!(wait_idle(&rx, Duration::from_secs(1), &CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_reduce_motion_covers_animation_and_transition() {
        for needle in ["animation-duration: 1ms", "transition-duration: 0s", "caret-color"] {
            assert!(REDUCE_MOTION.contains(needle), "{needle}");
        }
    }
}
