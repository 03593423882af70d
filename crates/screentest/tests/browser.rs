//! Chrome driver against a local HTTP server
//!
//! These need a Chrome install and are ignored by default:
//! `cargo test -p screentest --test browser -- --ignored`

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use screentest::config::CheckOptions;
use screentest::script::parse_script;
use screentest::{ChromeDriver, Common, Driver, Result, Testcase};

use common::slash;

const PAGE: &str = "<!doctype html><html><head><title>t</title></head>\
    <body style=\"margin:0;background:#fff\"><p>hello</p></body></html>";

const PAGE_WITH_IMAGE: &str = "<!doctype html><html><head><title>t</title></head>\
    <body style=\"margin:0\"><img src=\"/blocked.png\"></body></html>";

/// Counts `<style>` elements in a request the server can see.
const REPORT_STYLES: &str = "(() => { const x = new XMLHttpRequest(); \
    x.open('GET', '/seen?styles=' + document.querySelectorAll('style').length, false); \
    x.send(); })()";

#[derive(Debug, Clone)]
struct Request {
    path: String,
    headers: HashMap<String, String>,
}

/// Plain HTTP/1.1 server on a random port, one request per connection
struct Site {
    origin: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl Site {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = serve(stream, log).await;
                });
            }
        });
        Self { origin, requests }
    }

    fn request(&self, path: &str) -> Option<Request> {
        self.requests.lock().iter().find(|r| r.path == path).cloned()
    }

    fn paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.path.clone()).collect()
    }
}

async fn serve(mut stream: TcpStream, log: Arc<Mutex<Vec<Request>>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf).into_owned();
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    log.lock().push(Request {
        path: path.clone(),
        headers,
    });

    let (status, extra, body) = route(&path);
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n{extra}\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn route(path: &str) -> (&'static str, &'static str, &'static str) {
    match path.split('?').next().unwrap_or(path) {
        "/ok" => ("200 OK", "", PAGE),
        "/image" => ("200 OK", "", PAGE_WITH_IMAGE),
        "/old" => ("301 Moved Permanently", "Location: /new\r\n", ""),
        "/new" => ("200 OK", "", PAGE),
        "/seen" => ("204 No Content", "", ""),
        _ => ("404 Not Found", "", PAGE),
    }
}

struct Harness {
    _tmp: TempDir,
    site: Site,
    common: Common,
    driver: ChromeDriver,
}

impl Harness {
    async fn new(headers: &[(&str, &str)]) -> Self {
        let site = Site::start().await;
        let tmp = TempDir::new().unwrap();
        let opts = CheckOptions {
            output: Some(slash(&tmp.path().join("out"))),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        let golden = slash(&tmp.path().join("golden"));
        let common = Common::new(&site.origin, &golden, &opts).unwrap();
        let driver = tokio::task::spawn_blocking(|| ChromeDriver::launch(None))
            .await
            .unwrap()
            .expect("launch chrome")
            .with_headers(common.headers.clone())
            .with_timeout(Duration::from_secs(30));
        Self {
            _tmp: tmp,
            site,
            common,
            driver,
        }
    }

    fn testcase(&self, script: &str) -> Testcase {
        let mut tests = parse_script("browser.txt", script, &self.common).unwrap();
        assert_eq!(tests.len(), 1);
        tests.remove(0)
    }

    async fn capture(&self, script: &str) -> (Testcase, Result<Vec<u8>>) {
        let tc = self.testcase(script);
        let result = self
            .driver
            .capture(&tc, &tc.candidate_url, &CancellationToken::new())
            .await;
        (tc, result)
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a local Chrome"]
async fn headers_are_forwarded() {
    let h = Harness::new(&[("X-Screentest", "on")]).await;
    let (_, result) = h.capture("TEST ok\nPATHNAME /ok\nCAPTURE\n").await;
    result.unwrap();

    let request = h.site.request("/ok").expect("page was requested");
    assert_eq!(request.headers.get("x-screentest").map(String::as_str), Some("on"));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a local Chrome"]
async fn missing_page_fails_status_check() {
    let h = Harness::new(&[]).await;
    let (_, result) = h.capture("TEST missing\nPATHNAME /missing\nCAPTURE\n").await;
    assert_eq!(
        result.unwrap_err().to_string(),
        "http status mismatch: got 404; want 200"
    );

    let (_, result) = h
        .capture("TEST missing\nPATHNAME /missing\nSTATUS 404\nCAPTURE\n")
        .await;
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a local Chrome"]
async fn redirect_status_is_recorded() {
    let h = Harness::new(&[]).await;
    let (_, result) = h.capture("TEST old\nPATHNAME /old\nSTATUS 301\nCAPTURE\n").await;
    result.unwrap();
    assert!(h.site.request("/new").is_some(), "{:?}", h.site.paths());

    let (_, result) = h.capture("TEST old\nPATHNAME /old#top\nCAPTURE\n").await;
    assert_eq!(
        result.unwrap_err().to_string(),
        "http status mismatch: got 301; want 200"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a local Chrome"]
async fn viewport_matches_window_size() {
    let h = Harness::new(&[]).await;
    let (_, result) = h
        .capture("WINDOWSIZE 300x200\n\nTEST ok\nPATHNAME /ok\nCAPTURE viewport\n")
        .await;
    let img = image::load_from_memory(&result.unwrap()).unwrap();
    assert_eq!((img.width(), img.height()), (300, 200));

    let (tc, result) = h.capture("TEST ok\nPATHNAME /ok\nCAPTURE viewport 320x240\n").await;
    let img = image::load_from_memory(&result.unwrap()).unwrap();
    assert_eq!((img.width(), img.height()), (tc.viewport_width, tc.viewport_height));
    assert_eq!((img.width(), img.height()), (320, 240));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a local Chrome"]
async fn blocked_urls_are_not_fetched() {
    let h = Harness::new(&[]).await;
    let (_, result) = h
        .capture("BLOCK *blocked.png*\n\nTEST image\nPATHNAME /image\nCAPTURE\n")
        .await;
    result.unwrap();

    let paths = h.site.paths();
    assert!(paths.iter().any(|p| p == "/image"), "{paths:?}");
    assert!(!paths.iter().any(|p| p == "/blocked.png"), "{paths:?}");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a local Chrome"]
async fn motion_is_reduced_before_tasks() {
    let h = Harness::new(&[]).await;
    let script = format!("TEST ok\nPATHNAME /ok\nEVAL {REPORT_STYLES}\nCAPTURE\n");
    let (_, result) = h.capture(&script).await;
    result.unwrap();

    let paths = h.site.paths();
    assert!(paths.iter().any(|p| p == "/seen?styles=1"), "{paths:?}");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a local Chrome"]
async fn cancelled_capture_returns_promptly() {
    let h = Harness::new(&[]).await;
    let tc = h.testcase("TEST ok\nPATHNAME /ok\nSLEEP 1h\nCAPTURE\n");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        h.driver.capture(&tc, &tc.candidate_url, &cancel),
    )
    .await
    .expect("capture stops on cancel");
    assert_eq!(result.unwrap_err().to_string(), "cancelled");
}
