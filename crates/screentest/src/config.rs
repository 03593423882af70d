//! Run options and the values shared by every testcase of one invocation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScreentestError};
use crate::store::{Endpoint, ImageStore};

/// Default browser window and fallback viewport
pub const DEFAULT_WINDOW_WIDTH: u32 = 1536;
pub const DEFAULT_WINDOW_HEIGHT: u32 = 960;

pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-pixel colour distance threshold for the diff, in `[0, 1]`
pub const DIFF_THRESHOLD: f64 = 0.1;

/// Options for one invocation, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    /// Overwrite goldens with candidate captures instead of comparing
    pub update: bool,

    /// Regex selecting testcases by (suffixed) name
    pub run: Option<String>,

    /// Extra request headers for live captures
    pub headers: HashMap<String, String>,

    /// Template variables
    pub vars: HashMap<String, String>,

    /// Failure store location; defaults to the user cache dir
    pub output: Option<String>,

    /// Testcases run concurrently per file
    pub max_concurrency: usize,

    /// Attach to a running browser instead of launching one
    pub debugger_url: Option<String>,

    /// Bound on a single browser capture
    pub capture_timeout_secs: u64,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            update: false,
            run: None,
            headers: HashMap::new(),
            vars: HashMap::new(),
            output: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            debugger_url: None,
            capture_timeout_secs: DEFAULT_CAPTURE_TIMEOUT.as_secs(),
        }
    }
}

impl CheckOptions {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs.max(1))
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Testcase name filter from `--run`; no regex accepts everything.
#[derive(Debug, Clone, Default)]
pub struct Filter(Option<Regex>);

impl Filter {
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        match pattern.filter(|p| !p.is_empty()) {
            None => Ok(Self(None)),
            Some(p) => Regex::new(p)
                .map(|re| Self(Some(re)))
                .map_err(|e| ScreentestError::Config(format!("invalid run regex {p:?}: {e}"))),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0.as_ref().map_or(true, |re| re.is_match(name))
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Values shared across all testcases of one invocation
#[derive(Debug, Clone)]
pub struct Common {
    pub candidate: Endpoint,
    pub golden: Endpoint,
    pub failure_store: Arc<dyn ImageStore>,
    pub headers: HashMap<String, String>,
    pub filter: Filter,
    pub vars: HashMap<String, String>,
}

impl Common {
    /// Resolve the three stores and compile the filter. Performs no I/O.
    pub fn new(candidate: &str, golden: &str, opts: &CheckOptions) -> Result<Self> {
        if candidate.is_empty() {
            return Err(ScreentestError::Config("missing URL or path to test".into()));
        }
        if golden.is_empty() {
            return Err(ScreentestError::Config(
                "missing URL or path with expected results".into(),
            ));
        }

        let candidate = Endpoint::open(candidate)?;
        let golden = Endpoint::open(golden)?;
        if opts.update && golden.is_live() {
            return Err(ScreentestError::Config(format!(
                "cannot update a non-storage golden: {}",
                golden.location()
            )));
        }

        let output = match &opts.output {
            Some(output) if !output.is_empty() => output.clone(),
            _ => default_output_location()?,
        };
        let failure_store = crate::store::open(&output)?
            .ok_or_else(|| ScreentestError::Config(format!("cannot write images to {output:?}")))?;

        Ok(Self {
            candidate,
            golden,
            failure_store,
            headers: opts.headers.clone(),
            filter: Filter::new(opts.run.as_deref())?,
            vars: opts.vars.clone(),
        })
    }
}

/// `<user cache dir>/screentest`, slash-separated.
pub fn default_output_location() -> Result<String> {
    let cache = dirs::cache_dir()
        .ok_or_else(|| ScreentestError::Config("no user cache directory".into()))?;
    let cache = cache.to_string_lossy().replace('\\', "/");
    Ok(format!("{}/screentest", cache.trim_end_matches('/')))
}

/// Parse a `name:value,name:value` list. Names and values are trimmed;
/// empty values are allowed, empty names are not.
pub fn split_list(s: &str) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    let s = s.trim();
    if s.is_empty() {
        return Ok(out);
    }
    for pair in s.split(',') {
        match pair.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                out.insert(name.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(ScreentestError::Config(format!(
                    "invalid name:value pair: {pair:?}"
                )))
            }
        }
    }
    Ok(out)
}

/// Parse `WxH` into two non-negative integers. No surrounding whitespace is
/// allowed.
pub fn split_dimensions(text: &str) -> std::result::Result<(u32, u32), String> {
    let wrap = |reason: &str| format!("invalid dimensions {text:?}: {reason}");

    let parts: Vec<&str> = text.split('x').collect();
    let [w, h] = parts.as_slice() else {
        return Err(wrap("syntax error"));
    };
    let parse = |s: &str| -> std::result::Result<u32, String> {
        let n: i64 = s.parse().map_err(|e| wrap(&format!("invalid number {s:?}: {e}")))?;
        if n < 0 {
            return Err(wrap("negative dimension"));
        }
        u32::try_from(n).map_err(|_| wrap("dimension too large"))
    };
    Ok((parse(w)?, parse(h)?))
}
