//! Run options from `screentest.toml` and the command line
//!
//! The file is deserialized straight into [`CheckOptions`]; flags given on
//! the command line replace file values, and `--headers`/`--vars` pairs are
//! merged over the file's tables.

use std::path::{Path, PathBuf};

use anyhow::Context;
use screentest::config::{split_list, CheckOptions};
use tracing::debug;

/// Config file read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "screentest.toml";

/// Option values taken from flags; `None` leaves the file value alone.
#[derive(Debug, Default)]
pub struct Overrides {
    pub update: bool,
    pub run: Option<String>,
    pub headers: Option<String>,
    pub vars: Option<String>,
    pub output: Option<String>,
    pub max_concurrency: Option<usize>,
    pub debugger_url: Option<String>,
    pub capture_timeout_secs: Option<u64>,
}

/// Load options from `path`, or from `screentest.toml` if it exists.
/// An explicitly named file must exist.
pub fn load(path: Option<&Path>) -> anyhow::Result<CheckOptions> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    if !required && !path.exists() {
        return Ok(CheckOptions::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let opts: CheckOptions =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    debug!("Loaded options from {}", path.display());
    Ok(opts)
}

impl Overrides {
    pub fn apply(self, mut opts: CheckOptions) -> anyhow::Result<CheckOptions> {
        opts.update |= self.update;
        if let Some(headers) = self.headers {
            opts.headers.extend(split_list(&headers)?);
        }
        if let Some(vars) = self.vars {
            opts.vars.extend(split_list(&vars)?);
        }
        if self.run.is_some() {
            opts.run = self.run;
        }
        if self.output.is_some() {
            opts.output = self.output;
        }
        if let Some(n) = self.max_concurrency {
            opts.max_concurrency = n;
        }
        if self.debugger_url.is_some() {
            opts.debugger_url = self.debugger_url;
        }
        if let Some(secs) = self.capture_timeout_secs {
            opts.capture_timeout_secs = secs;
        }
        Ok(opts)
    }
}
