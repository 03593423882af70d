//! Script parsing
//!
//! A script is a template, expanded first against the `--vars` mapping, then
//! scanned one directive per line. Directives accumulate into the current
//! test block; only `CAPTURE` emits a [`Testcase`]. A blank line closes the
//! block. `WINDOWSIZE` and file-level `BLOCK` persist for the whole file.
//!
//! ```text
//! WINDOWSIZE 1536x960
//!
//! TEST go.dev homepage
//! PATHNAME /
//! CAPTURE fullscreen
//! CAPTURE fullscreen 540x1080
//! ```
//!
//! # Templates
//!
//! Templates use minijinja syntax: `{{ Name }}` substitutes a variable and
//! `{% for i in ints(0, 3) %}...{% endfor %}` repeats a block. A variable
//! missing from `--vars` is an error, not an empty string. Scripts written
//! for Go `text/template` (`{{.Name}}`, `{{range ints 0 3}}`, where a missing
//! key prints `<no value>`) do not parse and must be converted:
//!
//! | Go `text/template` | here |
//! |--------------------|------|
//! | `{{.Authority}}` | `{{ Authority }}` |
//! | `{{range $i := ints 0 3}}...{{end}}` | `{% for i in ints(0, 3) %}...{% endfor %}` |

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use minijinja::{Environment, UndefinedBehavior};
use tracing::{debug, warn};

use crate::config::{split_dimensions, Common, DEFAULT_WINDOW_HEIGHT, DEFAULT_WINDOW_WIDTH};
use crate::error::{Result, ScreentestError};
use crate::store::Endpoint;
use crate::testcase::{CaptureMode, Task, Testcase};

const DEFAULT_STATUS: u32 = 200;

/// Read, expand and parse the script at `path`.
pub async fn read_tests(path: &Path, common: &Common) -> Result<Vec<Testcase>> {
    let file = path.display().to_string();
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ScreentestError::io(&file, e))?;
    parse_script(&file, &source, common)
}

/// Parse script text. `file` names the script in errors and picks the
/// output directory for its testcases.
pub fn parse_script(file: &str, source: &str, common: &Common) -> Result<Vec<Testcase>> {
    let text = expand_template(file, source, &common.vars)?;
    let mut parser = Parser::new(file, common);
    let mut line_no = 0;
    for line in text.lines() {
        line_no += 1;
        parser
            .line(line)
            .map_err(|message| parse_error(file, line_no, message))?;
    }
    parser
        .finish()
        .map_err(|message| parse_error(file, line_no, message))
}

fn parse_error(file: &str, line: usize, message: String) -> ScreentestError {
    ScreentestError::Parse {
        file: file.to_string(),
        line,
        message,
    }
}

/// Expand the script template. Undefined variables are errors; `ints(a, b)`
/// yields the half-open range `a..b`.
pub fn expand_template(file: &str, source: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_function("ints", ints);
    env.render_str(source, vars)
        .map_err(|source| ScreentestError::Template {
            file: file.to_string(),
            source,
        })
}

fn ints(start: i64, end: i64) -> Vec<i64> {
    (start..end).collect()
}

/// The test block being assembled
#[derive(Debug, Clone)]
struct Block {
    name: String,
    pathname: Option<String>,
    candidate_url: String,
    golden_url: String,
    tasks: Vec<Task>,
    blocked_urls: Vec<String>,
    status: u32,
}

struct Parser<'a> {
    common: &'a Common,
    file_dir: String,
    width: u32,
    height: u32,
    blocked_urls: Vec<String>,
    block: Option<Block>,
    last_was_capture: bool,
    test_names: HashSet<String>,
    emitted_names: HashSet<String>,
    tests: Vec<Testcase>,
}

impl<'a> Parser<'a> {
    fn new(file: &str, common: &'a Common) -> Self {
        Self {
            common,
            file_dir: file_dir(file),
            width: DEFAULT_WINDOW_WIDTH,
            height: DEFAULT_WINDOW_HEIGHT,
            blocked_urls: Vec::new(),
            block: None,
            last_was_capture: false,
            test_names: HashSet::new(),
            emitted_names: HashSet::new(),
            tests: Vec::new(),
        }
    }

    fn line(&mut self, line: &str) -> std::result::Result<(), String> {
        let line = line.trim();
        if line.starts_with('#') {
            return Ok(());
        }
        let (word, args) = split_one_field(line);
        let directive = word.to_ascii_uppercase();

        match directive.as_str() {
            "" => {
                if self.block.is_some() && !self.last_was_capture {
                    return Err("test does not end with capture".into());
                }
                self.block = None;
                return Ok(());
            }
            "WINDOWSIZE" => {
                let (w, h) = split_dimensions(args)?;
                self.width = w;
                self.height = h;
            }
            "BLOCK" => {
                let urls = args.split_whitespace().map(String::from);
                match &mut self.block {
                    Some(block) => block.blocked_urls.extend(urls),
                    None => self.blocked_urls.extend(urls),
                }
            }
            "TEST" => self.start_test(args)?,
            "STATUS" => {
                let status = args
                    .parse::<u32>()
                    .map_err(|e| format!("invalid status {args:?}: {e}"))?;
                self.block_mut()?.status = status;
            }
            "PATHNAME" => {
                let candidate_url = live_url(&self.common.candidate, args);
                let golden_url = live_url(&self.common.golden, args);
                let block = self.block_mut()?;
                block.pathname = Some(args.to_string());
                block.candidate_url = candidate_url;
                block.golden_url = golden_url;
            }
            "CLICK" => {
                let selector = require_arg(args, "selector for CLICK")?;
                self.block_mut()?.tasks.push(Task::Click(selector));
            }
            "WAIT" => {
                let selector = require_arg(args, "selector for WAIT")?;
                self.block_mut()?.tasks.push(Task::WaitReady(selector));
            }
            "EVAL" => {
                let block = self.block_mut()?;
                if is_quoted(args) {
                    // Quotes are passed through, so the script evaluates to a string.
                    warn!("quoted argument {} to eval will evaluate to itself", args);
                }
                block.tasks.push(Task::Evaluate(args.to_string()));
            }
            "SLEEP" => {
                let block = self.block_mut()?;
                block.tasks.push(Task::Sleep(parse_duration(args)?));
            }
            "CAPTURE" => self.capture(args)?,
            _ => return Err(format!("unknown directive {word:?}")),
        }

        self.last_was_capture = directive == "CAPTURE";
        Ok(())
    }

    fn block_mut(&mut self) -> std::result::Result<&mut Block, String> {
        self.block
            .as_mut()
            .ok_or_else(|| "directive must be in a test".to_string())
    }

    fn start_test(&mut self, name: &str) -> std::result::Result<(), String> {
        if self.block.is_some() {
            return Err("no blank lines between tests".into());
        }
        if name.is_empty() {
            return Err("missing test name".into());
        }
        if !self.test_names.insert(name.to_string()) {
            return Err(format!("duplicate test name {name:?}"));
        }
        self.block = Some(Block {
            name: name.to_string(),
            pathname: None,
            candidate_url: String::new(),
            golden_url: String::new(),
            tasks: Vec::new(),
            blocked_urls: self.blocked_urls.clone(),
            status: DEFAULT_STATUS,
        });
        Ok(())
    }

    fn capture(&mut self, args: &str) -> std::result::Result<(), String> {
        let (mut width, mut height) = (self.width, self.height);
        let block = self.block_mut()?.clone();
        let pathname = block
            .pathname
            .clone()
            .ok_or_else(|| "missing pathname for capture".to_string())?;

        let (mode, rest) = split_one_field(args);
        let mut name = block.name.clone();
        let capture = match mode.to_ascii_uppercase().as_str() {
            "" | "VIEWPORT" | "FULLSCREEN" => {
                if !rest.is_empty() {
                    let (w, h) = split_dimensions(rest)?;
                    name = format!("{name} {w}x{h}");
                    width = w;
                    height = h;
                }
                if mode.eq_ignore_ascii_case("FULLSCREEN") {
                    CaptureMode::FullPage
                } else {
                    CaptureMode::Viewport
                }
            }
            "ELEMENT" => {
                let selector = require_arg(rest, "selector for element capture")?;
                name = format!("{name} element {selector}");
                CaptureMode::Element(selector)
            }
            _ => {
                return Err(
                    "first argument to capture must be 'fullscreen', 'viewport' or 'element'"
                        .into(),
                )
            }
        };

        if !self.emitted_names.insert(name.clone()) {
            return Err(format!("duplicate test name {name:?}"));
        }
        if !self.common.filter.matches(&name) {
            debug!("Skipping {} (filtered)", name);
            return Ok(());
        }

        let base = format!("{}/{}", self.file_dir, sanitize(&name));
        debug!("Captured testcase {} ({}x{}, {:?})", name, width, height, capture);
        self.tests.push(Testcase {
            name,
            pathname,
            candidate_url: block.candidate_url,
            golden_url: block.golden_url,
            tasks: block.tasks,
            blocked_urls: block.blocked_urls,
            status: block.status,
            viewport_width: width,
            viewport_height: height,
            capture,
            candidate_path: format!("{base}.got.png"),
            golden_path: format!("{base}.want.png"),
            diff_path: format!("{base}.diff.png"),
        });
        Ok(())
    }

    fn finish(self) -> std::result::Result<Vec<Testcase>, String> {
        if self.block.is_some() && !self.last_was_capture {
            return Err("test does not end with capture".into());
        }
        Ok(self.tests)
    }
}

fn live_url(endpoint: &Endpoint, pathname: &str) -> String {
    match endpoint {
        Endpoint::Live(base) => join_url(base, pathname),
        Endpoint::Stored(_) => String::new(),
    }
}

fn require_arg(args: &str, what: &str) -> std::result::Result<String, String> {
    if args.is_empty() {
        Err(format!("missing {what}"))
    } else {
        Ok(args.to_string())
    }
}

fn is_quoted(args: &str) -> bool {
    let bytes = args.as_bytes();
    bytes.len() >= 2
        && matches!(
            (bytes[0], bytes[bytes.len() - 1]),
            (b'\'', b'\'') | (b'"', b'"')
        )
}

/// Split off the first space- or tab-delimited word; the rest is trimmed.
pub fn split_one_field(text: &str) -> (&str, &str) {
    match text.find(|c| c == ' ' || c == '\t') {
        Some(i) => (&text[..i], text[i..].trim()),
        None => (text, ""),
    }
}

/// Join an origin and a pathname with exactly one slash between them.
pub fn join_url(left: &str, right: &str) -> String {
    format!(
        "{}/{}",
        left.strip_suffix('/').unwrap_or(left),
        right.strip_prefix('/').unwrap_or(right)
    )
}

/// Script file name without directories or extension.
pub fn file_dir(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Replace characters that are awkward in file names with `-`.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '.' | '*' | '<' | '>' | '?' | '`' | '\'' | '|' | '/' | '\\' | ':' | ' ' => '-',
            c => c,
        })
        .collect()
}

/// Parse a duration such as `500ms`, `2s`, `1m30s` or `1.5h`.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let invalid = || format!("invalid duration {text:?}");
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
