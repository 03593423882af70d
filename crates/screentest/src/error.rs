//! Error types for screentest runs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScreentestError {
    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}: could not expand template: {source}")]
    Template {
        file: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no tests found in {0}")]
    NoTests(String),

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("decoding image from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("encoding image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("{op} {path}: {reason}")]
    Store {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("browser error: {0}")]
    Browser(String),

    #[error("capture timed out after {seconds}s")]
    CaptureTimeout { seconds: u64 },

    #[error("http status mismatch: got {got}; want {want}")]
    StatusMismatch { got: u32, want: u32 },

    #[error("{candidate} != {golden}: {reason}")]
    ImageMismatch {
        candidate: String,
        golden: String,
        reason: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("test {name}: {source}")]
    Test {
        name: String,
        #[source]
        source: Box<ScreentestError>,
    },

    #[error("FAIL. Output at {location}")]
    Failed { location: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ScreentestError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ScreentestError::Io {
            path: path.into(),
            source,
        }
    }

    /// Strip any `Test` context wrappers.
    pub fn root(&self) -> &ScreentestError {
        match self {
            ScreentestError::Test { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), ScreentestError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ScreentestError>;
