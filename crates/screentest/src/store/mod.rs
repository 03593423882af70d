//! Image storage backends
//!
//! Screenshots, goldens and failure artifacts are addressed by slash-separated
//! paths relative to a store root. A location string picks the backend:
//!
//! | Location | Backend |
//! |----------|---------|
//! | `http://…`, `https://…` | none: images are captured live by the browser |
//! | `file:dir`, `file:///dir` | [`DirStore`] rooted at `dir` or `/dir` |
//! | `gs://bucket/prefix` | [`BucketStore`] on the GCS interoperability endpoint |
//! | `s3://bucket/prefix` | [`BucketStore`] on S3 (or `SCREENTEST_S3_ENDPOINT`) |
//! | anything else | [`DirStore`]; Windows drive paths included |
//!
//! Opening a store never performs I/O.

mod bucket;
mod dir;

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};

use crate::error::{Result, ScreentestError};

pub use bucket::BucketStore;
pub use dir::DirStore;

/// Environment variable overriding the S3 endpoint (MinIO and friends)
pub const ENV_S3_ENDPOINT: &str = "SCREENTEST_S3_ENDPOINT";

/// S3-compatible endpoint for Google Cloud Storage
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Reads and writes PNG images keyed by slash-separated paths.
#[async_trait]
pub trait ImageStore: Send + Sync + fmt::Debug {
    /// Decode the PNG stored at `path`.
    async fn read(&self, path: &str) -> Result<DynamicImage>;

    /// Encode `img` as PNG and store it at `path`, creating parents as needed.
    /// Readers never observe a partially written image.
    async fn write(&self, path: &str, img: &DynamicImage) -> Result<()>;

    /// Remove everything under `path`. Removing a missing path succeeds.
    async fn remove_tree(&self, path: &str) -> Result<()>;

    /// The location this store was opened with, for display.
    fn location(&self) -> String;
}

/// Where one side of a comparison gets its images from.
#[derive(Clone)]
pub enum Endpoint {
    /// Captured live from this origin by the browser.
    Live(String),
    /// Read from (and, for goldens, written to) a store.
    Stored(Arc<dyn ImageStore>),
}

impl Endpoint {
    /// Resolve a location string; http(s) origins become [`Endpoint::Live`].
    pub fn open(location: &str) -> Result<Self> {
        Ok(match open(location)? {
            Some(store) => Endpoint::Stored(store),
            None => Endpoint::Live(location.to_string()),
        })
    }

    pub fn store(&self) -> Option<&Arc<dyn ImageStore>> {
        match self {
            Endpoint::Live(_) => None,
            Endpoint::Stored(store) => Some(store),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Endpoint::Live(_))
    }

    pub fn location(&self) -> String {
        match self {
            Endpoint::Live(origin) => origin.clone(),
            Endpoint::Stored(store) => store.location(),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Live(origin) => f.debug_tuple("Live").field(origin).finish(),
            Endpoint::Stored(store) => f.debug_tuple("Stored").field(store).finish(),
        }
    }
}

/// Open the store named by `location`. Returns `None` for http(s) origins,
/// which have no store.
pub fn open(location: &str) -> Result<Option<Arc<dyn ImageStore>>> {
    let scheme = location
        .split_once(':')
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default();

    match scheme.as_str() {
        "http" | "https" => Ok(None),
        "file" => Ok(Some(Arc::new(DirStore::new(file_location_path(location)?)))),
        "gs" | "s3" => {
            let url = parse_url(location)?;
            let bucket = url
                .host_str()
                .filter(|host| !host.is_empty())
                .ok_or_else(|| ScreentestError::Config(format!("missing bucket in {location}")))?;
            let prefix = url.path().trim_start_matches('/');
            let endpoint = match scheme.as_str() {
                "gs" => Some(GCS_ENDPOINT.to_string()),
                _ => std::env::var(ENV_S3_ENDPOINT).ok(),
            };
            Ok(Some(Arc::new(BucketStore::new(location, bucket, prefix, endpoint))))
        }
        // Assume a file path; Windows paths can start with a drive letter.
        _ => Ok(Some(Arc::new(DirStore::new(location)))),
    }
}

/// Directory named by a `file:` location. `file:rel/dir` stays relative;
/// `file:///abs/dir` is percent-decoded.
fn file_location_path(location: &str) -> Result<String> {
    let rest = location.split_once(':').map_or("", |(_, rest)| rest);
    if !rest.starts_with("//") {
        return Ok(rest.to_string());
    }
    let path = parse_url(location)?
        .to_file_path()
        .map_err(|()| ScreentestError::Config(format!("not a local path: {location:?}")))?;
    Ok(path.to_string_lossy().replace('\\', "/"))
}

fn parse_url(location: &str) -> Result<url::Url> {
    url::Url::parse(location)
        .map_err(|e| ScreentestError::Config(format!("invalid store location {location:?}: {e}")))
}

/// Lexically clean a slash-separated path: collapse repeated slashes, drop
/// `.` segments and resolve `..` against preceding segments.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join two slash-separated paths and clean the result.
pub fn join_path(base: &str, rel: &str) -> String {
    if base.is_empty() {
        return clean_path(rel);
    }
    clean_path(&format!("{base}/{rel}"))
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(ScreentestError::Encode)?;
    Ok(buf)
}

pub fn decode_png(path: &str, data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory_with_format(data, ImageFormat::Png).map_err(|source| {
        ScreentestError::Decode {
            path: path.to_string(),
            source,
        }
    })
}
