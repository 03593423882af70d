//! S3-compatible bucket store
//!
//! Serves both `s3://` and `gs://` locations. GCS is reached through its S3
//! interoperability endpoint, so HMAC credentials come from the usual AWS
//! environment. The client is built on first use; opening a store does no I/O.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use image::DynamicImage;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{clean_path, decode_png, encode_png, join_path, ImageStore};
use crate::error::{Result, ScreentestError};

const FALLBACK_REGION: &str = "us-east-1";

/// Images stored as PNG objects under a key prefix
#[derive(Debug)]
pub struct BucketStore {
    url: String,
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
    client: OnceCell<Client>,
}

impl BucketStore {
    pub fn new(
        url: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            url: url.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
            endpoint,
            client: OnceCell::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
                let mut builder = aws_sdk_s3::config::Builder::from(&shared);
                if shared.region().is_none() {
                    builder = builder.region(Region::new(FALLBACK_REGION));
                }
                if let Some(endpoint) = &self.endpoint {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                debug!("Created object store client for {}", self.url);
                Client::from_conf(builder.build())
            })
            .await
    }

    /// Object key for a store-relative path. `.` maps to the bare prefix.
    fn key(&self, path: &str) -> String {
        let key = join_path(&self.prefix, path);
        if key == "." {
            String::new()
        } else {
            key
        }
    }

    fn display(&self, path: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), clean_path(path))
    }
}

#[async_trait]
impl ImageStore for BucketStore {
    async fn read(&self, path: &str) -> Result<DynamicImage> {
        let shown = self.display(path);
        let response = self
            .client()
            .await
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    ScreentestError::NotFound(shown.clone())
                } else {
                    ScreentestError::Store {
                        op: "reading",
                        path: shown.clone(),
                        reason: service_error.to_string(),
                    }
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| ScreentestError::Store {
                op: "reading",
                path: shown.clone(),
                reason: e.to_string(),
            })?
            .into_bytes();

        decode_png(&shown, &data)
    }

    async fn write(&self, path: &str, img: &DynamicImage) -> Result<()> {
        let shown = self.display(path);
        let data = encode_png(img)?;
        let len = data.len();

        // A single PUT is atomic from a reader's point of view.
        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .content_type("image/png")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| ScreentestError::Store {
                op: "writing",
                path: shown.clone(),
                reason: e.into_service_error().to_string(),
            })?;

        debug!("Wrote {} ({} bytes)", shown, len);
        Ok(())
    }

    async fn remove_tree(&self, path: &str) -> Result<()> {
        let shown = self.display(path);
        let store_err = |reason: String| ScreentestError::Store {
            op: "removing",
            path: shown.clone(),
            reason,
        };

        // Listing by the bare key also finds a single object stored at `path`.
        let root = self.key(path);
        let client = self.client().await;
        let mut token: Option<String> = None;
        let mut removed = 0usize;
        loop {
            let page = client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&root)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| store_err(e.into_service_error().to_string()))?;

            for object in page.contents() {
                let Some(key) = object.key().filter(|key| in_tree(&root, key)) else {
                    continue;
                };
                client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| store_err(e.into_service_error().to_string()))?;
                removed += 1;
            }

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(next)) => token = Some(next.to_string()),
                _ => break,
            }
        }

        debug!("Removed {} objects under {}", removed, shown);
        Ok(())
    }

    fn location(&self) -> String {
        self.url.clone()
    }
}

/// `key` is the object at `root` or lies below it. An empty root holds
/// everything.
fn in_tree(root: &str, key: &str) -> bool {
    root.is_empty()
        || key
            .strip_prefix(root)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
