//! Local directory store

use std::io;
use std::path::{PathBuf, MAIN_SEPARATOR_STR};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use image::DynamicImage;
use tokio::fs;
use tracing::debug;

use super::{clean_path, decode_png, encode_png, join_path, ImageStore};
use crate::error::{Result, ScreentestError};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Images stored as PNG files under a root directory
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: String,
}

impl DirStore {
    /// `dir` is slash-separated and cleaned lexically.
    pub fn new(dir: impl AsRef<str>) -> Self {
        Self {
            dir: clean_path(dir.as_ref()),
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    fn native_path(&self, path: &str) -> PathBuf {
        PathBuf::from(join_path(&self.dir, path).replace('/', MAIN_SEPARATOR_STR))
    }
}

#[async_trait]
impl ImageStore for DirStore {
    async fn read(&self, path: &str) -> Result<DynamicImage> {
        let native = self.native_path(path);
        let shown = native.display().to_string();
        let data = match fs::read(&native).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ScreentestError::NotFound(shown))
            }
            Err(e) => return Err(ScreentestError::io(shown, e)),
        };
        decode_png(&shown, &data)
    }

    async fn write(&self, path: &str, img: &DynamicImage) -> Result<()> {
        let native = self.native_path(path);
        let shown = native.display().to_string();
        let data = encode_png(img)?;

        let parent = match native.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| ScreentestError::io(parent.display().to_string(), e))?;

        // Write atomically via temp file in the same directory
        let file_name = native
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = parent.join(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = fs::write(&tmp_path, &data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ScreentestError::io(tmp_path.display().to_string(), e));
        }
        if let Err(e) = fs::rename(&tmp_path, &native).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ScreentestError::io(shown, e));
        }

        debug!("Wrote {} ({} bytes)", shown, data.len());
        Ok(())
    }

    async fn remove_tree(&self, path: &str) -> Result<()> {
        let native = self.native_path(path);
        let result = match fs::metadata(&native).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&native).await,
            Ok(_) => fs::remove_file(&native).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("Removed {}", native.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScreentestError::io(native.display().to_string(), e)),
        }
    }

    fn location(&self) -> String {
        self.dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use image::{Rgba, RgbaImage};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba(px)))
    }

    fn store_in(tmp: &TempDir) -> DirStore {
        DirStore::new(tmp.path().to_string_lossy().replace('\\', "/"))
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let img = solid(4, 3, [1, 2, 3, 255]);

        store.write("basic/home.png", &img).await.unwrap();
        let read = store.read("basic/home.png").await.unwrap();
        assert_eq!(read.to_rgba8(), img.to_rgba8());

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("basic"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["home.png".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_write_leaves_no_temp_file() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write("locked/a.png", &solid(1, 1, [0; 4])).await.unwrap();
        let locked = tmp.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Root ignores directory permissions; nothing to observe then.
        let writable = std::fs::write(locked.join("check"), b"").is_ok();
        let result = store.write("locked/b.png", &solid(1, 1, [0; 4])).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        if writable {
            return;
        }

        assert!(result.is_err());
        let entries: Vec<_> = std::fs::read_dir(&locked)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["a.png".to_string()]);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_logs_destination() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let logs = Captured::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        store.write("basic/home.png", &solid(2, 2, [0; 4])).await.unwrap();
        store.remove_tree("basic").await.unwrap();

        let text = String::from_utf8(logs.0.lock().clone()).unwrap();
        let written = tmp.path().join("basic").join("home.png");
        assert!(text.contains(&format!("Wrote {}", written.display())), "{text}");
        assert!(text.contains("Removed"), "{text}");
    }

    #[tokio::test]
    async fn test_overwrite_replaces() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write("a.png", &solid(1, 1, [0, 0, 0, 255])).await.unwrap();
        store.write("a.png", &solid(2, 2, [9, 9, 9, 255])).await.unwrap();
        let read = store.read("a.png").await.unwrap();
        assert_eq!((read.width(), read.height()), (2, 2));
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let err = store.read("nope.png").await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test]
    async fn test_remove_tree() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write("basic/a.png", &solid(1, 1, [0; 4])).await.unwrap();
        store.write("basic/nested/b.png", &solid(1, 1, [0; 4])).await.unwrap();
        store.write("other/c.png", &solid(1, 1, [0; 4])).await.unwrap();

        store.remove_tree("basic").await.unwrap();
        assert!(!tmp.path().join("basic").exists());
        assert!(tmp.path().join("other/c.png").exists());

        // Missing paths are fine, and removal is idempotent
        store.remove_tree("basic").await.unwrap();
        store.remove_tree("never/existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_tree_single_file() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.write("a.png", &solid(1, 1, [0; 4])).await.unwrap();
        store.remove_tree("a.png").await.unwrap();
        assert!(!tmp.path().join("a.png").exists());
    }
}
