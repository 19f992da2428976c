//! Flat file cache of validated downloads, keyed by source URL.
//!
//! Entries are stored as `root/<sha1(url)>` and existence alone means
//! validity: the downloader only stores files here after they passed their
//! validation, and evicts an entry whenever a restored copy fails it.

use std::path::{Path, PathBuf};
use std::fmt::Write;

use sha1::{Digest, Sha1};


/// A content cache rooted at one directory, cheap to clone.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {

    /// Create a cache store rooted at the given directory, which is created
    /// lazily on the first insertion.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// A cache store inside the standard user cache directory, falling back
    /// to the system temporary directory.
    pub fn new_default() -> Self {
        let mut root = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        root.push(concat!(env!("CARGO_PKG_NAME"), "-cache"));
        Self::new(root)
    }

    /// The cache file path for the given key.
    pub fn file_for(&self, key: &str) -> PathBuf {
        let mut sha1 = Sha1::new();
        sha1.update(key.as_bytes());
        let mut name = String::with_capacity(40);
        for byte in sha1.finalize() {
            write!(name, "{byte:02x}").unwrap();
        }
        self.root.join(name)
    }

    /// Copy the given source file into the cache under the given key,
    /// overwriting any previous entry. Failures are swallowed with a warning,
    /// a missed cache insertion is never an error for the caller.
    pub async fn put(&self, key: &str, src: &Path) {
        let file = self.file_for(key);
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            log::warn!("failed to create cache root {}: {e}", self.root.display());
            return;
        }
        if let Err(e) = tokio::fs::copy(src, &file).await {
            log::warn!("failed to cache {key}: {e}");
        }
    }

    /// Copy the cached entry for the given key to the destination path,
    /// returning false when there is no entry or the copy failed.
    pub async fn restore(&self, key: &str, dst: &Path) -> bool {

        let file = self.file_for(key);
        match tokio::fs::try_exists(&file).await {
            Ok(true) => (),
            _ => return false,
        }

        if let Some(parent) = dst.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                log::warn!("failed to create {}: {e}", parent.display());
                return false;
            }
        }

        match tokio::fs::copy(&file, dst).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("failed to restore cache of {key}: {e}");
                false
            }
        }

    }

    /// Evict the entry for the given key, if any.
    pub async fn remove(&self, key: &str) {
        let file = self.file_for(key);
        if let Err(e) = tokio::fs::remove_file(&file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to evict cache of {key}: {e}");
            }
        }
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[tokio::test]
    async fn roundtrip_and_evict() {

        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));

        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let dst = dir.path().join("out/dst.bin");
        assert!(!store.restore("https://example.com/a", &dst).await);

        store.put("https://example.com/a", &src).await;
        assert!(store.restore("https://example.com/a", &dst).await);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");

        // Distinct keys are distinct entries.
        assert!(!store.restore("https://example.com/b", &dst).await);

        store.remove("https://example.com/a").await;
        assert!(!store.restore("https://example.com/a", &dst).await);

    }

}
