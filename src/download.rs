//! Single and batch file downloads with retry, mirror fallback, caching and
//! a minimum transfer speed enforcement.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio::fs::File;

use crate::cache::CacheStore;
use crate::mirror::Mirrors;
use crate::pool::Pool;
use crate::task::Task;


/// Length of the windows used to measure the transfer speed of a download.
const SPEED_WINDOW: Duration = Duration::from_secs(1);


/// Global settings for a [`Downloader`], individual entries may override the
/// per-transfer knobs.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Timeout for receiving the response headers, the body itself is only
    /// constrained by the minimum speed.
    pub timeout: Duration,
    /// Minimum transfer speed in bytes per second, zero to disable.
    pub min_speed: u32,
    /// Number of attempts for each entry.
    pub tries: u32,
    /// Maximum number of entries downloading at the same time in a batch.
    pub max_concurrent: u32,
    /// Whether entries opted into caching actually use the cache store.
    pub use_cache: bool,
    /// Whether entries may be rewritten through the mirror list.
    pub use_mirrors: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            min_speed: 0,
            tries: 3,
            max_concurrent: 40,
            use_cache: true,
            use_mirrors: true,
        }
    }
}

/// How a downloaded (or already present) file is checked for integrity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Validation {
    /// The file only needs to exist.
    None,
    /// The file size must match the expected size, when one is known.
    #[default]
    Size,
    /// The file SHA-1 must match the expected checksum, falling back to the
    /// size check when no checksum is known.
    Sha1,
    /// Same as [`Self::Sha1`] with a MD5 checksum.
    Md5,
}

/// A single file to download.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Source URL of the file.
    pub url: Box<str>,
    /// Destination path of the file.
    pub file: Box<Path>,
    /// Expected size of the file, when known.
    pub size: Option<u64>,
    /// Expected checksum of the file as lowercase or uppercase hex.
    pub checksum: Option<Box<str>>,
    /// Integrity check applied after each attempt.
    pub validation: Validation,
    /// Whether this entry may be served from and stored into the cache.
    pub use_cache: bool,
    /// Whether this entry URL may be rewritten through mirrors.
    pub use_mirrors: bool,
    /// Override of [`DownloadSettings::tries`].
    pub tries: Option<u32>,
    /// Override of [`DownloadSettings::timeout`].
    pub timeout: Option<Duration>,
    /// Override of [`DownloadSettings::min_speed`].
    pub min_speed: Option<u32>,
}

impl Entry {

    pub fn new(url: impl Into<Box<str>>, file: impl Into<Box<Path>>) -> Self {
        Self {
            url: url.into(),
            file: file.into(),
            size: None,
            checksum: None,
            validation: Validation::default(),
            use_cache: false,
            use_mirrors: true,
            tries: None,
            timeout: None,
            min_speed: None,
        }
    }

    pub fn set_expect_size(&mut self, size: u64) -> &mut Self {
        self.size = Some(size);
        self
    }

    pub fn set_expect_sha1(&mut self, sha1: impl Into<Box<str>>) -> &mut Self {
        self.checksum = Some(sha1.into());
        self.validation = Validation::Sha1;
        self
    }

    pub fn set_expect_md5(&mut self, md5: impl Into<Box<str>>) -> &mut Self {
        self.checksum = Some(md5.into());
        self.validation = Validation::Md5;
        self
    }

    pub fn set_validation(&mut self, validation: Validation) -> &mut Self {
        self.validation = validation;
        self
    }

    pub fn set_use_cache(&mut self, use_cache: bool) -> &mut Self {
        self.use_cache = use_cache;
        self
    }

    pub fn set_use_mirrors(&mut self, use_mirrors: bool) -> &mut Self {
        self.use_mirrors = use_mirrors;
        self
    }

}

/// The error type for a failed batch download, individual downloads never
/// error because exhausted retries simply report a false success.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{failed}/{total} downloads failed, such as {url}")]
    Batch {
        failed: u32,
        total: u32,
        url: Box<str>,
    },
}

/// The downloader engine, cheap to clone because every part is shared.
#[derive(Debug, Clone)]
pub struct Downloader {
    settings: DownloadSettings,
    mirrors: Arc<Mirrors>,
    cache: Arc<CacheStore>,
    pool: Pool,
}

impl Downloader {

    pub fn new(
        settings: DownloadSettings,
        mirrors: Mirrors,
        cache: CacheStore,
    ) -> Self {
        let pool = Pool::new(settings.max_concurrent.max(1) as usize);
        Self {
            settings,
            mirrors: Arc::new(mirrors),
            cache: Arc::new(cache),
            pool,
        }
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    /// The pool limiting batch concurrency, its limit can be adjusted while
    /// batches are running.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Download a single entry, retrying up to its tries count, returning
    /// true when one attempt produced a file passing the entry validation.
    /// Failed attempts disable mirror rewriting for the remaining ones.
    pub async fn download(&self, entry: &Entry) -> bool {

        let tries = entry.tries.unwrap_or(self.settings.tries).max(1);
        let use_cache = entry.use_cache && self.settings.use_cache;
        let mut use_mirrors = entry.use_mirrors && self.settings.use_mirrors;

        for attempt in 1..=tries {

            let from_cache = use_cache && self.cache.restore(&entry.url, &entry.file).await;

            if !from_cache {

                let url = if use_mirrors {
                    self.mirrors.apply(&entry.url)
                } else {
                    Cow::Borrowed(&*entry.url)
                };

                if let Err(message) = self.fetch(&url, entry).await {
                    log::warn!("attempt {attempt}/{tries} failed for {url}: {message}");
                    use_mirrors = false;
                    continue;
                }

            }

            if check_file(&entry.file, entry.size, entry.checksum.as_deref(), entry.validation).await {
                if use_cache && !from_cache {
                    self.cache.put(&entry.url, &entry.file).await;
                }
                return true;
            }

            log::warn!("attempt {attempt}/{tries} produced an invalid file for {}", entry.url);

            // A corrupted cache entry must not poison the next attempts.
            if from_cache {
                self.cache.remove(&entry.url).await;
            }

            use_mirrors = false;

        }

        false

    }

    /// Download all entries of a batch, biggest files first, bounded by the
    /// concurrency pool. Entries whose file already passes validation are
    /// skipped without any request, making a repeated batch a no-op. Each
    /// settled entry advances the given task, which is completed or aborted
    /// depending on full success.
    pub async fn download_all(&self, mut entries: Vec<Entry>, task: &Task) -> Result<(), Error> {

        // Big files first for better parallelization, entries without a
        // known size keep their relative order.
        entries.sort_by(|a, b| {
            match (a.size, b.size) {
                (Some(a), Some(b)) => Ord::cmp(&b, &a),
                _ => Ordering::Equal,
            }
        });

        let total = entries.len() as u32;
        task.set_total(total);

        let mut futures = JoinSet::new();

        for entry in entries {
            let this = self.clone();
            futures.spawn(async move {
                let _permit = this.pool.acquire().await;
                let valid = check_file(&entry.file,
                    entry.size,
                    entry.checksum.as_deref(),
                    entry.validation).await;
                let success = valid || this.download(&entry).await;
                (success, entry.url)
            });
        }

        let mut failed = 0u32;
        let mut first_failed_url: Option<Box<str>> = None;

        while let Some(result) = futures.join_next().await {
            let (success, url) = result.expect("download task should not panic");
            if !success {
                log::warn!("failed to download {url}");
                failed += 1;
                first_failed_url.get_or_insert(url);
            }
            task.advance(success);
        }

        if let Some(url) = first_failed_url {
            task.abort(format!("{failed}/{total} downloads failed, such as {url}"));
            Err(Error::Batch { failed, total, url })
        } else {
            task.complete();
            Ok(())
        }

    }

    /// Fetch the given URL into the entry's file, ensuring its parent
    /// directory. The error is a plain message because each one is only a
    /// retryable attempt failure, never a hard error.
    async fn fetch(&self, url: &str, entry: &Entry) -> Result<(), String> {

        let timeout = entry.timeout.unwrap_or(self.settings.timeout);
        let min_speed = entry.min_speed.unwrap_or(self.settings.min_speed);

        let client = crate::http::client()
            .map_err(|e| e.to_string())?;

        // The timeout only covers the headers, the body is covered by the
        // minimum speed check below.
        let res = tokio::time::timeout(timeout, client.get(url).send()).await
            .map_err(|_| format!("no response after {timeout:?}"))?
            .and_then(|res| res.error_for_status())
            .map_err(|e| e.to_string())?;

        if let Some(parent) = entry.file.parent() {
            tokio::fs::create_dir_all(parent).await
                .map_err(|e| e.to_string())?;
        }

        let mut dst = File::create(&*entry.file).await
            .map_err(|e| e.to_string())?;

        let mut res = res;
        let mut window_start = Instant::now();
        let mut window_size = 0u64;

        loop {

            // With a minimum speed, a stalled body must terminate on its
            // own instead of waiting forever for the next chunk.
            let chunk = if min_speed != 0 {
                match tokio::time::timeout(SPEED_WINDOW, res.chunk()).await {
                    Ok(chunk) => chunk,
                    Err(_) => return Err(format!("transfer speed below {min_speed} B/s")),
                }
            } else {
                res.chunk().await
            };

            let Some(chunk) = chunk.map_err(|e| e.to_string())? else {
                break;
            };

            dst.write_all(&chunk).await
                .map_err(|e| e.to_string())?;

            if min_speed != 0 {
                window_size += chunk.len() as u64;
                let elapsed = window_start.elapsed();
                if elapsed >= SPEED_WINDOW {
                    let speed = window_size as f64 / elapsed.as_secs_f64();
                    if speed < min_speed as f64 {
                        return Err(format!("transfer speed below {min_speed} B/s"));
                    }
                    window_start = Instant::now();
                    window_size = 0;
                }
            }

        }

        dst.flush().await
            .map_err(|e| e.to_string())?;

        Ok(())

    }

}

/// Check that a file exists and passes the given validation. A size-only
/// validation passes when no expected size is known, and hash validations
/// fall back to the size check when no checksum is known.
pub async fn check_file(
    file: &Path,
    size: Option<u64>,
    checksum: Option<&str>,
    validation: Validation,
) -> bool {

    let Ok(metadata) = tokio::fs::metadata(file).await else {
        return false;
    };

    if !metadata.is_file() {
        return false;
    }

    if let Validation::None = validation {
        return true;
    }

    if let Some(size) = size {
        if metadata.len() != size {
            return false;
        }
    }

    let (kind, checksum) = match (validation, checksum) {
        (Validation::Sha1, Some(checksum)) => (HashKind::Sha1, checksum),
        (Validation::Md5, Some(checksum)) => (HashKind::Md5, checksum),
        _ => return true,
    };

    let file = PathBuf::from(file);
    let actual = tokio::task::spawn_blocking(move || hash_file(&file, kind))
        .await
        .expect("hash task should not panic");

    match actual {
        Ok(actual) => actual.eq_ignore_ascii_case(checksum),
        Err(_) => false,
    }

}

#[derive(Debug, Clone, Copy)]
enum HashKind {
    Sha1,
    Md5,
}

/// Compute the lowercase hex digest of a whole file.
fn hash_file(file: &Path, kind: HashKind) -> std::io::Result<String> {

    let mut reader = std::fs::File::open(file)?;
    let mut buf = [0u8; 8192];

    let mut sha1 = Sha1::new();
    let mut md5 = md5::Context::new();

    loop {
        let len = reader.read(&mut buf)?;
        if len == 0 {
            break;
        }
        match kind {
            HashKind::Sha1 => Digest::update(&mut sha1, &buf[..len]),
            HashKind::Md5 => md5.write_all(&buf[..len])?,
        }
    }

    let mut hex = String::with_capacity(40);
    match kind {
        HashKind::Sha1 => {
            for byte in sha1.finalize() {
                write!(hex, "{byte:02x}").unwrap();
            }
        }
        HashKind::Md5 => {
            write!(hex, "{:x}", md5.compute()).unwrap();
        }
    }

    Ok(hex)

}
