//! Provisioning of vendor-provided Java runtime components.
//!
//! Components are described by a two-level manifest: a meta manifest mapping
//! platforms to components and their variants, then a component manifest
//! listing every file with raw and optionally LZMA-compressed downloads.
//! Installed components are recorded in a persisted JSON list which alone
//! decides whether a component is installed.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use crate::container::Container;
use crate::download::{self, Downloader, Entry};
use crate::path::{PathExt, PathBufExt};
use crate::profile::OsInfo;
use crate::task::Task;


/// Default URL of the meta manifest listing all runtime components.
pub(crate) const META_MANIFEST_URL: &str = "https://piston-meta.mojang.com/v1/products/java-runtime/2ec0cc96c44e5a76b9c8b7c39df7210883d12871/all.json";


/// JSON schemas of the runtime manifests.
mod manifest {

    use std::collections::HashMap;

    #[derive(serde::Deserialize, Debug, Clone)]
    #[serde(transparent)]
    pub struct MetaManifest {
        pub platforms: HashMap<String, MetaPlatform>,
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    #[serde(transparent)]
    pub struct MetaPlatform {
        pub components: HashMap<String, MetaComponent>,
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    #[serde(transparent)]
    pub struct MetaComponent {
        pub variants: Vec<MetaVariant>,
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    pub struct MetaVariant {
        pub manifest: Download,
        pub version: MetaVersion,
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    pub struct MetaVersion {
        pub name: String,
        pub released: chrono::DateTime<chrono::FixedOffset>,
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    pub struct ComponentManifest {
        pub files: HashMap<String, ComponentFile>,
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    #[serde(rename_all = "lowercase", tag = "type")]
    pub enum ComponentFile {
        Directory,
        File {
            #[serde(default)]
            executable: bool,
            downloads: ComponentFileDownloads,
        },
        Link {
            target: String,
        },
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    pub struct ComponentFileDownloads {
        pub raw: Download,
        pub lzma: Option<Download>,
    }

    #[derive(serde::Deserialize, Debug, Clone)]
    pub struct Download {
        pub url: String,
        pub size: Option<u64>,
        pub sha1: Option<String>,
    }

}

/// The error type for runtime component installation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The meta manifest has no entry for the current platform.
    #[error("unsupported platform: {platform}")]
    UnsupportedPlatform {
        platform: String,
    },
    /// The platform exists but has no variant of the wanted component.
    #[error("component not found: {component}")]
    ComponentNotFound {
        component: String,
    },
    #[error("download: {0}")]
    Download(#[from] download::Error),
    #[error("internal: {error} @ {origin}")]
    Internal {
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
        origin: Box<str>,
    },
}

impl Error {

    #[inline]
    fn new_io_file(error: io::Error, file: impl AsRef<Path>) -> Self {
        Self::Internal { error: Box::new(error), origin: file.as_ref().display().to_string().into() }
    }

    #[inline]
    fn new_json_file(error: serde_path_to_error::Error<serde_json::Error>, file: impl AsRef<Path>) -> Self {
        Self::Internal { error: Box::new(error), origin: file.as_ref().display().to_string().into() }
    }

}

pub type Result<T> = std::result::Result<T, Error>;

/// The runtime component installer, tied to one container and downloader.
#[derive(Debug)]
pub struct JreInstaller {
    container: Container,
    downloader: Downloader,
    manifest_url: String,
    os: OsInfo,
    strip_extras: bool,
    prefer_compressed: bool,
}

impl JreInstaller {

    pub fn new(container: Container, downloader: Downloader) -> Self {
        Self {
            container,
            downloader,
            manifest_url: META_MANIFEST_URL.to_string(),
            os: OsInfo::current(),
            strip_extras: true,
            prefer_compressed: true,
        }
    }

    pub fn set_manifest_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.manifest_url = url.into();
        self
    }

    pub fn set_os(&mut self, os: OsInfo) -> &mut Self {
        self.os = os;
        self
    }

    /// When enabled, legal notice files and empty directory entries of the
    /// component are not materialized.
    pub fn set_strip_extras(&mut self, strip: bool) -> &mut Self {
        self.strip_extras = strip;
        self
    }

    /// When enabled, the LZMA transport is used for files that provide one.
    pub fn set_prefer_compressed(&mut self, prefer: bool) -> &mut Self {
        self.prefer_compressed = prefer;
        self
    }

    /// The platform key of the current system in the meta manifest.
    pub fn platform(&self) -> String {
        match (self.os.name.as_str(), self.os.arch.as_str()) {
            ("osx", "arm64") => "mac-os-arm64",
            ("osx", _) => "mac-os",
            ("windows", "arm64") => "windows-arm64",
            ("windows", "x86") => "windows-x86",
            ("windows", _) => "windows-x64",
            (_, "x86") => "linux-i386",
            (_, "arm64") => "linux-arm64",
            _ => "linux",
        }.to_string()
    }

    /// The directory a component is installed into.
    pub fn component_dir(&self, component: &str) -> PathBuf {
        self.container.jre_dir().joined(component)
    }

    /// The Java executable of an installed component.
    pub fn exec_file(&self, component: &str) -> PathBuf {
        let dir = self.component_dir(component);
        if self.os.name == "osx" {
            dir.joined("jre.bundle/Contents/Home/bin/java")
        } else if self.os.name == "windows" {
            dir.joined("bin").joined("javaw.exe")
        } else {
            dir.joined("bin").joined("java")
        }
    }

    fn installed_file(&self) -> PathBuf {
        self.container.jre_dir().joined("installed.json")
    }

    /// The list of recorded installed components, an unreadable record file
    /// counts as no component installed.
    pub async fn installed(&self) -> Vec<String> {
        let file = self.installed_file();
        let Ok(data) = tokio::fs::read(&file).await else {
            return Vec::new();
        };
        serde_json::from_slice(&data).unwrap_or_default()
    }

    /// Check that a component is recorded as installed, the files themselves
    /// are not re-verified.
    pub async fn is_installed(&self, component: &str) -> bool {
        self.installed().await.iter().any(|c| c == component)
    }

    /// Install the component if it is not recorded as installed yet, then
    /// complete the given task.
    pub async fn ensure(&self, component: &str, task: &Task) -> Result<()> {

        if self.is_installed(component).await {
            task.complete();
            return Ok(());
        }

        match self.install(component, task).await {
            Ok(()) => {
                task.complete();
                Ok(())
            }
            Err(e) => {
                task.abort(e.to_string());
                Err(e)
            }
        }

    }

    async fn install(&self, component: &str, task: &Task) -> Result<()> {

        let jre_dir = self.container.jre_dir();
        tokio::fs::create_dir_all(&jre_dir).await
            .map_err(|e| Error::new_io_file(e, &jre_dir))?;

        // Meta manifest, one entry per platform and component.
        let meta_file = jre_dir.join("meta.json");
        let mut entry = Entry::new(self.manifest_url.as_str(), meta_file.clone());
        entry.set_use_cache(true);
        self.downloader.download_all(vec![entry], &task.child("meta manifest", None)).await?;

        let meta = read_json::<manifest::MetaManifest>(&meta_file).await?;

        let platform = self.platform();
        let Some(meta_platform) = meta.platforms.get(&platform) else {
            return Err(Error::UnsupportedPlatform { platform });
        };

        let variant = meta_platform.components.get(component)
            .and_then(|component| component.variants.first());
        let Some(variant) = variant else {
            return Err(Error::ComponentNotFound { component: component.to_string() });
        };

        log::info!("installing runtime component {component} {} for {platform}",
            variant.version.name);

        // Component manifest, the full file list.
        let manifest_file = jre_dir.join_with_ext(component, "json");
        let mut entry = Entry::new(variant.manifest.url.as_str(), manifest_file.clone());
        if let Some(size) = variant.manifest.size {
            entry.set_expect_size(size);
        }
        if let Some(sha1) = &variant.manifest.sha1 {
            entry.set_expect_sha1(sha1.as_str());
        }
        entry.set_use_cache(true);
        self.downloader.download_all(vec![entry], &task.child("component manifest", None)).await?;

        let manifest = read_json::<manifest::ComponentManifest>(&manifest_file).await?;

        let dir = self.component_dir(component);
        let mut entries = Vec::new();
        let mut compressed = Vec::new();
        let mut executables = Vec::new();
        let mut links = Vec::new();

        for (rel_path, manifest_file) in &manifest.files {

            if self.strip_extras && is_legal_extra(rel_path) {
                continue;
            }

            let file = dir.join(rel_path);

            match manifest_file {
                manifest::ComponentFile::Directory => {
                    if !self.strip_extras {
                        tokio::fs::create_dir_all(&file).await
                            .map_err(|e| Error::new_io_file(e, &file))?;
                    }
                }
                manifest::ComponentFile::File { executable, downloads } => {

                    if *executable {
                        executables.push(file.clone());
                    }

                    let lzma = downloads.lzma.as_ref()
                        .filter(|_| self.prefer_compressed);

                    if let Some(lzma) = lzma {
                        // Compressed transport, staged aside and inflated
                        // after the whole batch.
                        let staging = file.clone().appended(".lzma");
                        let mut entry = Entry::new(lzma.url.as_str(), staging.clone());
                        if let Some(size) = lzma.size {
                            entry.set_expect_size(size);
                        }
                        if let Some(sha1) = &lzma.sha1 {
                            entry.set_expect_sha1(sha1.as_str());
                        }
                        entries.push(entry);
                        compressed.push((staging, file));
                    } else {
                        let raw = &downloads.raw;
                        let mut entry = Entry::new(raw.url.as_str(), file);
                        if let Some(size) = raw.size {
                            entry.set_expect_size(size);
                        }
                        if let Some(sha1) = &raw.sha1 {
                            entry.set_expect_sha1(sha1.as_str());
                        }
                        entries.push(entry);
                    }

                }
                manifest::ComponentFile::Link { target } => {
                    links.push((file, PathBuf::from(target)));
                }
            }

        }

        self.downloader.download_all(entries, &task.child("files", None)).await?;

        for (staging, file) in compressed {
            tokio::task::spawn_blocking(move || inflate_lzma(&staging, &file))
                .await
                .expect("inflate task should not panic")?;
        }

        for file in executables {
            make_executable(&file).await?;
        }

        for (file, target) in links {
            make_link(&file, &target).await?;
        }

        let mut installed = self.installed().await;
        installed.push(component.to_string());
        let data = serde_json::to_vec(&installed)
            .map_err(|e| Error::Internal { error: Box::new(e), origin: "installed.json".into() })?;
        let file = self.installed_file();
        tokio::fs::write(&file, data).await
            .map_err(|e| Error::new_io_file(e, &file))?;

        Ok(())

    }

}

/// Legal notice files are not needed to run the game.
fn is_legal_extra(rel_path: &str) -> bool {
    rel_path.starts_with("legal/")
        || rel_path.contains("/legal/")
}

async fn read_json<T: serde::de::DeserializeOwned>(file: &Path) -> Result<T> {
    let data = tokio::fs::read(file).await
        .map_err(|e| Error::new_io_file(e, file))?;
    let mut deserializer = serde_json::Deserializer::from_slice(&data);
    serde_path_to_error::deserialize::<_, T>(&mut deserializer)
        .map_err(|e| Error::new_json_file(e, file))
}

/// Inflate a staged LZMA file into its final location and remove the staging
/// file.
fn inflate_lzma(staging: &Path, file: &Path) -> Result<()> {

    let mut reader = std::fs::File::open(staging)
        .map(BufReader::new)
        .map_err(|e| Error::new_io_file(e, staging))?;
    let mut writer = std::fs::File::create(file)
        .map_err(|e| Error::new_io_file(e, file))?;

    lzma_rs::lzma_decompress(&mut reader, &mut writer)
        .map_err(|e| Error::Internal {
            error: Box::new(e),
            origin: staging.display().to_string().into(),
        })?;

    std::fs::remove_file(staging)
        .map_err(|e| Error::new_io_file(e, staging))?;

    Ok(())

}

#[cfg(unix)]
async fn make_executable(file: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = tokio::fs::metadata(file).await
        .map_err(|e| Error::new_io_file(e, file))?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    // Grant execute wherever read is already granted.
    permissions.set_mode(mode | ((mode & 0o444) >> 2));
    tokio::fs::set_permissions(file, permissions).await
        .map_err(|e| Error::new_io_file(e, file))
}

#[cfg(not(unix))]
async fn make_executable(_file: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn make_link(file: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await
            .map_err(|e| Error::new_io_file(e, parent))?;
    }
    match tokio::fs::symlink(target, file).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::new_io_file(e, file)),
    }
}

#[cfg(not(unix))]
async fn make_link(_file: &Path, _target: &Path) -> Result<()> {
    Ok(())
}
