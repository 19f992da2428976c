//! Full installation of a version into a container.
//!
//! The installer drives the whole pipeline as a fixed sequence of steps,
//! each one reported as a child of the given task: profile resolution, Java
//! runtime, client jar, libraries, asset index and objects, log config and
//! finally natives unpacking.

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::io;

use regex::Regex;
use zip::ZipArchive;

use crate::container::Container;
use crate::download::{self, Downloader, Entry, Validation};
use crate::jre::{self, JreInstaller};
use crate::profile::{self, OsInfo, Profile};
use crate::task::Task;
use crate::path::PathBufExt;
use crate::gav::Gav;


/// Base URL for downloading asset objects from their hash.
pub(crate) const RESOURCES_URL: &str = "https://resources.download.minecraft.net/";

/// Java runtime component installed when the profile does not name one.
pub(crate) const DEFAULT_JRE_COMPONENT: &str = "jre-legacy";

/// The replacement pattern for architecture bit-ness in natives classifiers.
const ARCH_REPLACEMENT_PATTERN: &str = "${arch}";


/// Decides which library classifiers are native archives for the current
/// system and which archive entries get unpacked from them.
#[derive(Debug, Clone)]
pub struct NativesPolicy {
    /// Archive entries matching this get unpacked, basename-only.
    pub include: Regex,
    /// Classifier pattern per rule OS name, a classifier matching none of
    /// them is not a native for that OS.
    pub classifiers: HashMap<String, Regex>,
    /// Architecture markers as (classifier substring, required arch or
    /// bit-ness) pairs, checked in order with only the first contained
    /// marker applying. A classifier without any marker matches every arch.
    pub markers: Vec<(String, String)>,
}

impl Default for NativesPolicy {
    fn default() -> Self {
        Self {
            include: Regex::new(r"\.(so|dll|dylib|jnilib)$").unwrap(),
            classifiers: HashMap::from_iter([
                ("linux".to_string(), Regex::new(r"^natives-linux").unwrap()),
                ("windows".to_string(), Regex::new(r"^natives-windows").unwrap()),
                ("osx".to_string(), Regex::new(r"^natives-(osx|macos)").unwrap()),
            ]),
            markers: [
                ("aarch_64", "arm64"),
                ("arm64", "arm64"),
                ("arm32", "arm32"),
                ("x86_64", "x86_64"),
                ("x86", "x86"),
                ("64", "64"),
                ("32", "32"),
            ].into_iter().map(|(m, a)| (m.to_string(), a.to_string())).collect(),
        }
    }
}

impl NativesPolicy {

    /// Check that the given library classifier is a native archive for the
    /// given system.
    pub fn matches(&self, classifier: &str, os: &OsInfo) -> bool {

        let classifier = if classifier.contains(ARCH_REPLACEMENT_PATTERN) {
            classifier.replace(ARCH_REPLACEMENT_PATTERN, &os.bits)
        } else {
            classifier.to_string()
        };

        let Some(regex) = self.classifiers.get(&os.name) else {
            return false;
        };

        if !regex.is_match(&classifier) {
            return false;
        }

        for (marker, required) in &self.markers {
            if classifier.contains(marker.as_str()) {
                return *required == os.arch || *required == os.bits;
            }
        }

        true

    }

}

/// The error type for version installation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("profile: {0}")]
    Profile(#[from] profile::Error),
    #[error("jre: {0}")]
    Jre(#[from] jre::Error),
    #[error("download: {0}")]
    Download(#[from] download::Error),
    /// The client jar has no download information and is not already there,
    /// it is mandatory to build the class path.
    #[error("client not found")]
    ClientNotFound {  },
    /// A library has no download information and is missing from the
    /// libraries directory.
    #[error("library not found: {name}")]
    LibraryNotFound {
        name: Gav,
    },
    /// Some native archives could not be unpacked.
    #[error("natives extraction failed for {failed} libraries")]
    NativesExtraction {
        failed: u32,
    },
    /// An asset index object carries a hash that is not 40 hex chars, it
    /// cannot shard the on-disk object path.
    #[error("invalid asset object hash for {path}: {hash}")]
    InvalidAssetHash {
        path: String,
        hash: String,
    },
    #[error("internal: {error} @ {origin}")]
    Internal {
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
        origin: Box<str>,
    },
}

impl Error {

    #[inline]
    pub(crate) fn new_io_file(error: io::Error, file: impl AsRef<Path>) -> Self {
        Self::Internal { error: Box::new(error), origin: file.as_ref().display().to_string().into() }
    }

    #[inline]
    pub(crate) fn new_json_file(error: serde_path_to_error::Error<serde_json::Error>, file: impl AsRef<Path>) -> Self {
        Self::Internal { error: Box::new(error), origin: file.as_ref().display().to_string().into() }
    }

}

pub type Result<T> = std::result::Result<T, Error>;

/// The outcome of a successful installation, everything needed to
/// synthesize the launch command.
#[derive(Debug)]
pub struct Installed {
    /// The effective, merged profile of the installed version.
    pub profile: Profile,
    /// The asset index id to pass to the game, empty for versions without
    /// assets.
    pub assets_id: String,
}

/// The version installer, tied to one container and downloader.
#[derive(Debug)]
pub struct Installer {
    container: Container,
    downloader: Downloader,
    jre: JreInstaller,
    os: OsInfo,
    features: HashSet<String>,
    natives_policy: NativesPolicy,
}

impl Installer {

    pub fn new(container: Container, downloader: Downloader) -> Self {
        let jre = JreInstaller::new(container.clone(), downloader.clone());
        Self {
            container,
            downloader,
            jre,
            os: OsInfo::current(),
            features: HashSet::new(),
            natives_policy: NativesPolicy::default(),
        }
    }

    /// Enable a feature flag for rule evaluation, such as 'is_demo_user'.
    pub fn set_feature(&mut self, feature: impl Into<String>) -> &mut Self {
        self.features.insert(feature.into());
        self
    }

    pub fn set_os(&mut self, os: OsInfo) -> &mut Self {
        self.os = os;
        self
    }

    pub fn set_natives_policy(&mut self, policy: NativesPolicy) -> &mut Self {
        self.natives_policy = policy;
        self
    }

    pub fn jre_mut(&mut self) -> &mut JreInstaller {
        &mut self.jre
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Install the given version id into the container, reporting progress
    /// as child tasks of the given one. Any step failure aborts the parent
    /// task with a descriptive reason.
    pub async fn install(&self, id: &str, task: &Task) -> Result<Installed> {
        match self.install_inner(id, task).await {
            Ok(installed) => {
                task.complete();
                Ok(installed)
            }
            Err(e) => {
                task.abort(e.to_string());
                Err(e)
            }
        }
    }

    async fn install_inner(&self, id: &str, task: &Task) -> Result<Installed> {

        let step = task.child("profile", None);
        let profile = match profile::resolve(&self.container, id).await {
            Ok(profile) => profile,
            Err(e) => {
                step.abort(e.to_string());
                return Err(e.into());
            }
        };
        step.complete();

        let component = profile.java_version.as_ref()
            .map(|jv| jv.component.as_str())
            .unwrap_or(DEFAULT_JRE_COMPONENT);
        let step = task.child("jre", None);
        self.jre.ensure(component, &step).await?;

        let step = task.child("client", None);
        self.install_client(&profile, &step).await?;

        let step = task.child("libraries", None);
        let natives_files = self.install_libraries(&profile, &step).await?;

        let step = task.child("assets", None);
        let index = self.install_asset_index(&profile, &step).await?;

        let step = task.child("assets objects", None);
        let assets_id = match index {
            Some((assets_id, index)) => {
                self.install_asset_objects(&profile, &assets_id, &index, &step).await?;
                assets_id
            }
            None => {
                step.complete();
                String::new()
            }
        };

        let step = task.child("log config", None);
        self.install_log_config(&profile, &step).await?;

        let step = task.child("natives", None);
        self.install_natives(&profile, &natives_files, &step).await?;

        Ok(Installed { profile, assets_id })

    }

    async fn install_client(&self, profile: &Profile, task: &Task) -> Result<()> {

        let file = self.container.client_file(&profile.id);

        let entry = match profile.downloads.get("client") {
            Some(dl) => {
                let mut entry = Entry::new(dl.url.as_str(), file);
                if let Some(size) = dl.size {
                    entry.set_expect_size(size);
                }
                if let Some(sha1) = &dl.sha1 {
                    entry.set_expect_sha1(sha1.as_str());
                }
                entry.set_use_cache(true);
                entry
            }
            None => {
                // No download information, the jar must already be there.
                return if download::check_file(&file, None, None, Validation::None).await {
                    task.complete();
                    Ok(())
                } else {
                    task.abort("client not found");
                    Err(Error::ClientNotFound {  })
                };
            }
        };

        self.downloader.download_all(vec![entry], task).await?;
        Ok(())

    }

    /// Collect rule-filtered, deduplicated libraries of the profile and
    /// batch-download them, returning the native archive files for the
    /// later unpacking step.
    async fn install_libraries(&self, profile: &Profile, task: &Task) -> Result<Vec<PathBuf>> {

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut natives_files = Vec::new();

        for lib in &profile.libraries {

            if !profile::eval_rules(lib.rules.as_deref(), &self.os, &self.features) {
                continue;
            }

            // A library matching an already collected one, any version, is
            // not collected again: head libraries take precedence.
            let key = (
                lib.name.group().to_string(),
                lib.name.artifact().to_string(),
                lib.name.classifier().map(str::to_string),
                lib.name.extension().to_string(),
            );
            if !seen.insert(key) {
                continue;
            }

            let artifact = lib.downloads.artifact.as_ref();
            let file = artifact
                .and_then(|a| a.path.as_deref())
                .map(|path| self.container.libraries_dir().join(path))
                .unwrap_or_else(|| self.container.library_file(&lib.name));

            let natives = lib.name.classifier()
                .is_some_and(|classifier| self.natives_policy.matches(classifier, &self.os));
            if natives {
                natives_files.push(file.clone());
            }

            if let Some(artifact) = artifact {
                let mut entry = Entry::new(artifact.download.url.as_str(), file);
                if let Some(size) = artifact.download.size {
                    entry.set_expect_size(size);
                }
                if let Some(sha1) = &artifact.download.sha1 {
                    entry.set_expect_sha1(sha1.as_str());
                }
                entries.push(entry);
            } else if let Some(repo_url) = &lib.url {
                // Only a maven repository URL, derive the full one from the
                // library specifier.
                let mut url = repo_url.clone();
                if !url.ends_with('/') {
                    url.push('/');
                }
                url.push_str(&lib.name.url_path());
                entries.push(Entry::new(url, file));
            } else if !download::check_file(&file, None, None, Validation::None).await {
                task.abort(format!("library not found: {}", lib.name));
                return Err(Error::LibraryNotFound { name: lib.name.clone() });
            }

        }

        self.downloader.download_all(entries, task).await?;
        Ok(natives_files)

    }

    /// Download and parse the asset index of the profile, if it has one.
    async fn install_asset_index(&self, profile: &Profile, task: &Task)
        -> Result<Option<(String, profile::serde::AssetIndexFile)>>
    {

        let Some(info) = &profile.asset_index else {
            // Too old for an asset index, legacy id is still forwarded.
            task.complete();
            return Ok(profile.assets.clone().map(|id| (id, empty_index())));
        };

        let file = self.container.asset_index_file(&info.id);
        let mut entry = Entry::new(info.download.url.as_str(), file.clone());
        if let Some(sha1) = &info.download.sha1 {
            entry.set_expect_sha1(sha1.as_str());
        }
        entry.set_use_cache(true);

        self.downloader.download_all(vec![entry], task).await?;

        let data = tokio::fs::read(&file).await
            .map_err(|e| Error::new_io_file(e, &file))?;
        let mut deserializer = serde_json::Deserializer::from_slice(&data);
        let index = serde_path_to_error::deserialize::<_, profile::serde::AssetIndexFile>(&mut deserializer)
            .map_err(|e| Error::new_json_file(e, &file))?;

        Ok(Some((info.id.clone(), index)))

    }

    /// Download all objects of the asset index, one entry per unique hash,
    /// then reconstruct the plain layouts required by old versions.
    async fn install_asset_objects(&self,
        profile: &Profile,
        assets_id: &str,
        index: &profile::serde::AssetIndexFile,
        task: &Task,
    ) -> Result<()> {

        let mut unique_hashes = HashSet::new();
        let mut entries = Vec::new();

        for (rel_path, object) in &index.objects {

            // The hash shards the object path, a malformed one is a broken
            // index and never a retryable download failure.
            if !is_asset_hash(&object.hash) {
                task.abort(format!("invalid asset object hash for {rel_path}: {}", object.hash));
                return Err(Error::InvalidAssetHash {
                    path: rel_path.clone(),
                    hash: object.hash.clone(),
                });
            }

            if unique_hashes.insert(object.hash.as_str()) {
                let mut entry = Entry::new(
                    format!("{RESOURCES_URL}{}/{}", &object.hash[..2], object.hash),
                    self.container.asset_object_file(&object.hash));
                entry.set_expect_size(object.size);
                entry.set_expect_sha1(object.hash.as_str());
                entries.push(entry);
            }

        }

        self.downloader.download_all(entries, task).await?;

        if index.r#virtual || index.map_to_resources {

            let virtual_dir = self.container.virtual_assets_dir(assets_id);
            let resources_dir = self.container.game_dir(&profile.id).joined("resources");

            for (rel_path, object) in &index.objects {

                let object_file = self.container.asset_object_file(&object.hash);

                if index.r#virtual {
                    copy_asset(&object_file, &virtual_dir.join(rel_path)).await?;
                }
                if index.map_to_resources {
                    copy_asset(&object_file, &resources_dir.join(rel_path)).await?;
                }

            }

        }

        Ok(())

    }

    async fn install_log_config(&self, profile: &Profile, task: &Task) -> Result<()> {

        let Some(logging) = profile.logging.get("client") else {
            task.complete();
            return Ok(());
        };

        let file = self.container.log_config_file(&logging.file.id);
        let mut entry = Entry::new(logging.file.download.url.as_str(), file);
        if let Some(size) = logging.file.download.size {
            entry.set_expect_size(size);
        }
        if let Some(sha1) = &logging.file.download.sha1 {
            entry.set_expect_sha1(sha1.as_str());
        }
        entry.set_use_cache(true);

        self.downloader.download_all(vec![entry], task).await?;
        Ok(())

    }

    /// Unpack every native archive into the version natives directory,
    /// basename-only. Failed archives are counted and fail the whole step
    /// once every one has been attempted.
    async fn install_natives(&self, profile: &Profile, natives_files: &[PathBuf], task: &Task) -> Result<()> {

        let natives_dir = self.container.natives_dir(&profile.id);
        tokio::fs::create_dir_all(&natives_dir).await
            .map_err(|e| Error::new_io_file(e, &natives_dir))?;

        task.set_total(natives_files.len() as u32);
        let mut failed = 0u32;

        for file in natives_files {

            let src = file.clone();
            let dir = natives_dir.clone();
            let include = self.natives_policy.include.clone();

            let result = tokio::task::spawn_blocking(move || {
                extract_natives(&src, &dir, &include)
            }).await.expect("natives task should not panic");

            match result {
                Ok(()) => task.advance(true),
                Err(e) => {
                    log::warn!("failed to unpack natives of {}: {e}", file.display());
                    failed += 1;
                    task.advance(false);
                }
            }

        }

        if failed != 0 {
            task.abort(format!("natives extraction failed for {failed} libraries"));
            Err(Error::NativesExtraction { failed })
        } else {
            task.complete();
            Ok(())
        }

    }

}

/// Check that an asset object hash has the expected 40 hex chars shape.
fn is_asset_hash(hash: &str) -> bool {
    hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// An empty asset index used for legacy ids with no download information.
fn empty_index() -> profile::serde::AssetIndexFile {
    profile::serde::AssetIndexFile {
        map_to_resources: false,
        r#virtual: false,
        objects: HashMap::new(),
    }
}

async fn copy_asset(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await
            .map_err(|e| Error::new_io_file(e, parent))?;
    }
    tokio::fs::copy(src, dst).await
        .map_err(|e| Error::new_io_file(e, dst))?;
    Ok(())
}

/// Unpack the matching entries of a native archive into the given directory,
/// dropping any directory structure of the archive.
fn extract_natives(file: &Path, dir: &Path, include: &Regex) -> io::Result<()> {

    let reader = BufReader::new(std::fs::File::open(file)?);
    let mut archive = ZipArchive::new(reader)
        .map_err(io::Error::other)?;

    extract_natives_archive(&mut archive, dir, include)

}

fn extract_natives_archive<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    dir: &Path,
    include: &Regex,
) -> io::Result<()> {

    for i in 0..archive.len() {

        let mut entry = archive.by_index(i)
            .map_err(io::Error::other)?;

        let Some(entry_path) = entry.enclosed_name() else {
            continue;
        };

        let Some(name) = entry_path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if !include.is_match(name) {
            continue;
        }

        let dst_file = dir.join(name);
        let mut dst = std::fs::File::create(&dst_file)?;
        io::copy(&mut entry, &mut dst)?;

    }

    Ok(())

}

#[cfg(test)]
mod tests {

    use std::io::Write;

    use super::*;

    fn os(name: &str, arch: &str, bits: &str) -> OsInfo {
        OsInfo {
            name: name.to_string(),
            version: "10.0".to_string(),
            arch: arch.to_string(),
            bits: bits.to_string(),
        }
    }

    #[test]
    fn natives_policy_classifiers() {

        let policy = NativesPolicy::default();
        let linux = os("linux", "x86_64", "64");
        let windows = os("windows", "x86_64", "64");
        let windows_arm = os("windows", "arm64", "64");

        assert!(policy.matches("natives-linux", &linux));
        assert!(!policy.matches("natives-windows", &linux));
        assert!(policy.matches("natives-windows", &windows));
        assert!(!policy.matches("sources", &linux));

        // Arch markers pin a classifier to one architecture.
        assert!(policy.matches("natives-windows-x86_64", &windows));
        assert!(!policy.matches("natives-windows-x86", &windows));
        assert!(policy.matches("natives-windows-arm64", &windows_arm));
        assert!(!policy.matches("natives-windows-arm64", &windows));

        // The bit-ness template resolves before matching.
        assert!(policy.matches("natives-windows-${arch}", &windows));

    }

    #[test]
    fn natives_extraction_basename_only() {

        let dir = tempfile::tempdir().unwrap();
        let archive_file = dir.path().join("natives.jar");

        let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive_file).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("META-INF/MANIFEST.MF", options).unwrap();
        writer.write_all(b"Manifest-Version: 1.0\n").unwrap();
        writer.start_file("linux/x64/org/lwjgl/liblwjgl.so", options).unwrap();
        writer.write_all(b"\x7fELF").unwrap();
        writer.start_file("notes.txt", options).unwrap();
        writer.write_all(b"not a native").unwrap();
        writer.finish().unwrap();

        let out_dir = dir.path().join("bin");
        std::fs::create_dir_all(&out_dir).unwrap();

        let include = NativesPolicy::default().include;
        extract_natives(&archive_file, &out_dir, &include).unwrap();

        assert!(out_dir.join("liblwjgl.so").is_file());
        assert!(!out_dir.join("notes.txt").exists());
        assert!(!out_dir.join("MANIFEST.MF").exists());
        assert_eq!(std::fs::read_dir(&out_dir).unwrap().count(), 1);

    }

}
