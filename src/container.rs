//! Path strategy inside a game container directory.
//!
//! All path decisions of the install and launch pipeline go through a
//! [`Container`], so a storage mode change never leaks into the core logic.

use std::path::{Path, PathBuf};

use crate::path::{PathExt, PathBufExt};
use crate::gav::Gav;


/// How a container shares data between the versions installed in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Versions share the container root as their working directory.
    #[default]
    Shared,
    /// Each version works inside its own version directory.
    Isolated,
    /// Like [`Self::Isolated`], with the container reserved for one version.
    Locked,
}

/// A game container rooted at one directory, resolving every path used by
/// the install and launch pipeline.
#[derive(Debug, Clone)]
pub struct Container {
    root: PathBuf,
    mode: StorageMode,
}

impl Container {

    pub fn new(root: impl Into<PathBuf>, mode: StorageMode) -> Self {
        Self { root: root.into(), mode }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// The directory of a version, containing its profile and client jar.
    pub fn version_dir(&self, id: &str) -> PathBuf {
        self.root.join("versions").joined(id)
    }

    /// The profile file of a version, `versions/<id>/<id>.json`.
    pub fn profile_file(&self, id: &str) -> PathBuf {
        self.version_dir(id).joined(id).appended(".json")
    }

    /// The client jar of a version, next to its profile file.
    pub fn client_file(&self, id: &str) -> PathBuf {
        self.version_dir(id).joined(id).appended(".jar")
    }

    /// The maven-layout libraries directory.
    pub fn libraries_dir(&self) -> PathBuf {
        self.root.join("libraries")
    }

    /// The file of a library inside the maven-layout directory.
    pub fn library_file(&self, gav: &Gav) -> PathBuf {
        self.libraries_dir().joined(gav.file_path())
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn asset_indexes_dir(&self) -> PathBuf {
        self.assets_dir().joined("indexes")
    }

    pub fn asset_index_file(&self, id: &str) -> PathBuf {
        self.asset_indexes_dir().joined(id).appended(".json")
    }

    pub fn asset_objects_dir(&self) -> PathBuf {
        self.assets_dir().joined("objects")
    }

    /// The file of an asset object, sharded under the first two hex chars
    /// of its hash.
    pub fn asset_object_file(&self, hash: &str) -> PathBuf {
        self.asset_objects_dir().joined(&hash[..2]).joined(hash)
    }

    /// The directory where a whole asset index is reconstructed with plain
    /// relative paths, used by versions too old for hashed objects.
    pub fn virtual_assets_dir(&self, index_id: &str) -> PathBuf {
        self.assets_dir().joined("virtual").joined(index_id)
    }

    pub fn log_configs_dir(&self) -> PathBuf {
        self.assets_dir().joined("log_configs")
    }

    pub fn log_config_file(&self, id: &str) -> PathBuf {
        self.log_configs_dir().joined(id)
    }

    /// The directory where the native libraries of a version are unpacked.
    pub fn natives_dir(&self, id: &str) -> PathBuf {
        self.root.join("bin").joined(id)
    }

    /// The root directory of installed Java runtime components.
    pub fn jre_dir(&self) -> PathBuf {
        self.root.join("jre")
    }

    /// The working directory the game runs in, depending on storage mode.
    pub fn game_dir(&self, id: &str) -> PathBuf {
        match self.mode {
            StorageMode::Shared => self.root.clone(),
            StorageMode::Isolated |
            StorageMode::Locked => self.version_dir(id),
        }
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn paths() {

        let container = Container::new("/data", StorageMode::Shared);
        assert_eq!(container.profile_file("1.20.4"), Path::new("/data/versions/1.20.4/1.20.4.json"));
        assert_eq!(container.client_file("1.20.4"), Path::new("/data/versions/1.20.4/1.20.4.jar"));
        assert_eq!(container.asset_object_file("1dc94f3692bb7b05a0b6161842e406e0b0bbb2c4"), Path::new("/data/assets/objects/1d/1dc94f3692bb7b05a0b6161842e406e0b0bbb2c4"));
        assert_eq!(container.natives_dir("1.20.4"), Path::new("/data/bin/1.20.4"));

        let gav: Gav = "org.lwjgl:lwjgl:3.3.3".parse().unwrap();
        assert_eq!(container.library_file(&gav), Path::new("/data/libraries/org/lwjgl/lwjgl/3.3.3/lwjgl-3.3.3.jar"));

    }

    #[test]
    fn game_dir_mode() {
        let shared = Container::new("/data", StorageMode::Shared);
        let isolated = Container::new("/data", StorageMode::Isolated);
        assert_eq!(shared.game_dir("a"), Path::new("/data"));
        assert_eq!(isolated.game_dir("a"), Path::new("/data/versions/a"));
    }

}
