//! JSON schemas for version profiles and asset indexes, byte-compatible
//! with the upstream metadata format.

use std::collections::HashMap;

use crate::serde::RegexString;
use crate::gav::Gav;


/// A version profile JSON schema.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// The version id, should be the same as the directory the profile is in.
    pub id: String,
    /// The version type, such as 'release' or 'snapshot'.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    /// The last time this version has been updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// The first release time of this version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_time: Option<String>,
    /// If present, the id of the parent profile this one inherits from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherits_from: Option<String>,
    /// Describe the Java runtime component to use, optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub java_version: Option<JavaVersion>,
    /// The asset index to use when launching the game, with its download.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_index: Option<AssetIndexInfo>,
    /// Legacy asset index id without download information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<String>,
    /// A mapping of downloads for entry point JAR files, such as the client.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub downloads: HashMap<String, Download>,
    /// The sequence of JAR libraries to include in the class path, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<Library>,
    /// The full class name to run as the main JVM class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_class: Option<String>,
    /// Legacy arguments command line, superseded by `arguments`.
    #[serde(rename = "minecraftArguments", skip_serializing_if = "Option::is_none")]
    pub legacy_arguments: Option<String>,
    /// Modern arguments for game and/or jvm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Arguments>,
    /// Logging configuration.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub logging: HashMap<String, Logging>,
    /// The id of the head profile this one was merged from, not part of the
    /// schema.
    #[serde(skip)]
    pub origin: String,
}

/// Object describing the Java runtime component to run the profile with.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JavaVersion {
    pub component: String,
    pub major_version: u32,
}

/// Describe the asset index to use and how to download it when missing.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssetIndexInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(flatten)]
    pub download: Download,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub name: Gav,
    #[serde(default, skip_serializing_if = "LibraryDownloads::is_empty")]
    pub downloads: LibraryDownloads,
    /// Legacy mapping of OS name to natives classifier template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub natives: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Rule>>,
    /// Maven repository to derive the download from when none is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDownloads {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<LibraryDownload>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub classifiers: HashMap<String, LibraryDownload>,
}

impl LibraryDownloads {
    pub fn is_empty(&self) -> bool {
        self.artifact.is_none() && self.classifiers.is_empty()
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDownload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub download: Download,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Arguments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub game: Vec<Argument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jvm: Vec<Argument>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum Argument {
    Raw(String),
    Conditional(ConditionalArgument),
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalArgument {
    pub value: SingleOrVec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Rule>>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Logging {
    #[serde(default)]
    pub r#type: LoggingType,
    pub argument: String,
    pub file: LoggingFile,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingType {
    #[default]
    #[serde(rename = "log4j2-xml")]
    Log4j2Xml,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoggingFile {
    pub id: String,
    #[serde(flatten)]
    pub download: Download,
}

/// An asset index JSON schema, this file is downloaded aside the profile.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct AssetIndexFile {
    /// Assets are also copied into the legacy per-version resources dir.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub map_to_resources: bool,
    /// Assets are also copied into the shared virtual directory.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub r#virtual: bool,
    /// Mapping of assets from their relative path to their hash and size.
    pub objects: HashMap<String, AssetObject>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct AssetObject {
    pub hash: String,
    pub size: u64,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "RuleOs::is_empty")]
    pub os: RuleOs,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub features: HashMap<String, bool>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RuleOs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Only known value to use regex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<RegexString>,
}

impl RuleOs {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.arch.is_none() && self.version.is_none()
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Disallow,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum SingleOrVec<T> {
    Single(T),
    Vec(Vec<T>)
}
