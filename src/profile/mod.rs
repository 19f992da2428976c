//! Version profile loading, inheritance merging and rule evaluation.
//!
//! A profile file may inherit from a parent one, the whole chain is loaded
//! and folded into a single effective profile before installation. Loaded
//! profiles are first normalized so the rest of the pipeline only ever sees
//! the modern arguments format and classifier-free library specifiers.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::{env, io};

use crate::container::Container;

pub(crate) mod serde;
pub use self::serde::{Profile, Argument, Arguments, Library, LibraryDownloads, Rule, RuleAction};


/// The default JVM arguments used when a profile defines none, such as for
/// old versions with only a legacy game arguments line.
pub(crate) const LEGACY_JVM_ARGS: &[&str] = &[
    "-Djava.library.path=${natives_directory}",
    "-Dminecraft.launcher.brand=${launcher_name}",
    "-Dminecraft.launcher.version=${launcher_version}",
    "-cp",
    "${classpath}",
];


/// The operating system properties rules are evaluated against, captured
/// once and passed around explicitly.
#[derive(Debug, Clone)]
pub struct OsInfo {
    /// OS name as used by rules, such as 'windows', 'linux' or 'osx'.
    pub name: String,
    /// OS version string, matched by rule version regexes.
    pub version: String,
    /// Architecture name as used by rules, such as 'x86_64' or 'arm64'.
    pub arch: String,
    /// Pointer width of the architecture, '32' or '64'.
    pub bits: String,
}

impl OsInfo {

    /// The properties of the system this binary was compiled for.
    pub fn current() -> Self {

        let name = match env::consts::OS {
            "macos" => "osx",
            other => other,
        };

        let arch = match env::consts::ARCH {
            "arm" => "arm32",
            "aarch64" => "arm64",
            other => other,
        };

        let bits = match env::consts::ARCH {
            "x86" | "arm" => "32",
            _ => "64",
        };

        let version = match os_info::get().version() {
            os_info::Version::Unknown => String::new(),
            version => version.to_string(),
        };

        Self {
            name: name.to_string(),
            version,
            arch: arch.to_string(),
            bits: bits.to_string(),
        }

    }

}

/// The error type for profile loading and merging.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested profile file does not exist in the container.
    #[error("profile not found: {id}")]
    NotFound {
        id: String,
    },
    /// A profile id appears twice in the chain, implying infinite recursion.
    #[error("inheritance loop: {id}")]
    InheritanceLoop {
        id: String,
    },
    /// A profile inherits from a parent that is missing or that no loaded
    /// profile declares inheriting from.
    #[error("broken inheritance chain at: {id}")]
    BrokenChain {
        id: String,
    },
    /// The profiles to merge have no unique root without a parent.
    #[error("no unique root profile")]
    NoRoot {  },
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


/// Load the profile chain of the given id, following `inheritsFrom` until a
/// root profile, and normalize each profile. The head profile comes first in
/// the returned chain.
pub async fn load(container: &Container, id: &str) -> Result<Vec<Profile>> {

    let mut profiles = Vec::new();
    let mut seen = HashSet::new();
    let mut current = id.to_string();

    loop {

        if !seen.insert(current.clone()) {
            return Err(Error::InheritanceLoop { id: current });
        }

        let file = container.profile_file(&current);
        let data = match tokio::fs::read(&file).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(if profiles.is_empty() {
                    Error::NotFound { id: current }
                } else {
                    Error::BrokenChain { id: current }
                });
            }
            Err(e) => return Err(Error::new_io_file(e, &file)),
        };

        let mut deserializer = serde_json::Deserializer::from_slice(&data);
        let mut profile = serde_path_to_error::deserialize::<_, Profile>(&mut deserializer)
            .map_err(|e| Error::new_json_file(e, &file))?;

        normalize(&mut profile);

        let parent = profile.inherits_from.clone();
        profiles.push(profile);

        match parent {
            Some(parent) => current = parent,
            None => break,
        }

    }

    Ok(profiles)

}

/// Load and merge the whole profile chain of the given id into a single
/// effective profile.
pub async fn resolve(container: &Container, id: &str) -> Result<Profile> {
    merge(load(container, id).await?)
}

/// Normalize a freshly parsed profile in place.
///
/// The legacy arguments line is split on whitespace into modern game
/// arguments with a default JVM argument list, and every classifier of a
/// library is split out into its own library entry (`group:artifact:
/// version:classifier`) keeping the rules of the original one.
pub fn normalize(profile: &mut Profile) {

    if let Some(legacy) = profile.legacy_arguments.take() {
        if profile.arguments.is_none() {
            profile.arguments = Some(Arguments {
                game: legacy.split_whitespace()
                    .map(|arg| Argument::Raw(arg.to_string()))
                    .collect(),
                jvm: LEGACY_JVM_ARGS.iter()
                    .map(|arg| Argument::Raw(arg.to_string()))
                    .collect(),
            });
        }
    }

    if profile.libraries.iter().any(|lib| !lib.downloads.classifiers.is_empty()) {
        let libraries = std::mem::take(&mut profile.libraries);
        for mut lib in libraries {

            if lib.downloads.classifiers.is_empty() {
                profile.libraries.push(lib);
                continue;
            }

            let mut classifiers = std::mem::take(&mut lib.downloads.classifiers)
                .into_iter()
                .collect::<Vec<_>>();

            // Deterministic output order, classifiers come from a map.
            classifiers.sort_by(|(a, _), (b, _)| a.cmp(b));

            if lib.downloads.artifact.is_some() {
                let mut base = lib.clone();
                base.natives = None;
                profile.libraries.push(base);
            }

            for (classifier, download) in classifiers {
                let mut name = lib.name.clone();
                name.set_classifier(Some(&classifier));
                profile.libraries.push(Library {
                    name,
                    downloads: LibraryDownloads {
                        artifact: Some(download),
                        classifiers: HashMap::new(),
                    },
                    natives: None,
                    rules: lib.rules.clone(),
                    url: None,
                });
            }

        }
    }

}

/// Merge a normalized profile chain into a single effective profile.
///
/// The chain must contain exactly one root profile without a parent, the
/// fold then repeatedly applies the profile inheriting from the current
/// result: arguments are appended (root first), libraries are prepended
/// (head first) and single-valued fields are overridden by the head when it
/// defines them. The final `origin` is the head profile id.
pub fn merge(mut profiles: Vec<Profile>) -> Result<Profile> {

    let mut roots = profiles.iter()
        .enumerate()
        .filter(|(_, profile)| profile.inherits_from.is_none())
        .map(|(i, _)| i);

    let root = match (roots.next(), roots.next()) {
        (Some(root), None) => root,
        _ => return Err(Error::NoRoot {  }),
    };

    let mut merged = profiles.swap_remove(root);

    while !profiles.is_empty() {

        let head = profiles.iter()
            .position(|profile| profile.inherits_from.as_deref() == Some(&merged.id));

        let Some(head) = head else {
            return Err(Error::BrokenChain { id: merged.id });
        };

        merge_child(&mut merged, profiles.swap_remove(head));

    }

    merged.origin = merged.id.clone();
    Ok(merged)

}

/// Apply a profile inheriting from the merged one, on top of it.
fn merge_child(merged: &mut Profile, head: Profile) {

    merged.id = head.id;
    merged.inherits_from = None;

    if head.r#type.is_some() {
        merged.r#type = head.r#type;
    }
    if head.time.is_some() {
        merged.time = head.time;
    }
    if head.release_time.is_some() {
        merged.release_time = head.release_time;
    }
    if head.java_version.is_some() {
        merged.java_version = head.java_version;
    }
    if head.asset_index.is_some() {
        merged.asset_index = head.asset_index;
    }
    if head.assets.is_some() {
        merged.assets = head.assets;
    }
    if head.main_class.is_some() {
        merged.main_class = head.main_class;
    }

    merged.downloads.extend(head.downloads);
    merged.logging.extend(head.logging);

    if let Some(head_args) = head.arguments {
        let args = merged.arguments.get_or_insert_with(Arguments::default);
        args.game.extend(head_args.game);
        args.jvm.extend(head_args.jvm);
    }

    if !head.libraries.is_empty() {
        let mut libraries = head.libraries;
        libraries.append(&mut merged.libraries);
        merged.libraries = libraries;
    }

}

/// Evaluate a rule list against the given OS properties and enabled feature
/// flags. An absent list allows, a present one denies by default and every
/// applicable rule overwrites the verdict with its action, in order.
pub fn eval_rules(rules: Option<&[Rule]>, os: &OsInfo, features: &HashSet<String>) -> bool {

    let Some(rules) = rules else {
        return true;
    };

    let mut allowed = false;
    for rule in rules {
        if rule_applies(rule, os, features) {
            allowed = rule.action == RuleAction::Allow;
        }
    }

    allowed

}

/// Check that every condition of a rule matches the given OS and features.
fn rule_applies(rule: &Rule, os: &OsInfo, features: &HashSet<String>) -> bool {

    if let Some(name) = &rule.os.name {
        if *name != os.name {
            return false;
        }
    }

    if let Some(arch) = &rule.os.arch {
        if *arch != os.arch {
            return false;
        }
    }

    if let Some(version) = &rule.os.version {
        if !version.is_match(&os.version) {
            return false;
        }
    }

    for (feature, expected) in &rule.features {
        if features.contains(feature) != *expected {
            return false;
        }
    }

    true

}

#[cfg(test)]
mod tests {

    use super::*;
    use super::serde::RuleOs;

    fn os(name: &str, version: &str, arch: &str) -> OsInfo {
        OsInfo {
            name: name.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
            bits: "64".to_string(),
        }
    }

    fn rule(action: RuleAction, name: Option<&str>) -> Rule {
        Rule {
            action,
            os: RuleOs {
                name: name.map(str::to_string),
                arch: None,
                version: None,
            },
            features: HashMap::new(),
        }
    }

    #[test]
    fn rules_default_verdicts() {

        let os = os("linux", "6.1", "x86_64");
        let features = HashSet::new();

        assert!(eval_rules(None, &os, &features));
        assert!(!eval_rules(Some(&[]), &os, &features));

        // Last applicable rule wins.
        let rules = [
            rule(RuleAction::Allow, None),
            rule(RuleAction::Disallow, Some("linux")),
        ];
        assert!(!eval_rules(Some(&rules), &os, &features));

        // Inapplicable rules leave the verdict untouched.
        let rules = [
            rule(RuleAction::Allow, None),
            rule(RuleAction::Disallow, Some("windows")),
        ];
        assert!(eval_rules(Some(&rules), &os, &features));

    }

    #[test]
    fn rules_features() {

        let os = os("linux", "6.1", "x86_64");

        let mut demo = Rule {
            action: RuleAction::Allow,
            os: RuleOs::default(),
            features: HashMap::new(),
        };
        demo.features.insert("is_demo_user".to_string(), true);

        let mut features = HashSet::new();
        assert!(!eval_rules(Some(std::slice::from_ref(&demo)), &os, &features));

        features.insert("is_demo_user".to_string());
        assert!(eval_rules(Some(std::slice::from_ref(&demo)), &os, &features));

    }

    #[test]
    fn normalize_legacy_arguments() {

        let mut profile: Profile = serde_json::from_str(r#"{
            "id": "b1.7.3",
            "minecraftArguments": "${auth_player_name} ${auth_session}",
            "mainClass": "net.minecraft.client.Minecraft"
        }"#).unwrap();

        normalize(&mut profile);

        assert!(profile.legacy_arguments.is_none());
        let args = profile.arguments.as_ref().unwrap();
        assert_eq!(args.game.len(), 2);
        assert_eq!(args.jvm.len(), LEGACY_JVM_ARGS.len());
        assert!(matches!(&args.game[0], Argument::Raw(s) if s == "${auth_player_name}"));

    }

    #[test]
    fn normalize_classifier_split() {

        let mut profile: Profile = serde_json::from_str(r#"{
            "id": "1.2.5",
            "libraries": [{
                "name": "org.lwjgl.lwjgl:lwjgl-platform:2.9.0",
                "downloads": {
                    "artifact": { "url": "https://example.com/base.jar" },
                    "classifiers": {
                        "natives-linux": { "url": "https://example.com/linux.jar" },
                        "natives-windows": { "url": "https://example.com/windows.jar" }
                    }
                },
                "rules": [{ "action": "allow" }]
            }]
        }"#).unwrap();

        normalize(&mut profile);

        let names = profile.libraries.iter()
            .map(|lib| lib.name.to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, [
            "org.lwjgl.lwjgl:lwjgl-platform:2.9.0",
            "org.lwjgl.lwjgl:lwjgl-platform:2.9.0:natives-linux",
            "org.lwjgl.lwjgl:lwjgl-platform:2.9.0:natives-windows",
        ]);

        // Rules of the original library are kept on each split library.
        for lib in &profile.libraries {
            assert_eq!(lib.rules.as_ref().map(Vec::len), Some(1));
            assert!(lib.downloads.classifiers.is_empty());
        }

    }

    #[test]
    fn normalize_classifier_split_without_artifact() {

        let mut profile: Profile = serde_json::from_str(r#"{
            "id": "1.2.5",
            "libraries": [{
                "name": "org.lwjgl.lwjgl:lwjgl-platform:2.9.0",
                "downloads": {
                    "classifiers": {
                        "natives-linux": { "url": "https://example.com/linux.jar" },
                        "natives-windows": { "url": "https://example.com/windows.jar" }
                    }
                }
            }]
        }"#).unwrap();

        normalize(&mut profile);

        // No platform-independent artifact, no base-named library.
        let names = profile.libraries.iter()
            .map(|lib| lib.name.to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, [
            "org.lwjgl.lwjgl:lwjgl-platform:2.9.0:natives-linux",
            "org.lwjgl.lwjgl:lwjgl-platform:2.9.0:natives-windows",
        ]);

    }

    #[test]
    fn merge_chain() {

        let child: Profile = serde_json::from_str(r#"{
            "id": "1.20.4-fabric",
            "inheritsFrom": "1.20.4",
            "mainClass": "net.fabricmc.loader.impl.launch.knot.KnotClient",
            "libraries": [{ "name": "net.fabricmc:fabric-loader:0.15.0" }],
            "arguments": { "jvm": ["-DFabricMcEmu=net.minecraft.client.main.Main"] }
        }"#).unwrap();

        let root: Profile = serde_json::from_str(r#"{
            "id": "1.20.4",
            "type": "release",
            "mainClass": "net.minecraft.client.main.Main",
            "libraries": [{ "name": "com.mojang:logging:1.1.1" }],
            "arguments": { "game": ["--version", "${version_name}"], "jvm": ["-cp", "${classpath}"] }
        }"#).unwrap();

        let merged = merge(vec![child, root]).unwrap();

        assert_eq!(merged.id, "1.20.4-fabric");
        assert_eq!(merged.origin, "1.20.4-fabric");
        assert!(merged.inherits_from.is_none());
        assert_eq!(merged.r#type.as_deref(), Some("release"));
        assert_eq!(merged.main_class.as_deref(), Some("net.fabricmc.loader.impl.launch.knot.KnotClient"));

        // Head libraries first, then root ones.
        assert_eq!(merged.libraries[0].name.to_string(), "net.fabricmc:fabric-loader:0.15.0");
        assert_eq!(merged.libraries[1].name.to_string(), "com.mojang:logging:1.1.1");

        // Arguments appended root first.
        let args = merged.arguments.as_ref().unwrap();
        assert!(matches!(&args.jvm[0], Argument::Raw(s) if s == "-cp"));
        assert!(matches!(&args.jvm[2], Argument::Raw(s) if s == "-DFabricMcEmu=net.minecraft.client.main.Main"));

    }

    #[test]
    fn merge_structural_errors() {

        let a: Profile = serde_json::from_str(r#"{ "id": "a", "inheritsFrom": "b" }"#).unwrap();
        let b: Profile = serde_json::from_str(r#"{ "id": "b", "inheritsFrom": "a" }"#).unwrap();
        assert!(matches!(merge(vec![a, b]), Err(Error::NoRoot {  })));

        let a: Profile = serde_json::from_str(r#"{ "id": "a" }"#).unwrap();
        let b: Profile = serde_json::from_str(r#"{ "id": "b", "inheritsFrom": "c" }"#).unwrap();
        assert!(matches!(merge(vec![a, b]), Err(Error::BrokenChain { id }) if id == "a"));

    }

}
