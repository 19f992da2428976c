//! Synthesis of the launch command line from an effective profile.
//!
//! This is a pure computation over the profile and container paths, nothing
//! is read from disk so it can run before or after the actual installation.

use std::collections::HashSet;
use std::env;

use crate::container::Container;
use crate::install::NativesPolicy;
use crate::profile::{self, Argument, OsInfo, Profile, LEGACY_JVM_ARGS};
use crate::profile::serde::SingleOrVec;


/// JVM arguments always appended by the launcher, after the profile ones.
pub(crate) const INJECTED_JVM_ARGS: &[&str] = &[
    "-Dminecraft.launcher.brand=${launcher_name}",
    "-Dminecraft.launcher.version=${launcher_version}",
];


/// The account identity substituted into game arguments. Offline sessions
/// just fill these with made-up values.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub username: String,
    pub uuid: String,
    pub access_token: String,
    pub user_type: String,
    pub xuid: String,
    pub client_id: String,
}

/// Options of the synthesis that are not derived from the profile.
#[derive(Debug, Clone)]
pub struct Options {
    pub launcher_name: String,
    pub launcher_version: String,
    /// Feature flags enabled for conditional argument and library rules.
    pub features: HashSet<String>,
    pub os: OsInfo,
    /// Policy deciding which classifier libraries are natives, these are
    /// kept out of the class path.
    pub natives_policy: NativesPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            launcher_name: env!("CARGO_PKG_NAME").to_string(),
            launcher_version: env!("CARGO_PKG_VERSION").to_string(),
            features: HashSet::new(),
            os: OsInfo::current(),
            natives_policy: NativesPolicy::default(),
        }
    }
}

/// The synthesized command line, to be combined with a Java executable and
/// a working directory to spawn the game.
#[derive(Debug, Clone)]
pub struct Command {
    pub jvm_args: Vec<String>,
    pub main_class: String,
    pub game_args: Vec<String>,
}

/// The error type for command synthesis.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The profile defines no main class, it is impossible to launch.
    #[error("main class not found")]
    MainClassNotFound {  },
}

pub type Result<T> = std::result::Result<T, Error>;


/// Synthesize the command line for the given effective profile.
pub fn synthesize(
    profile: &Profile,
    container: &Container,
    assets_id: &str,
    account: &Account,
    options: &Options,
) -> Result<Command> {

    let main_class = profile.main_class.clone()
        .ok_or(Error::MainClassNotFound {  })?;

    let mut jvm_args = Vec::new();
    let mut game_args = Vec::new();

    if let Some(args) = &profile.arguments {
        filter_args(&mut jvm_args, &args.jvm, &options.os, &options.features);
        filter_args(&mut game_args, &args.game, &options.os, &options.features);
    }

    // Old profiles without any JVM argument still need the basics.
    if jvm_args.is_empty() {
        jvm_args.extend(LEGACY_JVM_ARGS.iter().map(|arg| arg.to_string()));
    }

    for arg in INJECTED_JVM_ARGS {
        if !jvm_args.iter().any(|existing| existing == arg) {
            jvm_args.push(arg.to_string());
        }
    }

    // The logging configuration is an additional JVM argument with its own
    // substitution, resolved before the general pass.
    if let Some(logging) = profile.logging.get("client") {
        let file = container.log_config_file(&logging.file.id);
        jvm_args.push(logging.argument.replace("${path}", &file.display().to_string()));
    }

    // Class path in library declaration order, client jar last, natives
    // excluded.
    let mut seen = HashSet::new();
    let mut class_files = Vec::new();

    for lib in &profile.libraries {

        if !profile::eval_rules(lib.rules.as_deref(), &options.os, &options.features) {
            continue;
        }

        let key = (
            lib.name.group().to_string(),
            lib.name.artifact().to_string(),
            lib.name.classifier().map(str::to_string),
            lib.name.extension().to_string(),
        );
        if !seen.insert(key) {
            continue;
        }

        let natives = lib.name.classifier()
            .is_some_and(|classifier| options.natives_policy.matches(classifier, &options.os));
        if natives {
            continue;
        }

        let file = lib.downloads.artifact.as_ref()
            .and_then(|a| a.path.as_deref())
            .map(|path| container.libraries_dir().join(path))
            .unwrap_or_else(|| container.library_file(&lib.name));

        class_files.push(file);

    }

    class_files.push(container.client_file(&profile.id));

    let classpath = env::join_paths(&class_files)
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_default();

    let natives_dir = container.natives_dir(&profile.id);
    let game_dir = container.game_dir(&profile.id);

    let replace = |name: &str| {
        Some(match name {
            "classpath" => classpath.clone(),
            #[cfg(windows)]      "classpath_separator" => ";".to_string(),
            #[cfg(not(windows))] "classpath_separator" => ":".to_string(),
            "natives_directory" => natives_dir.display().to_string(),
            "launcher_name" => options.launcher_name.clone(),
            "launcher_version" => options.launcher_version.clone(),
            "version_name" => profile.id.clone(),
            "version_type" => return profile.r#type.clone(),
            "game_directory" => game_dir.display().to_string(),
            "library_directory" => container.libraries_dir().display().to_string(),
            "assets_root" => container.assets_dir().display().to_string(),
            "assets_index_name" => assets_id.to_string(),
            "game_assets" => container.virtual_assets_dir(assets_id).display().to_string(),
            "auth_player_name" => account.username.clone(),
            "auth_uuid" => account.uuid.clone(),
            "auth_access_token" => account.access_token.clone(),
            "auth_session" => account.access_token.clone(),
            "auth_xuid" => account.xuid.clone(),
            "clientid" => account.client_id.clone(),
            "user_type" => account.user_type.clone(),
            "user_properties" => "{}".to_string(),
            _ => return None,
        })
    };

    replace_strings_args(&mut jvm_args, replace);
    replace_strings_args(&mut game_args, replace);

    Ok(Command { jvm_args, main_class, game_args })

}

/// Append the rule-passing arguments of a list to the output.
fn filter_args(
    out: &mut Vec<String>,
    args: &[Argument],
    os: &OsInfo,
    features: &HashSet<String>,
) {
    for arg in args {
        match arg {
            Argument::Raw(value) => out.push(value.clone()),
            Argument::Conditional(arg) => {
                if profile::eval_rules(arg.rules.as_deref(), os, features) {
                    match &arg.value {
                        SingleOrVec::Single(value) => out.push(value.clone()),
                        SingleOrVec::Vec(values) => out.extend(values.iter().cloned()),
                    }
                }
            }
        }
    }
}

fn replace_strings_args<F>(args: &mut [String], mut func: F)
where
    F: FnMut(&str) -> Option<String>,
{
    for arg in args {
        replace_string_args(arg, &mut func);
    }
}

/// Given a string buffer, search for each variable of the form `${name}`,
/// give its name to the given closure and if some value is returned,
/// replace it by this value.
fn replace_string_args<F>(s: &mut String, mut func: F)
where
    F: FnMut(&str) -> Option<String>,
{

    // Everything before the cursor has already been checked.
    let mut cursor = 0;

    while let Some(open_idx) = s[cursor..].find("${") {

        let open_idx = cursor + open_idx;
        let Some(close_idx) = s[open_idx + 2..].find('}') else { break };
        let close_idx = open_idx + 2 + close_idx + 1;
        cursor = close_idx;

        if let Some(value) = func(&s[open_idx + 2..close_idx - 1]) {

            s.replace_range(open_idx..close_idx, &value);

            let repl_len = close_idx - open_idx;
            let repl_diff = value.len() as isize - repl_len as isize;
            cursor = cursor.checked_add_signed(repl_diff).unwrap();

        }

    }

}

#[cfg(test)]
mod tests {

    use crate::container::{Container, StorageMode};
    use super::*;

    fn test_os() -> OsInfo {
        OsInfo {
            name: "linux".to_string(),
            version: "6.1".to_string(),
            arch: "x86_64".to_string(),
            bits: "64".to_string(),
        }
    }

    #[test]
    fn string_args_replacement() {

        let mut s = "--assetsDir ${assets_root} --id ${assets_index_name} ${unknown}".to_string();
        replace_string_args(&mut s, |name| {
            Some(match name {
                "assets_root" => "/data/assets".to_string(),
                "assets_index_name" => "17".to_string(),
                _ => return None,
            })
        });

        assert_eq!(s, "--assetsDir /data/assets --id 17 ${unknown}");

    }

    #[test]
    fn synthesize_classpath_and_identity() {

        let profile: Profile = serde_json::from_str(r#"{
            "id": "1.20.4",
            "type": "release",
            "mainClass": "net.minecraft.client.main.Main",
            "libraries": [
                { "name": "com.mojang:logging:1.1.1" },
                { "name": "org.lwjgl:lwjgl:3.3.3:natives-linux" }
            ],
            "arguments": {
                "game": ["--username", "${auth_player_name}", "--version", "${version_name}"],
                "jvm": ["-cp", "${classpath}"]
            }
        }"#).unwrap();

        let container = Container::new("/data", StorageMode::Shared);
        let account = Account {
            username: "Dev".to_string(),
            ..Account::default()
        };
        let options = Options {
            os: test_os(),
            ..Options::default()
        };

        let command = synthesize(&profile, &container, "17", &account, &options).unwrap();

        assert_eq!(command.main_class, "net.minecraft.client.main.Main");
        assert_eq!(command.game_args, ["--username", "Dev", "--version", "1.20.4"]);

        // Natives are kept out of the class path, the client jar ends it.
        let classpath = &command.jvm_args[1];
        assert!(classpath.contains("com/mojang/logging/1.1.1/logging-1.1.1.jar"));
        assert!(!classpath.contains("natives-linux"));
        assert!(classpath.ends_with("versions/1.20.4/1.20.4.jar"));

    }

    #[test]
    fn synthesize_requires_main_class() {

        let profile: Profile = serde_json::from_str(r#"{ "id": "broken" }"#).unwrap();
        let container = Container::new("/data", StorageMode::Shared);

        let result = synthesize(&profile, &container, "", &Account::default(), &Options {
            os: test_os(),
            ..Options::default()
        });
        assert!(matches!(result, Err(Error::MainClassNotFound {  })));

    }

    #[test]
    fn synthesize_conditional_arguments() {

        let profile: Profile = serde_json::from_str(r#"{
            "id": "1.20.4",
            "mainClass": "net.minecraft.client.main.Main",
            "arguments": {
                "game": [
                    "--version", "${version_name}",
                    { "rules": [{ "action": "allow", "features": { "is_demo_user": true } }], "value": "--demo" },
                    { "rules": [{ "action": "allow", "os": { "name": "osx" } }], "value": ["-XstartOnFirstThread"] }
                ]
            }
        }"#).unwrap();

        let container = Container::new("/data", StorageMode::Shared);
        let options = Options {
            os: test_os(),
            ..Options::default()
        };

        let command = synthesize(&profile, &container, "", &Account::default(), &options).unwrap();
        assert_eq!(command.game_args, ["--version", "1.20.4"]);

        let mut demo = Options {
            os: test_os(),
            ..Options::default()
        };
        demo.features.insert("is_demo_user".to_string());

        let command = synthesize(&profile, &container, "", &Account::default(), &demo).unwrap();
        assert_eq!(command.game_args, ["--version", "1.20.4", "--demo"]);

    }

}
