//! Maven-style library specifier, known as GAV (Group, Artifact, Version).

use std::path::PathBuf;
use std::str::FromStr;
use std::fmt;

use crate::path::PathBufExt;


/// A maven-style library specifier with an optional classifier and extension,
/// its string format is `group:artifact:version[:classifier][@extension]`.
/// Classifiers carry the native variant of a library (such as
/// `natives-windows`), historically bundled under one library entry and split
/// apart by profile normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gav {
    group: String,
    artifact: String,
    version: String,
    classifier: Option<String>,
    extension: Option<String>,
}

impl Gav {

    /// Create a new library specifier from its components, none of which
    /// should be empty when given.
    pub fn new(
        group: impl Into<String>,
        artifact: impl Into<String>,
        version: impl Into<String>,
        classifier: Option<&str>,
        extension: Option<&str>,
    ) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
            classifier: classifier.map(str::to_string),
            extension: extension.map(str::to_string),
        }
    }

    fn parse(s: &str) -> Option<Self> {

        let (spec, extension) = match s.split_once('@') {
            Some((spec, ext)) if !ext.is_empty() && !ext.contains('@') => (spec, Some(ext)),
            Some(_) => return None,
            None => (s, None),
        };

        let mut split = spec.split(':');
        let group = split.next().filter(|s| !s.is_empty())?;
        let artifact = split.next().filter(|s| !s.is_empty())?;
        let version = split.next().filter(|s| !s.is_empty())?;
        let classifier = match split.next() {
            Some(s) if !s.is_empty() => Some(s),
            Some(_) => return None,
            None => None,
        };

        if split.next().is_some() {
            return None;
        }

        Some(Self::new(group, artifact, version, classifier, extension))

    }

    /// Return the group name of the library, never empty.
    #[inline]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Return the artifact name of the library, never empty.
    #[inline]
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// Return the version of the library, never empty.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Return the classifier of the library, if any.
    #[inline]
    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    /// Change the classifier of the library, should not be empty when given.
    #[inline]
    pub fn set_classifier(&mut self, classifier: Option<&str>) {
        self.classifier = classifier.map(str::to_string);
    }

    /// Return the extension of the library, defaults to "jar".
    #[inline]
    pub fn extension(&self) -> &str {
        self.extension.as_deref().unwrap_or("jar")
    }

    /// The name of the file pointed to by this specifier,
    /// `artifact-version[-classifier].extension`.
    pub fn file_name(&self) -> String {
        let mut name = format!("{}-{}", self.artifact, self.version);
        if let Some(classifier) = self.classifier.as_deref() {
            name.push('-');
            name.push_str(classifier);
        }
        name.push('.');
        name.push_str(self.extension());
        name
    }

    /// The standard maven-repository relative URL of the file pointed to by
    /// this specifier, always slash-separated.
    pub fn url_path(&self) -> String {
        format!("{}/{}/{}/{}",
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.file_name())
    }

    /// The standard maven-repository relative path of the file pointed to by
    /// this specifier, `group/parts/artifact/version/file_name`.
    pub fn file_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for part in self.group.split('.') {
            path.push(part);
        }
        path.joined(&self.artifact)
            .joined(&self.version)
            .joined(self.file_name())
    }

}

impl FromStr for Gav {

    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }

}

impl fmt::Display for Gav {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)?;
        if let Some(classifier) = self.classifier.as_deref() {
            write!(f, ":{classifier}")?;
        }
        if let Some(extension) = self.extension.as_deref() {
            write!(f, "@{extension}")?;
        }
        Ok(())
    }
}

impl serde::Serialize for Gav {

    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer
    {
        serializer.collect_str(self)
    }

}

impl<'de> serde::Deserialize<'de> for Gav {

    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {

        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {

            type Value = Gav;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string gav (group:artifact:version[:classifier][@extension])")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Gav::parse(v)
                    .ok_or_else(|| E::custom("invalid string gav (group:artifact:version[:classifier][@extension])"))
            }

        }

        deserializer.deserialize_str(Visitor)

    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn parse_and_display() {

        let gav: Gav = "org.lwjgl:lwjgl:3.3.3".parse().unwrap();
        assert_eq!(gav.group(), "org.lwjgl");
        assert_eq!(gav.artifact(), "lwjgl");
        assert_eq!(gav.version(), "3.3.3");
        assert_eq!(gav.classifier(), None);
        assert_eq!(gav.extension(), "jar");
        assert_eq!(gav.to_string(), "org.lwjgl:lwjgl:3.3.3");

        let gav: Gav = "org.lwjgl:lwjgl:3.3.3:natives-windows@zip".parse().unwrap();
        assert_eq!(gav.classifier(), Some("natives-windows"));
        assert_eq!(gav.extension(), "zip");
        assert_eq!(gav.to_string(), "org.lwjgl:lwjgl:3.3.3:natives-windows@zip");

        assert!("".parse::<Gav>().is_err());
        assert!("a:b".parse::<Gav>().is_err());
        assert!("a:b:c:d:e".parse::<Gav>().is_err());
        assert!("a:b:c@".parse::<Gav>().is_err());

    }

    #[test]
    fn file_path() {
        let gav: Gav = "com.example.group:artifact:1.0:natives-linux".parse().unwrap();
        let path = gav.file_path();
        let expected: PathBuf = ["com", "example", "group", "artifact", "1.0", "artifact-1.0-natives-linux.jar"]
            .iter().collect();
        assert_eq!(path, expected);
    }

}
