//! Mirror resolution, rewriting download URLs according to a ranked,
//! latency-tested rule set.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use reqwest::Client;


/// Number of probe attempts per rule when measuring latency.
const PROBE_TRIES: usize = 3;

/// Timeout of a single latency probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One mirror rule: a set of URL-substring overrides ranked by the measured
/// latency of its test URL. A `None` replacement means "match but keep the
/// URL as-is", which shields a URL family from lower-ranked rules.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MirrorRule {
    pub name: String,
    pub test_url: String,
    pub overrides: Vec<(String, Option<String>)>,
    /// Measured latency in milliseconds, negative when unreachable.
    #[serde(default)]
    pub latency: i64,
}

/// The resolver itself, constructed once from the configured rule set and the
/// global enable switch, then shared read-only by the downloader.
#[derive(Debug)]
pub struct Mirrors {
    enabled: bool,
    rules: Vec<MirrorRule>,
    /// Synthesized override list, rules reverse-merged by ascending latency so
    /// the lowest-latency rule wins a key collision.
    merged: Vec<(String, Option<String>)>,
}

impl Mirrors {

    /// Build a resolver from the given rules, sorted by ascending latency.
    pub fn new(mut rules: Vec<MirrorRule>, enabled: bool) -> Self {

        rules.sort_by_key(|rule| rule.latency);

        let mut merged: Vec<(String, Option<String>)> = Vec::new();
        for rule in &rules {
            for (pattern, replacement) in &rule.overrides {
                if !merged.iter().any(|(p, _)| p == pattern) {
                    merged.push((pattern.clone(), replacement.clone()));
                }
            }
        }

        Self { enabled, rules, merged }

    }

    /// A resolver that never rewrites anything.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), false)
    }

    /// True when the global mirroring switch is on.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The rule set backing this resolver, sorted by ascending latency. The
    /// caller owns persistence of this set.
    #[inline]
    pub fn rules(&self) -> &[MirrorRule] {
        &self.rules
    }

    /// Rewrite the given URL according to the merged override list: the first
    /// pattern that is a substring of the URL decides, performing at most one
    /// substring replacement. No match, a null replacement or a disabled
    /// resolver all keep the URL unchanged.
    pub fn apply<'u>(&self, url: &'u str) -> Cow<'u, str> {

        if !self.enabled {
            return Cow::Borrowed(url);
        }

        for (pattern, replacement) in &self.merged {
            if url.contains(pattern.as_str()) {
                return match replacement {
                    Some(replacement) => Cow::Owned(url.replacen(pattern.as_str(), replacement, 1)),
                    None => Cow::Borrowed(url),
                };
            }
        }

        Cow::Borrowed(url)

    }

}

/// Probe every rule's test URL and return the surviving rules with their
/// measured latency, sorted ascending. Unreachable rules are dropped. The
/// returned set is meant to replace the previous one wholesale.
pub async fn probe_rules(client: &Client, rules: Vec<MirrorRule>) -> Vec<MirrorRule> {

    let mut probed = Vec::with_capacity(rules.len());

    for mut rule in rules {
        match probe_url(client, &rule.test_url).await {
            Some(latency) => {
                rule.latency = latency.as_millis() as i64;
                probed.push(rule);
            }
            None => {
                log::warn!("dropping unreachable mirror rule: {}", rule.name);
            }
        }
    }

    probed.sort_by_key(|rule| rule.latency);
    probed

}

/// Measure the best-of-N latency of a HEAD request to the given URL, none if
/// every try failed or timed out.
async fn probe_url(client: &Client, url: &str) -> Option<Duration> {

    let mut best = None::<Duration>;

    for _ in 0..PROBE_TRIES {

        let start = Instant::now();
        let res = tokio::time::timeout(PROBE_TIMEOUT, client.head(url).send()).await;

        if let Ok(Ok(res)) = res {
            if !res.status().is_server_error() {
                let elapsed = start.elapsed();
                if best.is_none_or(|best| elapsed < best) {
                    best = Some(elapsed);
                }
            }
        }

    }

    best

}

#[cfg(test)]
mod tests {

    use super::*;

    fn rule(name: &str, latency: i64, overrides: &[(&str, Option<&str>)]) -> MirrorRule {
        MirrorRule {
            name: name.to_string(),
            test_url: String::new(),
            overrides: overrides.iter()
                .map(|(p, r)| (p.to_string(), r.map(str::to_string)))
                .collect(),
            latency,
        }
    }

    #[test]
    fn apply_rewrites() {

        let mirrors = Mirrors::new(vec![
            rule("slow", 200, &[
                ("https://resources.example.net", Some("https://slow.mirror/resources")),
                ("https://libraries.example.net", Some("https://slow.mirror/libraries")),
            ]),
            rule("fast", 20, &[
                ("https://resources.example.net", Some("https://fast.mirror/resources")),
            ]),
        ], true);

        // Lowest latency wins the colliding key.
        assert_eq!(
            mirrors.apply("https://resources.example.net/ab/abcdef"),
            "https://fast.mirror/resources/ab/abcdef",
        );

        // Non-colliding key from the slower rule still applies.
        assert_eq!(
            mirrors.apply("https://libraries.example.net/org/a/a.jar"),
            "https://slow.mirror/libraries/org/a/a.jar",
        );

        // No match is unchanged.
        assert_eq!(mirrors.apply("https://other.example.com/x"), "https://other.example.com/x");

    }

    #[test]
    fn apply_null_replacement_and_disabled() {

        let mirrors = Mirrors::new(vec![
            rule("keep", 10, &[("https://resources.example.net", None)]),
            rule("rewrite", 50, &[("https://resources.example.net", Some("https://m/"))]),
        ], true);

        // The null replacement matches first and keeps the URL untouched.
        assert_eq!(
            mirrors.apply("https://resources.example.net/x"),
            "https://resources.example.net/x",
        );

        let disabled = Mirrors::new(vec![
            rule("rewrite", 10, &[("https://resources.example.net", Some("https://m/"))]),
        ], false);
        assert_eq!(
            disabled.apply("https://resources.example.net/x"),
            "https://resources.example.net/x",
        );

    }

}
