//! Normalized view of a PersistentVolume's mount options
//!
//! Users write options as `--key=value`, `key=value`, `--key value`, or a
//! bare `key`. Normalizing to `--key` lets the controller ask whether an
//! option is present regardless of spelling.

use std::collections::BTreeMap;

/// Deprecated option that enables a local cache
pub const OPTION_CACHE: &str = "--cache";

/// Options that make no sense for a mount driven by the CSI driver
const IGNORED_OPTIONS: &[&str] = &["--foreground", "-f", "--help", "-h", "--version", "-v"];

/// Parsed mount options, keyed by normalized option name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountOptions {
    options: BTreeMap<String, String>,
}

impl MountOptions {
    /// Parse raw mount options
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Self {
        let mut options = BTreeMap::new();
        for option in raw {
            let option = option.as_ref().trim();
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, value),
                None => match option.split_once(' ') {
                    Some((key, value)) => (key, value.trim()),
                    None => (option, ""),
                },
            };
            let key = normalize_key(key);
            if IGNORED_OPTIONS.contains(&key.as_str()) {
                continue;
            }
            options.insert(key, value.to_string());
        }
        Self { options }
    }

    /// Whether the option is present, in any spelling
    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(&normalize_key(key))
    }

    /// Value of the option; empty for flags without a value
    pub fn value(&self, key: &str) -> Option<&str> {
        self.options.get(&normalize_key(key)).map(String::as_str)
    }
}

fn normalize_key(key: &str) -> String {
    let key = key.trim();
    if key.starts_with('-') {
        key.to_string()
    } else {
        format!("--{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_every_spelling() {
        let options = MountOptions::parse(&[
            "--cache=/tmp/cache",
            "region us-east-1",
            "allow-other",
            " --uid=1000 ",
        ]);
        assert_eq!(options.value("--cache"), Some("/tmp/cache"));
        assert_eq!(options.value("region"), Some("us-east-1"));
        assert_eq!(options.value("--allow-other"), Some(""));
        assert_eq!(options.value("uid"), Some("1000"));
    }

    #[test]
    fn bare_cache_option_is_detected() {
        let options = MountOptions::parse(&["cache /var/cache"]);
        assert!(options.has(OPTION_CACHE));
        let options = MountOptions::parse(&["allow-delete"]);
        assert!(!options.has(OPTION_CACHE));
    }

    #[test]
    fn ignores_options_meaningless_for_csi() {
        let options = MountOptions::parse(&["foreground", "-f", "--help"]);
        assert!(!options.has("--foreground"));
        assert!(!options.has("-f"));
        assert!(!options.has("--help"));
    }

    #[test]
    fn empty_input_has_nothing() {
        let options = MountOptions::parse::<&str>(&[]);
        assert!(!options.has(OPTION_CACHE));
        assert_eq!(options, MountOptions::default());
    }
}
