//! Build-time arguments.
//!
//! Tracks user-supplied `--build-arg` values, the names a stage has made
//! visible through `ARG`, and the proxy variables that are always
//! available. Produces the argument markers recorded in RUN and ARG
//! history entries.

use std::collections::{BTreeMap, BTreeSet};

use crate::image::ImageConfig;

/// Proxy variables usable without an `ARG` declaration.
pub const PROXY_ARGS: [&str; 8] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "FTP_PROXY",
    "ftp_proxy",
    "NO_PROXY",
    "no_proxy",
];

/// Argument state for one stage.
#[derive(Debug, Clone, Default)]
pub struct BuildArgSet {
    /// User values plus declared defaults
    values: BTreeMap<String, String>,
    /// Names declared with `ARG` in this stage
    declared: BTreeSet<String>,
}

impl BuildArgSet {
    pub fn new(user_args: &BTreeMap<String, String>) -> Self {
        Self {
            values: user_args.clone(),
            declared: BTreeSet::new(),
        }
    }

    fn is_proxy(name: &str) -> bool {
        PROXY_ARGS.contains(&name)
    }

    /// Declare `name`, applying `default` unless the user supplied a value.
    pub fn declare(&mut self, name: &str, default: Option<String>) {
        self.declared.insert(name.to_string());
        if let Some(default) = default {
            self.values.entry(name.to_string()).or_insert(default);
        }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.declared.contains(name) || Self::is_proxy(name)
    }

    /// Value visible to instructions, if the name is allowed and set.
    pub fn get(&self, name: &str) -> Option<&str> {
        if self.is_allowed(name) {
            self.values.get(name).map(String::as_str)
        } else {
            None
        }
    }

    pub fn declared(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(String::as_str)
    }

    /// Allowed arguments with values, as `(name, value)`.
    pub fn visible(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .filter(|(k, _)| self.is_allowed(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sorted `KEY=VALUE` list recorded in a RUN history entry.
    ///
    /// Values defined in the image environment win over argument values.
    /// Proxy variables only appear when explicitly declared.
    pub fn resolved_for_run(&self, config: &ImageConfig) -> Vec<String> {
        let mut entries: Vec<String> = self
            .visible()
            .filter(|(k, _)| self.declared.contains(*k) || !Self::is_proxy(k))
            .map(|(k, v)| match config.env_get(k) {
                Some(env_value) => format!("{}={}", k, env_value),
                None => format!("{}={}", k, v),
            })
            .collect();
        entries.sort();
        entries
    }

    /// Sorted names of allowed arguments with values, for ARG history.
    pub fn history_key(&self) -> String {
        self.visible()
            .map(|(k, _)| k)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Environment for a RUN: image env plus arguments it does not shadow.
    pub fn run_environment(&self, config: &ImageConfig) -> Vec<String> {
        let mut env = config.env.clone();
        for (k, v) in self.visible() {
            if config.env_get(k).is_none() {
                env.push(format!("{}={}", k, v));
            }
        }
        env
    }
}

/// User-supplied arguments no stage declared, for the end-of-build warning.
pub fn unused_args(user_args: &BTreeMap<String, String>, declared: &BTreeSet<String>) -> Vec<String> {
    user_args
        .keys()
        .filter(|k| !declared.contains(*k) && !PROXY_ARGS.contains(&k.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_undeclared_args_invisible() {
        let args = BuildArgSet::new(&user(&[("VERSION", "2")]));
        assert_eq!(args.get("VERSION"), None);
        assert!(args.resolved_for_run(&ImageConfig::default()).is_empty());
    }

    #[test]
    fn test_declare_with_default_and_override() {
        let mut args = BuildArgSet::new(&user(&[("VERSION", "2")]));
        args.declare("VERSION", Some("1".into()));
        args.declare("MODE", Some("fast".into()));
        args.declare("UNSET", None);
        assert_eq!(args.get("VERSION"), Some("2"));
        assert_eq!(args.get("MODE"), Some("fast"));
        assert_eq!(args.get("UNSET"), None);
        assert_eq!(args.history_key(), "MODE VERSION");
    }

    #[test]
    fn test_resolved_for_run_prefers_env() {
        let mut args = BuildArgSet::new(&user(&[("A", "arg")]));
        args.declare("A", None);
        args.declare("B", Some("b".into()));
        let mut config = ImageConfig::default();
        config.env_set("A", "env");
        assert_eq!(args.resolved_for_run(&config), vec!["A=env", "B=b"]);
    }

    #[test]
    fn test_proxy_args_hidden_unless_declared() {
        let mut args = BuildArgSet::new(&user(&[("HTTP_PROXY", "http://p:3128")]));
        assert_eq!(args.get("HTTP_PROXY"), Some("http://p:3128"));
        assert!(args.resolved_for_run(&ImageConfig::default()).is_empty());
        assert_eq!(
            args.run_environment(&ImageConfig::default()),
            vec!["HTTP_PROXY=http://p:3128"]
        );

        args.declare("HTTP_PROXY", None);
        assert_eq!(
            args.resolved_for_run(&ImageConfig::default()),
            vec!["HTTP_PROXY=http://p:3128"]
        );
    }

    #[test]
    fn test_unused_args_sorted() {
        let user_args = user(&[("Z", "1"), ("A", "1"), ("USED", "1"), ("no_proxy", "x")]);
        let declared: BTreeSet<String> = ["USED".to_string()].into_iter().collect();
        assert_eq!(unused_args(&user_args, &declared), vec!["A", "Z"]);
    }
}
