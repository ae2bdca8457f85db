//! `[log]` settings
//!
//! ```toml
//! [log]
//! to = "both"
//! level = "info"
//! file = "/var/log/fedmq/fedmq.log"
//!
//! [log.modules]
//! "fedmq::bridge" = "debug"
//! "fedmq::governor" = "trace"
//! ```
//!
//! A record is kept when its level passes the override of the longest module prefix matching
//! its target, or the default `level` when no override matches.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default", deserialize_with = "deserialize_level")]
    pub level: slog::Level,
    #[serde(default = "Log::file_default")]
    pub file: String,
    //longest prefix first
    #[serde(default, deserialize_with = "deserialize_module_levels")]
    pub modules: Vec<(String, slog::Level)>,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: Self::to_default(), level: Self::level_default(), file: Self::file_default(), modules: Vec::new() }
    }
}

impl Log {
    fn to_default() -> To {
        To::Console
    }
    fn level_default() -> slog::Level {
        slog::Level::Info
    }
    fn file_default() -> String {
        "fedmq.log".into()
    }

    /// Level that applies to records logged under `target`, e.g. `fedmq::bridge::credit`.
    pub fn level_for(&self, target: &str) -> slog::Level {
        self.modules
            .iter()
            .find(|(module, _)| {
                target.strip_prefix(module.as_str()).map(|rest| rest.is_empty() || rest.starts_with("::")).unwrap_or(false)
            })
            .map(|(_, level)| *level)
            .unwrap_or(self.level)
    }

    /// The most verbose level any target may log at.
    pub fn max_level(&self) -> slog::Level {
        self.modules.iter().map(|(_, level)| *level).fold(self.level, |max, level| {
            if level.as_usize() > max.as_usize() {
                level
            } else {
                max
            }
        })
    }
}

fn parse_level<E: de::Error>(level: &str) -> Result<slog::Level, E> {
    slog::Level::from_str(level).map_err(|_| E::custom(format!("invalid level, {level}")))
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<slog::Level, D::Error>
where
    D: Deserializer<'de>,
{
    parse_level(&String::deserialize(deserializer)?)
}

fn deserialize_module_levels<'de, D>(deserializer: D) -> Result<Vec<(String, slog::Level)>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut modules = BTreeMap::<String, String>::deserialize(deserializer)?
        .into_iter()
        .map(|(module, level)| Ok((module, parse_level(&level)?)))
        .collect::<Result<Vec<_>, D::Error>>()?;
    modules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_overrides_pick_the_longest_prefix() {
        let log = Log {
            modules: vec![
                ("fedmq::bridge::credit".into(), slog::Level::Trace),
                ("fedmq::bridge".into(), slog::Level::Debug),
            ],
            ..Default::default()
        };
        assert_eq!(log.level_for("fedmq::bridge::credit"), slog::Level::Trace);
        assert_eq!(log.level_for("fedmq::bridge::registry"), slog::Level::Debug);
        assert_eq!(log.level_for("fedmq::bridge"), slog::Level::Debug);
        assert_eq!(log.level_for("fedmq::bridges"), slog::Level::Info);
        assert_eq!(log.level_for("fedmq::governor"), slog::Level::Info);
        assert_eq!(log.max_level(), slog::Level::Trace);
        assert_eq!(Log::default().max_level(), slog::Level::Info);
    }

    #[test]
    fn targets() {
        assert!(To::Both.file() && To::Both.console());
        assert!(To::File.file() && !To::File.console());
        assert!(!To::Off.file() && !To::Off.console());
    }
}
