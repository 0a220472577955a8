//! Layered configuration.
//!
//! Values come from, in increasing priority: built-in defaults, a TOML file,
//! and `LARK_`-prefixed environment variables (`LARK_DST__THREADS=4` sets
//! `dst.threads`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "LARK_";
pub const CONFIG_FILE: &str = "lark.toml";
const DEFAULT_DST_THREADS: usize = 8;
const DEFAULT_WATCH_DELAY_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub update: UpdateConfig,
    pub database: DatabaseConfig,
    pub dst: DstConfig,
    pub watch: WatchConfig,
}

/// How the database update walk treats symlinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Follow symlinks pointing somewhere inside the music directory.
    pub follow_inside_symlinks: bool,
    /// Follow symlinks pointing outside of it.
    pub follow_outside_symlinks: bool,
}
impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            follow_inside_symlinks: true,
            follow_outside_symlinks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Where the database file is saved.
    pub path: PathBuf,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        let directory = project_dirs().map(|dirs| dirs.data_dir().to_path_buf()).unwrap_or_default();
        Self {
            path: directory.join("database.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DstConfig {
    /// Decoder slots (and threads) in the parallel DST decoder.
    pub threads: usize,
}
impl Default for DstConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_DST_THREADS,
        }
    }
}

/// Automatic updates when files under the music directory change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    /// Changes deeper than this many directories below the root update
    /// their ancestor at this depth instead.
    pub depth: usize,
    /// Quiet period, in milliseconds, before queued changes are updated.
    pub delay_ms: u64,
}
impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            depth: usize::MAX,
            delay_ms: DEFAULT_WATCH_DELAY_MS,
        }
    }
}

impl Config {
    /// Load from `path`, or from `lark.toml` in the user's config directory
    /// if none is given, then apply the environment.
    ///
    /// A missing default file is fine; a missing explicit one is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => {
                exn::bail!(ErrorKind::Invalid(format!("{} is not a file", path.display())));
            },
            Some(path) => Some(path.to_path_buf()),
            None => default_config_file(),
        };
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Reading configuration file");
            figment = figment.merge(Toml::file(file));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate a configuration from any set of providers.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Figment)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dst.threads == 0 {
            exn::bail!(ErrorKind::Invalid("dst.threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "lark")
}

fn default_config_file() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = Config::from_figment(Figment::from(Serialized::defaults(Config::default()))).unwrap();
        assert!(config.update.follow_inside_symlinks);
        assert!(config.update.follow_outside_symlinks);
        assert_eq!(config.dst.threads, 8);
        assert!(config.database.path.ends_with("database.json"));
        assert!(!config.watch.enabled);
        assert_eq!(config.watch.depth, usize::MAX);
        assert_eq!(config.watch.delay_ms, 5000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("lark.toml", "[update]\nfollow_outside_symlinks = false\n\n[dst]\nthreads = 2")?;
            let config = Config::load(Some(Path::new("lark.toml"))).map_err(|err| err.to_string())?;
            assert!(config.update.follow_inside_symlinks);
            assert!(!config.update.follow_outside_symlinks);
            assert_eq!(config.dst.threads, 2);
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("lark.toml", "[dst]\nthreads = 2\n[database]\npath = \"music.json\"")?;
            jail.set_env("LARK_DST__THREADS", "4");
            jail.set_env("LARK_UPDATE__FOLLOW_INSIDE_SYMLINKS", "false");
            jail.set_env("LARK_WATCH__ENABLED", "true");
            jail.set_env("LARK_WATCH__DEPTH", "3");
            let config = Config::load(Some(Path::new("lark.toml"))).map_err(|err| err.to_string())?;
            assert_eq!(config.dst.threads, 4);
            assert!(!config.update.follow_inside_symlinks);
            assert_eq!(config.database.path, PathBuf::from("music.json"));
            assert!(config.watch.enabled);
            assert_eq!(config.watch.depth, 3);
            Ok(())
        });
    }

    #[rstest]
    #[case("[dst]\nthreads = 0")]
    #[case("[dst]\nthreads = \"many\"")]
    #[case("[update]\nfollow_inside_symlinks = 3")]
    fn test_rejects(#[case] contents: &str) {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(contents));
        assert!(Config::from_figment(figment).is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }
}
