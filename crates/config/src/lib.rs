//! Layered configuration for the entity manager.
//!
//! Values are resolved, lowest priority first, from:
//! 1. built-in defaults ([`Config::default`]);
//! 2. a configuration file (TOML, YAML or JSON, picked by extension), either
//!    given explicitly or found at [`Config::default_path`];
//! 3. environment variables prefixed with `STRATA_` (`STRATA_CLEANUP_DELAY_MS=50`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "STRATA_";
pub const DEFAULT_CLEANUP_DELAY_MS: u64 = 200;
pub const DEFAULT_OFFLOAD_THRESHOLD: usize = 500;

/// How single-entity watchers decide that an entity didn't change, and skip
/// the emission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityEquality {
    /// Structural equality: an entity rebuilt with identical content is not
    /// re-emitted.
    #[default]
    Deep,
    /// Pointer identity, consistent with how the denormalization caches
    /// detect change.
    Reference,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Quiet period, after the last denormalization pass over a branch, before
    /// cache entries of entities that left the branch are evicted.
    pub cleanup_delay_ms: u64,
    /// Batches of at least this many raw entities are normalized on a
    /// blocking worker thread instead of inline.
    pub offload_threshold: usize,
    pub entity_equality: EntityEquality,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cleanup_delay_ms: DEFAULT_CLEANUP_DELAY_MS,
            offload_threshold: DEFAULT_OFFLOAD_THRESHOLD,
            entity_equality: EntityEquality::default(),
        }
    }
}

impl Config {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    /// Where a configuration file is looked for when none is given
    /// explicitly (e.g. `~/.config/strata/strata.toml` on Linux).
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "strata").map(|dirs| dirs.config_dir().join("strata.toml"))
    }

    /// Defaults, then the file at [`default_path`](Self::default_path) if it
    /// exists, then the environment.
    pub fn load() -> Result<Self> {
        let path = Self::default_path().filter(|path| path.is_file());
        tracing::debug!(path = ?path, "Loading configuration");
        Self::extract(Self::figment(path.as_deref())?)
    }

    /// Defaults, then `path` (which must exist), then the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        tracing::debug!(path = %path.display(), "Loading configuration");
        Self::extract(Self::figment(Some(path))?)
    }

    /// The provider stack used by [`load`](Self::load) and
    /// [`load_from`](Self::load_from), for callers that want to merge in
    /// providers of their own.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Extract and validate a configuration from any figment.
    pub fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Invalid)?;
        config.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.offload_threshold == 0 {
            exn::bail!(ErrorKind::OutOfRange("offload_threshold must be at least 1"));
        }
        Ok(self)
    }
}
