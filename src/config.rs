//! Engine configuration: file, environment and defaults
//!
//! A config is resolved from the first file found among an explicit path,
//! `./stratum.toml` and `<config_dir>/config.toml`, then overlaid with
//! `STRATUM_*` environment variables.
//!
//! ```toml
//! app = "shop"
//! stage = "prod"
//! phase = "up"
//! mode = "live"
//! concurrency = 8
//! failure_policy = "halt-all"
//!
//! [state]
//! backend = "object"
//! url = "https://objects.example.com"
//! bucket = "shop-state"
//! base_path = "teams/web"
//! ```

use crate::paths;
use anyhow::{Context, Result, bail};
use reconcile::{FailurePolicy, Mode, Phase};
use serde::{Deserialize, Deserializer, Serialize};
use statekit::{Passphrase, RecordCodec, Secret, SecretCodec};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_APP: &str = "STRATUM_APP";
pub const ENV_STAGE: &str = "STRATUM_STAGE";
pub const ENV_PHASE: &str = "STRATUM_PHASE";
pub const ENV_MODE: &str = "STRATUM_MODE";
pub const ENV_PASSWORD: &str = "STRATUM_PASSWORD";
pub const ENV_QUIET: &str = "STRATUM_QUIET";
pub const ENV_CONCURRENCY: &str = "STRATUM_CONCURRENCY";
pub const ENV_STATE_URL: &str = "STRATUM_STATE_URL";

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Application name, the first FQN segment
    pub app: String,
    /// Stage name, the second FQN segment
    pub stage: String,
    pub phase: Phase,
    pub mode: Mode,
    /// Passphrase for secret values; never written back out
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub password: Option<Secret>,
    pub quiet: bool,
    pub verbose: u8,
    /// Maximum number of handlers in flight
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    /// Update every existing resource even when unchanged
    pub force: bool,
    pub state: StateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: String::new(),
            stage: default_stage(),
            phase: Phase::default(),
            mode: Mode::default(),
            password: None,
            quiet: false,
            verbose: 0,
            concurrency: 4,
            failure_policy: FailurePolicy::default(),
            force: false,
            state: StateConfig::default(),
        }
    }
}

fn default_stage() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| reconcile::scope::validate_id(user).is_ok())
        .unwrap_or_else(|| "dev".to_string())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<Secret>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(Secret::new))
}

impl Config {
    /// Resolve, parse, overlay the environment and validate
    ///
    /// With `path` set the file must exist. Otherwise the first existing file
    /// among `./stratum.toml` and [`paths::config_file`] is used, falling back
    /// to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match Self::resolve_file(path)? {
            Some(file) => Self::from_file(&file)?,
            None => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        let config = config.from_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_file(path: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = path {
            return Ok(Some(path.to_path_buf()));
        }
        let local = PathBuf::from(paths::LOCAL_CONFIG_FILE);
        if local.is_file() {
            return Ok(Some(local));
        }
        let user = paths::config_file()?;
        Ok(user.is_file().then_some(user))
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config format in {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Overlay `STRATUM_*` environment variables
    pub fn from_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Overlay variables produced by `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(app) = lookup(ENV_APP) {
            self.app = app;
        }
        if let Some(stage) = lookup(ENV_STAGE) {
            self.stage = stage;
        }
        if let Some(phase) = lookup(ENV_PHASE) {
            self.phase = parse_var(ENV_PHASE, &phase)?;
        }
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = parse_var(ENV_MODE, &mode)?;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.password = Some(Secret::new(password));
        }
        if let Some(quiet) = lookup(ENV_QUIET) {
            self.quiet = parse_flag(ENV_QUIET, &quiet)?;
        }
        if let Some(concurrency) = lookup(ENV_CONCURRENCY) {
            self.concurrency = concurrency
                .parse()
                .with_context(|| format!("{ENV_CONCURRENCY} must be a number, got '{concurrency}'"))?;
        }
        if let Some(dir) = lookup(paths::ENV_STATE_DIR) {
            self.state.dir = Some(dir);
        }
        if let Some(url) = lookup(ENV_STATE_URL) {
            self.state.backend = StoreKind::Object;
            self.state.url = Some(url);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.is_empty() {
            bail!("No app name configured (set `app` in stratum.toml or {ENV_APP})");
        }
        reconcile::scope::validate_id(&self.app).context("Invalid app name")?;
        reconcile::scope::validate_id(&self.stage).context("Invalid stage name")?;
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.state.backend == StoreKind::Object && self.state.url.is_none() {
            bail!("The object state backend needs a url (set `state.url` or {ENV_STATE_URL})");
        }
        Ok(())
    }

    /// Record codec for this config: encrypting when a password is set
    pub fn codec(&self) -> Result<RecordCodec> {
        match &self.password {
            Some(password) => {
                let secrets = SecretCodec::new(Passphrase::new(password.expose()))
                    .context("Failed to initialise the secret codec")?;
                Ok(RecordCodec::new(secrets))
            }
            None => Ok(RecordCodec::plain()),
        }
    }

    /// Serialize to TOML; the password is omitted
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn parse_var<T: FromStr<Err = String>>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|e: String| anyhow::anyhow!("{key}: {e}"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key} must be a boolean, got '{other}'"),
    }
}

// ============================================================================
// State store selection
// ============================================================================

/// Which backend holds state records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One JSON file per record under the state directory
    #[default]
    Fs,
    /// Process memory; lost on exit
    Memory,
    /// A remote object storage bucket over HTTP
    Object,
    /// A journaled worker thread in this process
    Durable,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fs => "fs",
            Self::Memory => "memory",
            Self::Object => "object",
            Self::Durable => "durable",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub backend: StoreKind,
    /// Root directory for `fs` and journal directory for `durable`
    pub dir: Option<String>,
    /// Endpoint for `object`
    pub url: Option<String>,
    pub bucket: String,
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub token: Option<Secret>,
    /// Namespace prefix isolating this engine's keys in a shared backend
    pub base_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StoreKind::default(),
            dir: None,
            url: None,
            bucket: "stratum-state".to_string(),
            token: None,
            base_path: String::new(),
        }
    }
}

impl StateConfig {
    /// Configured directory, expanded, or the default state directory
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(paths::expand_path(dir)),
            None => paths::state_dir(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.phase, Phase::Up);
        assert_eq!(config.mode, Mode::Live);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.failure_policy, FailurePolicy::HaltDependents);
        assert_eq!(config.state.backend, StoreKind::Fs);
        assert!(!config.stage.is_empty());
        assert!(config.password.is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stratum.toml");
        fs::write(
            &path,
            r#"
app = "shop"
stage = "prod"
phase = "destroy"
mode = "hybrid"
password = "hunter2"
concurrency = 8
failure_policy = "halt-all"

[state]
backend = "durable"
dir = "/var/lib/stratum"
base_path = "teams/web"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.app, "shop");
        assert_eq!(config.stage, "prod");
        assert_eq!(config.phase, Phase::Destroy);
        assert_eq!(config.mode, Mode::Hybrid);
        assert_eq!(config.password.as_ref().map(Secret::expose), Some("hunter2"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.failure_policy, FailurePolicy::HaltAll);
        assert_eq!(config.state.backend, StoreKind::Durable);
        assert_eq!(config.state.base_path, "teams/web");
        assert_eq!(config.state.bucket, "stratum-state");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stratum.toml");
        fs::write(&path, "app = \"shop\"\nconcurency = 3\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("concurency"), "{err:#}");
    }

    #[test]
    fn test_env_overrides() {
        let config = Config {
            app: "shop".into(),
            ..Config::default()
        }
        .with_overrides(vars(&[
            (ENV_STAGE, "qa"),
            (ENV_PHASE, "read"),
            (ENV_MODE, "LOCAL"),
            (ENV_PASSWORD, "pw"),
            (ENV_QUIET, "yes"),
            (ENV_CONCURRENCY, "2"),
            (paths::ENV_STATE_DIR, "/tmp/state"),
        ]))
        .unwrap();

        assert_eq!(config.app, "shop");
        assert_eq!(config.stage, "qa");
        assert_eq!(config.phase, Phase::Read);
        assert_eq!(config.mode, Mode::Local);
        assert_eq!(config.password.as_ref().map(Secret::expose), Some("pw"));
        assert!(config.quiet);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.state.dir.as_deref(), Some("/tmp/state"));
        assert_eq!(config.state.backend, StoreKind::Fs);
    }

    #[test]
    fn test_state_url_selects_object_backend() {
        let config = Config::default()
            .with_overrides(vars(&[(ENV_STATE_URL, "http://localhost:9000")]))
            .unwrap();
        assert_eq!(config.state.backend, StoreKind::Object);
        assert_eq!(config.state.url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_bad_env_values() {
        assert!(Config::default().with_overrides(vars(&[(ENV_PHASE, "sideways")])).is_err());
        assert!(Config::default().with_overrides(vars(&[(ENV_CONCURRENCY, "many")])).is_err());
        assert!(Config::default().with_overrides(vars(&[(ENV_QUIET, "maybe")])).is_err());
    }

    #[test]
    fn test_validate() {
        let valid = Config {
            app: "shop".into(),
            stage: "dev".into(),
            ..Config::default()
        };
        assert!(valid.validate().is_ok());

        assert!(Config { app: String::new(), ..valid.clone() }.validate().is_err());
        assert!(Config { app: "my shop".into(), ..valid.clone() }.validate().is_err());
        assert!(Config { stage: "a/b".into(), ..valid.clone() }.validate().is_err());
        assert!(Config { concurrency: 0, ..valid.clone() }.validate().is_err());

        let mut object = valid;
        object.state.backend = StoreKind::Object;
        assert!(object.validate().is_err());
        object.state.url = Some("http://localhost:9000".into());
        assert!(object.validate().is_ok());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "app = \"shop\"\nstage = \"ci\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.app, "shop");

        let missing = dir.path().join("missing.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_password_never_serialized() {
        let config = Config {
            app: "shop".into(),
            password: Some(Secret::new("hunter2")),
            ..Config::default()
        };
        let toml = config.to_toml().unwrap();
        assert!(!toml.contains("hunter2"));
        assert!(toml.contains("app = \"shop\""));
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_codec_follows_password() {
        assert!(!Config::default().codec().unwrap().has_passphrase());
        let config = Config {
            password: Some(Secret::new("pw")),
            ..Config::default()
        };
        assert!(config.codec().unwrap().has_passphrase());
    }
}
