//! Declarative pool configuration: how many workers each queue combination
//! gets, selected per environment.
//!
//! The document is YAML. Top-level entries are either
//! `queue-combination: count` pairs or environment sections holding such
//! pairs; the selected environment's section is overlaid on the top-level
//! counts and everything that is not a non-negative integer is dropped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::logger::{Level, Logger};

/// Locations scanned, in order, when no explicit path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["resque-pool.yml", "config/resque-pool.yml"];

const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Where the configuration document comes from.
pub enum ConfigSource {
    /// Scan [`DEFAULT_CONFIG_PATHS`].
    Auto,
    /// An explicit file. If it does not exist, an error is logged and the
    /// default scan is used instead.
    Path(PathBuf),
    /// An in-memory document; no file is read.
    Document(serde_yaml::Value),
}

/// One top-level entry of the document: a worker count, an environment
/// section, or noise to be discarded.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DocEntry {
    Count(i64),
    Section(BTreeMap<String, serde_yaml::Value>),
    Other(serde_yaml::Value),
}

type Document = BTreeMap<String, DocEntry>;

/// Pool configuration: the desired-count map plus the knobs read from the
/// environment at construction.
pub struct Config {
    source: ConfigSource,
    environment: String,
    /// Worker polling interval handed to each spawned worker.
    pub interval: Duration,
    /// Threshold for the pool logger.
    pub level: Level,
    counts: Option<BTreeMap<String, usize>>,
}

impl Config {
    pub fn new(source: ConfigSource) -> Config {
        Config {
            source,
            environment: String::new(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            level: Level::Info,
            counts: None,
        }
    }

    /// Apply the environment-variable inputs recognized at construction:
    /// `RESQUE_ENV`, `INTERVAL`, `RESQUE_POOL_CONFIG`, and the verbosity
    /// switches `VERBOSE`/`LOGGING` (notice) and `VVERBOSE` (debug).
    pub fn from_env(source: ConfigSource) -> Result<Config> {
        Self::from_lookup(source, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        source: ConfigSource,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Config> {
        let mut config = Config::new(source);

        if let Some(environment) = lookup("RESQUE_ENV") {
            config.environment = environment;
        }
        if let Some(raw) = lookup("INTERVAL") {
            let secs: f64 = raw
                .parse()
                .with_context(|| format!("invalid INTERVAL {raw:?}"))?;
            if secs.is_nan() || secs < 0.0 {
                bail!("INTERVAL must be non-negative, got {raw:?}");
            }
            config.interval = Duration::from_secs_f64(secs);
        }
        if matches!(config.source, ConfigSource::Auto) {
            if let Some(path) = lookup("RESQUE_POOL_CONFIG").filter(|p| !p.is_empty()) {
                config.source = ConfigSource::Path(PathBuf::from(path));
            }
        }
        let set = |key: &str| lookup(key).is_some_and(|v| !v.is_empty());
        if set("VVERBOSE") {
            config.level = Level::Debug;
        } else if set("VERBOSE") || set("LOGGING") {
            config.level = Level::Notice;
        }

        Ok(config)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn set_environment(&mut self, environment: impl Into<String>) {
        self.environment = environment.into();
    }

    /// Load the effective desired-count map, unless it is already loaded.
    /// A parse failure here is fatal to the caller.
    pub fn initialize(&mut self, logger: &Logger) -> Result<()> {
        if self.counts.is_none() {
            self.counts = Some(self.load_counts(logger)?);
        }
        Ok(())
    }

    /// Re-read the configuration (the HUP path). On failure the previous
    /// effective map stays in place, so a bad edit cannot drop a running
    /// pool.
    pub fn reload(&mut self, logger: &Logger) {
        match self.load_counts(logger) {
            Ok(counts) => self.counts = Some(counts),
            Err(err) => logger.error(
                "reload failed, keeping previous configuration: {error}",
                &[("error", format!("{err:#}"))],
            ),
        }
    }

    /// Desired worker count for a queue-combination key; 0 when unknown.
    pub fn worker_count(&self, queues: &str) -> usize {
        self.counts
            .as_ref()
            .and_then(|counts| counts.get(queues))
            .copied()
            .unwrap_or(0)
    }

    /// Every queue-combination key in the effective map.
    pub fn known_queues(&self) -> Vec<&str> {
        self.counts
            .as_ref()
            .map(|counts| counts.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Empty the desired-count map; the next [`initialize`] reparses.
    ///
    /// [`initialize`]: Config::initialize
    pub fn reset_queues(&mut self) {
        self.counts = None;
    }

    fn load_counts(&self, logger: &Logger) -> Result<BTreeMap<String, usize>> {
        let document = match &self.source {
            ConfigSource::Document(value) => serde_yaml::from_value::<Document>(value.clone())
                .context("invalid in-memory configuration document")?,
            source => match choose_config_file(source, logger) {
                Some(path) => {
                    debug!(path = %path.display(), "loading pool configuration");
                    parse_document(&path)?
                }
                None => Document::new(),
            },
        };
        Ok(apply_environment(document, &self.environment))
    }
}

/// Pick the configuration file: an existing explicit path wins; a missing
/// explicit path logs an error and falls back to the default scan.
fn choose_config_file(source: &ConfigSource, logger: &Logger) -> Option<PathBuf> {
    if let ConfigSource::Path(path) = source {
        if path.exists() {
            return Some(path.clone());
        }
        logger.error(
            "config file not found: {path}",
            &[("path", path.display().to_string())],
        );
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// Read and parse one configuration file. A `.sh` file is executed with
/// its captured stdout parsed in its place; anything else is raw YAML.
fn parse_document(path: &Path) -> Result<Document> {
    let raw = if path.extension().is_some_and(|ext| ext == "sh") {
        let output = std::process::Command::new("sh")
            .arg(path)
            .output()
            .with_context(|| format!("run config script {}", path.display()))?;
        if !output.status.success() {
            bail!("config script {} failed: {}", path.display(), output.status);
        }
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?
    };

    if raw.trim().is_empty() {
        return Ok(Document::new());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
}

/// Overlay the selected environment's section on the top-level counts,
/// dropping everything that is not a non-negative integer (other
/// environments' sections included) in the same pass.
fn apply_environment(document: Document, environment: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    let mut overlay = BTreeMap::new();
    for (key, entry) in document {
        match entry {
            DocEntry::Count(n) if n >= 0 => {
                counts.insert(key, n as usize);
            }
            DocEntry::Section(section) if !environment.is_empty() && key == environment => {
                for (queues, value) in section {
                    if let Some(n) = value.as_u64() {
                        overlay.insert(queues, n as usize);
                    }
                }
            }
            _ => {}
        }
    }
    counts.extend(overlay);
    counts
}
