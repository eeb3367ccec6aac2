use anyhow::{bail, Context, Result};
use presence_core::{DEFAULT_DESCRIPTOR_LEN, DEFAULT_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration: optional TOML file, then `PRESENCE_*` environment
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a recognition must strictly exceed.
    pub threshold: f32,
    /// Similarity above which a new enrollment is reported as a likely
    /// duplicate of another employee.
    pub duplicate_threshold: f32,
    /// Descriptor length every enrollment and probe must have.
    pub descriptor_len: usize,
    /// Location tag written on attendance events.
    pub location: String,
    /// Abort a gallery scan after this many milliseconds (0 = no limit).
    pub scan_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("presence.db"),
            threshold: DEFAULT_THRESHOLD,
            duplicate_threshold: 0.95,
            descriptor_len: DEFAULT_DESCRIPTOR_LEN,
            location: "field".to_string(),
            scan_timeout_ms: 0,
        }
    }
}

impl Config {
    /// Load from `path` (or `PRESENCE_CONFIG`, or the XDG default), then apply
    /// environment overrides. A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("PRESENCE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(default_config_path);

        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config at {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };

        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `PRESENCE_*` overrides looked up through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(location) = lookup("PRESENCE_LOCATION") {
            self.location = location;
        }
        self.threshold = env_parse(&lookup, "PRESENCE_THRESHOLD", self.threshold);
        self.duplicate_threshold =
            env_parse(&lookup, "PRESENCE_DUPLICATE_THRESHOLD", self.duplicate_threshold);
        self.descriptor_len = env_parse(&lookup, "PRESENCE_DESCRIPTOR_LEN", self.descriptor_len);
        self.scan_timeout_ms = env_parse(&lookup, "PRESENCE_SCAN_TIMEOUT_MS", self.scan_timeout_ms);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("threshold", self.threshold),
            ("duplicate_threshold", self.duplicate_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                bail!("{name} must be within [-1, 1], got {value}");
            }
        }
        if self.descriptor_len == 0 {
            bail!("descriptor_len must be positive");
        }
        if self.location.trim().is_empty() {
            bail!("location must not be empty");
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Option<Duration> {
        (self.scan_timeout_ms > 0).then(|| Duration::from_millis(self.scan_timeout_ms))
    }
}

fn env_parse<T: std::str::FromStr + Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            default
        }),
        None => default,
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("presence")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("presence/config.toml")
}
