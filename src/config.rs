use crate::error::{Result, SyncError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable the engine reads.
const ENV_PREFIX: &str = "SIMVAR_";

/// Extract `SIMVAR_*` assignments from dotenv-style text.
///
/// Accepts `KEY=value` and `export KEY=value` lines, single or double quoted
/// values and `#` comments after unquoted values. Keys without the prefix are
/// ignored; nothing is written to the process environment.
pub fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.starts_with(ENV_PREFIX) {
            continue;
        }

        let raw = raw.trim();
        let value = match raw.chars().next() {
            Some(q @ ('"' | '\'')) if raw.len() > 1 && raw.ends_with(q) => &raw[1..raw.len() - 1],
            _ => raw.split(" #").next().unwrap_or(raw).trim_end(),
        };
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}

/// Read `SIMVAR_*` settings from a dotenv file. A missing file is empty.
pub fn read_dotenv(path: &Path) -> HashMap<String, String> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let vars = parse_dotenv(&content);
            if !vars.is_empty() {
                info!("Read {} setting(s) from {:?}", vars.len(), path);
            }
            vars
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
        Err(e) => {
            warn!("Ignoring unreadable {:?}: {}", path, e);
            HashMap::new()
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll: PollConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval used when a binding does not request one.
    pub default_interval_ms: u64,
    /// Requested intervals below this are clamped up to it.
    pub min_interval_ms: u64,
    /// A single source read taking longer than this counts as a failed read.
    pub read_timeout_ms: u64,
    /// During a failure streak, log every Nth failure after the first.
    pub failure_log_every: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Probability in [0, 1] that a simulated read fails.
    pub failure_rate: f64,
    /// Upper bound of the random latency added to each simulated read.
    pub max_latency_ms: u64,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 200,
            min_interval_ms: 16,
            read_timeout_ms: 1000,
            failure_log_every: 50,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            max_latency_ms: 5,
            seed: None,
        }
    }
}

impl PollConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Clamp a requested interval to the configured floor.
    pub fn clamp_interval(&self, requested: Duration) -> Duration {
        requested.max(Duration::from_millis(self.min_interval_ms.max(1)))
    }
}

impl Config {
    /// Default location of the config file (`<config dir>/simvar-sync/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("simvar-sync").join("config.json"))
    }

    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let config: Config = serde_json::from_slice(&bytes)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load from `path` if given, else from the default path if it exists,
    /// else defaults. `SIMVAR_*` overrides are applied last: the process
    /// environment first, then `.env` in the working directory.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::load(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::load(&p)?,
                _ => Self::default(),
            },
        };
        let dotenv = read_dotenv(Path::new(".env"));
        let config =
            base.with_overrides(|key| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned()));
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SIMVAR_*` overrides found through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parsed(&lookup, "SIMVAR_DEFAULT_INTERVAL_MS") {
            self.poll.default_interval_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "SIMVAR_MIN_INTERVAL_MS") {
            self.poll.min_interval_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "SIMVAR_READ_TIMEOUT_MS") {
            self.poll.read_timeout_ms = ms;
        }
        if let Some(n) = parsed(&lookup, "SIMVAR_FAILURE_LOG_EVERY") {
            self.poll.failure_log_every = n;
        }

        // Simulation
        if let Some(rate) = parsed(&lookup, "SIMVAR_SIM_FAILURE_RATE") {
            self.simulation.failure_rate = rate;
        }
        if let Some(ms) = parsed(&lookup, "SIMVAR_SIM_MAX_LATENCY_MS") {
            self.simulation.max_latency_ms = ms;
        }
        if let Some(seed) = parsed(&lookup, "SIMVAR_SIM_SEED") {
            self.simulation.seed = Some(seed);
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll.read_timeout_ms == 0 {
            return Err(SyncError::Config(
                "poll.read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.simulation.failure_rate) {
            return Err(SyncError::Config(format!(
                "simulation.failure_rate must be within [0, 1], got {}",
                self.simulation.failure_rate
            )));
        }
        Ok(())
    }
}
