//! Sweep file parsing.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sweep_config::TrainParams;

use crate::job::{JobDescriptor, JobOverrides, SlurmSettings};

/// Top-level sweep file (raw, before merging).
#[derive(Debug, Clone, Deserialize)]
struct RawSweepConfig {
    #[serde(default)]
    pub launcher: LauncherSettings,
    pub slurm: SlurmSettings,
    #[serde(default = "empty_table")]
    pub defaults: toml::Value,
    #[serde(default)]
    pub runs: Vec<toml::Value>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Sweep file after merging defaults into runs.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Where the sweep file was read from. Job scripts point back at it.
    pub path: PathBuf,
    pub launcher: LauncherSettings,
    pub slurm: SlurmSettings,
    pub runs: Vec<RunConfig>,
}

/// How to invoke the trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherSettings {
    /// Trainer interpreter or binary.
    #[serde(default = "default_program")]
    pub program: String,
    /// Leading arguments placed before the generated flags.
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,
    /// Directory receiving one `<name>.log` per experiment.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_program_args(),
            log_dir: default_log_dir(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

fn default_program() -> String {
    "python".to_string()
}

fn default_program_args() -> Vec<String> {
    vec!["train.py".to_string()]
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

/// Configuration for a single experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Experiment name; also names the log file.
    pub name: String,
    #[serde(flatten)]
    pub params: TrainParams,
    /// Per-run scheduler overrides.
    #[serde(default)]
    pub slurm: JobOverrides,
}

impl RunConfig {
    /// Build the trainer's command-line arguments.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        self.params.to_cli_args(&self.name)
    }

    /// Log file for this run. Same name, same path.
    #[must_use]
    pub fn log_path(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}.log", self.name))
    }
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                let value = match base_map.get(k) {
                    Some(base_v) => merge_toml(base_v, v),
                    None => v.clone(),
                };
                merged.insert(k.clone(), value);
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// First key of a merged run table that no run field accepts.
///
/// `RunConfig` flattens its parameters, which makes serde ignore unknown
/// keys, so a misspelled hyperparameter would otherwise vanish silently.
fn unknown_run_key(run: &toml::Value) -> Option<&str> {
    let table = run.as_table()?;
    table
        .keys()
        .map(String::as_str)
        .find(|key| !RUN_KEYS.contains(key) && !TrainParams::FIELDS.contains(key))
}

const RUN_KEYS: &[&str] = &["name", "slurm"];

fn valid_run_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.')
}

impl SweepConfig {
    /// Load a sweep file, merging defaults into each run.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::parse(&content, path)
    }

    /// Parse sweep file contents; `path` is recorded for job scripts.
    pub fn parse(content: &str, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let raw: RawSweepConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let runs: Vec<RunConfig> = raw
            .runs
            .iter()
            .map(|run_value| {
                let merged = merge_toml(&raw.defaults, run_value);
                if let Some(key) = unknown_run_key(&merged) {
                    let run = merged
                        .get("name")
                        .and_then(toml::Value::as_str)
                        .unwrap_or("<unnamed>");
                    return Err(ConfigError::UnknownKey {
                        run: run.to_string(),
                        key: key.to_string(),
                    });
                }
                merged
                    .try_into()
                    .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let mut seen = HashSet::new();
        for run in &runs {
            if !valid_run_name(&run.name) {
                return Err(ConfigError::InvalidName(run.name.clone()));
            }
            if !seen.insert(run.name.as_str()) {
                return Err(ConfigError::DuplicateRun(run.name.clone()));
            }
        }

        let config = Self {
            path: path.into(),
            launcher: raw.launcher,
            slurm: raw.slurm,
            runs,
        };
        for run in &config.runs {
            config.descriptor(run).validate()?;
        }
        Ok(config)
    }

    /// Look up a run by experiment name.
    pub fn run(&self, name: &str) -> Result<&RunConfig, ConfigError> {
        self.runs
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownRun(name.to_string()))
    }

    /// Select runs by name, or all of them when `names` is empty.
    pub fn select(&self, names: &[String]) -> Result<Vec<&RunConfig>, ConfigError> {
        if names.is_empty() {
            return Ok(self.runs.iter().collect());
        }
        names.iter().map(|n| self.run(n)).collect()
    }

    /// Resource request for one run.
    #[must_use]
    pub fn descriptor(&self, run: &RunConfig) -> JobDescriptor {
        JobDescriptor::resolve(&self.slurm, &run.slurm, &run.name)
    }
}

/// Errors that can occur when loading a sweep file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("experiment name '{0}' is used by more than one run")]
    DuplicateRun(String),
    #[error("invalid experiment name '{0}': expected ASCII letters, digits, '-', '_' or '.'")]
    InvalidName(String),
    #[error("no run named '{0}' in config")]
    UnknownRun(String),
    #[error("unknown key '{key}' in run '{run}'")]
    UnknownKey { run: String, key: String },
    #[error("invalid job descriptor for {job}: {reason}")]
    Descriptor { job: String, reason: String },
}
