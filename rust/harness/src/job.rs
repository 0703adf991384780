//! Scheduler resource requests and batch script rendering.

use std::{fmt::Write as _, path::Path};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Sweep-wide `[slurm]` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlurmSettings {
    pub partition: String,
    #[serde(default = "default_one")]
    pub gpus: u32,
    #[serde(default = "default_one")]
    pub nodes: u32,
    #[serde(default = "default_one")]
    pub ntasks_per_node: u32,
    /// Defaults to the experiment name.
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default = "default_error")]
    pub error: String,
    /// Shell lines run before the job step, e.g. environment activation.
    #[serde(default)]
    pub setup: Vec<String>,
    /// Extra `#SBATCH` options, passed through verbatim.
    #[serde(default)]
    pub extra_directives: Vec<String>,
}

fn default_one() -> u32 {
    1
}

fn default_output() -> String {
    "slurm-%j.out".to_string()
}

fn default_error() -> String {
    "slurm-%j.err".to_string()
}

/// Per-run `slurm = { ... }` overrides. Unset fields inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobOverrides {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub gpus: Option<u32>,
    #[serde(default)]
    pub nodes: Option<u32>,
    #[serde(default)]
    pub ntasks_per_node: Option<u32>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Resource request for a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_name: String,
    pub gpus: u32,
    pub nodes: u32,
    pub ntasks_per_node: u32,
    pub partition: String,
    /// Stdout path template, contains a job id placeholder.
    pub output: String,
    /// Stderr path template, contains a job id placeholder.
    pub error: String,
    pub extra_directives: Vec<String>,
    pub setup: Vec<String>,
}

impl JobDescriptor {
    /// Combine sweep settings with a run's overrides.
    #[must_use]
    pub fn resolve(settings: &SlurmSettings, overrides: &JobOverrides, run_name: &str) -> Self {
        Self {
            job_name: overrides
                .job_name
                .clone()
                .or_else(|| settings.job_name.clone())
                .unwrap_or_else(|| run_name.to_string()),
            gpus: overrides.gpus.unwrap_or(settings.gpus),
            nodes: overrides.nodes.unwrap_or(settings.nodes),
            ntasks_per_node: overrides.ntasks_per_node.unwrap_or(settings.ntasks_per_node),
            partition: overrides
                .partition
                .clone()
                .unwrap_or_else(|| settings.partition.clone()),
            output: overrides
                .output
                .clone()
                .unwrap_or_else(|| settings.output.clone()),
            error: overrides
                .error
                .clone()
                .unwrap_or_else(|| settings.error.clone()),
            extra_directives: settings.extra_directives.clone(),
            setup: settings.setup.clone(),
        }
    }

    /// Reject requests the scheduler would refuse or that would clobber logs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Descriptor {
                job: self.job_name.clone(),
                reason: reason.to_string(),
            })
        };
        if self.partition.trim().is_empty() {
            return fail("partition cannot be empty");
        }
        if self.job_name.is_empty() || self.job_name.contains(char::is_whitespace) {
            return fail("job name must be non-empty and contain no whitespace");
        }
        // sbatch splits #SBATCH lines on whitespace
        if [&self.partition, &self.output, &self.error]
            .iter()
            .any(|value| value.contains(char::is_whitespace))
        {
            return fail("partition, output and error cannot contain whitespace");
        }
        if self.nodes == 0 || self.ntasks_per_node == 0 {
            return fail("nodes and ntasks_per_node must be at least 1");
        }
        for template in [&self.output, &self.error] {
            if !has_job_id_placeholder(template) {
                return fail("output and error paths need a %j or %A placeholder");
            }
        }
        if self.extra_directives.iter().any(|d| d.contains('\n')) {
            return fail("extra directives must be single lines");
        }
        Ok(())
    }

    /// `#SBATCH` option strings in submission order.
    #[must_use]
    pub fn directives(&self) -> Vec<String> {
        let mut directives = vec![format!("--job-name={}", self.job_name)];
        if self.gpus > 0 {
            directives.push(format!("--gres=gpu:{}", self.gpus));
        }
        directives.extend([
            format!("--nodes={}", self.nodes),
            format!("--ntasks-per-node={}", self.ntasks_per_node),
            format!("--partition={}", self.partition),
            format!("--output={}", self.output),
            format!("--error={}", self.error),
        ]);
        directives.extend(self.extra_directives.iter().cloned());
        directives
    }

    /// Render the batch script that runs `harness job` for one experiment.
    #[must_use]
    pub fn render_script(&self, harness: &Path, config: &Path, run_name: &str) -> String {
        let mut script = String::from("#!/bin/bash\n");
        for directive in self.directives() {
            let _ = writeln!(script, "#SBATCH {directive}");
        }
        script.push('\n');
        for line in &self.setup {
            let _ = writeln!(script, "{line}");
        }
        let _ = writeln!(
            script,
            "exec {} job --config {} --run {}",
            shell_quote(&harness.to_string_lossy()),
            shell_quote(&config.to_string_lossy()),
            shell_quote(run_name),
        );
        script
    }
}

fn has_job_id_placeholder(template: &str) -> bool {
    template.contains("%j") || template.contains("%A")
}

/// Quote a word for POSIX shells. Plain words pass through unchanged.
#[must_use]
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
