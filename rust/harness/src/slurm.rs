//! SLURM integration.
//!
//! Submits batch scripts through `sbatch` and reads job accounting through
//! `sacct`. Both are expected on `PATH` of the submitting host and the
//! compute node respectively.

use std::{env, fmt, process::Stdio};

use tokio::{io::AsyncWriteExt, process::Command};

/// Columns requested from `sacct`, in output order.
pub const ACCOUNTING_FIELDS: &str = "User,JobID,JobName,Partition,State,Elapsed,Start,NodeList";

/// Environment variable the scheduler sets inside an allocation.
pub const JOB_ID_VAR: &str = "SLURM_JOB_ID";

/// Accounting metadata for one job, as reported by `sacct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingRecord {
    pub user: String,
    pub job_id: String,
    pub job_name: String,
    pub partition: String,
    pub state: String,
    pub elapsed: String,
    pub start: String,
    pub node_list: String,
}

impl AccountingRecord {
    /// Pick the record for `job_id` out of `sacct --parsable2 --noheader` output.
    ///
    /// `sacct` also lists job steps (`123.batch`, `123.0`); only the
    /// allocation row is returned.
    pub fn parse(output: &str, job_id: &str) -> Result<Self, SlurmError> {
        for line in output.lines() {
            let fields: Vec<&str> = line.trim_end().split('|').collect();
            if fields.len() != 8 {
                continue;
            }
            if fields[1] != job_id {
                continue;
            }
            return Ok(Self {
                user: fields[0].to_string(),
                job_id: fields[1].to_string(),
                job_name: fields[2].to_string(),
                partition: fields[3].to_string(),
                state: fields[4].to_string(),
                elapsed: fields[5].to_string(),
                start: fields[6].to_string(),
                node_list: fields[7].to_string(),
            });
        }
        Err(SlurmError::MissingRecord(job_id.to_string()))
    }
}

impl fmt::Display for AccountingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user={} job_id={} job_name={} partition={} state={} elapsed={} start={} nodes={}",
            self.user,
            self.job_id,
            self.job_name,
            self.partition,
            self.state,
            self.elapsed,
            self.start,
            self.node_list
        )
    }
}

/// Parse `sbatch --parsable` output: `<id>` or `<id>;<cluster>`.
pub fn parse_job_id(output: &str) -> Result<String, SlurmError> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty());
    let id = line
        .and_then(|l| l.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Ok(id.to_string())
    } else {
        Err(SlurmError::Malformed(output.trim().to_string()))
    }
}

/// Job id of the current allocation, if running inside one.
#[must_use]
pub fn current_job_id() -> Option<String> {
    env::var(JOB_ID_VAR).ok().filter(|id| !id.trim().is_empty())
}

/// Thin wrapper around the scheduler CLI tools.
#[derive(Debug, Clone)]
pub struct Slurm {
    sbatch: String,
    sacct: String,
}

impl Default for Slurm {
    fn default() -> Self {
        Self::new("sbatch", "sacct")
    }
}

impl Slurm {
    /// Use the given `sbatch` and `sacct` executables.
    #[must_use]
    pub fn new(sbatch: impl Into<String>, sacct: impl Into<String>) -> Self {
        Self {
            sbatch: sbatch.into(),
            sacct: sacct.into(),
        }
    }

    /// Submit a batch script on stdin and return the assigned job id.
    pub async fn submit(&self, script: &str) -> Result<String, SlurmError> {
        let mut child = Command::new(&self.sbatch)
            .arg("--parsable")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SlurmError::Spawn(self.sbatch.clone(), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| SlurmError::Spawn(self.sbatch.clone(), e))?;
            // closing stdin tells sbatch the script is complete
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SlurmError::Spawn(self.sbatch.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SlurmError::Rejected(stderr.trim().to_string()));
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout))
    }

    /// Query accounting metadata for a job.
    pub async fn accounting(&self, job_id: &str) -> Result<AccountingRecord, SlurmError> {
        let output = Command::new(&self.sacct)
            .args(["-j", job_id, "--noheader", "--parsable2"])
            .arg(format!("--format={ACCOUNTING_FIELDS}"))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SlurmError::Spawn(self.sacct.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SlurmError::Accounting(stderr.trim().to_string()));
        }

        AccountingRecord::parse(&String::from_utf8_lossy(&output.stdout), job_id)
    }
}

/// Errors that can occur talking to the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SlurmError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("sbatch rejected the job: {0}")]
    Rejected(String),
    #[error("unexpected sbatch output: '{0}'")]
    Malformed(String),
    #[error("sacct failed: {0}")]
    Accounting(String),
    #[error("sacct returned no record for job {0}")]
    MissingRecord(String),
}
