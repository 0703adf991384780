//! Job submission and the in-allocation job step.

use std::path::PathBuf;

use crate::{
    config::{RunConfig, SweepConfig},
    launcher::{LaunchError, LaunchOutcome, Launcher},
    slurm::{self, AccountingRecord, Slurm, SlurmError},
};

/// A job accepted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub run: String,
    pub job_id: String,
}

/// Submits runs to the scheduler and executes them once allocated.
pub struct Submitter<'a> {
    config: &'a SweepConfig,
    slurm: Slurm,
    /// Binary the batch script calls back into for the job step.
    harness_binary: PathBuf,
}

impl<'a> Submitter<'a> {
    #[must_use]
    pub fn new(config: &'a SweepConfig, slurm: Slurm, harness_binary: impl Into<PathBuf>) -> Self {
        Self {
            config,
            slurm,
            harness_binary: harness_binary.into(),
        }
    }

    /// Batch script for one run.
    #[must_use]
    pub fn render_script(&self, run: &RunConfig) -> String {
        self.config
            .descriptor(run)
            .render_script(&self.harness_binary, &self.config.path, &run.name)
    }

    /// Hand one run to the scheduler.
    pub async fn submit(&self, run: &RunConfig) -> Result<Submission, SlurmError> {
        let script = self.render_script(run);
        let job_id = self.slurm.submit(&script).await?;
        tracing::info!("Submitted {} as job {}", run.name, job_id);
        Ok(Submission {
            run: run.name.clone(),
            job_id,
        })
    }

    /// Record accounting metadata for the current allocation.
    ///
    /// Audit problems never block the launch; they are only reported.
    pub async fn audit(&self) -> Option<AccountingRecord> {
        let Some(job_id) = slurm::current_job_id() else {
            tracing::warn!(
                "{} not set, skipping accounting audit (not inside an allocation?)",
                slurm::JOB_ID_VAR
            );
            return None;
        };

        match self.slurm.accounting(&job_id).await {
            Ok(record) => {
                tracing::info!("Job accounting: {record}");
                println!("{record}");
                Some(record)
            }
            Err(e) => {
                tracing::warn!("Accounting audit for job {job_id} failed: {e}");
                None
            }
        }
    }

    /// Job step: audit, then launch exactly one run.
    pub async fn run_job(&self, run: &RunConfig) -> Result<LaunchOutcome, LaunchError> {
        self.audit().await;
        Launcher::new(&self.config.launcher).launch(run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWEEP: &str = r#"
[launcher]
log_dir = "checkpoints"

[slurm]
partition = "gpu"
setup = ["source activate torch"]

[defaults]
model = "twolayercnn"
batch_size = 64
epochs = 160
optimiser = "adam"
learning_rate = 0.001

[[runs]]
name = "twolayercnn-49k"
train_data_size = 49000

[[runs]]
name = "twolayercnn-4k"
train_data_size = 4000
slurm = { partition = "short" }
"#;

    fn config() -> SweepConfig {
        SweepConfig::parse(SWEEP, "/sweeps/cifar.toml").unwrap()
    }

    #[test]
    fn test_render_script_per_run() {
        let config = config();
        let submitter = Submitter::new(&config, Slurm::default(), "/usr/bin/sweep-harness");

        let first = submitter.render_script(&config.runs[0]);
        assert!(first.contains("#SBATCH --job-name=twolayercnn-49k\n"));
        assert!(first.contains("#SBATCH --partition=gpu\n"));
        assert!(first.contains("source activate torch\n"));
        assert!(first.ends_with(
            "exec /usr/bin/sweep-harness job --config /sweeps/cifar.toml --run twolayercnn-49k\n"
        ));

        let second = submitter.render_script(&config.runs[1]);
        assert!(second.contains("#SBATCH --partition=short\n"));
        assert!(second.contains("--run twolayercnn-4k\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_through_fake_sbatch() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("sbatch");
        std::fs::write(&fake, "#!/bin/sh\ncat > /dev/null\necho '808;main'\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = config();
        let submitter = Submitter::new(
            &config,
            Slurm::new(fake.to_string_lossy(), "sacct"),
            "/usr/bin/sweep-harness",
        );
        let submission = submitter.submit(&config.runs[0]).await.unwrap();
        assert_eq!(
            submission,
            Submission {
                run: "twolayercnn-49k".into(),
                job_id: "808".into(),
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_job_propagates_trainer_status() {
        let dir = tempfile::tempdir().unwrap();
        let sweep = format!(
            r#"
[launcher]
program = "sh"
args = ["-c", "echo step; exit 3"]
log_dir = "{}"

[slurm]
partition = "gpu"

[[runs]]
name = "audited"
model = "twolayercnn"
batch_size = 8
epochs = 1
optimiser = "sgd"
learning_rate = 0.1
"#,
            dir.path().display()
        );
        let config = SweepConfig::parse(&sweep, dir.path().join("sweep.toml")).unwrap();
        // sacct missing or job id unset: the audit is skipped, the launch still happens
        let submitter = Submitter::new(
            &config,
            Slurm::new("/nonexistent/sbatch", "/nonexistent/sacct"),
            "sweep-harness",
        );
        let outcome = submitter.run_job(&config.runs[0]).await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(
            std::fs::read_to_string(outcome.log_path).unwrap(),
            "step\n"
        );
    }
}
