//! Trainer subprocess execution.
//!
//! Runs the trainer once with the flags rendered from a [`RunConfig`],
//! writing interleaved stdout and stderr to the experiment's log file while
//! echoing both to the terminal.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter},
    process::Command,
    sync::mpsc,
};

use crate::config::{LauncherSettings, RunConfig};

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Result of a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    /// Experiment name.
    pub name: String,
    /// Trainer exit status; `128 + signal` if it was killed.
    pub exit_code: i32,
    /// Log file holding the trainer's output.
    pub log_path: PathBuf,
}

impl LaunchOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Launches the trainer for one run configuration.
pub struct Launcher {
    program: String,
    program_args: Vec<String>,
    log_dir: PathBuf,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    /// Echo trainer output to this process's stdout/stderr.
    echo: bool,
}

impl Launcher {
    /// Create a launcher from sweep settings.
    #[must_use]
    pub fn new(settings: &LauncherSettings) -> Self {
        Self {
            program: settings.program.clone(),
            program_args: settings.args.clone(),
            log_dir: settings.log_dir.clone(),
            working_dir: settings.working_dir.clone(),
            env: settings.env.clone(),
            echo: true,
        }
    }

    /// Keep trainer output out of the terminal; the log file is still written.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Full argument vector passed to the program.
    #[must_use]
    pub fn command_args(&self, run: &RunConfig) -> Vec<String> {
        let mut args = self.program_args.clone();
        args.extend(run.to_args());
        args
    }

    /// Log file for a run.
    #[must_use]
    pub fn log_path(&self, run: &RunConfig) -> PathBuf {
        run.log_path(&self.log_dir)
    }

    /// Run the trainer to completion.
    ///
    /// A non-zero trainer exit is not an error here; it is reported through
    /// [`LaunchOutcome::exit_code`] so the caller can propagate it.
    pub async fn launch(&self, run: &RunConfig) -> Result<LaunchOutcome, LaunchError> {
        let log_path = self.log_path(run);
        let log_file = open_log(&log_path)
            .await
            .map_err(|e| LaunchError::LogFile(log_path.clone(), e))?;

        let args = self.command_args(run);
        tracing::info!("Launching {} -> {}", run.name, log_path.display());
        tracing::debug!("Spawning: {} {}", self.program, args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::Spawn(run.name.clone(), e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, Stream::Stdout, tx.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, Stream::Stderr, tx.clone())));
        drop(tx);

        let mut writer = tokio::spawn(write_log(log_file, rx, self.echo));

        // The writer only finishes early if a write failed or the child
        // closed both pipes while still running.
        let mut writer_result = None;
        let status = tokio::select! {
            status = child.wait() => status,
            written = &mut writer => {
                let written = written.unwrap_or_else(|e| Err(io::Error::other(e)));
                if let Err(e) = written {
                    tracing::error!("Log write failed for {}, killing trainer", run.name);
                    let _ = child.kill().await;
                    return Err(LaunchError::LogWrite(log_path, e));
                }
                writer_result = Some(Ok(()));
                child.wait().await
            }
        };
        let status = status.map_err(|e| LaunchError::Wait(run.name.clone(), e))?;

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }
        let written = match writer_result {
            Some(result) => result,
            None => writer.await.unwrap_or_else(|e| Err(io::Error::other(e))),
        };
        written.map_err(|e| LaunchError::LogWrite(log_path.clone(), e))?;

        let exit_code = exit_code(status);
        if exit_code == 0 {
            tracing::info!("{} finished", run.name);
        } else {
            tracing::error!("{} exited with status {}", run.name, exit_code);
        }

        Ok(LaunchOutcome {
            name: run.name.clone(),
            exit_code,
            log_path,
        })
    }
}

/// Map a process status to a shell-style exit code.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

async fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    File::create(path).await
}

/// Forward raw output chunks, one per line, to the log writer.
///
/// Bytes are passed through untouched so non-UTF-8 output reaches the log
/// as printed. A read error never closes the pipe early: the rest of the
/// stream is drained so the trainer cannot die on a broken pipe.
async fn forward_lines<R>(
    reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<(Stream, Vec<u8>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("Reading trainer {stream:?} failed: {e}, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
}

async fn write_log(
    file: File,
    mut rx: mpsc::UnboundedReceiver<(Stream, Vec<u8>)>,
    echo: bool,
) -> io::Result<()> {
    let mut file = BufWriter::new(file);
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some((stream, line)) = rx.recv().await {
        file.write_all(&line).await?;
        // flush per line so the log can be tailed while the job runs
        file.flush().await?;

        if echo {
            let term: &mut (dyn tokio::io::AsyncWrite + Unpin + Send) = match stream {
                Stream::Stdout => &mut stdout,
                Stream::Stderr => &mut stderr,
            };
            // terminal echo is best effort; the log file is the record
            let _ = term.write_all(&line).await;
            let _ = term.flush().await;
        }
    }
    file.flush().await
}

/// Errors that can occur when launching the trainer.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to open log file {0}: {1}")]
    LogFile(PathBuf, io::Error),
    #[error("failed to spawn trainer for {0}: {1}")]
    Spawn(String, io::Error),
    #[error("failed waiting on trainer for {0}: {1}")]
    Wait(String, io::Error),
    #[error("failed writing log file {0}: {1}")]
    LogWrite(PathBuf, io::Error),
}

#[cfg(all(test, unix))]
mod tests {
    use sweep_config::{ModelId, Optimiser, TrainParams};
    use tempfile::tempdir;
    use test_case::test_case;

    use super::*;
    use crate::job::JobOverrides;

    fn run(name: &str) -> RunConfig {
        let model: ModelId = "twolayercnn".parse().unwrap();
        RunConfig {
            name: name.to_string(),
            params: TrainParams::new(model, 64, 1, Optimiser::Adam, 0.001),
            slurm: JobOverrides::default(),
        }
    }

    /// `sh -c <script>` stands in for the trainer; flags land in `$0 $1 ...`.
    fn shell_launcher(script: &str, log_dir: &Path) -> Launcher {
        let settings = LauncherSettings {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            log_dir: log_dir.to_path_buf(),
            working_dir: None,
            env: BTreeMap::new(),
        };
        Launcher::new(&settings).quiet()
    }

    #[tokio::test]
    async fn test_success_exit_zero() {
        let dir = tempdir().unwrap();
        let launcher = shell_launcher("echo training; exit 0", dir.path());
        let outcome = launcher.launch(&run("ok")).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.log_path, dir.path().join("ok.log"));
    }

    #[test_case(1)]
    #[test_case(2)]
    #[test_case(137)]
    #[tokio::test]
    async fn test_exit_status_propagates(code: i32) {
        let dir = tempdir().unwrap();
        let launcher = shell_launcher(&format!("exit {code}"), dir.path());
        let outcome = launcher.launch(&run("fail")).await.unwrap();
        assert_eq!(outcome.exit_code, code);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_killed_by_signal_maps_to_137() {
        let dir = tempdir().unwrap();
        let launcher = shell_launcher("kill -9 $$", dir.path());
        let outcome = launcher.launch(&run("killed")).await.unwrap();
        assert_eq!(outcome.exit_code, 137);
    }

    #[tokio::test]
    async fn test_log_captures_both_streams() {
        let dir = tempdir().unwrap();
        let launcher = shell_launcher("echo out-line; echo err-line >&2", dir.path());
        let outcome = launcher.launch(&run("both")).await.unwrap();
        let log = std::fs::read_to_string(outcome.log_path).unwrap();
        assert!(log.contains("out-line\n"));
        assert!(log.contains("err-line\n"));
    }

    #[tokio::test]
    async fn test_trainer_receives_flags() {
        let dir = tempdir().unwrap();
        // $0 is the first flag, so print it along with the rest
        let launcher = shell_launcher(r#"echo "$0" "$@""#, dir.path());
        let outcome = launcher.launch(&run("flags")).await.unwrap();
        let log = std::fs::read_to_string(outcome.log_path).unwrap();
        assert_eq!(log.trim_end(), run("flags").to_args().join(" "));
    }

    #[tokio::test]
    async fn test_log_overwritten_on_relaunch() {
        let dir = tempdir().unwrap();
        shell_launcher("echo first", dir.path())
            .launch(&run("again"))
            .await
            .unwrap();
        let outcome = shell_launcher("echo second", dir.path())
            .launch(&run("again"))
            .await
            .unwrap();
        let log = std::fs::read_to_string(outcome.log_path).unwrap();
        assert_eq!(log, "second\n");
    }

    #[tokio::test]
    async fn test_log_dir_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("checkpoints").join("sweep");
        let outcome = shell_launcher("true", &nested)
            .launch(&run("nested"))
            .await
            .unwrap();
        assert!(outcome.log_path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_log_is_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let err = shell_launcher("true", &blocker)
            .launch(&run("blocked"))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::LogFile(..)));
    }

    #[tokio::test]
    async fn test_non_utf8_output_passes_through() {
        let dir = tempdir().unwrap();
        // enough output after the bad byte to fill the pipe if it were abandoned
        let launcher = shell_launcher(
            r"printf 'a\377b\n'; i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done; printf 'after'",
            dir.path(),
        );
        let outcome = launcher.launch(&run("bytes")).await.unwrap();
        assert_eq!(outcome.exit_code, 0);

        let log = std::fs::read(outcome.log_path).unwrap();
        assert!(log.starts_with(b"a\xffb\nline0\n"));
        assert!(log.ends_with(b"line19999\nafter"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_log_write_failure_kills_trainer() {
        let dir = tempdir().unwrap();
        // opening /dev/full succeeds, every write fails with ENOSPC
        std::os::unix::fs::symlink("/dev/full", dir.path().join("full.log")).unwrap();
        let launcher = shell_launcher("while true; do echo spam; done", dir.path());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            launcher.launch(&run("full")),
        )
        .await
        .expect("trainer was not killed after the log write failed");
        let err = result.unwrap_err();
        assert!(matches!(err, LaunchError::LogWrite(path, _) if path == dir.path().join("full.log")));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempdir().unwrap();
        let settings = LauncherSettings {
            program: "/nonexistent/python".into(),
            args: Vec::new(),
            log_dir: dir.path().to_path_buf(),
            working_dir: None,
            env: BTreeMap::new(),
        };
        let err = Launcher::new(&settings)
            .quiet()
            .launch(&run("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(name, _) if name == "nope"));
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempdir().unwrap();
        let mut settings = LauncherSettings {
            program: "sh".into(),
            args: vec!["-c".into(), r#"echo "$SWEEP_TEST_VAR"; pwd"#.into()],
            log_dir: dir.path().join("logs"),
            working_dir: Some(dir.path().to_path_buf()),
            env: BTreeMap::new(),
        };
        settings
            .env
            .insert("SWEEP_TEST_VAR".into(), "from-config".into());
        let outcome = Launcher::new(&settings)
            .quiet()
            .launch(&run("env"))
            .await
            .unwrap();
        let log = std::fs::read_to_string(outcome.log_path).unwrap();
        let mut lines = log.lines();
        assert_eq!(lines.next(), Some("from-config"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            cwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_command_args_prefix() {
        let dir = tempdir().unwrap();
        let settings = LauncherSettings {
            log_dir: dir.path().to_path_buf(),
            ..LauncherSettings::default()
        };
        let launcher = Launcher::new(&settings);
        let args = launcher.command_args(&run("prefixed"));
        assert_eq!(args[0], "train.py");
        assert_eq!(args[1], "--model");
    }
}
