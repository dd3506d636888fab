//! Decoder orchestration
//!
//! Runs the external MatIE decoder once per unit directory of a workspace.
//! A failing decoder is recorded in a [`ToolRun`] and never aborts the batch:
//! the caller still reads whatever `.ann` files exist afterwards.
//!
//! Author: hephaex@gmail.com

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use matie_core::{AnnotatorConfig, MatieError, Result, ToolRun, ToolRunStatus};

use crate::metrics;

/// errno for "Text file busy"
const ETXTBSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 3;

/// How long to keep draining pipes once the decoder has exited or been killed
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Tool environment
// ============================================================================

/// Immutable description of how the decoder is launched
#[derive(Debug, Clone)]
pub struct ToolEnvironment {
    /// Entry point, relative to `tool_dir` unless absolute
    pub decode_script: PathBuf,
    /// Working directory of the decoder process
    pub tool_dir: PathBuf,
    pub model_dir: String,
    pub vocab_dir: String,
    pub extra_args: String,
    pub disable_gpu: bool,
    /// Unit directories whose name contains this marker are skipped
    pub exclusion_marker: String,
    pub timeout: Option<Duration>,
    pub max_captured_output: usize,
}

impl ToolEnvironment {
    /// Absolute path of the entry point script
    pub fn script_path(&self) -> std::io::Result<PathBuf> {
        let script = self.tool_dir.join(&self.decode_script);
        if script.is_absolute() {
            Ok(script)
        } else {
            Ok(std::env::current_dir()?.join(script))
        }
    }

    /// Environment handed to one decoder invocation
    ///
    /// Input and output directory are the same: the decoder writes each
    /// `.ann` next to its `.txt`.
    pub fn vars(&self, unit_dir: &Path) -> Vec<(&'static str, OsString)> {
        let mut vars = vec![
            ("MODEL_DIR", OsString::from(&self.model_dir)),
            ("VOCAB_DIR", OsString::from(&self.vocab_dir)),
            ("INPUT_DIR", unit_dir.as_os_str().to_owned()),
            ("OUTPUT_DIR", unit_dir.as_os_str().to_owned()),
            ("EXTRA_ARGS", OsString::from(&self.extra_args)),
        ];
        if self.disable_gpu {
            vars.push(("CUDA_VISIBLE_DEVICES", OsString::new()));
        }
        vars
    }
}

impl From<&AnnotatorConfig> for ToolEnvironment {
    fn from(config: &AnnotatorConfig) -> Self {
        Self {
            decode_script: config.decode_script.clone(),
            tool_dir: config.tool_dir.clone(),
            model_dir: config.model_dir.clone(),
            vocab_dir: config.vocab_dir.clone(),
            extra_args: config.extra_args.clone(),
            disable_gpu: config.disable_gpu,
            exclusion_marker: config.exclusion_marker.clone(),
            timeout: config.timeout(),
            max_captured_output: config.max_captured_output,
        }
    }
}

// ============================================================================
// Unit annotator
// ============================================================================

/// Trait for anything that annotates the `.txt` files of one directory
#[async_trait]
pub trait UnitAnnotator: Send + Sync {
    /// Annotate every input in `unit_dir`, writing `.ann` files in place
    async fn annotate_unit(&self, unit_dir: &Path) -> ToolRun;
}

/// The external decoder script run as a subprocess
#[derive(Debug, Clone)]
pub struct DecodeScript {
    env: ToolEnvironment,
}

impl DecodeScript {
    pub fn new(env: ToolEnvironment) -> Self {
        Self { env }
    }

    pub fn environment(&self) -> &ToolEnvironment {
        &self.env
    }

    async fn spawn(&self, script: &Path, unit_dir: &Path) -> std::io::Result<Child> {
        let mut attempt = 1;
        loop {
            let mut command = Command::new(script);
            command
                .current_dir(&self.env.tool_dir)
                .envs(self.env.vars(unit_dir))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            // The decoder becomes leader of its own process group, so the
            // interpreter it launches can be killed along with it.
            #[cfg(unix)]
            command.process_group(0);

            match command.spawn() {
                // Another thread may still hold the script open for writing across a fork.
                Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => return other,
            }
        }
    }

    fn finish(&self, unit: String, started: Instant, outcome: RunOutcome) -> ToolRun {
        let limit = self.env.max_captured_output;
        let duration = started.elapsed();
        metrics::TOOL_DURATION_SECONDS.observe(duration.as_secs_f64());

        let (status, exit_code, stdout, stderr, error) = match outcome {
            RunOutcome::Exited(output) => {
                let status = if output.status.success() {
                    ToolRunStatus::Succeeded
                } else {
                    ToolRunStatus::Failed
                };
                let error = (!output.status.success())
                    .then(|| format!("decoder exited with {}", output.status));
                (
                    status,
                    output.status.code(),
                    truncate_output(&output.stdout, limit),
                    truncate_output(&output.stderr, limit),
                    error,
                )
            }
            RunOutcome::TimedOut {
                after,
                stdout,
                stderr,
            } => (
                ToolRunStatus::TimedOut,
                None,
                truncate_output(&stdout, limit),
                truncate_output(&stderr, limit),
                Some(format!("decoder killed after {}s", after.as_secs())),
            ),
            RunOutcome::SpawnFailed(reason) => (
                ToolRunStatus::SpawnFailed,
                None,
                String::new(),
                String::new(),
                Some(reason),
            ),
        };

        ToolRun {
            unit,
            status,
            exit_code,
            stdout,
            stderr,
            duration_ms: duration.as_millis() as u64,
            error,
        }
    }
}

enum RunOutcome {
    Exited(std::process::Output),
    TimedOut {
        after: Duration,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    SpawnFailed(String),
}

/// Kills the decoder's process group when dropped, unless disarmed
///
/// Covers both an expired deadline and cancellation of the batch task.
struct ProcessGroup {
    id: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { id: child.id() }
    }

    fn kill(&mut self) {
        if let Some(id) = self.id.take() {
            kill_process_group(id);
        }
    }

    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(id: u32) {
    let Ok(pgid) = libc::pid_t::try_from(id) else {
        return;
    };
    // SAFETY: killpg only sends a signal to the group created at spawn.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "Decoder process group already gone"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_id: u32) {}

/// Background readers draining the decoder's stdout and stderr
struct CapturedOutput {
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl CapturedOutput {
    fn start(child: &mut Child) -> Self {
        Self {
            stdout: child.stdout.take().map(|pipe| tokio::spawn(read_pipe(pipe))),
            stderr: child.stderr.take().map(|pipe| tokio::spawn(read_pipe(pipe))),
        }
    }

    async fn collect(self) -> (Vec<u8>, Vec<u8>) {
        let stdout = drain(self.stdout).await;
        let stderr = drain(self.stderr).await;
        (stdout, stderr)
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buffer).await {
        tracing::debug!("Decoder pipe closed with error: {}", e);
    }
    buffer
}

/// Wait a bounded time for a reader; a descendant outside the process group
/// may still hold the pipe open
async fn drain(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = reader else {
        return Vec::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(OUTPUT_GRACE, handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

#[async_trait]
impl UnitAnnotator for DecodeScript {
    async fn annotate_unit(&self, unit_dir: &Path) -> ToolRun {
        let unit = unit_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let started = Instant::now();

        let script = match self.env.script_path() {
            Ok(script) => script,
            Err(e) => {
                let outcome = RunOutcome::SpawnFailed(format!("cannot resolve decoder path: {e}"));
                return self.finish(unit, started, outcome);
            }
        };

        if let Err(e) = ensure_executable(&script).await {
            let outcome =
                RunOutcome::SpawnFailed(format!("cannot make {} executable: {e}", script.display()));
            return self.finish(unit, started, outcome);
        }

        tracing::info!(unit = %unit, script = %script.display(), "Running MatIE decoder");

        let mut child = match self.spawn(&script, unit_dir).await {
            Ok(child) => child,
            Err(e) => {
                let outcome =
                    RunOutcome::SpawnFailed(format!("cannot start {}: {e}", script.display()));
                return self.finish(unit, started, outcome);
            }
        };
        let mut group = ProcessGroup::of(&child);
        let captured = CapturedOutput::start(&mut child);

        let waited = match self.env.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let outcome = match waited {
            Some(Ok(status)) => {
                group.disarm();
                let (stdout, stderr) = captured.collect().await;
                RunOutcome::Exited(std::process::Output {
                    status,
                    stdout,
                    stderr,
                })
            }
            Some(Err(e)) => {
                group.kill();
                RunOutcome::SpawnFailed(format!("failed to wait for decoder: {e}"))
            }
            None => {
                group.kill();
                if let Err(e) = child.start_kill() {
                    tracing::debug!(unit = %unit, "Decoder already exited: {}", e);
                }
                if let Err(e) = child.wait().await {
                    tracing::warn!(unit = %unit, "Failed to reap killed decoder: {}", e);
                }
                let (stdout, stderr) = captured.collect().await;
                RunOutcome::TimedOut {
                    after: self.env.timeout.unwrap_or_default(),
                    stdout,
                    stderr,
                }
            }
        };
        self.finish(unit, started, outcome)
    }
}

/// Set the execute bits on the decoder entry point
#[cfg(unix)]
pub async fn ensure_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    let mode = permissions.mode();
    if mode & 0o111 != 0o111 {
        permissions.set_mode(mode | 0o111);
        tokio::fs::set_permissions(path, permissions).await?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn ensure_executable(path: &Path) -> std::io::Result<()> {
    tokio::fs::metadata(path).await.map(|_| ())
}

/// Whether a workspace entry should be handed to the annotator
pub fn is_eligible(name: &str, is_dir: bool, exclusion_marker: &str) -> bool {
    is_dir && (exclusion_marker.is_empty() || !name.contains(exclusion_marker))
}

/// Keep the last `limit` bytes of captured output
pub fn truncate_output(bytes: &[u8], limit: usize) -> String {
    if bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let dropped = bytes.len() - limit;
    format!(
        "[{dropped} bytes truncated]{}",
        String::from_utf8_lossy(&bytes[dropped..])
    )
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs a [`UnitAnnotator`] over the unit directories of one workspace
#[derive(Clone)]
pub struct Orchestrator {
    annotator: Arc<dyn UnitAnnotator>,
    exclusion_marker: String,
}

impl Orchestrator {
    pub fn new(annotator: Arc<dyn UnitAnnotator>, exclusion_marker: impl Into<String>) -> Self {
        Self {
            annotator,
            exclusion_marker: exclusion_marker.into(),
        }
    }

    /// Orchestrator driving the real decoder script
    pub fn from_environment(env: ToolEnvironment) -> Self {
        let marker = env.exclusion_marker.clone();
        Self::new(Arc::new(DecodeScript::new(env)), marker)
    }

    /// Invoke the annotator serially on each eligible unit of `workspace_root`
    ///
    /// Failed invocations are logged and returned as records; only failure to
    /// list the workspace itself is an error.
    pub async fn run_workspace(&self, workspace_root: &Path) -> Result<Vec<ToolRun>> {
        let units = self.eligible_units(workspace_root).await?;
        let mut runs = Vec::with_capacity(units.len());

        for unit_dir in units {
            let run = self.annotator.annotate_unit(&unit_dir).await;
            metrics::TOOL_RUNS_TOTAL
                .with_label_values(&[run.status.as_str()])
                .inc();

            if run.succeeded() {
                tracing::info!(unit = %run.unit, duration_ms = run.duration_ms, "Decoder finished");
            } else {
                let failure = run.failure().map(|e| e.to_string()).unwrap_or_default();
                tracing::error!(
                    unit = %run.unit,
                    status = %run.status,
                    exit_code = ?run.exit_code,
                    error = %failure,
                    stdout = %run.stdout,
                    stderr = %run.stderr,
                    "Decoder failed"
                );
            }
            runs.push(run);
        }

        Ok(runs)
    }

    async fn eligible_units(&self, workspace_root: &Path) -> Result<Vec<PathBuf>> {
        let io_error = |source| MatieError::Io {
            path: workspace_root.to_path_buf(),
            source,
        };

        let mut entries = tokio::fs::read_dir(workspace_root).await.map_err(io_error)?;
        let mut units = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);

            if is_eligible(&name, is_dir, &self.exclusion_marker) {
                units.push(entry.path());
            } else {
                tracing::warn!(entry = %entry.path().display(), "Skipping workspace entry");
            }
        }

        units.sort();
        Ok(units)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("exclusion_marker", &self.exclusion_marker)
            .finish_non_exhaustive()
    }
}
