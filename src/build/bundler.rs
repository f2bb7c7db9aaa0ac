//! External bundler invocation
//!
//! The bundler is an opaque subprocess. Its output is captured up to a fixed
//! number of bytes per stream, and the whole process group is killed when
//! the timeout expires or the build is cancelled.

use crate::config::schema::BundlerConfig;
use crate::error::{PreviewError, PreviewResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to wait for output pipes to close after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Structured result of one bundler invocation
#[derive(Debug, Clone)]
pub struct BundlerRun {
    /// Exit code, `None` when killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Either stream produced more bytes than were captured
    pub truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl BundlerRun {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Combined stdout and stderr, for error payloads
    pub fn diagnostics(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        if self.truncated {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[output truncated]");
        }
        text
    }
}

/// Something that turns a staged workspace into a static bundle
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Run the bundler against `workspace`. A non-zero exit is reported in
    /// the returned `BundlerRun`; only failing to start the process is an error.
    async fn bundle(&self, workspace: &Path, cancel: CancellationToken)
        -> PreviewResult<BundlerRun>;

    /// Human-readable name for logs
    fn name(&self) -> String;
}

/// Bundler backed by a subprocess, `npm run build` by default
#[derive(Debug, Clone)]
pub struct CommandBundler {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl CommandBundler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let defaults = BundlerConfig::default();
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            timeout: defaults.timeout(),
            max_output_bytes: defaults.max_output_bytes,
        }
    }

    pub fn from_config(config: &BundlerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            timeout: config.timeout(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for CommandBundler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Bundler for CommandBundler {
    async fn bundle(
        &self,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> PreviewResult<BundlerRun> {
        debug!("Executing in {}: {}", workspace.display(), self);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a timeout takes down `npm` and everything it spawned
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| PreviewError::BundlerSpawn {
            command: self.to_string(),
            source: e,
        })?;

        let stdout = child.stdout.take().map(|s| spawn_reader(s, self.max_output_bytes));
        let stderr = child.stderr.take().map(|s| spawn_reader(s, self.max_output_bytes));

        let mut timed_out = false;
        let mut cancelled = false;

        let status = tokio::select! {
            status = child.wait() => status,
            _ = tokio::time::sleep(self.timeout) => {
                timed_out = true;
                terminate(&mut child).await
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                terminate(&mut child).await
            }
        };
        let status = status.map_err(|e| PreviewError::io(format!("waiting for `{}`", self), e))?;

        let (stdout, stdout_truncated) = collect(stdout).await;
        let (stderr, stderr_truncated) = collect(stderr).await;

        let run = BundlerRun {
            exit_code: exit_code(status),
            stdout,
            stderr,
            truncated: stdout_truncated || stderr_truncated,
            timed_out,
            cancelled,
            elapsed: start.elapsed(),
        };

        debug!(
            "`{}` finished in {:?} (exit {:?}, timed_out {}, cancelled {})",
            self, run.elapsed, run.exit_code, run.timed_out, run.cancelled
        );
        Ok(run)
    }

    fn name(&self) -> String {
        self.to_string()
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

/// Bytes captured from one output stream so far
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// A reader task plus the buffer it fills. The buffer stays readable if the
/// task has to be abandoned.
struct OutputReader {
    captured: Arc<Mutex<Captured>>,
    handle: JoinHandle<io::Result<()>>,
}

fn spawn_reader<R>(reader: R, max_bytes: usize) -> OutputReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured = Arc::new(Mutex::new(Captured::default()));
    let handle = tokio::spawn(read_bounded(reader, max_bytes, Arc::clone(&captured)));
    OutputReader { captured, handle }
}

/// Read a stream to EOF, keeping at most `max_bytes`. The rest is drained
/// and discarded so the child never blocks on a full pipe.
async fn read_bounded<R>(
    mut reader: R,
    max_bytes: usize,
    captured: Arc<Mutex<Captured>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut buffer = captured.lock().unwrap_or_else(PoisonError::into_inner);
        let room = max_bytes.saturating_sub(buffer.bytes.len());
        if n > room {
            buffer.truncated = true;
        }
        buffer.bytes.extend_from_slice(&buf[..n.min(room)]);
        drop(buffer);
    }
}

async fn collect(reader: Option<OutputReader>) -> (String, bool) {
    let Some(OutputReader {
        captured,
        mut handle,
    }) = reader
    else {
        return (String::new(), false);
    };

    let mut cut_short = false;
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("Failed to read bundler output: {}", e),
        Ok(Err(e)) => warn!("Bundler output reader failed: {}", e),
        Err(_) => {
            // A background process outlived the bundler and still holds the pipe
            handle.abort();
            cut_short = true;
        }
    }

    let captured = std::mem::take(&mut *captured.lock().unwrap_or_else(PoisonError::into_inner));
    (
        String::from_utf8_lossy(&captured.bytes).into_owned(),
        captured.truncated || cut_short,
    )
}

/// Kill the child's process group, then reap the child
async fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) has no memory-safety preconditions. The negative pid
        // addresses the group created by `process_group(0)`.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }

    if let Err(e) = child.start_kill() {
        debug!("start_kill after group kill: {}", e);
    }
    child.wait().await
}
