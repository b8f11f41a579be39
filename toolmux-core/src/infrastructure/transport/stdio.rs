use super::frame::{BoxedRead, BoxedWrite, FrameReader, FrameWriter};
use super::stderr::StderrLog;
use crate::config::ServerConfig;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bound on draining the rest of stderr once the process is gone.
const STDERR_FLUSH: Duration = Duration::from_millis(200);

/// Byte-level ownership of one server's pipes.
///
/// The reader goes to the session's read loop, the writer is shared by every
/// caller. `process` is absent for in-memory transports.
pub struct Transport {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    pub process: Option<ChildProcess>,
    pub stderr: StderrLog,
}

impl Transport {
    /// Spawns the configured command with piped stdio.
    ///
    /// The environment overlay is merged over the parent's environment. The
    /// child is killed if its handle is dropped without an explicit shutdown.
    pub fn spawn(config: &ServerConfig, stderr_lines: usize) -> io::Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("failed to capture server stdout"))?;

        let stderr = StderrLog::new(stderr_lines);
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| stderr.spawn_drain(&config.name, stream));

        info!(
            server = %config.name,
            pid = child.id(),
            command = %config.command_line(),
            "Spawned tool server"
        );

        Ok(Self {
            reader: FrameReader::new(Box::new(stdout)),
            writer: FrameWriter::new(Box::new(stdin)),
            process: Some(ChildProcess {
                server: config.name.clone(),
                child,
                stderr_task,
            }),
            stderr,
        })
    }

    /// Transport over arbitrary streams with no subprocess behind it.
    pub fn from_streams(reader: BoxedRead, writer: BoxedWrite) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            process: None,
            stderr: StderrLog::new(0),
        }
    }
}

/// Handle on a spawned server process.
pub struct ChildProcess {
    server: String,
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

impl ChildProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process has already terminated.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Waits up to `within` for the process to exit on its own. Once it has,
    /// whatever it wrote to stderr is collected before returning.
    pub async fn wait_exit(&mut self, within: Duration) -> Option<ExitStatus> {
        let status = tokio::time::timeout(within, self.child.wait())
            .await
            .ok()
            .and_then(Result::ok)?;
        self.finish_stderr().await;
        Some(status)
    }

    async fn finish_stderr(&mut self) {
        if let Some(mut task) = self.stderr_task.take() {
            // a grandchild may still hold the stderr pipe open
            if tokio::time::timeout(STDERR_FLUSH, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    /// Sends SIGTERM (unix), waits `grace`, then kills and reaps.
    ///
    /// The caller is expected to have closed stdin first.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        let result = self.terminate_inner(grace).await;
        self.finish_stderr().await;
        result
    }

    async fn terminate_inner(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.try_exit_status() {
            debug!(server = %self.server, %status, "Server already exited");
            return Ok(status);
        }

        self.signal_terminate();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    server = %self.server,
                    grace_ms = grace.as_millis() as u64,
                    "Server did not exit within grace period, killing"
                );
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            debug!(server = %self.server, %err, "Failed to send SIGTERM");
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {}
}
