use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

/// Bounded tail of a subprocess's stderr, kept for failure reports.
#[derive(Debug, Clone)]
pub struct StderrLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(256)))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Captured lines joined with newlines; empty when nothing was written.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Drains `stream` line by line into this log until it closes.
    pub fn spawn_drain<R>(&self, server: &str, stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let log = self.clone();
        let server = server.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, line = %line, "server stderr");
                log.push(line);
            }
        })
    }
}

/// Appends a stderr excerpt to a failure reason.
pub fn with_stderr(reason: impl Into<String>, stderr: &str) -> String {
    let reason = reason.into();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        reason
    } else {
        format!("{reason} | stderr: {stderr}")
    }
}
