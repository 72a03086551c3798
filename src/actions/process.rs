// src/actions/process.rs

//! Subprocess supervision for build actions
//!
//! Children are spawned with stdout and stderr piped; both streams are
//! tailed line-buffered into a per-action log file (flushed on every
//! newline, byte-for-byte) and captured for the completion result. The
//! [`MultiSession`] barrier joins several children and fires its
//! completion exactly once; [`BufferSearch`] detects marker strings
//! across buffer boundaries in streamed output.

use crate::actions::ActionHandle;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Completion info of one supervised child
#[derive(Debug, Default, Clone)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    /// Spawn/supervision error text; empty on success
    pub error: String,
    /// Captured stdout
    pub output: String,
    /// Captured stderr
    pub error_output: String,
}

impl ProcessResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_empty() && self.exit_code == Some(0)
    }

    /// Short human-readable failure reason
    pub fn failure_reason(&self, tool: &str) -> String {
        if !self.error.is_empty() {
            format!("unable to invoke {}: {}", tool, self.error)
        } else {
            format!(
                "{} returned with exit code {}",
                tool,
                self.exit_code.map_or_else(|| "?".to_string(), |c| c.to_string())
            )
        }
    }
}

/// A subprocess writing its output to a per-action log file
pub struct BuildProcess {
    name: String,
    log_path: PathBuf,
}

impl BuildProcess {
    pub fn new(name: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            log_path: log_path.into(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Spawn the child and supervise it to completion
    ///
    /// The PID is noted in the action's output buffer; the log file
    /// receives the exact child output.
    pub async fn run(&self, action: &ActionHandle, mut command: Command) -> ProcessResult {
        let mut result = ProcessResult::default();

        if let Some(parent) = self.log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                result.error = format!("unable to create log directory: {}", e);
                return result;
            }
        }
        let log_file = match tokio::fs::File::create(&self.log_path).await {
            Ok(file) => Arc::new(tokio::sync::Mutex::new(file)),
            Err(e) => {
                result.error = format!(
                    "unable to create log file \"{}\": {}",
                    self.log_path.display(),
                    e
                );
                return result;
            }
        };

        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(Stdio::null());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                result.error = e.to_string();
                warn!("unable to spawn {}: {}", self.name, e);
                return result;
            }
        };
        if let Some(pid) = child.id() {
            action.append_output(format!("{} PID: {}\n", self.name, pid));
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = stdout.map(|stream| {
            tokio::spawn(tail_stream_to_log(stream, Arc::clone(&log_file)))
        });
        let stderr_task = stderr.map(|stream| {
            tokio::spawn(tail_stream_to_log(stream, Arc::clone(&log_file)))
        });

        match child.wait().await {
            Ok(status) => result.exit_code = status.code(),
            Err(e) => result.error = e.to_string(),
        }
        if let Some(task) = stdout_task {
            if let Ok(captured) = task.await {
                result.output = captured;
            }
        }
        if let Some(task) = stderr_task {
            if let Ok(captured) = task.await {
                result.error_output = captured;
            }
        }
        debug!(
            "{} exited with {:?}, log at \"{}\"",
            self.name,
            result.exit_code,
            self.log_path.display()
        );
        result
    }
}

/// Copy a child stream into the log file line-buffered, returning the
/// captured bytes as lossy UTF-8
async fn tail_stream_to_log(
    stream: impl AsyncRead + Unpin,
    log_file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
) -> String {
    let mut reader = BufReader::new(stream);
    let mut captured = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                captured.extend_from_slice(&line);
                let mut file = log_file.lock().await;
                if file.write_all(&line).await.is_ok() {
                    let _ = file.flush().await;
                }
            }
            Err(e) => {
                warn!("error reading child output: {}", e);
                break;
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

/// Joins several asynchronous completions and fires its handler exactly
/// once after the last one reported
pub struct MultiSession {
    remaining: AtomicUsize,
    on_complete: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MultiSession {
    pub fn new(count: usize, on_complete: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        let session = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            on_complete: Mutex::new(Some(on_complete)),
        });
        if count == 0 {
            session.fire();
        }
        session
    }

    /// Report one completion; the handler fires when the last participant
    /// reports, regardless of completion order
    pub fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        if let Some(handler) = self
            .on_complete
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handler();
        }
    }
}

/// Streaming substring matcher detecting `start_marker … <terminator>`
/// sequences across buffer boundaries
///
/// After the start marker matched, bytes are collected until any
/// terminator byte appears; the callback fires exactly once with the
/// delimited payload. An optional give-up marker cancels the search when
/// seen before the start marker completes.
pub struct BufferSearch {
    start_marker: Vec<u8>,
    terminators: Vec<u8>,
    give_up_marker: Vec<u8>,
    callback: Box<dyn FnMut(String) + Send>,
    start_matched: usize,
    give_up_matched: usize,
    collecting: bool,
    payload: Vec<u8>,
    done: bool,
}

impl BufferSearch {
    pub fn new(
        start_marker: impl Into<String>,
        terminators: impl Into<String>,
        give_up_marker: impl Into<String>,
        callback: impl FnMut(String) + Send + 'static,
    ) -> Self {
        Self {
            start_marker: start_marker.into().into_bytes(),
            terminators: terminators.into().into_bytes(),
            give_up_marker: give_up_marker.into().into_bytes(),
            callback: Box::new(callback),
            start_matched: 0,
            give_up_matched: 0,
            collecting: false,
            payload: Vec::new(),
            done: false,
        }
    }

    /// Feed the next chunk of streamed output
    pub fn feed(&mut self, data: &[u8]) {
        if self.done {
            return;
        }
        for &byte in data {
            if self.done {
                return;
            }
            if self.collecting {
                if self.terminators.contains(&byte) {
                    let payload = String::from_utf8_lossy(&self.payload).into_owned();
                    (self.callback)(payload);
                    self.done = true;
                } else {
                    self.payload.push(byte);
                }
                continue;
            }

            // match the give-up marker
            if !self.give_up_marker.is_empty() {
                if byte == self.give_up_marker[self.give_up_matched] {
                    self.give_up_matched += 1;
                    if self.give_up_matched == self.give_up_marker.len() {
                        self.done = true;
                        return;
                    }
                } else {
                    self.give_up_matched = usize::from(byte == self.give_up_marker[0]);
                }
            }

            // match the start marker
            if byte == self.start_marker[self.start_matched] {
                self.start_matched += 1;
                if self.start_matched == self.start_marker.len() {
                    self.collecting = true;
                }
            } else {
                self.start_matched = usize::from(byte == self.start_marker[0]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionHandle, BuildActionType};

    #[tokio::test]
    async fn test_build_process_logs_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("echo.log");
        let action = ActionHandle::new(0, BuildActionType::DummyBuildAction);

        let mut command = Command::new("sh");
        command.arg("-c").arg("echo line1; echo line2; echo oops >&2");
        let process = BuildProcess::new("echo", &log_path);
        let result = process.run(&action, command).await;

        assert!(result.succeeded(), "error: {}", result.error);
        assert_eq!(result.output, "line1\nline2\n");
        assert_eq!(result.error_output, "oops\n");

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("line1\nline2\n"));
        assert!(log.contains("oops\n"));
        assert!(action.lock().output.contains("echo PID: "));
    }

    #[tokio::test]
    async fn test_build_process_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let action = ActionHandle::new(0, BuildActionType::DummyBuildAction);

        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 3");
        let process = BuildProcess::new("failing", dir.path().join("fail.log"));
        let result = process.run(&action, command).await;

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.succeeded());
        assert!(result.failure_reason("failing").contains("exit code 3"));
    }

    #[tokio::test]
    async fn test_build_process_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let action = ActionHandle::new(0, BuildActionType::DummyBuildAction);

        let command = Command::new("/nonexistent/binary");
        let process = BuildProcess::new("ghost", dir.path().join("ghost.log"));
        let result = process.run(&action, command).await;

        assert!(!result.error.is_empty());
        assert!(!result.succeeded());
        assert!(result.failure_reason("ghost").contains("unable to invoke"));
    }

    #[test]
    fn test_multi_session_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let session = MultiSession::new(
            2,
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        session.complete_one();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        session.complete_one();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multi_session_zero_participants() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _session = MultiSession::new(
            0,
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_search_across_boundaries() {
        let results: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let results_clone = Arc::clone(&results);
        let mut search = BufferSearch::new(
            "Updated version: ",
            "\x1b\n",
            "Starting build",
            move |payload| results_clone.lock().unwrap().push(payload),
        );

        search.feed(b"Starting Updated");
        search.feed(b" version: some ");
        search.feed(b"version number\x1bmore chars");
        assert_eq!(
            *results.lock().unwrap(),
            vec!["some version number".to_string()]
        );

        // a second occurrence is ignored
        search.feed(b"Updated version: again\n");
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_buffer_search_give_up_marker() {
        let results: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let results_clone = Arc::clone(&results);
        let mut search = BufferSearch::new(
            "Updated version: ",
            "\n",
            "Starting build",
            move |payload| results_clone.lock().unwrap().push(payload),
        );

        search.feed(b"... Starting build ...\n");
        search.feed(b"Updated version: 1.2.3\n");
        assert!(results.lock().unwrap().is_empty());
    }
}
