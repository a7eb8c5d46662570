//! Command execution for claimed jobs.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use queuectl_core::Job;

/// Bytes of stderr/stdout kept in reports and error summaries.
pub const OUTPUT_TAIL_BYTES: usize = 512;

/// Runs a job's command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, job: &Job, timeout: Duration) -> Result<ExecutionReport, ExecutionError>;
}

/// Successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub duration: Duration,
    /// Tail of the captured stdout
    pub stdout: String,
}

/// Failed execution. Drives retry; never fatal to the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{}", exit_summary(.code, .stderr))]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("timed out after {after:?}")]
    TimedOut { after: Duration },
    #[error("failed to spawn command: {0}")]
    Spawn(String),
}

fn exit_summary(code: &Option<i32>, stderr: &str) -> String {
    let head = match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    if stderr.is_empty() {
        head
    } else {
        format!("{head}: {stderr}")
    }
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, job: &Job, timeout: Duration) -> Result<ExecutionReport, ExecutionError> {
        let started = Instant::now();

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Spawn(e.to_string()))?;

        let stdout = OutputCapture::spawn(child.stdout.take());
        let stderr = OutputCapture::spawn(child.stderr.take());

        // Background processes may keep the pipes open after the child exits;
        // only the exit status is bounded by the timeout.
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| ExecutionError::Spawn(e.to_string()))?,
            Err(_) => {
                let _ = child.kill().await;
                stdout.abort();
                stderr.abort();
                return Err(ExecutionError::TimedOut { after: timeout });
            }
        };

        let deadline = tokio::time::Instant::now() + OUTPUT_GRACE;
        let stdout = stdout.finish(deadline).await;
        let stderr = stderr.finish(deadline).await;

        if status.success() {
            Ok(ExecutionReport {
                duration: started.elapsed(),
                stdout,
            })
        } else {
            Err(ExecutionError::NonZeroExit {
                code: status.code(),
                stderr,
            })
        }
    }
}

/// How long pipe readers keep draining once the child has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(100);

/// Keeps the last `OUTPUT_TAIL_BYTES` pushed into it.
#[derive(Debug, Default)]
struct TailBuffer {
    bytes: Vec<u8>,
}

impl TailBuffer {
    fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= OUTPUT_TAIL_BYTES {
            self.bytes.clear();
            self.bytes
                .extend_from_slice(&chunk[chunk.len() - OUTPUT_TAIL_BYTES..]);
            return;
        }
        self.bytes.extend_from_slice(chunk);
        let excess = self.bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
        self.bytes.drain(..excess);
    }

    /// Lossily decoded and trimmed.
    fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

/// Background task draining one pipe into a `TailBuffer`.
struct OutputCapture {
    tail: Arc<Mutex<TailBuffer>>,
    reader: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn spawn<P>(pipe: Option<P>) -> Self
    where
        P: AsyncRead + Unpin + Send + 'static,
    {
        let tail = Arc::new(Mutex::new(TailBuffer::default()));
        let reader = pipe.map(|mut pipe| {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => tail
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(&chunk[..n]),
                    }
                }
            })
        });
        Self { tail, reader }
    }

    fn abort(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }

    /// Read until EOF or `deadline`, whichever comes first, and return the tail.
    async fn finish(mut self, deadline: tokio::time::Instant) -> String {
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .to_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use queuectl_core::JobId;

    fn job(command: &str) -> Job {
        Job::new(JobId::parse("job").unwrap(), command, 3, Utc::now())
    }

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let report = ShellRunner::new()
            .run(&job("echo Hello from job1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.stdout, "Hello from job1");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_code_and_stderr() {
        let err = ShellRunner::new()
            .run(&job("echo oops >&2; exit 3"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecutionError::NonZeroExit {
                code: Some(3),
                stderr: "oops".to_string(),
            }
        );
        assert_eq!(err.to_string(), "exit code 3: oops");
    }

    #[tokio::test]
    async fn unknown_command_is_a_failed_execution() {
        let err = ShellRunner::new()
            .run(&job("nonexistent_cmd_xyz"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NonZeroExit { code: Some(127), .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let started = Instant::now();
        let err = ShellRunner::new()
            .run(&job("sleep 5"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let err = ShellRunner::new()
            .with_shell("/definitely/not/a/shell")
            .run(&job("true"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn(_)));
    }

    #[tokio::test]
    async fn exit_status_decides_even_with_background_children() {
        let started = Instant::now();
        let report = ShellRunner::new()
            .run(&job("sleep 3 & echo done; exit 0"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.stdout, "done");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn chatty_output_keeps_only_the_tail() {
        let report = ShellRunner::new()
            .run(
                &job("i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done; echo END"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(report.stdout.len() <= OUTPUT_TAIL_BYTES);
        assert!(report.stdout.ends_with("line-1999\nEND"));
    }

    #[test]
    fn tail_buffer_keeps_the_end() {
        let mut tail = TailBuffer::default();
        tail.push("x".repeat(OUTPUT_TAIL_BYTES).as_bytes());
        tail.push(b"END");
        assert_eq!(tail.bytes.len(), OUTPUT_TAIL_BYTES);
        assert!(tail.to_text().ends_with("END"));

        let mut small = TailBuffer::default();
        small.push(b"  a");
        small.push(b"b \n");
        assert_eq!(small.to_text(), "ab");
    }
}
