//! Job executors: the code that actually performs a task.
//!
//! Two implementations ship with the crate:
//! - [`FnExecutor`] runs an async closure in-process
//! - [`ShellExecutor`] spawns a subprocess per task

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::JobError;
use crate::worker::task::{Task, TaskId};

/// Maximum captured output per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Borrowed view of a task handed to an executor.
#[derive(Debug, Clone, Copy)]
pub struct JobRequest<'a> {
    pub task_id: &'a TaskId,
    pub kind: &'a str,
    pub payload: &'a serde_json::Value,
    pub args: &'a [String],
    pub attempt: u32,
}

impl<'a> JobRequest<'a> {
    pub fn from_task(task: &'a Task) -> Self {
        Self {
            task_id: &task.id,
            kind: &task.kind,
            payload: &task.payload,
            args: &task.args,
            attempt: task.attempt,
        }
    }

    /// Build an `ExecutionFailed` error for this job.
    pub fn fail(&self, reason: impl Into<String>) -> JobError {
        JobError::ExecutionFailed {
            kind: self.kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// Successful job output.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub output: serde_json::Value,
}

impl JobOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self { output }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(serde_json::Value::String(text.into()))
    }

    pub fn empty() -> Self {
        Self::new(serde_json::Value::Null)
    }
}

/// Performs the work named by a task's type.
///
/// The scheduler treats every call as opaque, potentially slow and potentially
/// failing. An `Err` is recorded as a failed task; it never affects the worker.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, request: &JobRequest<'_>) -> Result<JobOutput, JobError>;
}

type JobFn =
    dyn for<'a> Fn(JobRequest<'a>) -> BoxFuture<'a, Result<JobOutput, JobError>> + Send + Sync;

/// In-process executor backed by an async closure.
#[derive(Clone)]
pub struct FnExecutor {
    f: Arc<JobFn>,
}

impl FnExecutor {
    /// Wrap a closure returning a boxed future, e.g.
    /// `FnExecutor::new(|req| Box::pin(async move { Ok(JobOutput::empty()) }))`.
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(JobRequest<'a>) -> BoxFuture<'a, Result<JobOutput, JobError>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Wrap a synchronous closure.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(JobRequest<'_>) -> Result<JobOutput, JobError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |req| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(req) })
        })
    }
}

impl fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobExecutor for FnExecutor {
    async fn execute(&self, request: &JobRequest<'_>) -> Result<JobOutput, JobError> {
        (self.f)(*request).await
    }
}

/// Subprocess executor: runs `program [base_args..] [task args..]`.
///
/// Stdout and stderr are captured (each truncated to 64KB). A non-zero exit
/// status is a failure. The child is killed if the execution future is
/// dropped, so scheduler timeouts terminate it.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    program: String,
    base_args: Vec<String>,
    working_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl ShellExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            working_dir: None,
            envs: Vec::new(),
        }
    }

    /// `sh -c <args joined by spaces>`. Task args form the command line.
    pub fn shell() -> Self {
        Self::new("sh").with_args(["-c"])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn is_shell(&self) -> bool {
        self.base_args.last().is_some_and(|a| a == "-c")
    }

    fn build_command(&self, request: &JobRequest<'_>) -> Result<Command, JobError> {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);

        if self.is_shell() {
            // `sh -c` takes the script as a single argument
            if request.args.is_empty() {
                return Err(JobError::InvalidArguments {
                    kind: request.kind.to_string(),
                    reason: "shell job needs a command".to_string(),
                });
            }
            command.arg(request.args.join(" "));
        } else {
            command.args(request.args);
        }

        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.env("OPSCHED_TASK_ID", request.task_id.as_str());
        command.env("OPSCHED_ATTEMPT", request.attempt.to_string());

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(command)
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    async fn execute(&self, request: &JobRequest<'_>) -> Result<JobOutput, JobError> {
        let mut child = self
            .build_command(request)?
            .spawn()
            .map_err(|e| JobError::Spawn {
                kind: request.kind.to_string(),
                reason: format!("{}: {}", self.program, e),
            })?;

        let start = Instant::now();

        // Read both pipes concurrently with the wait so a chatty child cannot
        // fill a pipe and deadlock.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            read_capped(stdout_pipe.as_mut()),
            read_capped(stderr_pipe.as_mut()),
        );

        let status = status.map_err(|e| request.fail(format!("wait failed: {e}")))?;
        let output = combine_output(&stdout, &stderr);
        let exit_code = status.code().unwrap_or(-1);

        tracing::debug!(
            task_id = %request.task_id,
            program = %self.program,
            exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Subprocess finished"
        );

        if status.success() {
            Ok(JobOutput::new(serde_json::json!({
                "output": output,
                "exit_code": exit_code,
            })))
        } else {
            Err(request.fail(format!(
                "exit code {}: {}",
                exit_code,
                truncate_for_error(&output)
            )))
        }
    }
}

async fn read_capped<R>(pipe: Option<&mut R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return String::new();
    };

    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            // Keep draining past the cap so the child never blocks on a full pipe
            Ok(n) if buf.len() < MAX_OUTPUT_SIZE => buf.extend_from_slice(&chunk[..n]),
            Ok(_) => {}
        }
    }
    truncate_output(&String::from_utf8_lossy(&buf))
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{}\n\n--- stderr ---\n{}", stdout, stderr)
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_error(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        format!("{}...", trimmed.chars().take(200).collect::<String>())
    }
}

/// Executor that sleeps for `args[0]` milliseconds. Handy for smoke tests.
pub fn sleep_executor() -> FnExecutor {
    FnExecutor::new(|req| {
        Box::pin(async move {
            let ms: u64 = match req.args.first() {
                Some(raw) => raw.parse().map_err(|_| JobError::InvalidArguments {
                    kind: req.kind.to_string(),
                    reason: format!("expected milliseconds, got `{raw}`"),
                })?,
                None => 0,
            };
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, JobError>(JobOutput::new(serde_json::json!({ "slept_ms": ms })))
        })
    })
}

/// Executor that returns its payload and args unchanged.
pub fn echo_executor() -> FnExecutor {
    FnExecutor::from_sync(|req| {
        Ok(JobOutput::new(serde_json::json!({
            "payload": req.payload,
            "args": req.args,
        })))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::task::TaskRequest;

    fn task(kind: &str, args: &[&str]) -> Task {
        Task::from_request(TaskRequest::new(kind).with_args(args.iter().copied()), 1)
    }

    #[tokio::test]
    async fn fn_executor_runs_closure() {
        let exec = FnExecutor::new(|req| {
            Box::pin(async move { Ok(JobOutput::text(format!("ran {}", req.kind))) })
        });
        let t = task("todo", &[]);
        let out = exec.execute(&JobRequest::from_task(&t)).await.unwrap();
        assert_eq!(out.output, serde_json::json!("ran todo"));
    }

    #[tokio::test]
    async fn fn_executor_propagates_failure() {
        let exec = FnExecutor::from_sync(|req| Err(req.fail("boom")));
        let t = task("qa", &[]);
        let err = exec.execute(&JobRequest::from_task(&t)).await.unwrap_err();
        assert!(matches!(err, JobError::ExecutionFailed { ref reason, .. } if reason == "boom"));
    }

    #[tokio::test]
    async fn echo_returns_args() {
        let t = task("echo", &["a", "b"]);
        let out = echo_executor()
            .execute(&JobRequest::from_task(&t))
            .await
            .unwrap();
        assert_eq!(out.output["args"], serde_json::json!(["a", "b"]));
    }

    #[tokio::test]
    async fn sleep_rejects_bad_argument() {
        let t = task("sleep", &["soon"]);
        let err = sleep_executor()
            .execute(&JobRequest::from_task(&t))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn shell_executor_captures_stdout() {
        let t = task("shell", &["echo", "hello"]);
        let out = ShellExecutor::shell()
            .execute(&JobRequest::from_task(&t))
            .await
            .unwrap();
        assert!(out.output["output"].as_str().unwrap().contains("hello"));
        assert_eq!(out.output["exit_code"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn shell_executor_nonzero_exit_is_failure() {
        let t = task("shell", &["echo oops >&2; exit 3"]);
        let err = ShellExecutor::shell()
            .execute(&JobRequest::from_task(&t))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[tokio::test]
    async fn shell_executor_requires_command() {
        let t = task("shell", &[]);
        let err = ShellExecutor::shell()
            .execute(&JobRequest::from_task(&t))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn shell_executor_missing_program() {
        let t = task("ghost", &[]);
        let err = ShellExecutor::new("/definitely/not/a/binary")
            .execute(&JobRequest::from_task(&t))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
    }

    #[tokio::test]
    async fn shell_executor_uses_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let t = task("shell", &["pwd; echo $GREETING; echo $OPSCHED_ATTEMPT"]);
        let out = ShellExecutor::shell()
            .with_working_dir(dir.path().to_path_buf())
            .with_env("GREETING", "hi there")
            .execute(&JobRequest::from_task(&t))
            .await
            .unwrap();

        let text = out.output["output"].as_str().unwrap();
        let dir_name = dir.path().file_name().unwrap().to_string_lossy();
        assert!(text.contains(dir_name.as_ref()), "{text}");
        assert!(text.contains("hi there"));
        assert!(text.lines().any(|l| l.trim() == "1"));
    }

    #[test]
    fn truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() <= MAX_OUTPUT_SIZE + 100);
        assert!(result.contains("[truncated"));
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        let s = "café";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 4), 3);
        assert_eq!(floor_char_boundary(s, 3), 3);
    }
}
