use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::AgentError;
use crate::types::{TaskPayload, TaskResult};
use crate::Result;

// ─── TaskExecutor ─────────────────────────────────────────────────────────

/// Runs one acquired task. The runner reports whatever this returns; an
/// `Err` is reported as a failed run.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, task: TaskPayload) -> BoxFuture<'static, Result<TaskResult>>;
}

// ─── CommandExecutor ──────────────────────────────────────────────────────

/// Hands each task to an external collector program.
///
/// The payload is written to the program's stdin as one JSON line and stdin
/// is closed. On exit code 0, stdout is parsed as the run result (empty
/// stdout is a `null` result). A non-zero exit is a failed run carrying the
/// captured stderr.
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, task: TaskPayload) -> BoxFuture<'static, Result<TaskResult>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("PERPETUAL_TASK_ID", &task.task_id)
            .env("PERPETUAL_TASK_TYPE", &task.task_type)
            .kill_on_drop(true);
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, run(cmd, &task)).await {
                Ok(result) => result,
                Err(_) => Ok(TaskResult::failure(format!(
                    "collector timed out after {}s",
                    timeout.as_secs()
                ))),
            }
        })
    }
}

async fn run(mut cmd: Command, task: &TaskPayload) -> Result<TaskResult> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::Executor(format!("failed to spawn collector: {e}")))?;

    // Drain stderr in the background so a chatty collector cannot block.
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stderr_task = child.stderr.take().map(|stderr| {
        let buf = Arc::clone(&stderr_buf);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if let Ok(mut b) = buf.lock() {
                    if !b.is_empty() {
                        b.push('\n');
                    }
                    b.push_str(&line);
                }
            }
        })
    });

    if let Some(mut stdin) = child.stdin.take() {
        let mut line = serde_json::to_vec(task)?;
        line.push(b'\n');
        // A collector that exits without reading its input is not an error.
        if let Err(e) = stdin.write_all(&line).await {
            tracing::debug!(task_id = %task.task_id, error = %e, "collector closed stdin early");
        }
    }

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_string(&mut stdout)
            .await
            .map_err(|e| AgentError::Executor(format!("failed to read collector output: {e}")))?;
    }
    let status = child
        .wait()
        .await
        .map_err(|e| AgentError::Executor(format!("failed to wait for collector: {e}")))?;
    if let Some(handle) = stderr_task {
        let _ = handle.await;
    }

    if !status.success() {
        let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();
        let msg = match status.code() {
            Some(code) if stderr.is_empty() => format!("collector exited with code {code}"),
            Some(code) => format!("collector exited with code {code}: {stderr}"),
            None => "collector terminated by signal".to_string(),
        };
        tracing::warn!(task_id = %task.task_id, "{msg}");
        return Ok(TaskResult::failure(msg));
    }

    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(TaskResult::success(serde_json::Value::Null));
    }
    Ok(TaskResult::success(serde_json::from_str(trimmed)?))
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;

    fn payload() -> TaskPayload {
        TaskPayload {
            task_id: "t1".into(),
            task_type: "ARTIFACT_COLLECTION".into(),
            account_id: "acct".into(),
            client_context: serde_json::json!({ "subscription_id": "sub-1" }),
            details: None,
        }
    }

    fn sh(script: &str) -> CommandExecutor {
        CommandExecutor::new("sh", vec!["-c".into(), script.into()], Duration::from_secs(10))
    }

    #[tokio::test]
    async fn stdout_json_becomes_the_result() {
        let exec = sh(r#"cat >/dev/null; echo '{"keys":["1.0","1.1"]}'"#);
        let result = exec.execute(payload()).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.result["keys"][1], "1.1");
    }

    #[tokio::test]
    async fn collector_sees_the_payload_on_stdin() {
        let exec = sh(r#"read line; echo "{\"echo\": $line}""#);
        let result = exec.execute(payload()).await.unwrap();
        assert_eq!(result.result["echo"]["task_id"], "t1");
        assert_eq!(result.result["echo"]["client_context"]["subscription_id"], "sub-1");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failed_run_with_stderr() {
        let exec = sh("echo 'registry unreachable' >&2; exit 3");
        let result = exec.execute(payload()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failure);
        let msg = result.result["error_message"].as_str().unwrap();
        assert!(msg.contains("code 3"));
        assert!(msg.contains("registry unreachable"));
    }

    #[tokio::test]
    async fn empty_stdout_is_null_result() {
        let exec = sh("cat >/dev/null");
        let result = exec.execute(payload()).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert!(result.result.is_null());
    }

    #[tokio::test]
    async fn slow_collector_times_out() {
        let exec = CommandExecutor::new("sh", vec!["-c".into(), "sleep 5".into()], Duration::from_millis(100));
        let result = exec.execute(payload()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn missing_program_is_an_executor_error() {
        let exec = CommandExecutor::new("/nonexistent/collector", vec![], Duration::from_secs(1));
        let err = exec.execute(payload()).await.unwrap_err();
        assert!(matches!(err, AgentError::Executor(_)));
    }
}
