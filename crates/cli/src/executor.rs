//! Runs one shell command per task.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use batchwise_compute::{TaskError, TaskExecutor};
use batchwise_core::Task;
use serde_json::Value;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Executes `sh -c <command>` for every task.
///
/// The child sees the task as JSON on stdin, plus `BATCHWISE_TASK_ID` and one
/// `BATCHWISE_PARAM_<NAME>` variable per parameter. Its stdout becomes the
/// payload (parsed as JSON when possible). A non-zero exit fails the task with
/// the last stderr line.
pub struct CommandExecutor {
    command: String,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn spawn(&self, task: &Task) -> std::io::Result<Child> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("BATCHWISE_TASK_ID", &task.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &task.parameters {
            cmd.env(param_env_name(name), param_env_value(value));
        }
        cmd.spawn()
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        let input = serde_json::to_vec(task).map_err(anyhow::Error::from)?;
        let mut child = self
            .spawn(task)
            .map_err(|e| TaskError::Other(anyhow::Error::new(e).context("failed to spawn task command")))?;

        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                // Commands that ignore stdin close the pipe early.
                let _ = stdin.write_all(&input);
            });
        }
        let stdout_rx = drain(child.stdout.take());
        let stderr_rx = drain(child.stderr.take());

        let status = match self.timeout {
            Some(limit) => match child.wait_timeout(limit).map_err(anyhow::Error::from)? {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(task_id = %task.id, timeout_secs = limit.as_secs_f64(), "Killed task command");
                    return Err(TaskError::failed(format!(
                        "command killed after {}s timeout",
                        limit.as_secs_f64()
                    )));
                }
            },
            None => child.wait().map_err(anyhow::Error::from)?,
        };

        let stdout = stdout_rx.recv().unwrap_or_default();
        let stderr = stderr_rx.recv().unwrap_or_default();
        debug!(task_id = %task.id, code = ?status.code(), "Task command exited");

        if !status.success() {
            let reason = last_line(&stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("command exited with {status}"));
            return Err(TaskError::Failed(reason));
        }
        Ok(parse_payload(&stdout))
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match stream {
        Some(mut stream) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf);
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

/// `ligand-name` -> `BATCHWISE_PARAM_LIGAND_NAME`.
fn param_env_name(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("BATCHWISE_PARAM_{upper}")
}

fn param_env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_payload(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new("7CMD_ATP")
            .with_param("pdb", "7CMD")
            .with_param("ligand-name", "ATP")
            .with_param("chain", json!(1))
    }

    #[test]
    fn json_stdout_becomes_payload() {
        let exec = CommandExecutor::new(r#"echo '{"score": -7.5}'"#, None);
        assert_eq!(exec.execute(&task()).unwrap(), json!({"score": -7.5}));
    }

    #[test]
    fn plain_stdout_becomes_string() {
        let exec = CommandExecutor::new("echo done", None);
        assert_eq!(exec.execute(&task()).unwrap(), json!("done"));
    }

    #[test]
    fn environment_carries_task_fields() {
        let exec = CommandExecutor::new(
            r#"echo "$BATCHWISE_TASK_ID $BATCHWISE_PARAM_PDB $BATCHWISE_PARAM_LIGAND_NAME $BATCHWISE_PARAM_CHAIN""#,
            None,
        );
        assert_eq!(exec.execute(&task()).unwrap(), json!("7CMD_ATP 7CMD ATP 1"));
    }

    #[test]
    fn stdin_holds_task_json() {
        let exec = CommandExecutor::new("cat", None);
        let payload = exec.execute(&task()).unwrap();
        assert_eq!(payload["id"], "7CMD_ATP");
        assert_eq!(payload["parameters"]["pdb"], "7CMD");
    }

    #[test]
    fn nonzero_exit_reports_last_stderr_line() {
        let exec = CommandExecutor::new("echo warming up >&2; echo 'structure not found' >&2; exit 3", None);
        match exec.execute(&task()) {
            Err(TaskError::Failed(msg)) => assert_eq!(msg, "structure not found"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn silent_failure_reports_exit_status() {
        let exec = CommandExecutor::new("exit 2", None);
        let err = exec.execute(&task()).unwrap_err();
        assert!(err.to_string().contains("exit"));
    }

    #[test]
    fn overrunning_command_is_killed() {
        let exec = CommandExecutor::new("sleep 5", Some(Duration::from_millis(200)));
        let started = std::time::Instant::now();
        let err = exec.execute(&task()).unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn env_names_are_sanitised() {
        assert_eq!(param_env_name("res.num"), "BATCHWISE_PARAM_RES_NUM");
    }
}
