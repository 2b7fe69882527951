use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::ToolError;

const STDERR_TAIL: usize = 2048;

/// One out-of-process tool invocation bound to a deadline.
pub(crate) struct ToolInvocation<'a> {
    pub tool: &'a str,
    pub args: Vec<String>,
    pub envs: Vec<(&'static str, &'a str)>,
    pub timeout: Duration,
}

impl ToolInvocation<'_> {
    /// Run to completion. The child is killed if the deadline passes.
    pub(crate) async fn run(self) -> Result<(), ToolError> {
        let mut cmd = Command::new(self.tool);
        cmd.args(&self.args)
            .envs(self.envs.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: self.tool.to_string(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_elapsed) => {
                return Err(ToolError::Timeout {
                    tool: self.tool.to_string(),
                    after: self.timeout,
                });
            }
            Ok(result) => result.map_err(|source| ToolError::Spawn {
                tool: self.tool.to_string(),
                source,
            })?,
        };

        if output.status.success() {
            return Ok(());
        }
        Err(ToolError::Exit {
            tool: self.tool.to_string(),
            status: output.status,
            stderr: stderr_tail(&output.stderr),
        })
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = ToolInvocation {
            tool: "sh",
            args: vec!["-c".into(), "echo 'role does not exist' >&2; exit 3".into()],
            envs: vec![],
            timeout: Duration::from_secs(5),
        }
        .run()
        .await
        .unwrap_err();
        match err {
            ToolError::Exit { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "role does not exist");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_is_reported_as_timeout() {
        let err = ToolInvocation {
            tool: "sh",
            args: vec!["-c".into(), "exec sleep 5".into()],
            envs: vec![],
            timeout: Duration::from_millis(100),
        }
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn environment_reaches_the_tool() {
        ToolInvocation {
            tool: "sh",
            args: vec!["-c".into(), "test \"$PGPASSWORD\" = s3cret".into()],
            envs: vec![("PGPASSWORD", "s3cret")],
            timeout: Duration::from_secs(5),
        }
        .run()
        .await
        .expect("env var visible to child");
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let err = ToolInvocation {
            tool: "/nonexistent/vaultdump-tool",
            args: vec![],
            envs: vec![],
            timeout: Duration::from_secs(1),
        }
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
