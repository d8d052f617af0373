use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub type CommandRunner = Arc<dyn Fn(String) -> BoxFuture<'static, Result<CommandOutput>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// A shell command with `@NAME@` placeholders filled in per call.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
}

impl fmt::Debug for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandTemplate").field(&self.raw).finish()
    }
}

impl CommandTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn render(&self, substitutions: &[(&str, &str)]) -> String {
        substitutions
            .iter()
            .fold(self.raw.clone(), |cmd, (placeholder, value)| {
                cmd.replace(placeholder, &shell_quote(value))
            })
    }
}

/// Single-quote `value` for `sh -c` unless it is plainly safe.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ',' | ':' | '='));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

pub fn default_runner() -> CommandRunner {
    Arc::new(|command| run_shell(command).boxed())
}

async fn run_shell(command: String) -> Result<CommandOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `command` through `runner`, bounded by `limit`, and require exit 0.
///
/// Dropping the runner future on timeout kills the child process.
pub async fn run_checked(
    runner: &CommandRunner,
    operation: &'static str,
    command: String,
    limit: Duration,
) -> Result<CommandOutput> {
    debug!(operation, command, "running command");
    let output = match tokio::time::timeout(limit, runner(command.clone())).await {
        Ok(result) => result.map_err(|err| Error::device(operation, err.to_string()))?,
        Err(_) => {
            warn!(operation, command, timeout = ?limit, "command timed out");
            return Err(Error::device(
                operation,
                format!("timed out after {}", humantime::format_duration(limit)),
            ));
        }
    };

    if !output.success() {
        let exit = output
            .status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        warn!(
            operation,
            exit_code = exit,
            stderr = output.stderr.trim(),
            command,
            "command failed"
        );
        return Err(Error::device(
            operation,
            format!("exit {exit}: {}", output.stderr.trim()),
        ));
    }
    Ok(output)
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use std::os::unix::process::ExitStatusExt;

    pub fn status(code: i32) -> ExitStatus {
        ExitStatus::from_raw((code & 0xff) << 8)
    }

    pub fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            status: status(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Replays canned outputs in order and records every command it saw.
    #[derive(Clone, Default)]
    pub struct StubRunner {
        pub responses: Arc<Mutex<VecDeque<CommandOutput>>>,
        pub seen: Arc<Mutex<Vec<String>>>,
    }

    impl StubRunner {
        pub fn with(responses: Vec<CommandOutput>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                seen: Arc::default(),
            }
        }

        pub fn commands(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }

        pub fn runner(&self) -> CommandRunner {
            let stub = self.clone();
            Arc::new(move |command: String| {
                stub.seen.lock().unwrap().push(command.clone());
                let next = stub.responses.lock().unwrap().pop_front();
                async move {
                    next.ok_or_else(|| {
                        Error::Io(std::io::Error::other(format!(
                            "no stubbed response for command '{command}'"
                        )))
                    })
                }
                .boxed()
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("MY_F0123"), "MY_F0123");
        assert_eq!(shell_quote("/tmp/snap.png"), "/tmp/snap.png");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn renders_placeholders() {
        let template = CommandTemplate::new("tv-updater set @ID@");
        assert_eq!(
            template.render(&[("@ID@", "MY_F0042")]),
            "tv-updater set MY_F0042"
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_device_error() {
        let stub = StubRunner::with(vec![output(2, "", "no route to host\n")]);
        let err = run_checked(
            &stub.runner(),
            "select",
            "tv-updater set x".to_string(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, Error::Device { operation: "select", ref message } if message.contains("no route to host")),
            "unexpected error: {err}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_command_times_out() {
        let runner: CommandRunner = Arc::new(|_command: String| {
            async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok::<_, Error>(output(0, "", ""))
            }
            .boxed()
        });
        let err = run_checked(&runner, "list", "slow".to_string(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Device { operation: "list", .. }));
    }

    #[tokio::test]
    async fn default_runner_captures_stdout() {
        let out = run_checked(
            &default_runner(),
            "list",
            "printf 'a\\tb\\n'".to_string(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "a\tb\n");
    }
}
