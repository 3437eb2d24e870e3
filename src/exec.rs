//! External command execution with a deadline
//!
//! Firewall, proxy-engine and lifecycle adapters all shell out through
//! [`CommandRunner`]. The managers are synchronous, so the runner owns a
//! small tokio runtime and blocks on `tokio::process` futures bounded by
//! `tokio::time::timeout`. A command that outlives the deadline is killed.
//!
//! The runner blocks the calling thread and must not be used from inside
//! another tokio runtime.

use crate::error::{NetplaneError, Result};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs, bounded by a timeout
#[derive(Debug, Clone)]
pub struct CommandRunner {
    runtime: Arc<Runtime>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("netplane-exec")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime: Arc::new(runtime),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a command and return its output whatever the exit status
    pub fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = self.runtime.block_on(async {
            tokio::time::timeout(self.timeout, command.output()).await
        });

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(NetplaneError::Command(format!("{}: {}", program, e))),
            Err(_) => {
                return Err(NetplaneError::Timeout(format!(
                    "{} {} did not finish within {:?}",
                    program,
                    args.join(" "),
                    self.timeout
                )))
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a command, failing on a non-zero exit status
    pub fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let output = self.output(program, args)?;
        if !output.success {
            return Err(NetplaneError::Command(format!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Convert string literals into owned arguments
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn runner(secs: u64) -> CommandRunner {
        CommandRunner::new(Duration::from_secs(secs)).unwrap()
    }

    #[test]
    fn test_run_captures_stdout() {
        let out = runner(30).run("sh", &args(["-c", "echo hello"])).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_run_reports_failure() {
        let err = runner(30)
            .run("sh", &args(["-c", "echo oops >&2; exit 3"]))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with 3"));
        assert!(msg.contains("oops"));
    }

    #[test]
    fn test_timeout_kills_command() {
        let runner = CommandRunner::new(Duration::from_millis(100)).unwrap();
        let started = Instant::now();
        let err = runner.run("sleep", &args(["5"])).unwrap_err();
        assert!(matches!(err, NetplaneError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program() {
        let err = runner(30).run("/nonexistent/netplane-test", &[]).unwrap_err();
        assert!(matches!(err, NetplaneError::Command(_)));
    }

    #[test]
    fn test_runner_shared_across_threads() {
        let runner = runner(30);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let runner = runner.clone();
                std::thread::spawn(move || {
                    runner
                        .run("sh", &args(["-c".to_string(), format!("echo {}", i)]))
                        .unwrap()
                })
            })
            .collect();

        let mut outputs: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().unwrap().trim().to_string())
            .collect();
        outputs.sort();
        assert_eq!(outputs, vec!["0", "1", "2", "3"]);
    }
}
