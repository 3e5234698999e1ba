use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use tracing::debug;

use crate::error::ProcessError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs external commands with a deadline.
///
/// Every VCS and backend call goes through here, so a hanging clone or build
/// is killed after `timeout` instead of stalling its worker forever.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `program` with `args` and returns its standard output.
    pub fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Utf8Path>,
    ) -> Result<String, ProcessError> {
        let command = format!("{program} {}", args.join(" "));
        debug!("$ {command}");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

        // Drained on their own threads so a chatty child can't fill the pipe
        // and block while we wait for it.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::Timeout {
                    command,
                    seconds: self.timeout.as_secs(),
                });
            }

            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            return Err(ProcessError::Failed {
                command,
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(stdout)
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout() {
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let out = runner.run("sh", &["-c", "echo kasane"], None).unwrap();
        assert_eq!(out.trim(), "kasane");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let error = runner
            .run("sh", &["-c", "echo broken >&2; exit 3"], None)
            .unwrap_err();

        match error {
            ProcessError::Failed { stderr, status, .. } => {
                assert_eq!(stderr, "broken");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_deadline_kills_child() {
        let runner = ProcessRunner::new(Duration::from_millis(200));
        let start = Instant::now();
        let error = runner.run("sleep", &["10"], None).unwrap_err();

        assert!(matches!(error, ProcessError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program() {
        let runner = ProcessRunner::new(Duration::from_secs(1));
        let error = runner
            .run("kasane-definitely-not-installed", &[], None)
            .unwrap_err();
        assert!(matches!(error, ProcessError::Spawn { .. }));
    }
}
