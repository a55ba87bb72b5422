use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' did not finish within {timeout:?} and was killed")]
    Timeout { program: String, timeout: Duration },
    #[error("'{program}' {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("error waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a tool invocation that exited successfully.
#[derive(Debug, Default, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external command-line tools with a hard timeout.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    pub timeout: Duration,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Spawns `program args..`, waits up to the timeout, and fails on a
    /// non-zero exit. The child is killed when the timeout expires.
    pub fn run<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<ToolOutput, ToolError> {
        let mut cmd = Command::new(program);
        for arg in args {
            cmd.arg(arg.as_ref());
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(
            "running {program} {}",
            args.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(" ")
        );

        let mut child = spawn(program, &mut cmd)?;
        // Pipes are drained while the child runs so a full pipe buffer never
        // stalls it into the timeout.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_timeout(program, &mut child, self.timeout)?;

        let output = ToolOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        if status.success() {
            Ok(output)
        } else {
            Err(ToolError::Failed {
                program: program.to_string(),
                status: describe_status(&status),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

// ETXTBSY: a freshly written tool script can still be held open by a
// concurrently forked process for a brief moment.
const TEXT_FILE_BUSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

fn spawn(program: &str, cmd: &mut Command) -> Result<Child, ToolError> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < SPAWN_ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(POLL_INTERVAL * attempt);
            }
            Err(source) => {
                return Err(ToolError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
        }
    }
}

fn wait_with_timeout(
    program: &str,
    child: &mut Child,
    timeout: Duration,
) -> Result<ExitStatus, ToolError> {
    let start_time = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if start_time.elapsed() > timeout {
                    warn!("{program} timed out after {timeout:?}, killing");
                    if let Err(e) = child.kill() {
                        warn!("failed to kill {program}: {e}");
                    }
                    let _ = child.wait();
                    return Err(ToolError::Timeout {
                        program: program.to_string(),
                        timeout,
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                return Err(ToolError::Wait {
                    program: program.to_string(),
                    source,
                });
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited abnormally".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_of_successful_tool() {
        let runner = ToolRunner::new(Duration::from_secs(5));
        let output = runner.run("sh", &["-c", "echo disarmed"]).unwrap();
        assert_eq!(output.stdout.trim(), "disarmed");
    }

    #[test]
    fn non_zero_exit_is_reported_with_stderr() {
        let runner = ToolRunner::new(Duration::from_secs(5));
        match runner.run("sh", &["-c", "echo nope >&2; exit 3"]) {
            Err(ToolError::Failed { status, stderr, .. }) => {
                assert!(status.contains("code 3"), "Unexpected status: {status}");
                assert_eq!(stderr, "nope");
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn hung_tool_is_killed_on_timeout() {
        let runner = ToolRunner::new(Duration::from_millis(100));
        let started = Instant::now();
        let result = runner.run("sh", &["-c", "sleep 5"]);
        assert!(matches!(result, Err(ToolError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn output_larger_than_a_pipe_buffer_is_collected() {
        let runner = ToolRunner::new(Duration::from_secs(5));
        let output = runner
            .run("sh", &["-c", "yes x | head -c 200000; echo done >&2"])
            .unwrap();
        assert_eq!(output.stdout.len(), 200_000);
        assert_eq!(output.stderr.trim(), "done");
    }

    #[test]
    fn missing_tool_fails_to_spawn() {
        let runner = ToolRunner::new(Duration::from_secs(1));
        let result = runner.run::<&str>("./this_tool_does_not_exist_12345", &[]);
        assert!(matches!(result, Err(ToolError::Spawn { .. })));
    }
}
