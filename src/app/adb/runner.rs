use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::app::error::AppError;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Completion handle for a command started with [`CommandRunner::run_async`].
pub trait CommandWait: Send {
    /// Blocks until the process exits and yields its captured output.
    fn communicate(self: Box<Self>) -> Result<CommandOutput, AppError>;
}

/// Process-invocation seam for everything that touches a device.
///
/// The production implementation shells out to adb; tests substitute a
/// scripted double so lifecycle choreography can be asserted command by
/// command.
pub trait CommandRunner: Send + Sync {
    /// Runs `program args..` synchronously. Fails with `ERR_COMMAND` on a
    /// nonzero exit, a broken pipe, or the timeout elapsing; the error
    /// message carries the argv and captured stderr.
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError>;

    /// Spawns `program args..` and returns a handle whose `communicate()`
    /// blocks on completion. Used for long-running generators whose events
    /// are reported out-of-band.
    fn run_async(
        &self,
        program: &str,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn CommandWait>, AppError>;
}

pub fn render_argv(program: &str, args: &[String]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Runs commands through `std::process`, draining stdout/stderr on separate
/// threads while polling for exit.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let output = capture_with_timeout(program, args, timeout, trace_id)?;
        if !output.success() {
            return Err(AppError::command(
                format!(
                    "Command failed ({}): `{}`: {}",
                    output
                        .exit_code
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| "killed".to_string()),
                    render_argv(program, args),
                    output.stderr.trim()
                ),
                trace_id,
            ));
        }
        Ok(output)
    }

    fn run_async(
        &self,
        program: &str,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn CommandWait>, AppError> {
        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::system(format!("Failed to spawn command: {err}"), trace_id))?;
        Ok(Box::new(ProcessWait {
            child,
            trace_id: trace_id.to_string(),
        }))
    }
}

struct ProcessWait {
    child: std::process::Child,
    trace_id: String,
}

impl CommandWait for ProcessWait {
    fn communicate(self: Box<Self>) -> Result<CommandOutput, AppError> {
        let output = self.child.wait_with_output().map_err(|err| {
            AppError::system(format!("Failed to wait for command: {err}"), &self.trace_id)
        })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}

fn capture_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn command: {err}"), trace_id))?;

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can
    // block once the pipe buffer fills, and we will incorrectly hit the
    // timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let stdout_handle = std::thread::spawn(move || drain(stdout));
    let stderr_handle = std::thread::spawn(move || drain(stderr));

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::command(
                        format!(
                            "Command timed out after {}s: `{}`",
                            timeout.as_secs(),
                            render_argv(program, args)
                        ),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn drain(mut reader: impl Read) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    buffer
}
