use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Execute a command safely without shell injection.
/// All arguments must be provided separately.
pub fn execute_command<S: AsRef<OsStr>>(program: S, args: &[S]) -> Result<CommandOutput> {
    let program_str = program.as_ref().to_string_lossy().to_string();
    let args_str = join_args(args);

    debug!("Executing command: {} {}", program_str, args_str);

    let output = Command::new(&program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("Failed to execute command: {}", program_str))?;

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
    };
    log_outcome(&program_str, &args_str, &result);
    Ok(result)
}

/// Execute a command and capture stdout as a string.
pub fn execute_command_capture_stdout<S: AsRef<OsStr>>(program: S, args: &[S]) -> Result<String> {
    let output = execute_command(program, args)?;
    if !output.success {
        anyhow::bail!("Command failed: {}", output.stderr);
    }
    Ok(output.stdout.trim().to_string())
}

/// Run a command, handing each stdout line to `on_line` as it arrives.
///
/// stderr is drained on a separate thread so a chatty child cannot block on a
/// full pipe. Spawn failures are returned as the raw `io::Error` so callers can
/// tell a missing executable (`NotFound`) apart from other failures.
pub fn stream_command<S, F>(program: S, args: &[S], mut on_line: F) -> std::io::Result<CommandOutput>
where
    S: AsRef<OsStr>,
    F: FnMut(&str),
{
    let program_str = program.as_ref().to_string_lossy().to_string();
    let args_str = join_args(args);
    debug!("Streaming command: {} {}", program_str, args_str);

    let mut child = Command::new(&program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).to_string()
        })
    });

    let mut stdout = String::new();
    if let Some(pipe) = child.stdout.take() {
        if let Err(e) = read_lines(BufReader::new(pipe), &mut on_line, &mut stdout) {
            let stderr = abort_child(&mut child, stderr_reader);
            warn!("Lost output of {}: {}", program_str, e);
            if !stderr.trim().is_empty() {
                debug!("stderr: {}", stderr.trim());
            }
            return Err(e);
        }
    }

    let status = child.wait()?;
    let stderr = join_stderr(stderr_reader);

    let result = CommandOutput {
        success: status.success(),
        stdout,
        stderr,
        exit_code: status.code(),
    };
    log_outcome(&program_str, &args_str, &result);
    Ok(result)
}

fn read_lines<R, F>(reader: R, on_line: &mut F, stdout: &mut String) -> std::io::Result<()>
where
    R: BufRead,
    F: FnMut(&str),
{
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches('\r');
        on_line(line);
        stdout.push_str(line);
        stdout.push('\n');
    }
    Ok(())
}

/// Kill and reap `child` after its output could not be read, returning
/// whatever stderr it produced.
fn abort_child(child: &mut Child, stderr_reader: Option<JoinHandle<String>>) -> String {
    if let Err(e) = child.kill() {
        debug!("Kill failed: {}", e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap child process: {}", e);
    }
    join_stderr(stderr_reader)
}

fn join_stderr(stderr_reader: Option<JoinHandle<String>>) -> String {
    match stderr_reader {
        Some(handle) => handle.join().unwrap_or_default(),
        None => String::new(),
    }
}

fn join_args<S: AsRef<OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|a| a.as_ref().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn log_outcome(program: &str, args: &str, output: &CommandOutput) {
    if !output.success {
        warn!(
            "Command failed: {} {} (exit code: {:?})",
            program, args, output.exit_code
        );
        warn!("stderr: {}", output.stderr.trim());
    } else {
        debug!("Command succeeded: {} {}", program, args);
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_command_real() {
        let output = execute_command("echo", &["test"]).unwrap();
        assert!(output.success);
        assert!(output.stdout.contains("test"));
    }

    #[test]
    fn test_execute_command_failure() {
        let output = execute_command("false", &[]).unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(1));
    }

    #[test]
    fn test_capture_stdout_trims() {
        let out = execute_command_capture_stdout("echo", &["  padded  "]).unwrap();
        assert_eq!(out, "padded");
    }

    #[test]
    fn test_stream_command_emits_lines() {
        let mut lines = Vec::new();
        let output = stream_command("printf", &["one\ntwo\nthree\n"], |line| {
            lines.push(line.to_string())
        })
        .unwrap();
        assert!(output.success);
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_stream_command_captures_stderr() {
        let output = stream_command("sh", &["-c", "echo oops >&2; exit 3"], |_| {}).unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.trim(), "oops");
    }

    /// Yields one chunk, then fails.
    struct BrokenPipe {
        chunk: Option<&'static [u8]>,
    }

    impl Read for BrokenPipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunk.take() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed")),
            }
        }
    }

    #[test]
    fn test_read_lines_stops_on_error() {
        let mut lines = Vec::new();
        let mut stdout = String::new();
        let reader = BufReader::new(BrokenPipe {
            chunk: Some(b"first\r\nsecond\n"),
        });
        let err = read_lines(reader, &mut |line: &str| lines.push(line.to_string()), &mut stdout)
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(lines, vec!["first", "second"]);
        assert_eq!(stdout, "first\nsecond\n");
    }

    #[test]
    fn test_abort_child_reaps_process() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).to_string()
            })
        });

        let stderr = abort_child(&mut child, stderr_reader);
        assert!(stderr.is_empty());
        let status = child.try_wait().unwrap().expect("child was reaped");
        assert!(!status.success());
    }

    #[test]
    fn test_stream_command_missing_program() {
        let err = stream_command("definitely-not-a-real-program-xyz", &[], |_| {}).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
