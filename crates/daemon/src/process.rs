//! Process runner for external tools.
//!
//! Spawns a single executable, streams its standard output and diagnostic
//! (stderr) text to optional per-invocation line callbacks, and resolves by
//! exit code. There is no retry: a failing invocation fails the caller.

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::trace;

/// Number of trailing diagnostic lines kept in error messages.
const DIAGNOSTIC_TAIL_LINES: usize = 5;

/// Error type for external process execution
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the process streams or waiting for exit failed
    #[error("IO error while running process: {0}")]
    Io(#[from] std::io::Error),

    /// The process exited with a non-zero status (code -1 when killed by a signal)
    #[error("{program} exited with code {code}: {}", diagnostic_tail(.stderr))]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },
}

/// Last few non-empty lines of a diagnostic stream, joined with " | ".
fn diagnostic_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    lines[start..].join(" | ")
}

/// Callback invoked once per line of a process stream.
pub type LineCallback<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Optional line callbacks attached to a single invocation.
#[derive(Default)]
pub struct StreamHandlers<'a> {
    pub stdout: Option<LineCallback<'a>>,
    pub stderr: Option<LineCallback<'a>>,
}

impl<'a> StreamHandlers<'a> {
    /// Handlers with only a diagnostic-stream callback.
    pub fn diagnostics(on_line: LineCallback<'a>) -> Self {
        Self {
            stdout: None,
            stderr: Some(on_line),
        }
    }
}

/// Everything a successful process wrote.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args` to completion.
///
/// Both streams are read concurrently and delivered line by line as they
/// arrive. Lines are terminated by `\n` or `\r`, since ffmpeg rewrites its
/// status line with carriage returns.
///
/// # Returns
/// * `Ok(ProcessOutput)` - zero exit code, with the accumulated stream text
/// * `Err(ProcessError::Failed)` - non-zero exit, with code and diagnostic text
pub async fn run_process(
    program: &Path,
    args: &[String],
    handlers: StreamHandlers<'_>,
) -> Result<ProcessOutput, ProcessError> {
    let program_name = program.to_string_lossy().to_string();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program_name.clone(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

    let StreamHandlers {
        stdout: on_stdout,
        stderr: on_stderr,
    } = handlers;

    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    let (stdout_result, stderr_result) = tokio::join!(
        pump_lines(stdout, on_stdout, &mut stdout_bytes),
        pump_lines(stderr, on_stderr, &mut stderr_bytes),
    );
    stdout_result?;
    stderr_result?;

    let status = child.wait().await?;
    let output = ProcessOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
    };

    if status.success() {
        Ok(output)
    } else {
        Err(ProcessError::Failed {
            program: program_name,
            code: status.code().unwrap_or(-1),
            stderr: output.stderr,
        })
    }
}

/// Copy `reader` into `sink`, invoking `on_line` for every complete line.
async fn pump_lines<R>(
    mut reader: R,
    mut on_line: Option<LineCallback<'_>>,
    sink: &mut Vec<u8>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        sink.extend_from_slice(&chunk[..n]);
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            emit_line(&line[..line.len() - 1], &mut on_line);
        }
    }

    if !pending.is_empty() {
        emit_line(&pending, &mut on_line);
    }

    Ok(())
}

fn emit_line(bytes: &[u8], on_line: &mut Option<LineCallback<'_>>) {
    if bytes.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(bytes);
    trace!(line = %text, "process output");
    if let Some(callback) = on_line.as_deref_mut() {
        callback(&text);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_success_returns_both_streams() {
        let (program, args) = sh("echo hello; echo diag 1>&2");
        let output = run_process(&program, &args, StreamHandlers::default())
            .await
            .expect("sh should succeed");

        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "diag");
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_code_and_diagnostics() {
        let (program, args) = sh("echo 'first problem' 1>&2; echo 'fatal problem' 1>&2; exit 3");
        let err = run_process(&program, &args, StreamHandlers::default())
            .await
            .unwrap_err();

        match &err {
            ProcessError::Failed { code, stderr, .. } => {
                assert_eq!(*code, 3);
                assert!(stderr.contains("fatal problem"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(err.to_string().contains("exited with code 3"));
        assert!(err.to_string().contains("fatal problem"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let err = run_process(
            Path::new("/nonexistent/tool-xyz-12345"),
            &[],
            StreamHandlers::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_callbacks_receive_lines_split_on_cr_and_lf() {
        let (program, args) = sh("printf 'a\\rb\\nc' 1>&2; printf 'x\\ny\\n'");

        let mut diag_lines = Vec::new();
        let mut out_lines = Vec::new();
        let mut on_diag = |line: &str| diag_lines.push(line.to_string());
        let mut on_out = |line: &str| out_lines.push(line.to_string());

        run_process(
            &program,
            &args,
            StreamHandlers {
                stdout: Some(&mut on_out),
                stderr: Some(&mut on_diag),
            },
        )
        .await
        .expect("sh should succeed");

        assert_eq!(diag_lines, vec!["a", "b", "c"]);
        assert_eq!(out_lines, vec!["x", "y"]);
    }

    #[test]
    fn test_diagnostic_tail_keeps_last_lines() {
        let stderr = "1\n2\n3\n\n4\r5\n6\n7\n";
        assert_eq!(diagnostic_tail(stderr), "3 | 4 | 5 | 6 | 7");
    }
}
