//! Subprocess adapter shared by every CLI-backed operation.
//!
//! A [`CommandRunner`] executes one external binary and classifies the
//! outcome into the gateway error taxonomy. [`CliTool`] binds a runner to one
//! tool and exposes the three output modes: NDJSON records, raw text and a
//! single JSON document. Long-lived commands are read line by line through a
//! [`LineStream`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{truncate_chars, GatewayError, Result, MAX_DIAGNOSTIC_CHARS};
use crate::metrics::MetricsCollector;
use crate::normalizer::RawRecord;

/// Identity of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    /// Short name used in errors and logs
    pub name: String,
    /// Binary name or path
    pub program: String,
    /// Install guidance shown when the binary is missing
    pub install_hint: String,
}

impl ToolSpec {
    /// The `imsg` Messages CLI.
    #[must_use]
    pub fn imsg(program: &str) -> Self {
        Self {
            name: "imsg".to_string(),
            program: program.to_string(),
            install_hint: "Install with: brew install steipete/tap/imsg".to_string(),
        }
    }

    /// The `remindctl` Reminders CLI.
    #[must_use]
    pub fn remindctl(program: &str) -> Self {
        Self {
            name: "remindctl".to_string(),
            program: program.to_string(),
            install_hint: "Install with: brew install steipete/tap/remindctl".to_string(),
        }
    }

    fn not_found(&self) -> GatewayError {
        GatewayError::ToolNotFound {
            tool: self.name.clone(),
            hint: self.install_hint.clone(),
        }
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Decoded stdout
    pub stdout: String,
    /// Decoded stderr
    pub stderr: String,
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ToolOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Executes external binaries. The seam tests replace.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, killing the process if `limit` elapses.
    async fn run(&self, tool: &ToolSpec, args: &[String], limit: Duration) -> Result<ToolOutput>;

    /// Start a long-lived process whose stdout is read line by line.
    async fn spawn_lines(&self, tool: &ToolSpec, args: &[String]) -> Result<LineStream>;
}

/// Render a command line for logs and dry runs, quoting where needed.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, tool: &ToolSpec, args: &[String], limit: Duration) -> Result<ToolOutput> {
        debug!(command = %command_line(&tool.program, args), "Executing");

        let mut child = Command::new(&tool.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(tool, e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Other(format!("{} stdout was not captured", tool.name)))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Other(format!("{} stderr was not captured", tool.name)))?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let collected = timeout(limit, async {
            tokio::try_join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err), child.wait())
        })
        .await;

        match collected {
            Ok(Ok((_, _, status))) => Ok(ToolOutput {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                code: status.code(),
            }),
            Ok(Err(e)) => Err(GatewayError::Io(e)),
            Err(_) => {
                warn!(tool = %tool.name, timeout_secs = limit.as_secs_f64(), "Command timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(tool = %tool.name, error = %e, "Failed to kill timed out command");
                }
                Err(GatewayError::Timeout {
                    tool: tool.name.clone(),
                    seconds: limit.as_secs_f64(),
                })
            },
        }
    }

    async fn spawn_lines(&self, tool: &ToolSpec, args: &[String]) -> Result<LineStream> {
        debug!(command = %command_line(&tool.program, args), "Starting stream");
        LineStream::spawn(tool, args)
    }
}

fn spawn_error(tool: &ToolSpec, err: std::io::Error) -> GatewayError {
    if err.kind() == std::io::ErrorKind::NotFound {
        tool.not_found()
    } else {
        GatewayError::Io(err)
    }
}

/// A running process read one stdout line at a time.
///
/// The child is killed when the stream is dropped; [`LineStream::terminate`]
/// additionally waits for it to be reaped.
#[derive(Debug)]
pub struct LineStream {
    tool: String,
    child: Child,
    reader: BufReader<ChildStdout>,
    buf: Vec<u8>,
    stderr: Option<JoinHandle<String>>,
    line_no: usize,
}

impl LineStream {
    /// Spawn `tool` with `args`, capturing stdout and stderr.
    pub fn spawn(tool: &ToolSpec, args: &[String]) -> Result<Self> {
        let mut child = Command::new(&tool.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(tool, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Other(format!("{} stdout was not captured", tool.name)))?;

        // Drain stderr concurrently so a chatty process never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        Ok(Self {
            tool: tool.name.clone(),
            child,
            reader: BufReader::new(stdout),
            buf: Vec::new(),
            stderr,
            line_no: 0,
        })
    }

    /// OS process id, while the process is running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Name of the tool behind this stream.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Next line of stdout with its 1-based line number; `None` at EOF.
    /// Invalid UTF-8 is replaced rather than rejected, so a garbled line
    /// reaches the parser and is skipped there.
    pub async fn next_line(&mut self) -> Result<Option<(usize, String)>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }

        let mut line = self.buf.as_slice();
        if let Some(rest) = line.strip_suffix(b"\n") {
            line = rest.strip_suffix(b"\r").unwrap_or(rest);
        }
        self.line_no += 1;
        Ok(Some((self.line_no, String::from_utf8_lossy(line).into_owned())))
    }

    /// Wait for a process whose stdout has closed and classify its exit.
    pub async fn finish(mut self) -> Result<()> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if status.success() {
            Ok(())
        } else {
            Err(GatewayError::tool_failed(&self.tool, status.code().unwrap_or(-1), &stderr, ""))
        }
    }

    /// Kill the process if it is still running and reap it.
    pub async fn terminate(mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => {},
            _ => {
                if let Err(e) = self.child.kill().await {
                    warn!(tool = %self.tool, error = %e, "Failed to kill streaming command");
                }
            },
        }
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
        debug!(tool = %self.tool, "Stream terminated");
    }
}

/// Parse one NDJSON line. A line may hold one object or an array of objects.
pub fn parse_ndjson_line(tool: &str, line_no: usize, line: &str) -> Result<Vec<RawRecord>> {
    let skipped = |reason: String| GatewayError::ParseSkipped {
        tool: tool.to_string(),
        line: line_no,
        reason,
    };

    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(vec![RawRecord::new(map)]),
        Ok(Value::Array(items)) => Ok(items.into_iter().filter_map(RawRecord::from_value).collect()),
        Ok(other) => Err(skipped(format!("expected object or array, got {other}"))),
        Err(e) => Err(skipped(e.to_string())),
    }
}

/// Parse NDJSON output, skipping malformed lines. Returns the records and
/// how many lines were skipped.
#[must_use]
pub fn parse_ndjson(tool: &str, output: &str) -> (Vec<RawRecord>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;

    for (idx, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_ndjson_line(tool, idx + 1, line) {
            Ok(parsed) => records.extend(parsed),
            Err(e) => {
                warn!(error = %e, line = %truncate_chars(line, 100), "NDJSON parse error");
                skipped += 1;
            },
        }
    }

    (records, skipped)
}

/// One external tool bound to a runner.
#[derive(Clone)]
pub struct CliTool {
    spec: ToolSpec,
    runner: Arc<dyn CommandRunner>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for CliTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliTool").field("spec", &self.spec).finish_non_exhaustive()
    }
}

impl CliTool {
    /// Bind `spec` to `runner`.
    #[must_use]
    pub fn new(spec: ToolSpec, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            spec,
            runner,
            metrics: MetricsCollector::default(),
        }
    }

    /// The tool this adapter drives.
    #[must_use]
    pub const fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    /// Render the full command line for `args`.
    #[must_use]
    pub fn command_line(&self, args: &[String]) -> String {
        command_line(&self.spec.program, args)
    }

    async fn execute(&self, args: &[String], limit: Duration) -> Result<ToolOutput> {
        let started = Instant::now();
        let result = self.runner.run(&self.spec, args, limit).await;

        let outcome = match &result {
            Ok(output) if output.success() => "success",
            Ok(_) => "failed",
            Err(e) => match e.kind() {
                crate::error::ErrorKind::Timeout => "timeout",
                crate::error::ErrorKind::ToolNotFound => "not_found",
                _ => "error",
            },
        };
        self.metrics.record_tool_call(&self.spec.name, outcome, started.elapsed());

        let output = result?;
        if output.success() {
            Ok(output)
        } else {
            Err(GatewayError::tool_failed(
                &self.spec.name,
                output.code.unwrap_or(-1),
                &output.stderr,
                &output.stdout,
            ))
        }
    }

    /// Run and parse stdout as NDJSON records.
    pub async fn run_json(&self, args: &[String], limit: Duration) -> Result<Vec<RawRecord>> {
        let output = self.execute(args, limit).await?;
        let (records, skipped) = parse_ndjson(&self.spec.name, &output.stdout);
        if skipped > 0 {
            self.metrics.record_lines_skipped(&self.spec.name, skipped);
        }
        Ok(records)
    }

    /// Run and return stdout untouched.
    pub async fn run_raw(&self, args: &[String], limit: Duration) -> Result<String> {
        Ok(self.execute(args, limit).await?.stdout)
    }

    /// Run and parse stdout as one JSON document. Empty output is `None`
    /// when `allow_empty`, an error otherwise.
    pub async fn run_document(&self, args: &[String], limit: Duration, allow_empty: bool) -> Result<Option<Value>> {
        let output = self.execute(args, limit).await?;
        let body = output.stdout.trim();

        if body.is_empty() {
            return if allow_empty {
                Ok(None)
            } else {
                Err(GatewayError::UnexpectedOutput {
                    tool: self.spec.name.clone(),
                    detail: "no output".to_string(),
                })
            };
        }

        serde_json::from_str(body).map(Some).map_err(|e| GatewayError::UnexpectedOutput {
            tool: self.spec.name.clone(),
            detail: format!("{e}: {}", truncate_chars(body, MAX_DIAGNOSTIC_CHARS)),
        })
    }

    /// Start a long-lived command.
    pub async fn stream(&self, args: &[String]) -> Result<LineStream> {
        self.runner.spawn_lines(&self.spec, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_tool(output: ToolOutput) -> CliTool {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |_, _, _| Ok(output.clone()));
        CliTool::new(ToolSpec::imsg("imsg"), Arc::new(runner))
    }

    #[test]
    fn test_parse_ndjson_objects_and_arrays() {
        let output = "{\"id\": 1}\n\n[{\"id\": 2}, {\"id\": 3}, 4]\n";
        let (records, skipped) = parse_ndjson("imsg", output);
        assert_eq!(records.len(), 3);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_parse_ndjson_skips_malformed_lines() {
        let output = "{\"id\": 1}\n{not json\n\"scalar\"\n{\"id\": 2}\n";
        let (records, skipped) = parse_ndjson("imsg", output);
        assert_eq!(records.len(), 2);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_parse_ndjson_line_reports_line_number() {
        let err = parse_ndjson_line("imsg", 7, "{oops").unwrap_err();
        assert!(matches!(err, GatewayError::ParseSkipped { line: 7, .. }));
    }

    #[test]
    fn test_command_line_quotes_arguments() {
        let args = vec!["send".to_string(), "--text".to_string(), "it's here".to_string()];
        assert_eq!(command_line("imsg", &args), r#"imsg send --text 'it'"'"'s here'"#);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_tool_failed_with_stdout_fallback() {
        let tool = mock_tool(ToolOutput {
            stdout: "Error: chat 99 not found".into(),
            stderr: String::new(),
            code: Some(1),
        });
        let err = tool.run_raw(&[], Duration::from_secs(1)).await.unwrap_err();
        match err {
            GatewayError::ToolFailed { code, stderr, .. } => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "Error: chat 99 not found");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_document_empty_output() {
        let tool = mock_tool(ToolOutput {
            code: Some(0),
            ..ToolOutput::default()
        });
        assert!(tool.run_document(&[], Duration::from_secs(1), true).await.unwrap().is_none());
        let err = tool.run_document(&[], Duration::from_secs(1), false).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedOutput { .. }));
    }

    #[tokio::test]
    async fn test_run_document_invalid_json() {
        let tool = mock_tool(ToolOutput {
            stdout: "not json".into(),
            code: Some(0),
            ..ToolOutput::default()
        });
        let err = tool.run_document(&[], Duration::from_secs(1), false).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedOutput { .. }));
    }
}
