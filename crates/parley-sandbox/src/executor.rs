//! Snippet executor
//!
//! Runs a scanned snippet in an isolated interpreter process with a hard
//! wall-clock budget. The child is killed at the budget regardless of its
//! internal state; the caller never blocks past budget plus a small fixed
//! overhead. Output is captured, size-capped, and decoded before being
//! handed back.

#![allow(clippy::module_name_repetitions)]

use crate::error::{Error, Result};
use crate::job::ExecutionJob;
use crate::scan::ImportScanner;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Marker separating snippet stdout from the serialized result
const RESULT_MARKER: &str = "---8f1c-result---";

/// Helper utilities injected ahead of every snippet. They cover the common
/// data operations so that snippets rarely need raw access to anything
/// beyond the allow-listed modules.
const HELPER_PRELUDE: &str = r#"
import json as _json

def coerce_num(value, default=None):
    if isinstance(value, (int, float)):
        return value
    try:
        text = str(value).strip().replace(",", "")
        return float(text) if "." in text else int(text)
    except (TypeError, ValueError):
        return default

def top_n(rows, key, n=5):
    ranked = sorted(rows, key=lambda r: coerce_num(r.get(key), 0), reverse=True)
    return ranked[:n]

def suggest_column(name, columns):
    wanted = str(name).strip().lower()
    for col in columns:
        if col.lower() == wanted:
            return col
    for col in columns:
        if wanted in col.lower() or col.lower() in wanted:
            return col
    return None
"#;

/// Configuration for the sandbox executor
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter argv; the program is fed on stdin
    pub interpreter: Vec<String>,
    /// Budget applied when a job does not carry its own
    pub default_timeout: Duration,
    /// PATH value exposed to the child (everything else is scrubbed)
    pub child_path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-I".to_string(), "-".to_string()],
            default_timeout: Duration::from_secs(30),
            child_path: "/usr/bin:/bin".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Set the interpreter argv
    #[must_use]
    pub fn with_interpreter(mut self, argv: Vec<String>) -> Self {
        self.interpreter = argv;
        self
    }

    /// Set the fallback budget
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Result of a successful snippet run
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Decoded value of the snippet's `result` variable
    pub value: serde_json::Value,
    /// Anything the snippet printed before the result
    pub stdout: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Sandboxed snippet executor
pub struct SandboxExecutor {
    config: SandboxConfig,
    scanner: ImportScanner,
}

impl SandboxExecutor {
    /// Create an executor with the given configuration
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            scanner: ImportScanner::new(),
        }
    }

    /// Create an executor with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(SandboxConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run a job to completion, hard-killing it at its budget.
    #[instrument(skip(self, job), fields(job_id = %job.id, timeout_ms = %job.timeout.as_millis()))]
    pub async fn run(&self, job: &ExecutionJob) -> Result<RunOutput> {
        self.run_with_cancel(job, &CancellationToken::new()).await
    }

    /// Run a job with cooperative cancellation. Cancelling the token kills
    /// the child; a cancelled run is equivalent to no run for the caller's
    /// state purposes.
    #[instrument(skip(self, job, cancel), fields(job_id = %job.id))]
    pub async fn run_with_cancel(
        &self,
        job: &ExecutionJob,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        // Reject disallowed capabilities before any process exists
        self.scanner.scan(&job.source, &job.allowed_imports)?;

        let program = self.assemble_program(job)?;
        let (argv0, rest) = self
            .config
            .interpreter
            .split_first()
            .ok_or_else(|| Error::Spawn("empty interpreter argv".to_string()))?;

        let mut child = tokio::process::Command::new(argv0)
            .args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env("PATH", &self.config.child_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", argv0, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("child stdin unavailable".to_string()))?;
        stdin.write_all(program.as_bytes()).await?;
        drop(stdin);

        let start = Instant::now();
        // A zero job budget means "use the executor default"
        let budget = if job.timeout.is_zero() {
            self.config.default_timeout
        } else {
            job.timeout
        };
        let collect = child.wait_with_output();
        tokio::pin!(collect);

        let output = tokio::select! {
            outcome = tokio::time::timeout(budget, &mut collect) => match outcome {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(Error::Execution(format!("wait failed: {}", e))),
                Err(_) => {
                    // Dropping the pinned future reaps the child (kill_on_drop)
                    warn!(job_id = %job.id, budget_ms = %budget.as_millis(), "snippet killed at budget");
                    return Err(Error::Timeout(budget.as_millis() as u64));
                }
            },
            () = cancel.cancelled() => {
                debug!(job_id = %job.id, "snippet run cancelled");
                return Err(Error::Cancelled);
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        if output.stdout.len() + output.stderr.len() > job.max_output_bytes {
            return Err(Error::OutputRejected(format!(
                "output exceeds {} bytes",
                job.max_output_bytes
            )));
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Execution(clip(stderr.trim(), 500)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let (printed, value) = split_result(&stdout)?;

        debug!(
            job_id = %job.id,
            duration_ms = duration_ms,
            stdout_len = printed.len(),
            "snippet run completed"
        );

        Ok(RunOutput {
            value,
            stdout: printed,
            duration_ms,
        })
    }

    /// Assemble the full program: helper prelude, parameter bindings, the
    /// snippet itself, and the result footer.
    fn assemble_program(&self, job: &ExecutionJob) -> Result<String> {
        let bindings = serde_json::to_string(&job.bindings)
            .map_err(|e| Error::Execution(format!("unencodable bindings: {}", e)))?;
        let escaped = bindings.replace('\\', "\\\\").replace('"', "\\\"");

        Ok(format!(
            "{prelude}\nparams = _json.loads(\"{escaped}\")\nresult = None\n{source}\nprint(\"{marker}\")\nprint(_json.dumps(result, default=str))\n",
            prelude = HELPER_PRELUDE,
            escaped = escaped,
            source = job.source,
            marker = RESULT_MARKER,
        ))
    }
}

/// Split captured stdout into snippet-printed text and the decoded result.
fn split_result(stdout: &str) -> Result<(String, serde_json::Value)> {
    let Some(idx) = stdout.rfind(RESULT_MARKER) else {
        return Err(Error::OutputRejected(
            "result marker missing from output".to_string(),
        ));
    };
    let printed = stdout[..idx].trim_end().to_string();
    let tail = stdout[idx + RESULT_MARKER.len()..].trim();
    let value = serde_json::from_str(tail)
        .map_err(|e| Error::OutputRejected(format!("result is not valid JSON: {}", e)))?;
    Ok((printed, value))
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}...", &text[..max])
    }
}
