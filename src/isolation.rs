//! Isolation layer: one disposable worker process per job
//!
//! The parent writes a single JSON line describing the job to the worker's
//! stdin; the worker writes a single JSON line holding the canonical result to
//! its stdout and exits. The parent kills the worker on timeout or
//! cancellation, and always reaps it afterwards.

use std::io::{BufRead, Write};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::WorkerConfig;
use crate::engine::Harness;
use crate::normalize::normalize;
use crate::sandbox::ExecutionLimits;
use crate::types::{Cancelled, EngineError, ExecutionResult, InputPayload, Options, Target};

/// The request message sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolatedJob {
    pub target: Target,
    #[serde(default)]
    pub input: InputPayload,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub limits: ExecutionLimits,
}

impl IsolatedJob {
    /// Run the job on the current thread; this is what a worker does
    pub fn run(&self) -> ExecutionResult {
        match &self.target {
            Target::Tool(id) => id.entry().invoke(&self.input, &self.options),
            Target::Code(code) => {
                Harness::new().evaluate(code, &self.input, &self.options, &self.limits)
            }
        }
    }
}

/// Runs jobs in separate, killable worker processes
#[derive(Debug, Clone, Default)]
pub struct IsolationLayer {
    worker: WorkerConfig,
}

impl IsolationLayer {
    pub fn new(worker: WorkerConfig) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &WorkerConfig {
        &self.worker
    }

    /// Run `job` in a fresh worker, bounded by `deadline` and `cancel`
    ///
    /// Exactly one of result, timeout failure or `Cancelled` comes back, and
    /// the worker is gone when this returns.
    pub async fn run_isolated(
        &self,
        job: &IsolatedJob,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let deadline_ms = deadline.as_millis() as u64;
        let started = Instant::now();

        let payload = match serde_json::to_vec(job) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode isolated job");
                return Ok(ExecutionResult::internal("failed to encode job"));
            }
        };

        let mut child = match self.spawn_worker() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to start isolated context");
                return Ok(ExecutionResult::internal("failed to start isolated context"));
            }
        };
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            terminate(&mut child).await;
            error!(?pid, "isolated context has no pipes");
            return Ok(ExecutionResult::internal("isolated context unavailable"));
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(deadline) => Outcome::TimedOut,
            response = exchange(stdin, stdout, payload) => Outcome::Responded(response),
        };

        // The response may already be in; killing an exited worker is a no-op
        let status = terminate(&mut child).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Cancelled => {
                debug!(?pid, elapsed_ms, "isolated execution cancelled");
                Err(Cancelled)
            }
            Outcome::TimedOut => {
                warn!(?pid, deadline_ms, "isolated execution exceeded its deadline");
                Ok(ExecutionResult::timeout(deadline_ms))
            }
            Outcome::Responded(Ok(raw)) => {
                debug!(?pid, elapsed_ms, "isolated execution responded");
                Ok(normalize(&raw))
            }
            Outcome::Responded(Err(e)) => {
                error!(?pid, error = %e, status = ?status, "isolated context failed");
                Ok(ExecutionResult::internal("isolated context crashed"))
            }
        }
    }

    fn spawn_worker(&self) -> Result<Child, EngineError> {
        let program = match &self.worker.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(EngineError::WorkerSpawn)?,
        };
        let stderr = if self.worker.inherit_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        };

        Command::new(&program)
            .args(&self.worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::WorkerSpawn)
    }
}

enum Outcome {
    Cancelled,
    TimedOut,
    Responded(Result<serde_json::Value, EngineError>),
}

/// Send the job, then wait for the single response line
async fn exchange(
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    payload: Vec<u8>,
) -> Result<serde_json::Value, EngineError> {
    stdin.write_all(&payload).await?;
    stdin.write_all(b"\n").await?;
    stdin.shutdown().await?;
    drop(stdin);

    let mut lines = BufReader::new(stdout).lines();
    match lines.next_line().await? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => Err(EngineError::WorkerCrashed(
            "closed its output without a result".to_string(),
        )),
    }
}

/// Kill and reap the worker. Safe to call whether or not it already exited.
async fn terminate(child: &mut Child) -> Option<std::process::ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "worker already gone");
    }
    child.wait().await.ok()
}

// ============================================================================
// Worker side
// ============================================================================

/// Serve exactly one job: read a request line, write a response line
pub fn serve_worker<R: BufRead, W: Write>(mut reader: R, mut writer: W) -> Result<(), EngineError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(EngineError::WorkerCrashed("no job received".to_string()));
    }
    let job: IsolatedJob = serde_json::from_str(line.trim_end())?;
    debug!(job = %job_kind(&job.target), "worker running job");

    let result = job.run();
    serde_json::to_writer(&mut writer, &result.to_raw())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn job_kind(target: &Target) -> &str {
    match target {
        Target::Tool(id) => id.slug(),
        Target::Code(_) => "code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolId;
    use crate::types::FailureKind;
    use std::io::Cursor;

    fn serve(job: &IsolatedJob) -> serde_json::Value {
        let request = format!("{}\n", serde_json::to_string(job).unwrap());
        let mut output = Vec::new();
        serve_worker(Cursor::new(request), &mut output).unwrap();
        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.lines().count(), 1);
        serde_json::from_str(text.trim_end()).unwrap()
    }

    #[test]
    fn test_worker_runs_tool() {
        let job = IsolatedJob {
            target: Target::Tool(ToolId::UpperCase),
            input: "abc".into(),
            options: Options::new(),
            limits: ExecutionLimits::default(),
        };
        assert_eq!(serve(&job), serde_json::json!("ABC"));
    }

    #[test]
    fn test_worker_runs_code() {
        let job = IsolatedJob {
            target: Target::Code(r#"throw "bad";"#.to_string()),
            input: InputPayload::Empty,
            options: Options::new(),
            limits: ExecutionLimits::default(),
        };
        assert_eq!(serve(&job), serde_json::json!({ "error": "bad" }));
    }

    #[test]
    fn test_worker_rejects_malformed_request() {
        let mut output = Vec::new();
        let result = serve_worker(Cursor::new("not json\n"), &mut output);
        assert!(matches!(result, Err(EngineError::Protocol(_))));
        assert!(output.is_empty());
    }

    #[test]
    fn test_worker_rejects_empty_input() {
        let mut output = Vec::new();
        let result = serve_worker(Cursor::new(""), &mut output);
        assert!(matches!(result, Err(EngineError::WorkerCrashed(_))));
    }

    #[test]
    fn test_job_defaults_when_fields_missing() {
        let job: IsolatedJob = serde_json::from_str(r#"{ "target": { "tool": "sha256" } }"#).unwrap();
        assert_eq!(job.input, InputPayload::Empty);
        assert_eq!(job.limits, ExecutionLimits::default());
    }

    #[tokio::test]
    async fn test_missing_worker_program_is_internal_failure() {
        let layer = IsolationLayer::new(WorkerConfig::program(
            "/nonexistent/transform-engine-worker",
        ));
        let job = IsolatedJob {
            target: Target::Code("1".to_string()),
            input: InputPayload::Empty,
            options: Options::new(),
            limits: ExecutionLimits::default(),
        };
        let result = layer
            .run_isolated(&job, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.as_failure().unwrap().kind, FailureKind::Internal);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let layer = IsolationLayer::new(WorkerConfig::program("/nonexistent"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = IsolatedJob {
            target: Target::Code("1".to_string()),
            input: InputPayload::Empty,
            options: Options::new(),
            limits: ExecutionLimits::default(),
        };
        let outcome = layer.run_isolated(&job, Duration::from_secs(1), &cancel).await;
        assert_eq!(outcome, Err(Cancelled));
    }
}
