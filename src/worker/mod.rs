//! Scanner Worker Protocol (C2, §4.2): a long-lived subprocess hosting
//! generated scanner code, driven over line-delimited JSON on stdio.

pub mod protocol;
pub mod rule;

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;
use protocol::{ScanRequest, ScanResponse, READY_SENTINEL};

/// A spawned scanner worker subprocess. Reused across many scan requests
/// for the lifetime of one (agent, ticker) stream (§4.2 rationale).
pub struct ScannerWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    request_timeout: Duration,
}

impl ScannerWorker {
    /// Spawns `argv[0]` with `argv[1..]` as arguments and awaits the
    /// initial `READY` line (§4.2 step 1).
    pub async fn spawn(argv: &[String], request_timeout: Duration) -> Result<Self, EngineError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::Internal("empty scanner worker command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EngineError::WorkerCrash(format!("failed to spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Internal("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("worker stdout not piped".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready = timeout(request_timeout, lines.next_line())
            .await
            .map_err(|_| EngineError::Timeout("worker did not become READY in time".to_string()))?
            .map_err(|e| EngineError::WorkerCrash(format!("reading READY: {e}")))?;

        match ready {
            Some(line) if line.trim() == READY_SENTINEL => {}
            Some(other) => {
                return Err(EngineError::WorkerCrash(format!(
                    "expected READY, got: {other}"
                )))
            }
            None => return Err(EngineError::WorkerCrash("worker exited before READY".to_string())),
        }

        Ok(Self {
            child,
            stdin,
            stdout: lines,
            request_timeout,
        })
    }

    /// Issues one scan request and awaits the matching response and the
    /// trailing `READY` line (§4.2 steps 2-4). A timeout or a premature EOF
    /// on stdout is reported as [`EngineError::WorkerCrash`] or
    /// [`EngineError::Timeout`]; callers must respawn the worker.
    pub async fn scan(&mut self, request: ScanRequest) -> Result<ScanResponse, EngineError> {
        let request_id = request.request_id.clone();
        let payload = serde_json::to_string(&request)
            .map_err(|e| EngineError::Internal(format!("serializing scan request: {e}")))?;

        timeout(self.request_timeout, async {
            self.stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| EngineError::WorkerCrash(format!("writing request: {e}")))?;
            self.stdin
                .write_all(b"\n")
                .await
                .map_err(|e| EngineError::WorkerCrash(format!("writing newline: {e}")))?;
            self.stdin
                .flush()
                .await
                .map_err(|e| EngineError::WorkerCrash(format!("flushing stdin: {e}")))?;

            let response_line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| EngineError::WorkerCrash(format!("reading response: {e}")))?
                .ok_or_else(|| EngineError::WorkerCrash("worker exited before responding".to_string()))?;

            let response: ScanResponse = serde_json::from_str(&response_line)
                .map_err(|e| EngineError::WorkerCrash(format!("malformed response JSON: {e}")))?;

            if response.request_id != request_id {
                return Err(EngineError::WorkerCrash(format!(
                    "response requestId {} does not match request {request_id}",
                    response.request_id
                )));
            }

            let ready_line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| EngineError::WorkerCrash(format!("reading READY: {e}")))?
                .ok_or_else(|| EngineError::WorkerCrash("worker exited before READY".to_string()))?;
            if ready_line.trim() != READY_SENTINEL {
                return Err(EngineError::WorkerCrash(format!(
                    "expected READY after response, got: {ready_line}"
                )));
            }

            Ok(response)
        })
        .await
        .map_err(|_| EngineError::Timeout(format!("scan request {request_id} timed out")))?
    }

    /// Closes stdin and awaits clean exit, killing the process if it does
    /// not exit promptly (§4.2 step 6, §5 cancellation).
    pub async fn shutdown(mut self) {
        drop(self.stdin);
        match timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "scanner worker exited cleanly"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for scanner worker exit"),
            Err(_) => {
                warn!("scanner worker did not exit in time, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Generates a unique, human-traceable request id (§4.2 "Contracts").
pub fn next_request_id() -> String {
    Uuid::new_v4().to_string()
}
