//! Execution sessions
//!
//! One session per WebSocket connection. A session accepts a single framed
//! invocation at a time, runs it through the sandbox, and either returns to
//! the idle state for the next request or closes the connection. Policy is
//! fail-closed: any malformed or invalid request ends the connection, and a
//! connection that dies mid-run takes its backend down with it.

use crate::sandbox::{SandboxHandle, kill_group};
use crate::stream::StreamMultiplexer;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use crucible_core::invocation::RawInvocation;
use crucible_core::protocol::{
    self, ControlMessage, MAX_REQUEST_SIZE, OutputChunk, ServerMessage, close_code,
};
use crucible_core::{BackendConfig, ExecutionReport, fingerprint};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// How one invocation left the session.
enum Outcome {
    /// Report delivered; the connection may carry another request.
    Continue,
    /// The client went away; nothing left to say.
    Disconnect,
    /// Protocol or validation failure; close abnormally and stop.
    Abort { code: u16, reason: String },
}

/// Why the running phase ended.
enum RunExit {
    /// Backend streams closed or the deadline fired; finish normally.
    Finished,
    /// Client sent the kill token.
    Cancelled,
    /// Client vanished mid-run.
    Disconnected,
    /// Client broke protocol mid-run.
    Protocol { code: u16, reason: String },
}

pub struct Session {
    tx: SplitSink<WebSocket, Message>,
    rx: SplitStream<WebSocket>,
    client_fingerprint: String,
    languages: Arc<HashSet<String>>,
    backend: Arc<BackendConfig>,
}

impl Session {
    /// Drive a connection until it closes, serving invocations in sequence.
    pub async fn run(
        socket: WebSocket,
        client_fingerprint: String,
        languages: Arc<HashSet<String>>,
        backend: Arc<BackendConfig>,
    ) {
        let (tx, rx) = socket.split();
        let mut session = Self {
            tx,
            rx,
            client_fingerprint,
            languages,
            backend,
        };
        loop {
            match session.serve_one().await {
                Outcome::Continue => {}
                Outcome::Disconnect => break,
                Outcome::Abort { code, reason } => {
                    session.close(code, reason).await;
                    break;
                }
            }
        }
    }

    /// One full pass of the state machine: Idle → Validating → Running →
    /// Draining → Terminal.
    async fn serve_one(&mut self) -> Outcome {
        // Idle: wait for a framed request
        let request = loop {
            match self.rx.next().await {
                Some(Ok(Message::Binary(bytes))) => break bytes,
                Some(Ok(Message::Text(_))) => {
                    return Outcome::Abort {
                        code: close_code::UNSUPPORTED_DATA,
                        reason: "expected a binary message".into(),
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Outcome::Disconnect,
                Some(Err(e)) => return self.read_failed(&e),
            }
        };

        if request.len() > MAX_REQUEST_SIZE {
            return Outcome::Abort {
                code: close_code::TOO_LARGE,
                reason: format!(
                    "received message of size {}, greater than size limit {MAX_REQUEST_SIZE}",
                    request.len()
                ),
            };
        }

        // Validating
        let raw: RawInvocation = match protocol::decode_exact(&request) {
            Ok(raw) => raw,
            Err(e) => {
                return Outcome::Abort {
                    code: close_code::POLICY_VIOLATION,
                    reason: format!("invalid request: {e}"),
                };
            }
        };
        let invocation = match raw.validate(&self.languages) {
            Ok(invocation) => invocation,
            Err(errors) => {
                let reasons = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Outcome::Abort {
                    code: close_code::POLICY_VIOLATION,
                    reason: format!("invalid request: {reasons}"),
                };
            }
        };

        let invocation_id = fingerprint::invocation_id();
        tracing::info!(
            invocation = %invocation_id,
            client = %self.client_fingerprint,
            language = %invocation.language,
            timeout = invocation.timeout,
            "invocation accepted"
        );

        // Running: stage, launch, stream
        let mut handle =
            match SandboxHandle::stage(self.backend.clone(), &invocation, &invocation_id).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(invocation = %invocation_id, error = %e, "staging failed");
                    return self.finish_aborted().await;
                }
            };
        let (mut process, stdout, stderr) =
            match handle.launch(&self.client_fingerprint, &invocation) {
                Ok(launched) => launched,
                Err(e) => {
                    tracing::error!(invocation = %invocation_id, error = %e, "launch failed");
                    handle.teardown().await;
                    return self.finish_aborted().await;
                }
            };

        let (mux, mut chunks) = StreamMultiplexer::spawn(stdout, stderr);
        let deadline = sleep_until(Instant::now() + Duration::from_secs(invocation.timeout.into()));
        tokio::pin!(deadline);
        let pgid = process.pgid();
        let mut timed_out = false;

        let exit = loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        if self.send_chunk(chunk).await.is_err() {
                            kill_group(pgid);
                            break RunExit::Disconnected;
                        }
                    }
                    // both streams reached EOF; the backend is wrapping up
                    None => break RunExit::Finished,
                },
                message = self.rx.next() => match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        match protocol::decode_exact::<ControlMessage>(&bytes) {
                            Ok(ControlMessage::Kill) => {
                                kill_group(pgid);
                                break RunExit::Cancelled;
                            }
                            Err(_) => {
                                kill_group(pgid);
                                break RunExit::Protocol {
                                    code: close_code::POLICY_VIOLATION,
                                    reason: "invalid control message".into(),
                                };
                            }
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        kill_group(pgid);
                        break RunExit::Protocol {
                            code: close_code::UNSUPPORTED_DATA,
                            reason: "expected a binary message".into(),
                        };
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        kill_group(pgid);
                        break RunExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "client read failed mid-run");
                        kill_group(pgid);
                        break RunExit::Disconnected;
                    }
                },
                () = &mut deadline => {
                    tracing::info!(invocation = %invocation_id, "timeout reached, killing backend");
                    timed_out = true;
                    kill_group(pgid);
                    break RunExit::Finished;
                }
            }
        };

        // Draining: deliver what the backend already produced, then reap it.
        let mut talking = matches!(exit, RunExit::Finished | RunExit::Cancelled);
        while let Some(chunk) = chunks.recv().await {
            if talking && self.send_chunk(chunk).await.is_err() {
                talking = false;
                kill_group(pgid);
            }
        }
        let (stdout_truncated, stderr_truncated) = mux.join().await;
        let status = loop {
            tokio::select! {
                status = process.wait() => break status,
                () = &mut deadline, if !timed_out => {
                    // streams closed early but the backend is still running
                    tracing::info!(invocation = %invocation_id, "timeout reached while draining");
                    timed_out = true;
                    kill_group(pgid);
                }
            }
        };
        handle.teardown().await;

        // Terminal
        match exit {
            RunExit::Disconnected => Outcome::Disconnect,
            RunExit::Protocol { code, reason } => Outcome::Abort { code, reason },
            RunExit::Finished | RunExit::Cancelled => {
                let report = match status {
                    Ok(raw) => ExecutionReport::from_raw(
                        raw,
                        stdout_truncated,
                        stderr_truncated,
                        timed_out,
                    ),
                    Err(e) => {
                        tracing::debug!(invocation = %invocation_id, error = %e, "no usable status record");
                        ExecutionReport::aborted(timed_out, stdout_truncated, stderr_truncated)
                    }
                };
                self.finish(report).await
            }
        }
    }

    /// Send the terminal report; the session may then accept a new request.
    async fn finish(&mut self, report: ExecutionReport) -> Outcome {
        if self.send(&ServerMessage::Done(report)).await.is_err() {
            return Outcome::Disconnect;
        }
        Outcome::Continue
    }

    /// Terminal report for an invocation that never produced a backend:
    /// the request was valid, so this is a report, not a protocol error.
    async fn finish_aborted(&mut self) -> Outcome {
        self.finish(ExecutionReport::aborted(false, false, false)).await
    }

    async fn send_chunk(&mut self, chunk: OutputChunk) -> Result<(), axum::Error> {
        self.send(&ServerMessage::from(chunk)).await
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), axum::Error> {
        let bytes = protocol::encode(message).map_err(axum::Error::new)?;
        self.tx.send(Message::Binary(bytes)).await
    }

    /// Map a transport read failure: an overlong frame gets the size-limit
    /// close, anything else means the client is gone. tungstenite reports
    /// the capacity overflow only as an opaque error string.
    fn read_failed(&self, error: &axum::Error) -> Outcome {
        let message = error.to_string();
        if message.contains("Message too long") {
            return Outcome::Abort {
                code: close_code::TOO_LARGE,
                reason: format!("message exceeds size limit {MAX_REQUEST_SIZE}"),
            };
        }
        tracing::debug!(error = %message, "client read failed");
        Outcome::Disconnect
    }

    /// Abnormal close with a client-visible reason.
    async fn close(&mut self, code: u16, reason: String) {
        tracing::info!(code, %reason, "closing session");
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(e) = self.tx.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "close frame not delivered");
        }
    }
}
