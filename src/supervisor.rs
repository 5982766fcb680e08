//! Supervision of in-flight fabric-ai processes.
//!
//! One entry per accepted `processContent` request, keyed by correlation
//! id. Each operation runs in its own task: content is piped to the child,
//! stdout lines stream back as `content` frames, and exactly one terminal
//! frame (`done`, `error`, or `cancelled`) ends the stream. Operations for
//! different ids never serialize behind one another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fabric::ProcessHandle;
use crate::transport::{Response, ResponsePayload};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// A `processContent` request reused an id that is still streaming.
    #[error("request {0} is already in flight")]
    DuplicateRequest(Uuid),

    /// Cancellation named an id with no active operation. Distinct from a
    /// successful cancel so the peer can tell "nothing to cancel" apart
    /// from "cancelled".
    #[error("no active operation with id {0}")]
    UnknownOperation(Uuid),
}

/// Cancellation handle for one in-flight operation.
///
/// The payload is the cancel request's own correlation id, which the
/// operation task echoes back in the `cancelled` frame. Consuming the
/// entry on cancel makes a second cancel for the same id resolve to
/// [`SupervisorError::UnknownOperation`].
struct InFlight {
    cancel_tx: oneshot::Sender<Uuid>,
}

/// Owns the map of in-flight operations and the response channel.
///
/// The map is the only shared mutable state in the host; everything else
/// is resolved fresh per request.
pub struct ProcessSupervisor {
    inflight: Mutex<HashMap<Uuid, InFlight>>,
    responses: mpsc::Sender<Response>,
    cancel_grace: Duration,
    shutdown: CancellationToken,
}

impl ProcessSupervisor {
    pub fn new(responses: mpsc::Sender<Response>, cancel_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            inflight: Mutex::new(HashMap::new()),
            responses,
            cancel_grace,
            shutdown: CancellationToken::new(),
        })
    }

    /// Number of active operations.
    pub async fn active_operations(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// Whether `id` has an active operation.
    pub async fn is_active(&self, id: Uuid) -> bool {
        self.inflight.lock().await.contains_key(&id)
    }

    /// Accept a spawned process for `id` and start streaming its output.
    ///
    /// Rejects an id that already has an active operation without
    /// disturbing the existing one.
    pub async fn start(
        self: &Arc<Self>,
        id: Uuid,
        process: Box<dyn ProcessHandle>,
        content: String,
    ) -> Result<(), SupervisorError> {
        let (cancel_tx, cancel_rx) = oneshot::channel();

        {
            let mut inflight = self.inflight.lock().await;
            if inflight.contains_key(&id) {
                return Err(SupervisorError::DuplicateRequest(id));
            }
            inflight.insert(id, InFlight { cancel_tx });
        }

        debug!(request = %id, "starting streaming operation");
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.run_operation(id, process, content, cancel_rx).await;
        });

        Ok(())
    }

    /// Cancel the operation `request_id` on behalf of cancel request
    /// `cancel_id`.
    ///
    /// On success the operation task terminates its child and emits the
    /// `cancelled` frame; this method only hands the cancel over.
    pub async fn cancel(&self, cancel_id: Uuid, request_id: Uuid) -> Result<(), SupervisorError> {
        let entry = self
            .inflight
            .lock()
            .await
            .remove(&request_id)
            .ok_or(SupervisorError::UnknownOperation(request_id))?;

        debug!(request = %request_id, cancel = %cancel_id, "cancelling operation");
        entry
            .cancel_tx
            .send(cancel_id)
            .map_err(|_| SupervisorError::UnknownOperation(request_id))
    }

    /// Tear down every in-flight operation without emitting frames.
    /// Called when the transport is gone and there is no peer to notify.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run_operation(
        self: Arc<Self>,
        id: Uuid,
        mut process: Box<dyn ProcessHandle>,
        content: String,
        mut cancel_rx: oneshot::Receiver<Uuid>,
    ) {
        let grace = self.cancel_grace;

        // The selects below only pick the next event; the process handle
        // is acted on afterwards, once the competing futures are gone.
        enum OpEvent<T> {
            Shutdown,
            Cancelled(Option<Uuid>),
            Ready(T),
        }

        // Feed the content. Cancellation must be able to interrupt a
        // write stalled on a child that is not reading its stdin.
        let event = tokio::select! {
            biased;

            () = self.shutdown.cancelled() => OpEvent::Shutdown,
            cancel = &mut cancel_rx => OpEvent::Cancelled(cancel.ok()),
            fed = async {
                process.write_stdin(content.as_bytes()).await?;
                process.close_stdin().await
            } => OpEvent::Ready(fed),
        };

        match event {
            OpEvent::Shutdown => {
                self.finish(id).await;
                process.terminate(grace).await;
                return;
            }
            OpEvent::Cancelled(cancel_id) => {
                // Entry already consumed by cancel().
                process.terminate(grace).await;
                self.emit_cancelled(cancel_id, id).await;
                return;
            }
            OpEvent::Ready(Err(e)) => {
                process.terminate(grace).await;
                if self.finish(id).await {
                    self.emit_error(id, format!("failed to write content to tool stdin: {e}"))
                        .await;
                } else {
                    self.emit_cancelled_if_requested(id, cancel_rx).await;
                }
                return;
            }
            OpEvent::Ready(Ok(())) => {}
        }

        let mut emitted_lines = 0usize;
        loop {
            let event = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => OpEvent::Shutdown,
                cancel = &mut cancel_rx => OpEvent::Cancelled(cancel.ok()),
                line = process.next_stdout_line() => OpEvent::Ready(line),
            };

            match event {
                OpEvent::Shutdown => {
                    self.finish(id).await;
                    process.terminate(grace).await;
                    return;
                }
                OpEvent::Cancelled(cancel_id) => {
                    // Entry already consumed by cancel(); terminate and
                    // emit the one terminal frame for this stream.
                    process.terminate(grace).await;
                    self.emit_cancelled(cancel_id, id).await;
                    return;
                }
                OpEvent::Ready(Ok(Some(line))) => {
                    emitted_lines += 1;
                    self.emit(Response {
                        id,
                        payload: ResponsePayload::Content { content: line },
                    })
                    .await;
                }
                OpEvent::Ready(Ok(None)) => break,
                OpEvent::Ready(Err(e)) => {
                    process.terminate(grace).await;
                    if self.finish(id).await {
                        self.emit_error(id, format!("failed to read tool output: {e}"))
                            .await;
                    } else {
                        self.emit_cancelled_if_requested(id, cancel_rx).await;
                    }
                    return;
                }
            }
        }

        let exit = process.wait().await;

        if !self.finish(id).await {
            // cancel() won the race against process exit; the canceller
            // owns the terminal frame.
            self.emit_cancelled_if_requested(id, cancel_rx).await;
            return;
        }

        match exit {
            Ok(code) => {
                if code != Some(0) && emitted_lines == 0 {
                    let stderr = process.stderr_output().await;
                    let message = if stderr.is_empty() {
                        format!("tool exited with {} and produced no output", describe_exit(code))
                    } else {
                        format!("tool exited with {}: {stderr}", describe_exit(code))
                    };
                    self.emit_error(id, message).await;
                } else {
                    self.emit(Response {
                        id,
                        payload: ResponsePayload::Done { exit_code: code },
                    })
                    .await;
                }
            }
            Err(e) => {
                self.emit_error(id, format!("failed to wait for tool exit: {e}"))
                    .await;
            }
        }
    }

    /// Remove `id` from the in-flight map. Returns false when the entry is
    /// already gone, i.e. a concurrent cancel owns the terminal frame.
    async fn finish(&self, id: Uuid) -> bool {
        self.inflight.lock().await.remove(&id).is_some()
    }

    async fn emit_cancelled(&self, cancel_id: Option<Uuid>, request_id: Uuid) {
        match cancel_id {
            Some(cancel_id) => {
                self.emit(Response {
                    id: cancel_id,
                    payload: ResponsePayload::Cancelled { request_id },
                })
                .await;
            }
            None => warn!(request = %request_id, "cancel signal dropped before delivery"),
        }
    }

    /// Await the cancel id from a `cancel()` that raced this task, then
    /// emit the `cancelled` frame on its behalf.
    async fn emit_cancelled_if_requested(&self, id: Uuid, cancel_rx: oneshot::Receiver<Uuid>) {
        self.emit_cancelled(cancel_rx.await.ok(), id).await;
    }

    async fn emit_error(&self, id: Uuid, message: String) {
        self.emit(Response {
            id,
            payload: ResponsePayload::Error { message },
        })
        .await;
    }

    async fn emit(&self, response: Response) {
        if self.responses.send(response).await.is_err() {
            warn!("response channel closed, dropping frame");
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "signal termination".to_string(), |c| format!("exit code {c}"))
}
