//! Request validation and dispatch.
//!
//! Frames arrive as raw `serde_json::Value`s from the codec and are
//! validated against the closed request schema here, so a malformed frame
//! can still be answered with an `error` naming its correlation id.
//! Framing failures, by contrast, tear the transport down: a misaligned
//! stream cannot be trusted frame by frame.
//!
//! All responses funnel through one writer task, which keeps frames from
//! concurrent operations serialized on stdout.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::fabric::{resolve_tool_path, CommandRunner, FabricCommand, FabricRunner};
use crate::supervisor::ProcessSupervisor;
use crate::transport::{
    CodecError, FrameCodec, Request, RequestPayload, Response, ResponsePayload,
};

/// Which single-shot enumeration a request asked for.
#[derive(Debug, Clone, Copy)]
enum Listing {
    Patterns,
    Contexts,
}

impl Listing {
    const fn name(self) -> &'static str {
        match self {
            Self::Patterns => "patterns",
            Self::Contexts => "contexts",
        }
    }
}

/// Validates and dispatches one request frame at a time.
///
/// Handshake and enumeration handlers run as spawned tasks so a slow
/// probe never blocks the read loop; `processContent` registration stays
/// inline, which makes the duplicate-id check race-free.
pub struct Router<F, R>
where
    F: Fn(PathBuf) -> R + Clone + Send + Sync + 'static,
    R: CommandRunner + 'static,
{
    settings: Settings,
    supervisor: Arc<ProcessSupervisor>,
    responses: mpsc::Sender<Response>,
    make_runner: F,
    _runner: PhantomData<fn() -> R>,
}

impl<F, R> Router<F, R>
where
    F: Fn(PathBuf) -> R + Clone + Send + Sync + 'static,
    R: CommandRunner + 'static,
{
    pub fn new(settings: Settings, responses: mpsc::Sender<Response>, make_runner: F) -> Self {
        let supervisor = ProcessSupervisor::new(responses.clone(), settings.cancel_grace);
        Self {
            settings,
            supervisor,
            responses,
            make_runner,
            _runner: PhantomData,
        }
    }

    /// Tear down all in-flight operations. Called when the transport goes
    /// away and there is no peer left to stream to.
    pub fn shutdown(&self) {
        self.supervisor.begin_shutdown();
    }

    /// Validate and dispatch one decoded frame.
    pub async fn dispatch(&self, frame: Value) {
        let request = match Request::deserialize(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Answer per-id when the frame still carries one; a frame
                // with no usable id can only be logged.
                let id = frame
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                if let Some(id) = id {
                    warn!(request = %id, error = %e, "rejecting invalid request");
                    self.send_error(id, format!("invalid request: {e}")).await;
                } else {
                    warn!(error = %e, "dropping malformed frame without correlation id");
                }
                return;
            }
        };

        let id = request.id;
        let path_override = request.path;

        match request.payload {
            RequestPayload::Ping => {
                debug!(request = %id, "handshake ping");
                tokio::spawn(handle_ping(
                    self.settings.clone(),
                    id,
                    path_override,
                    self.make_runner.clone(),
                    self.responses.clone(),
                ));
            }
            RequestPayload::ListPatterns => {
                tokio::spawn(handle_listing(
                    Listing::Patterns,
                    self.settings.clone(),
                    id,
                    path_override,
                    self.make_runner.clone(),
                    self.responses.clone(),
                ));
            }
            RequestPayload::ListContexts => {
                tokio::spawn(handle_listing(
                    Listing::Contexts,
                    self.settings.clone(),
                    id,
                    path_override,
                    self.make_runner.clone(),
                    self.responses.clone(),
                ));
            }
            RequestPayload::ProcessContent {
                content,
                model,
                pattern,
                context,
                custom_prompt,
            } => {
                self.handle_process_content(
                    id,
                    path_override,
                    content,
                    model,
                    pattern,
                    context,
                    custom_prompt,
                )
                .await;
            }
            RequestPayload::CancelProcess { request_id } => {
                // The operation task emits the `cancelled` frame; only the
                // failure path is answered here.
                if let Err(e) = self.supervisor.cancel(id, request_id).await {
                    debug!(request = %request_id, error = %e, "cancellation rejected");
                    self.send_error(id, e.to_string()).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_process_content(
        &self,
        id: Uuid,
        path_override: Option<PathBuf>,
        content: String,
        model: Option<String>,
        pattern: Option<String>,
        context: Option<String>,
        custom_prompt: Option<String>,
    ) {
        if self.supervisor.is_active(id).await {
            self.send_error(id, format!("request {id} is already in flight"))
                .await;
            return;
        }

        let path = match resolve_tool_path(path_override.as_deref(), self.settings.tool_path.as_deref())
        {
            Ok(path) => path,
            Err(e) => {
                self.send_error(id, e.to_string()).await;
                return;
            }
        };

        let runner = (self.make_runner)(path);

        let mut command = FabricCommand::new(runner.tool_path()).stream();
        if let Some(model) = model.or_else(|| self.settings.default_model.clone()) {
            command = command.model(model);
        }
        if let Some(pattern) = pattern {
            command = command.pattern(pattern);
        } else if let Some(custom_prompt) = custom_prompt {
            command = command.custom_prompt(custom_prompt);
        }
        if let Some(context) = context {
            command = command.context(context);
        }

        let process = match runner.spawn_streaming(command).await {
            Ok(process) => process,
            Err(e) => {
                warn!(request = %id, error = %e, "failed to spawn tool");
                self.send_error(id, format!("failed to start tool: {e}")).await;
                return;
            }
        };

        if let Err(e) = self.supervisor.start(id, process, content).await {
            self.send_error(id, e.to_string()).await;
        }
    }

    async fn send_error(&self, id: Uuid, message: String) {
        send_response(
            &self.responses,
            Response {
                id,
                payload: ResponsePayload::Error { message },
            },
        )
        .await;
    }
}

async fn send_response(responses: &mpsc::Sender<Response>, response: Response) {
    if responses.send(response).await.is_err() {
        warn!("response channel closed, dropping frame");
    }
}

/// Resolve and probe the tool, answering `pong` in every case. An invalid
/// pong is the peer's signal to treat the connection as failed; the probe
/// itself is time-bounded so a hung tool cannot wedge the handshake.
async fn handle_ping<F, R>(
    settings: Settings,
    id: Uuid,
    path_override: Option<PathBuf>,
    make_runner: F,
    responses: mpsc::Sender<Response>,
) where
    F: Fn(PathBuf) -> R,
    R: CommandRunner,
{
    let payload = match resolve_tool_path(path_override.as_deref(), settings.tool_path.as_deref()) {
        Ok(path) => {
            let resolved = path.display().to_string();
            let runner = make_runner(path);
            match tokio::time::timeout(settings.handshake_timeout, runner.version()).await {
                Ok(Ok(output)) if output.success => ResponsePayload::Pong {
                    resolved_path: Some(resolved),
                    version: Some(output.stdout),
                    valid: true,
                },
                Ok(Ok(output)) => {
                    warn!(stderr = %output.stderr, "tool version probe failed");
                    ResponsePayload::Pong {
                        resolved_path: Some(resolved),
                        version: None,
                        valid: false,
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to run tool version probe");
                    ResponsePayload::Pong {
                        resolved_path: Some(resolved),
                        version: None,
                        valid: false,
                    }
                }
                Err(_) => {
                    warn!(timeout = ?settings.handshake_timeout, "tool version probe timed out");
                    ResponsePayload::Pong {
                        resolved_path: Some(resolved),
                        version: None,
                        valid: false,
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to resolve tool path");
            ResponsePayload::Pong {
                resolved_path: None,
                version: None,
                valid: false,
            }
        }
    };

    send_response(&responses, Response { id, payload }).await;
}

async fn handle_listing<F, R>(
    listing: Listing,
    settings: Settings,
    id: Uuid,
    path_override: Option<PathBuf>,
    make_runner: F,
    responses: mpsc::Sender<Response>,
) where
    F: Fn(PathBuf) -> R,
    R: CommandRunner,
{
    let payload = match resolve_tool_path(path_override.as_deref(), settings.tool_path.as_deref()) {
        Ok(path) => {
            let runner = make_runner(path);
            let output = match listing {
                Listing::Patterns => runner.list_patterns().await,
                Listing::Contexts => runner.list_contexts().await,
            };
            match output {
                Ok(output) if output.success => {
                    let items: Vec<String> = output
                        .stdout
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(ToString::to_string)
                        .collect();
                    match listing {
                        Listing::Patterns => ResponsePayload::PatternsList { patterns: items },
                        Listing::Contexts => ResponsePayload::ContextsList { contexts: items },
                    }
                }
                Ok(output) => ResponsePayload::Error {
                    message: format!("failed to list {}: {}", listing.name(), output.stderr),
                },
                Err(e) => ResponsePayload::Error {
                    message: format!("failed to list {}: {e}", listing.name()),
                },
            }
        }
        Err(e) => ResponsePayload::Error {
            message: e.to_string(),
        },
    };

    send_response(&responses, Response { id, payload }).await;
}

/// Run the host over an arbitrary byte-stream pair. The read loop owns
/// dispatch; a writer task owns the outbound frame stream.
pub async fn serve<I, O, F, R>(
    input: I,
    output: O,
    settings: Settings,
    make_runner: F,
) -> Result<(), CodecError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Send + Unpin + 'static,
    F: Fn(PathBuf) -> R + Clone + Send + Sync + 'static,
    R: CommandRunner + 'static,
{
    let mut frames = FramedRead::new(input, FrameCodec::<Value>::default());
    let (responses, mut response_rx) = mpsc::channel::<Response>(64);

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(output, FrameCodec::<Response>::default());
        while let Some(response) = response_rx.recv().await {
            if let Err(e) = sink.send(response).await {
                error!(error = %e, "failed to write response frame, stopping writer");
                break;
            }
        }
    });

    let router = Router::new(settings, responses, make_runner);

    let result = loop {
        match frames.next().await {
            Some(Ok(frame)) => router.dispatch(frame).await,
            Some(Err(e)) => {
                error!(error = %e, "framing error, tearing down transport");
                break Err(e);
            }
            None => {
                info!("transport closed by peer");
                break Ok(());
            }
        }
    };

    router.shutdown();
    drop(router);
    let _ = writer.await;
    result
}

/// Serve the native messaging protocol over this process's stdio.
pub async fn serve_stdio(settings: Settings) -> Result<(), CodecError> {
    info!("native messaging host listening on stdio");
    serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        settings,
        FabricRunner::new,
    )
    .await
}
