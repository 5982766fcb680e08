//! End-to-end tests: the full host loop on one side of a duplex pipe, the
//! peer-side connection state machine on the other, and a shell script
//! standing in for fabric-ai.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use fabric_native_host::client::{BridgeConnection, BridgeEvent, ClientError, ConnectionStatus};
use fabric_native_host::config::Settings;
use fabric_native_host::fabric::FabricRunner;
use fabric_native_host::router::serve;
use fabric_native_host::transport::{CodecError, ResponsePayload};

type Connection = BridgeConnection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// A fake fabric-ai that answers the probe and the enumeration flags and
/// echoes two lines for everything else.
const ECHO_TOOL: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "v1.4.0" ;;
  --listpatterns) printf 'summarize\nextract_wisdom\n' ;;
  --listcontexts) printf 'research\n' ;;
  *) cat >/dev/null; printf 'line1\nline2\n' ;;
esac
"#;

/// A fake tool that emits one line and then hangs until killed.
const HANGING_TOOL: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "v1.4.0" ;;
  *) cat >/dev/null; echo started; sleep 30 ;;
esac
"#;

/// A broken install: every invocation fails.
const BROKEN_TOOL: &str = "#!/bin/sh\nexit 1\n";

fn fake_tool(script: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fabric-ai");
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    (dir, path)
}

fn spawn_host() -> (
    JoinHandle<Result<(), CodecError>>,
    ReadHalf<DuplexStream>,
    WriteHalf<DuplexStream>,
) {
    let (host_io, client_io) = duplex(256 * 1024);
    let (host_read, host_write) = split(host_io);
    let (client_read, client_write) = split(client_io);

    let settings = Settings {
        cancel_grace: Duration::from_millis(500),
        ..Settings::default()
    };
    let server = tokio::spawn(serve(host_read, host_write, settings, FabricRunner::new));
    (server, client_read, client_write)
}

async fn connect(tool: PathBuf) -> (Connection, JoinHandle<Result<(), CodecError>>) {
    let (server, client_read, client_write) = spawn_host();
    let mut connection = BridgeConnection::new(Some(tool), Duration::from_secs(5));
    let handshake = connection
        .connect(client_read, client_write)
        .await
        .expect("handshake failed");
    assert!(handshake.valid);
    (connection, server)
}

async fn expect_content(
    events: &mut tokio::sync::broadcast::Receiver<BridgeEvent>,
    id: uuid::Uuid,
) -> String {
    loop {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for content")
            .expect("event channel closed");
        match event {
            BridgeEvent::Content {
                id: event_id,
                content,
            } if event_id == id => return content,
            BridgeEvent::Content { .. } | BridgeEvent::Status(_) => {}
        }
    }
}

#[tokio::test]
async fn handshake_reports_version_and_path() {
    let (_dir, tool) = fake_tool(ECHO_TOOL);
    let (server, client_read, client_write) = spawn_host();

    let mut connection: Connection = BridgeConnection::new(Some(tool.clone()), Duration::from_secs(5));
    let handshake = connection.connect(client_read, client_write).await.unwrap();

    assert!(handshake.valid);
    assert_eq!(handshake.version.as_deref(), Some("v1.4.0"));
    assert_eq!(
        handshake.resolved_path.as_deref(),
        Some(tool.to_str().unwrap())
    );
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    // Closing the peer side shuts the host loop down cleanly.
    drop(connection);
    let result = timeout(Duration::from_secs(5), server).await.unwrap();
    assert_matches!(result, Ok(Ok(())));
}

#[tokio::test]
async fn broken_tool_fails_the_handshake() {
    let (_dir, tool) = fake_tool(BROKEN_TOOL);
    let (_server, client_read, client_write) = spawn_host();

    let mut connection: Connection = BridgeConnection::new(Some(tool), Duration::from_secs(5));
    let result = connection.connect(client_read, client_write).await;

    assert_matches!(result, Err(ClientError::HandshakeRejected { .. }));
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn enumerations_parse_tool_output() {
    let (_dir, tool) = fake_tool(ECHO_TOOL);
    let (mut connection, _server) = connect(tool).await;

    let patterns = connection.list_patterns().await.unwrap();
    let response = timeout(Duration::from_secs(10), patterns)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_matches!(
        response.payload,
        ResponsePayload::PatternsList { patterns } if patterns == ["summarize", "extract_wisdom"]
    );

    let contexts = connection.list_contexts().await.unwrap();
    let response = timeout(Duration::from_secs(10), contexts)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_matches!(
        response.payload,
        ResponsePayload::ContextsList { contexts } if contexts == ["research"]
    );
}

#[tokio::test]
async fn process_content_streams_lines_then_done() {
    let (_dir, tool) = fake_tool(ECHO_TOOL);
    let (mut connection, _server) = connect(tool).await;
    let mut events = connection.subscribe();

    let (id, receiver) = connection
        .process_content("hello".into(), None, Some("summarize".into()), None, None)
        .await
        .unwrap();

    assert_eq!(expect_content(&mut events, id).await, "line1");
    assert_eq!(expect_content(&mut events, id).await, "line2");

    let terminal = timeout(Duration::from_secs(10), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(terminal.id, id);
    assert_matches!(terminal.payload, ResponsePayload::Done { exit_code: Some(0) });
}

#[tokio::test]
async fn concurrent_operations_complete_independently() {
    let (_dir, tool) = fake_tool(ECHO_TOOL);
    let (mut connection, _server) = connect(tool).await;
    let mut events = connection.subscribe();

    let (id_a, rx_a) = connection
        .process_content("a".into(), None, None, None, Some("first".into()))
        .await
        .unwrap();
    let (id_b, rx_b) = connection
        .process_content("b".into(), None, None, None, Some("second".into()))
        .await
        .unwrap();

    // No ordering guarantee exists across ids; within an id, lines arrive
    // in the order the tool produced them.
    let mut lines_a = Vec::new();
    let mut lines_b = Vec::new();
    while lines_a.len() < 2 || lines_b.len() < 2 {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for content")
            .expect("event channel closed");
        match event {
            BridgeEvent::Content { id, content } if id == id_a => lines_a.push(content),
            BridgeEvent::Content { id, content } if id == id_b => lines_b.push(content),
            BridgeEvent::Content { .. } | BridgeEvent::Status(_) => {}
        }
    }
    assert_eq!(lines_a, ["line1", "line2"]);
    assert_eq!(lines_b, ["line1", "line2"]);

    for rx in [rx_a, rx_b] {
        let terminal = timeout(Duration::from_secs(10), rx).await.unwrap().unwrap().unwrap();
        assert_matches!(terminal.payload, ResponsePayload::Done { exit_code: Some(0) });
    }
}

#[tokio::test]
async fn cancel_while_streaming_terminates_the_tool() {
    let (_dir, tool) = fake_tool(HANGING_TOOL);
    let (mut connection, _server) = connect(tool).await;
    let mut events = connection.subscribe();

    let (id, receiver) = connection
        .process_content("page".into(), None, None, None, Some("never finishes".into()))
        .await
        .unwrap();

    // The stream is live before the cancel goes out.
    assert_eq!(expect_content(&mut events, id).await, "started");

    let (cancel_id, cancel_rx) = connection.cancel(id).await.unwrap();
    let cancelled = timeout(Duration::from_secs(10), cancel_rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.id, cancel_id);
    assert_matches!(
        cancelled.payload,
        ResponsePayload::Cancelled { request_id } if request_id == id
    );

    // The stream's own receiver resolves with the same terminal frame,
    // and nothing follows it.
    let stream_terminal = timeout(Duration::from_secs(10), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_matches!(stream_terminal.payload, ResponsePayload::Cancelled { .. });

    tokio::time::sleep(Duration::from_millis(300)).await;
    loop {
        match events.try_recv() {
            Ok(BridgeEvent::Content { id: event_id, .. }) => {
                assert_ne!(event_id, id, "content arrived after the terminal frame");
            }
            Ok(BridgeEvent::Status(_)) => {}
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn cancelling_an_unknown_operation_is_an_error() {
    let (_dir, tool) = fake_tool(ECHO_TOOL);
    let (mut connection, _server) = connect(tool).await;

    let (_, cancel_rx) = connection.cancel(uuid::Uuid::new_v4()).await.unwrap();
    let response = timeout(Duration::from_secs(10), cancel_rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_matches!(
        response.payload,
        ResponsePayload::Error { message } if message.contains("no active operation")
    );
}

#[tokio::test]
async fn framing_violation_tears_the_transport_down() {
    use futures::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    use fabric_native_host::transport::{FrameCodec, Request, RequestPayload};

    let (_dir, tool) = fake_tool(HANGING_TOOL);
    let (server, client_read, client_write) = spawn_host();

    let mut reader = tokio_util::codec::FramedRead::new(client_read, FrameCodec::<Value>::default());
    let mut writer =
        tokio_util::codec::FramedWrite::new(client_write, FrameCodec::<Request>::default());

    let id = Uuid::new_v4();
    writer
        .send(Request {
            id,
            path: Some(tool),
            payload: RequestPayload::ProcessContent {
                content: "page".into(),
                model: None,
                pattern: None,
                context: None,
                custom_prompt: Some("never finishes".into()),
            },
        })
        .await
        .unwrap();

    // The operation is streaming before the violation lands.
    let frame = timeout(Duration::from_secs(10), reader.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame["type"], "content");
    assert_eq!(frame["content"], "started");

    // A length prefix far past the frame cap: fatal, not recoverable.
    let mut raw = writer.into_inner();
    raw.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
    raw.flush().await.unwrap();

    let result = timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
    assert_matches!(result, Err(CodecError::FrameTooLarge { .. }));

    // The in-flight operation is torn down without a terminal frame: the
    // stream just ends.
    loop {
        match timeout(Duration::from_secs(10), reader.next()).await.unwrap() {
            Some(Ok(frame)) => assert_eq!(frame["type"], "content"),
            Some(Err(_)) | None => break,
        }
    }
}
