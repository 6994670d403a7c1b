//! Comet transport driven by an in-memory HTTP client.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_protocol::{
    codec, Action, ConnectionDetails, ErrorInfo, Format, Message, ProtocolMessage,
};
use tether_transport::{
    ApiKey, AuthProvider, CometConfig, CometTransport, EventSink, HttpClient, HttpError,
    HttpRequest, HttpResponse, Method, TokenCallback, Transport, TransportEnvelope,
    TransportEvent, TransportId, TransportKind, TransportParams,
};
use url::Url;
use tokio::sync::mpsc;

/// Answers connect with a canned body, plays scripted receive outcomes
/// before parking receive requests, and records every POST.
struct MockHttp {
    connect_status: u16,
    connect_body: Vec<Bytes>,
    /// `Ok` completes a receive request with an empty body.
    recv_script: Mutex<VecDeque<Result<(), HttpError>>>,
    recv_count: Mutex<u32>,
    posts: Mutex<Vec<(Url, Option<Bytes>)>>,
    post_tx: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl HttpClient for MockHttp {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let path = request.url.path().to_string();
        match request.method {
            Method::Get if path.ends_with("/connect") => Ok(HttpResponse::from_chunks(
                self.connect_status,
                self.connect_body.clone(),
            )),
            Method::Get => {
                *self.recv_count.lock().unwrap() += 1;
                let next = self.recv_script.lock().unwrap().pop_front();
                match next {
                    Some(Ok(())) => Ok(HttpResponse::from_chunks(200, vec![])),
                    Some(Err(e)) => Err(e),
                    None => Ok(HttpResponse {
                        status: 200,
                        body: stream::pending().boxed(),
                    }),
                }
            }
            Method::Post => {
                self.posts.lock().unwrap().push((request.url, request.body));
                let _ = self.post_tx.send(());
                Ok(HttpResponse::from_chunks(200, vec![]))
            }
        }
    }
}

fn connected_line() -> Bytes {
    let details = ConnectionDetails {
        connection_key: Some("key-1".into()),
        max_idle_interval: Some(15_000),
        ..Default::default()
    };
    let frame = ProtocolMessage::connected("conn-1", details);
    let mut line = codec::encode_batch(&[frame], Format::Json).unwrap().to_vec();
    line.push(b'\n');
    Bytes::from(line)
}

struct Harness {
    transport: CometTransport,
    events: mpsc::UnboundedReceiver<TransportEnvelope>,
    http: Arc<MockHttp>,
    posted: mpsc::UnboundedReceiver<()>,
}

fn harness(kind: TransportKind, status: u16, body: Vec<Bytes>) -> Harness {
    harness_with(kind, status, body, Arc::new(ApiKey::new("app.key:secret")))
}

fn harness_with(
    kind: TransportKind,
    status: u16,
    body: Vec<Bytes>,
    auth: Arc<dyn AuthProvider>,
) -> Harness {
    let (post_tx, posted) = mpsc::unbounded_channel();
    let http = Arc::new(MockHttp {
        connect_status: status,
        connect_body: body,
        recv_script: Mutex::new(VecDeque::new()),
        recv_count: Mutex::new(0),
        posts: Mutex::new(Vec::new()),
        post_tx,
    });
    let (tx, events) = mpsc::unbounded_channel();
    let transport = CometTransport::new(
        kind,
        TransportParams::new("localhost", 8080, false),
        EventSink::new(TransportId::next(), tx),
        http.clone(),
        auth,
        CometConfig::default(),
    )
    .unwrap();
    Harness {
        transport,
        events,
        http,
        posted,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEnvelope>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
        .event
}

async fn connect(h: &mut Harness) {
    h.transport.connect();
    assert_eq!(next_event(&mut h.events).await, TransportEvent::Preconnect);
    assert!(matches!(next_event(&mut h.events).await, TransportEvent::Connected { .. }));
}

async fn next_post(h: &mut Harness) -> (Url, Option<Bytes>) {
    tokio::time::timeout(Duration::from_secs(60), h.posted.recv())
        .await
        .expect("post timeout");
    h.http.posts.lock().unwrap().remove(0)
}

#[tokio::test]
async fn test_stream_connect_and_send_batch() {
    let mut h = harness(TransportKind::CometStream, 200, vec![connected_line()]);
    h.transport.connect();

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Preconnect);
    match next_event(&mut h.events).await {
        TransportEvent::Connected {
            connection_id,
            details,
            ..
        } => {
            assert_eq!(connection_id, "conn-1");
            assert_eq!(details.connection_key.as_deref(), Some("key-1"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(h.transport.is_connected());

    h.transport
        .send(ProtocolMessage::message("room", vec![Message::new("a", serde_json::json!(1))]))
        .unwrap();
    h.transport
        .send(ProtocolMessage::message("room", vec![Message::new("b", serde_json::json!(2))]))
        .unwrap();

    let mut frames = Vec::new();
    while frames.len() < 2 {
        tokio::time::timeout(Duration::from_secs(5), h.posted.recv())
            .await
            .expect("post timeout");
        let posts = std::mem::take(&mut *h.http.posts.lock().unwrap());
        for (url, body) in posts {
            assert_eq!(url.path(), "/comet/key-1/send");
            frames.extend(codec::decode_batch(&body.unwrap(), Format::Json).unwrap());
        }
    }
    let names: Vec<_> = frames
        .iter()
        .map(|f| f.messages.as_ref().unwrap()[0].name.clone().unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_streamed_channel_frames_follow_connected() {
    let mut message = codec::encode_batch(
        &[ProtocolMessage::message("room", vec![Message::new("hello", serde_json::json!("x"))])],
        Format::Json,
    )
    .unwrap()
    .to_vec();
    message.push(b'\n');
    let connected = connected_line();
    let (head, tail) = message.split_at(5);

    let mut h = harness(
        TransportKind::CometStream,
        200,
        vec![connected, Bytes::copy_from_slice(head), Bytes::copy_from_slice(tail)],
    );
    h.transport.connect();

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Preconnect);
    assert!(matches!(next_event(&mut h.events).await, TransportEvent::Connected { .. }));
    match next_event(&mut h.events).await {
        TransportEvent::Channel(frame) => {
            assert_eq!(frame.action, Action::Message);
            assert_eq!(frame.channel.as_deref(), Some("room"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_poll_connect_reads_whole_body() {
    let line = connected_line();
    let body = Bytes::copy_from_slice(&line[..line.len() - 1]);
    let mut h = harness(TransportKind::CometPoll, 200, vec![body]);
    h.transport.connect();

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Preconnect);
    assert!(matches!(next_event(&mut h.events).await, TransportEvent::Connected { .. }));
    assert_eq!(next_event(&mut h.events).await, TransportEvent::Activity);
}

#[tokio::test]
async fn test_token_error_response_disconnects() {
    let body = Bytes::from_static(
        br#"{"error":{"code":40142,"statusCode":401,"message":"Token expired"}}"#,
    );
    let mut h = harness(TransportKind::CometStream, 401, vec![body]);
    h.transport.connect();

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Preconnect);
    assert_eq!(
        next_event(&mut h.events).await,
        TransportEvent::Disconnected(ErrorInfo::new(40142, 401, "Token expired"))
    );
}

#[tokio::test]
async fn test_rejected_credentials_fail() {
    let body = Bytes::from_static(
        br#"{"error":{"code":40101,"statusCode":401,"message":"Invalid key"}}"#,
    );
    let mut h = harness(TransportKind::CometStream, 401, vec![body]);
    h.transport.connect();

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Preconnect);
    assert!(matches!(
        next_event(&mut h.events).await,
        TransportEvent::Failed(e) if e.code == 40101
    ));
}

#[tokio::test]
async fn test_disposed_transport_goes_quiet() {
    let mut h = harness(TransportKind::CometStream, 200, vec![connected_line()]);
    h.transport.dispose();
    h.transport.connect();

    tokio::task::yield_now().await;
    assert!(h.events.try_recv().is_err());
    assert!(h.transport.send(ProtocolMessage::close()).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_single_receive_failure_is_tolerated() {
    let mut h = harness(TransportKind::CometStream, 200, vec![connected_line()]);
    h.http
        .recv_script
        .lock()
        .unwrap()
        .extend([Err(HttpError::Network("connection reset".into())), Ok(())]);
    connect(&mut h).await;

    // End of the connect request, then the receive request after the retry.
    assert_eq!(next_event(&mut h.events).await, TransportEvent::Activity);
    assert_eq!(next_event(&mut h.events).await, TransportEvent::Activity);
    assert!(tokio::time::timeout(Duration::from_secs(60), h.events.recv())
        .await
        .is_err());
    assert_eq!(*h.http.recv_count.lock().unwrap(), 3);
    assert!(h.transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_receive_failures_disconnect() {
    let mut h = harness(TransportKind::CometStream, 200, vec![connected_line()]);
    h.http
        .recv_script
        .lock()
        .unwrap()
        .extend((0..5).map(|_| Err(HttpError::Network("connection reset".into()))));
    connect(&mut h).await;

    assert_eq!(next_event(&mut h.events).await, TransportEvent::Activity);
    match next_event(&mut h.events).await {
        TransportEvent::Disconnected(err) => assert_eq!(err.code, 80003),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(*h.http.recv_count.lock().unwrap(), 5);
}

#[tokio::test]
async fn test_dispose_tells_service_to_disconnect() {
    let mut h = harness(TransportKind::CometStream, 200, vec![connected_line()]);
    connect(&mut h).await;

    h.transport.dispose();
    let (url, _) = next_post(&mut h).await;
    assert_eq!(url.path(), "/comet/key-1/disconnect");
}

#[tokio::test]
async fn test_dispose_after_close_sends_no_disconnect() {
    let mut h = harness(TransportKind::CometStream, 200, vec![connected_line()]);
    connect(&mut h).await;

    h.transport.request_close();
    let (url, _) = next_post(&mut h).await;
    assert_eq!(url.path(), "/comet/key-1/close");

    h.transport.dispose();
    tokio::task::yield_now().await;
    assert!(h.http.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_reauthorize_renews_endpoints_and_sends_auth() {
    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let auth = TokenCallback::new(move || {
        let mut n = counter.lock().unwrap();
        let token = format!("token-{n}");
        *n += 1;
        Box::pin(async move { Ok(token) })
    });
    let mut h = harness_with(TransportKind::CometStream, 200, vec![connected_line()], Arc::new(auth));
    connect(&mut h).await;

    h.transport.reauthorize();
    let (url, body) = next_post(&mut h).await;
    assert_eq!(url.path(), "/comet/key-1/send");
    assert_eq!(url.query(), Some("access_token=token-1"));
    let frames = codec::decode_batch(&body.unwrap(), Format::Json).unwrap();
    assert_eq!(frames, vec![ProtocolMessage::auth("token-1")]);
}
