//! Comet (HTTP streaming / long polling) transport.
//!
//! The connect request doubles as the first receive request. Once the
//! service confirms the connection, receive requests are reopened one after
//! another while the transport is connected, and outbound frames are POSTed
//! in batches: everything queued while a send is in flight goes out in the
//! next request. Comet always speaks JSON.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_protocol::{codec, codes, Action, ErrorInfo, Format, ProtocolMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::auth::{auth_failure_event, AuthParams, AuthProvider};
use crate::events::{classify, frame_from_http_error};
use crate::http::{error_from_body, HttpClient, HttpError, HttpRequest, Method};
use crate::params::TransportParams;
use crate::request::RequestPolicy;
use crate::traits::{
    EventSink, Transport, TransportError, TransportEvent, TransportId, TransportKind,
};

/// Consecutive failed receive requests tolerated before disconnecting.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const ERROR_BACKOFF_MS: u64 = 1000;

/// Comet transport configuration.
#[derive(Debug, Clone, Copy)]
pub struct CometConfig {
    /// Policy for send, close and disconnect requests.
    pub request: RequestPolicy,
    /// Longest a receive request may stay open.
    pub recv_timeout: Duration,
}

impl Default for CometConfig {
    fn default() -> Self {
        Self {
            request: RequestPolicy::default(),
            recv_timeout: Duration::from_secs(90),
        }
    }
}

/// Per-connection URIs, known once CONNECTED has been received.
#[derive(Debug, Clone)]
struct Endpoints {
    key: String,
    send: Url,
    recv: Url,
    close: Url,
    disconnect: Url,
}

impl Endpoints {
    fn new(base: &Url, connection_key: &str, auth: &AuthParams) -> Result<Self, TransportError> {
        let endpoint = |suffix: &str| -> Result<Url, TransportError> {
            let mut url = base.join(&format!("{connection_key}/{suffix}"))?;
            url.query_pairs_mut().extend_pairs([auth.query_pair()]);
            Ok(url)
        };
        Ok(Self {
            key: connection_key.to_string(),
            send: endpoint("send")?,
            recv: endpoint("recv")?,
            close: endpoint("close")?,
            disconnect: endpoint("disconnect")?,
        })
    }
}

/// Splits a streamed body into newline-terminated chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(pos).freeze();
        self.buf.advance(1);
        Some(line)
    }

    fn finish(&mut self) -> Option<Bytes> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        Some(self.buf.split().freeze())
    }
}

enum RecvError {
    /// The service ended the exchange; no further receive requests.
    Stop,
    Http(HttpError),
}

struct Shared {
    kind: TransportKind,
    host: String,
    http: Arc<dyn HttpClient>,
    auth: Arc<dyn AuthProvider>,
    config: CometConfig,
    sink: EventSink,
    base: Url,
    auth_params: Mutex<Option<AuthParams>>,
    endpoints: watch::Sender<Option<Endpoints>>,
}

impl Shared {
    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("accept".into(), Format::Json.content_type().into()),
            ("content-type".into(), Format::Json.content_type().into()),
        ]
    }

    fn streaming(&self) -> bool {
        self.kind == TransportKind::CometStream
    }

    fn deliver(&self, frames: Vec<ProtocolMessage>) {
        for frame in frames {
            trace!(transport = %self.sink.id(), action = %frame.action, "Received frame");
            if frame.action == Action::Connected {
                self.set_endpoints(&frame);
            }
            if let Some(event) = classify(frame) {
                self.sink.emit(event);
            }
        }
    }

    fn set_endpoints(&self, frame: &ProtocolMessage) {
        let key = frame
            .connection_details
            .as_ref()
            .and_then(|d| d.connection_key.clone())
            .or_else(|| frame.connection_key.clone());
        let auth = self.auth_params.lock().ok().and_then(|a| a.clone());
        let (Some(key), Some(auth)) = (key, auth) else {
            warn!(transport = %self.sink.id(), "CONNECTED without connection key");
            return;
        };
        match Endpoints::new(&self.base, &key, &auth) {
            Ok(endpoints) => {
                debug!(transport = %self.sink.id(), recv = %endpoints.recv.path(), "Comet endpoints set");
                self.endpoints.send_replace(Some(endpoints));
            }
            Err(e) => warn!(transport = %self.sink.id(), error = %e, "Invalid comet endpoint"),
        }
    }

    fn decode_and_deliver(&self, data: &[u8]) {
        match codec::decode_batch(data, Format::Json) {
            Ok(frames) => self.deliver(frames),
            Err(e) => warn!(transport = %self.sink.id(), error = %e, "Undecodable comet body"),
        }
    }

    /// One receive exchange. The connect request is the first of these.
    async fn receive(&self, url: Url, connecting: bool, connect_timeout: Duration) -> Result<(), RecvError> {
        let request = HttpRequest {
            method: Method::Get,
            url,
            headers: self.headers(),
            body: None,
            timeout: self.config.recv_timeout,
        };
        let result = if connecting {
            match tokio::time::timeout(connect_timeout, self.http.execute(request)).await {
                Ok(result) => result,
                Err(_) => Err(HttpError::Timeout),
            }
        } else {
            self.http.execute(request).await
        };
        let response = result.map_err(RecvError::Http)?;

        if self.sink.is_closed() {
            return Err(RecvError::Stop);
        }
        if connecting {
            self.sink.emit(TransportEvent::Preconnect);
        }

        if !response.is_success() {
            let status = response.status;
            let body = response.bytes().await.unwrap_or_default();
            let error = error_from_body(status, &body);
            debug!(transport = %self.sink.id(), status, code = error.code, "Comet request rejected");
            self.deliver(vec![frame_from_http_error(error)]);
            return Err(RecvError::Stop);
        }

        let mut body = response.body;
        let mut lines = LineBuffer::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(RecvError::Http)?;
            if self.sink.is_closed() {
                return Err(RecvError::Stop);
            }
            lines.push(&chunk);
            if self.streaming() {
                while let Some(line) = lines.next_line() {
                    if !line.iter().all(u8::is_ascii_whitespace) {
                        self.decode_and_deliver(&line);
                    }
                }
            }
        }
        if let Some(rest) = lines.finish() {
            self.decode_and_deliver(&rest);
        }
        self.sink.emit(TransportEvent::Activity);
        Ok(())
    }

    async fn run(self: Arc<Self>, params: TransportParams) {
        let auth = match self.auth.auth_params(params.force_auth_refresh).await {
            Ok(auth) => auth,
            Err(e) => {
                self.sink.emit(auth_failure_event(e));
                return;
            }
        };
        if let Ok(mut slot) = self.auth_params.lock() {
            *slot = Some(auth.clone());
        }

        let mut connect_url = match self.base.join("connect") {
            Ok(url) => url,
            Err(e) => {
                self.sink.emit(TransportEvent::Disconnected(ErrorInfo::new(
                    codes::FAILED,
                    400,
                    e.to_string(),
                )));
                return;
            }
        };
        connect_url
            .query_pairs_mut()
            .extend_pairs(params.connect_query(&auth))
            .append_pair("stream", if self.streaming() { "true" } else { "false" });

        info!(transport = %self.sink.id(), kind = %self.kind, host = %self.host, "Comet connecting");
        match self.receive(connect_url, true, params.connect_timeout).await {
            Ok(()) => {}
            Err(RecvError::Stop) => return,
            Err(RecvError::Http(e)) => {
                self.sink.emit(TransportEvent::Disconnected(e.to_error_info()));
                return;
            }
        }
        if !self.sink.is_connected() {
            self.sink.emit(TransportEvent::Disconnected(ErrorInfo::new(
                codes::DISCONNECTED,
                400,
                "Connect request completed without confirmation",
            )));
            return;
        }

        self.recv_loop().await;
    }

    async fn recv_loop(&self) {
        let mut consecutive_errors = 0u32;
        loop {
            if self.sink.is_closed() || !self.sink.is_connected() {
                break;
            }
            let current = self.endpoints.borrow().clone();
            let Some(endpoints) = current else {
                break;
            };
            match self.receive(endpoints.recv, false, Duration::ZERO).await {
                Ok(()) => consecutive_errors = 0,
                Err(RecvError::Stop) => break,
                Err(RecvError::Http(e)) => {
                    consecutive_errors += 1;
                    warn!(transport = %self.sink.id(), error = %e, consecutive_errors, "Comet receive error");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.sink.emit(TransportEvent::Disconnected(e.to_error_info()));
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(
                        ERROR_BACKOFF_MS * u64::from(consecutive_errors),
                    ))
                    .await;
                }
            }
        }
        debug!(transport = %self.sink.id(), "Comet receive loop exited");
    }

    async fn post(&self, url: &Url, body: Bytes, what: &str) -> Result<(u16, Bytes), HttpError> {
        self.config
            .request
            .run(what, || {
                let request = HttpRequest {
                    method: Method::Post,
                    url: url.clone(),
                    headers: self.headers(),
                    body: Some(body.clone()),
                    timeout: self.config.request.timeout,
                };
                async move {
                    let response = self.http.execute(request).await?;
                    let status = response.status;
                    let body = response.bytes().await?;
                    Ok((status, body))
                }
            })
            .await
    }

    async fn send_loop(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>) {
        let mut endpoints_rx = self.endpoints.subscribe();
        loop {
            if endpoints_rx.borrow().is_some() {
                break;
            }
            if endpoints_rx.changed().await.is_err() {
                return;
            }
        }

        while let Some(first) = outbound.recv().await {
            // Renewed credentials replace the endpoints.
            let current = endpoints_rx.borrow().clone();
            let Some(endpoints) = current else {
                break;
            };
            let mut batch = vec![first];
            while let Ok(next) = outbound.try_recv() {
                batch.push(next);
            }
            let body = match codec::encode_batch(&batch, Format::Json) {
                Ok(body) => body,
                Err(e) => {
                    warn!(transport = %self.sink.id(), error = %e, "Unable to encode send batch");
                    continue;
                }
            };
            trace!(transport = %self.sink.id(), frames = batch.len(), "Comet send");
            match self.post(&endpoints.send, body, "send").await {
                Ok((status, body)) if (200..300).contains(&status) => {
                    if !body.is_empty() {
                        self.decode_and_deliver(&body);
                    }
                }
                Ok((status, body)) => {
                    self.deliver(vec![frame_from_http_error(error_from_body(status, &body))]);
                    break;
                }
                Err(e) => {
                    self.sink.emit(TransportEvent::Disconnected(e.to_error_info()));
                    break;
                }
            }
        }
    }
}

impl Shared {
    /// Renew the credentials used by every later request and tell the
    /// service with an AUTH frame.
    async fn reauthorize(&self, outbound: mpsc::UnboundedSender<ProtocolMessage>) {
        let auth = match self.auth.auth_params(true).await {
            Ok(auth) => auth,
            Err(e) => {
                self.sink.emit(auth_failure_event(e));
                return;
            }
        };
        let AuthParams::Token(token) = &auth else {
            debug!(transport = %self.sink.id(), "Key credentials cannot be renewed");
            return;
        };
        if let Ok(mut slot) = self.auth_params.lock() {
            *slot = Some(auth.clone());
        }
        let current = self.endpoints.borrow().clone();
        if let Some(current) = current {
            match Endpoints::new(&self.base, &current.key, &auth) {
                Ok(endpoints) => {
                    self.endpoints.send_replace(Some(endpoints));
                }
                Err(e) => warn!(transport = %self.sink.id(), error = %e, "Invalid comet endpoint"),
            }
        }
        let _ = outbound.send(ProtocolMessage::auth(token.clone()));
    }
}

/// Comet transport over an [`HttpClient`].
pub struct CometTransport {
    id: TransportId,
    params: TransportParams,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ProtocolMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ProtocolMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_requested: AtomicBool,
}

impl CometTransport {
    /// Create an unconnected Comet transport.
    ///
    /// # Errors
    ///
    /// Returns an error if `kind` is not a Comet kind or the host is invalid.
    pub fn new(
        kind: TransportKind,
        params: TransportParams,
        sink: EventSink,
        http: Arc<dyn HttpClient>,
        auth: Arc<dyn AuthProvider>,
        config: CometConfig,
    ) -> Result<Self, TransportError> {
        if !kind.is_comet() {
            return Err(TransportError::Unsupported(kind));
        }
        let base = params.comet_base()?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (endpoints, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            kind,
            host: params.host.clone(),
            http,
            auth,
            config,
            sink: sink.clone(),
            base,
            auth_params: Mutex::new(None),
            endpoints,
        });
        Ok(Self {
            id: sink.id(),
            params,
            shared,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
            close_requested: AtomicBool::new(false),
        })
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }
}

impl Transport for CometTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    fn host(&self) -> &str {
        &self.shared.host
    }

    fn connect(&self) {
        let Some(outbound_rx) = self.outbound_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };
        self.track(tokio::spawn(self.shared.clone().run(self.params.clone())));
        self.track(tokio::spawn(self.shared.clone().send_loop(outbound_rx)));
    }

    fn send(&self, frame: ProtocolMessage) -> Result<(), TransportError> {
        if self.shared.sink.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let current = shared.endpoints.borrow().clone();
        let Some(endpoints) = current else {
            return;
        };
        self.track(tokio::spawn(async move {
            if let Err(e) = shared.post(&endpoints.close, Bytes::new(), "close").await {
                shared.sink.emit(TransportEvent::Disconnected(e.to_error_info()));
            }
        }));
    }

    fn dispose(&self) {
        // Abandoning a connection the service still considers live.
        let live = !self.shared.sink.is_closed() && !self.close_requested.load(Ordering::SeqCst);
        self.shared.sink.detach();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let current = self.shared.endpoints.borrow().clone();
        if let (true, Some(endpoints), Ok(runtime)) =
            (live, current, tokio::runtime::Handle::try_current())
        {
            let shared = self.shared.clone();
            runtime.spawn(async move {
                if let Err(e) = shared.post(&endpoints.disconnect, Bytes::new(), "disconnect").await {
                    debug!(transport = %shared.sink.id(), error = %e, "Disconnect request failed");
                }
            });
        }
        debug!(transport = %self.id, "Comet transport disposed");
    }

    fn is_connected(&self) -> bool {
        self.shared.sink.is_connected()
    }

    fn reauthorize(&self) {
        if self.shared.sink.is_closed() {
            return;
        }
        let shared = self.shared.clone();
        let outbound = self.outbound.clone();
        self.track(tokio::spawn(async move { shared.reauthorize(outbound).await }));
    }
}

impl Drop for CometTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_chunks() {
        let mut lines = LineBuffer::default();
        lines.push(b"[{\"action\":0}]\n[{\"act");
        assert_eq!(&lines.next_line().unwrap()[..], b"[{\"action\":0}]");
        assert!(lines.next_line().is_none());

        lines.push(b"ion\":1}]\n");
        assert_eq!(&lines.next_line().unwrap()[..], b"[{\"action\":1}]");
        assert!(lines.finish().is_none());
    }

    #[test]
    fn test_line_buffer_unterminated_body() {
        let mut lines = LineBuffer::default();
        lines.push(b"[{\"action\":4}]");
        assert!(lines.next_line().is_none());
        assert_eq!(&lines.finish().unwrap()[..], b"[{\"action\":4}]");
    }

    #[test]
    fn test_endpoints() {
        let base = Url::parse("https://realtime.example.com:443/comet/").unwrap();
        let endpoints = Endpoints::new(&base, "abc!def", &AuthParams::Key("k:s".into())).unwrap();
        assert_eq!(endpoints.send.path(), "/comet/abc!def/send");
        assert_eq!(endpoints.recv.path(), "/comet/abc!def/recv");
        assert_eq!(endpoints.close.path(), "/comet/abc!def/close");
        assert_eq!(endpoints.disconnect.path(), "/comet/abc!def/disconnect");
        assert_eq!(endpoints.recv.query(), Some("key=k%3As"));
    }
}
