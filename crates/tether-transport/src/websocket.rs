//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! JSON frames travel as text messages, MessagePack frames as binary
//! messages; one WebSocket message carries exactly one frame.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tether_protocol::{codec, codes, ErrorInfo, Format, ProtocolMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::auth::{auth_failure_event, AuthParams, AuthProvider};
use crate::events::classify;
use crate::params::TransportParams;
use crate::traits::{
    EventSink, Transport, TransportError, TransportEvent, TransportId, TransportKind,
};

fn closed_error(clean: bool, code: Option<u16>) -> ErrorInfo {
    if clean {
        ErrorInfo::new(codes::DISCONNECTED, 400, "Websocket closed")
    } else {
        let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
        ErrorInfo::new(
            codes::DISCONNECTED,
            400,
            format!("Unclean disconnection of WebSocket ; code = {code}"),
        )
    }
}

fn encode_message(frame: &ProtocolMessage, format: Format) -> Result<Message, TransportError> {
    let data = codec::encode(frame, format)?;
    Ok(match format {
        Format::Json => Message::Text(String::from_utf8_lossy(&data).into_owned()),
        Format::MsgPack => Message::Binary(data.to_vec()),
    })
}

fn decode_message(message: &Message) -> Option<Result<ProtocolMessage, TransportError>> {
    let result = match message {
        Message::Text(text) => codec::decode(text.as_bytes(), Format::Json),
        Message::Binary(data) => codec::decode(data, Format::MsgPack),
        _ => return None,
    };
    Some(result.map_err(TransportError::from))
}

/// WebSocket client transport.
pub struct WebSocketTransport {
    id: TransportId,
    params: TransportParams,
    sink: EventSink,
    auth: Arc<dyn AuthProvider>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Create an unconnected WebSocket transport.
    #[must_use]
    pub fn new(params: TransportParams, sink: EventSink, auth: Arc<dyn AuthProvider>) -> Self {
        let (writer, writer_rx) = mpsc::unbounded_channel();
        Self {
            id: sink.id(),
            params,
            sink,
            auth,
            writer: Mutex::new(Some(writer)),
            writer_rx: Mutex::new(Some(writer_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }

    fn queue(&self, message: Message) -> Result<(), TransportError> {
        let writer = self.writer.lock().ok().and_then(|w| w.clone());
        match writer {
            Some(writer) => writer
                .send(message)
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

async fn run(
    params: TransportParams,
    sink: EventSink,
    auth: Arc<dyn AuthProvider>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    pong: mpsc::UnboundedSender<Message>,
) {
    let auth = match auth.auth_params(params.force_auth_refresh).await {
        Ok(auth) => auth,
        Err(e) => {
            sink.emit(auth_failure_event(e));
            return;
        }
    };
    if sink.is_closed() {
        return;
    }
    let url = match params.websocket_url(&auth) {
        Ok(url) => url,
        Err(e) => {
            sink.emit(TransportEvent::Disconnected(ErrorInfo::new(
                codes::FAILED,
                400,
                e.to_string(),
            )));
            return;
        }
    };

    info!(transport = %sink.id(), host = %params.host, "WebSocket connecting");
    let stream = match tokio::time::timeout(params.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!(transport = %sink.id(), error = %e, "WebSocket handshake failed");
            sink.emit(TransportEvent::Disconnected(ErrorInfo::new(
                codes::DISCONNECTED,
                0,
                format!("WebSocket handshake failed: {e}"),
            )));
            return;
        }
        Err(_) => {
            sink.emit(TransportEvent::Disconnected(ErrorInfo::timeout(
                "WebSocket handshake",
            )));
            return;
        }
    };
    if sink.is_closed() {
        return;
    }
    debug!(transport = %sink.id(), "WebSocket open");
    sink.emit(TransportEvent::Preconnect);

    let (mut write, mut read) = stream.split();

    let writer_sink = sink.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                writer_sink.emit(TransportEvent::Disconnected(ErrorInfo::new(
                    50000,
                    500,
                    format!("Exception from ws connection when trying to send: {e}"),
                )));
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    loop {
        match read.next().await {
            Some(Ok(Message::Ping(data))) => {
                sink.emit(TransportEvent::Activity);
                let _ = pong.send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {
                sink.emit(TransportEvent::Activity);
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                debug!(transport = %sink.id(), ?code, "Received close frame");
                sink.emit(TransportEvent::Disconnected(closed_error(
                    code.map_or(true, |c| c == 1000),
                    code,
                )));
                break;
            }
            Some(Ok(message)) => match decode_message(&message) {
                Some(Ok(frame)) => {
                    trace!(transport = %sink.id(), action = %frame.action, "Received frame");
                    if let Some(event) = classify(frame) {
                        sink.emit(event);
                    } else {
                        sink.emit(TransportEvent::Activity);
                    }
                }
                Some(Err(e)) => {
                    warn!(transport = %sink.id(), error = %e, "Undecodable WebSocket message");
                }
                None => {}
            },
            Some(Err(e)) => {
                debug!(transport = %sink.id(), error = %e, "WebSocket error");
                sink.emit(TransportEvent::Disconnected(closed_error(false, None)));
                break;
            }
            None => {
                debug!(transport = %sink.id(), "WebSocket stream ended");
                sink.emit(TransportEvent::Disconnected(closed_error(false, None)));
                break;
            }
        }
    }
    writer.abort();
}

impl Transport for WebSocketTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn host(&self) -> &str {
        &self.params.host
    }

    fn connect(&self) {
        let Some(outbound) = self.writer_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };
        let Some(pong) = self.writer.lock().ok().and_then(|w| w.clone()) else {
            return;
        };
        self.track(tokio::spawn(run(
            self.params.clone(),
            self.sink.clone(),
            self.auth.clone(),
            outbound,
            pong,
        )));
    }

    fn send(&self, frame: ProtocolMessage) -> Result<(), TransportError> {
        if self.sink.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.queue(encode_message(&frame, self.params.format)?)
    }

    fn request_close(&self) {
        if let Err(e) = self.send(ProtocolMessage::close()) {
            debug!(transport = %self.id, error = %e, "Unable to send CLOSE");
        }
    }

    fn dispose(&self) {
        self.sink.detach();
        let _ = self.queue(Message::Close(None));
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        debug!(transport = %self.id, "WebSocket transport disposed");
    }

    fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    fn reauthorize(&self) {
        if self.sink.is_closed() {
            return;
        }
        let Some(writer) = self.writer.lock().ok().and_then(|w| w.clone()) else {
            return;
        };
        let (auth, sink, format) = (self.auth.clone(), self.sink.clone(), self.params.format);
        self.track(tokio::spawn(async move {
            match auth.auth_params(true).await {
                Ok(AuthParams::Token(token)) => {
                    match encode_message(&ProtocolMessage::auth(token), format) {
                        Ok(message) => {
                            let _ = writer.send(message);
                        }
                        Err(e) => warn!(transport = %sink.id(), error = %e, "Unable to encode AUTH"),
                    }
                }
                Ok(AuthParams::Key(_)) => {
                    debug!(transport = %sink.id(), "Key credentials cannot be renewed");
                }
                Err(e) => {
                    sink.emit(auth_failure_event(e));
                }
            }
        }));
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}
