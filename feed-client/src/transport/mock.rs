//! Mock transport for testing.
//!
//! Scripts server behavior (handshake answers, injected events, drops and
//! closes) and captures sent frames for verification.

use super::{Connection, Frame, Transport, TransportError};
use async_trait::async_trait;
use feed_types::{
    ConnectionErrorEvent, ConnectionOkEvent, ConnectRequest, ErrorPayload, WsEvent,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type FrameSender = mpsc::UnboundedSender<Result<Frame, TransportError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<Frame, TransportError>>;

/// Mock transport for testing.
///
/// By default every handshake is accepted with a `connection.ok` carrying
/// `mock-conn-{n}`, where `n` counts connections from 1.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug)]
struct MockTransportInner {
    auto_accept: bool,
    connected_urls: Vec<String>,
    sent_messages: Vec<String>,
    close_codes: Vec<u16>,
    sockets: Vec<MockSocket>,
    fail_connects: VecDeque<String>,
    handshake_errors: VecDeque<ErrorPayload>,
}

#[derive(Debug)]
struct MockSocket {
    tx: FrameSender,
    connected: Arc<AtomicBool>,
}

impl Default for MockTransportInner {
    fn default() -> Self {
        Self {
            auto_accept: true,
            connected_urls: Vec::new(),
            sent_messages: Vec::new(),
            close_codes: Vec::new(),
            sockets: Vec::new(),
            fail_connects: VecDeque::new(),
            handshake_errors: VecDeque::new(),
        }
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop answering handshakes automatically.
    pub fn set_auto_accept(&self, accept: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.auto_accept = accept;
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_connects.push_back(error.to_string());
    }

    /// Answer the next handshake with `connection.error`.
    pub fn reject_next_handshake(&self, code: u32, status_code: u16, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.handshake_errors.push_back(ErrorPayload {
            code,
            status_code,
            message: message.to_string(),
        });
    }

    /// Deliver an event on the newest connection.
    pub fn push_event(&self, event: &WsEvent) {
        let text = event.to_json().unwrap();
        self.push_text(text);
    }

    /// Deliver a raw text frame on the newest connection.
    pub fn push_text(&self, text: String) {
        let inner = self.inner.lock().unwrap();
        if let Some(socket) = inner.sockets.last() {
            let _ = socket.tx.send(Ok(Frame::Text(text)));
        }
    }

    /// Deliver an event on the connection opened `index`-th (0-based).
    pub fn push_event_to(&self, index: usize, event: &WsEvent) {
        let text = event.to_json().unwrap();
        let inner = self.inner.lock().unwrap();
        if let Some(socket) = inner.sockets.get(index) {
            let _ = socket.tx.send(Ok(Frame::Text(text)));
        }
    }

    /// Fail the newest connection as if the network dropped.
    pub fn drop_connection(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(socket) = inner.sockets.last() {
            socket.connected.store(false, Ordering::SeqCst);
            let _ = socket
                .tx
                .send(Err(TransportError::ReceiveFailed("connection reset".into())));
        }
    }

    /// Close the newest connection from the server side.
    pub fn close_from_server(&self, code: u16) {
        let inner = self.inner.lock().unwrap();
        if let Some(socket) = inner.sockets.last() {
            socket.connected.store(false, Ordering::SeqCst);
            let _ = socket.tx.send(Ok(Frame::Close {
                code: Some(code),
                reason: "closed by mock server".into(),
            }));
        }
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.sockets.len()
    }

    /// URLs of every connect attempt, including failed ones.
    pub fn connected_urls(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.connected_urls.clone()
    }

    /// Get all frames that were sent, across connections.
    pub fn sent_messages(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.clone()
    }

    /// Sent handshakes, decoded.
    pub fn sent_handshakes(&self) -> Vec<ConnectRequest> {
        self.sent_messages()
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }

    /// Number of health-check pings sent.
    pub fn health_checks_sent(&self) -> usize {
        self.sent_messages()
            .iter()
            .filter(|m| m.starts_with('[') && m.contains("\"health.check\""))
            .count()
    }

    /// Close codes sent by the client.
    pub fn close_codes(&self) -> Vec<u16> {
        let inner = self.inner.lock().unwrap();
        inner.close_codes.clone()
    }

    /// Clear all state (messages, sockets, scripted failures).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected_urls.push(url.to_string());

        // Check for forced failure
        if let Some(error) = inner.fail_connects.pop_front() {
            return Err(TransportError::ConnectionFailed(error));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        inner.sockets.push(MockSocket {
            tx: tx.clone(),
            connected: Arc::clone(&connected),
        });
        let index = inner.sockets.len();

        Ok(Arc::new(MockConnection {
            index,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            connected,
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// One mock socket.
#[derive(Debug)]
pub struct MockConnection {
    index: usize,
    tx: FrameSender,
    rx: tokio::sync::Mutex<FrameReceiver>,
    connected: Arc<AtomicBool>,
    inner: Arc<Mutex<MockTransportInner>>,
}

impl MockConnection {
    fn answer_handshake(&self, request: ConnectRequest) {
        let mut inner = self.inner.lock().unwrap();
        let reply = if let Some(error) = inner.handshake_errors.pop_front() {
            WsEvent::ConnectionError(ConnectionErrorEvent {
                connection_id: None,
                error,
            })
        } else if inner.auto_accept {
            WsEvent::ConnectionOk(ConnectionOkEvent {
                connection_id: format!("mock-conn-{}", self.index),
                created_at: 0,
                me: Some(request.user_details),
            })
        } else {
            return;
        };
        if let Ok(text) = reply.to_json() {
            let _ = self.tx.send(Ok(Frame::Text(text)));
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let handshake = serde_json::from_str::<ConnectRequest>(&text).ok();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sent_messages.push(text);
        }
        if let Some(request) = handshake {
            self.answer_handshake(request);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(frame) => frame,
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.close_codes.push(code);
        }
        // The mock server acknowledges immediately.
        let _ = self.tx.send(Ok(Frame::Close {
            code: Some(code),
            reason: reason.to_string(),
        }));
        Ok(())
    }
}
