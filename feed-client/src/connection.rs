//! Connection runtime.
//!
//! One background task owns the [`ConnectionState`] machine and performs the
//! I/O its actions ask for: opening sockets, sending the handshake and
//! health checks, arming timers, settling the connection id and answering
//! connect calls. Callers talk to it through a [`ConnectionHandle`].
//!
//! Socket opens and reads run in helper tasks that report back over an
//! internal channel, tagged with the epoch of the session they belong to.
//! Each report is checked against the current epoch, so a slow old socket
//! can never act on a newer session. Everything the rest of the client
//! needs to know leaves the task as a [`Signal`], in order.

use feed_core::{Action, ConnectionState, Event};
use feed_types::{
    ConnectRequest, ConnectionOkEvent, HealthCheckPing, UserData, WsEvent, WS_CLOSED_SUCCESS,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{AuthType, ClientConfig, ConnectionConfig};
use crate::connection_id::ConnectionIdSlot;
use crate::error::ClientError;
use crate::token::TokenManager;
use crate::transport::{Connection, Frame, Transport, TransportError};

type ConnectReply = oneshot::Sender<Result<ConnectionOkEvent, ClientError>>;

/// What the runtime reports to the orchestrator.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    /// An event arrived on the session with this epoch.
    Event { epoch: u64, event: WsEvent },
    /// Health flipped.
    Health {
        healthy: bool,
        connection_id: Option<String>,
        me: Option<UserData>,
    },
    /// A reconnect completed; active entities must be resynchronized.
    Recover { connection_id: Option<String> },
}

enum Command {
    Connect {
        user: UserData,
        url: String,
        anonymous: bool,
        reply: ConnectReply,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Network {
        online: bool,
    },
}

enum Internal {
    Opened {
        epoch: u64,
        connection: Arc<dyn Connection>,
        token: Option<String>,
    },
    OpenFailed {
        epoch: u64,
        error: String,
        retryable: bool,
    },
    Frame {
        epoch: u64,
        frame: Result<Frame, TransportError>,
    },
}

/// Handle to the connection runtime task.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    config: Arc<ClientConfig>,
    epoch: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Start the runtime task.
    pub(crate) fn spawn(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenManager>,
        connection_id: Arc<ConnectionIdSlot>,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let healthy = Arc::new(AtomicBool::new(false));

        let runtime = ConnectionRuntime {
            state: ConnectionState::new(),
            config: config.connection.clone(),
            transport,
            tokens,
            connection_id,
            signals,
            internal_tx,
            internal_rx,
            user: None,
            url: String::new(),
            anonymous: false,
            socket: None,
            reader: None,
            opener: None,
            closing: None,
            handshake_token: None,
            confirmed: None,
            pending_connect: None,
            reconnect_at: None,
            ping_at: None,
            liveness_at: None,
            epoch: Arc::clone(&epoch),
            healthy: Arc::clone(&healthy),
        };
        tokio::spawn(runtime.run(command_rx));

        Self {
            commands,
            config,
            epoch,
            healthy,
        }
    }

    /// Connect as `user` and wait for the server's confirmation.
    ///
    /// The wait is bounded by the configured connect timeout. A timeout only
    /// abandons this call; the runtime keeps trying to connect.
    pub(crate) async fn connect(
        &self,
        user: UserData,
        anonymous: bool,
    ) -> Result<ConnectionOkEvent, ClientError> {
        let auth = if anonymous {
            AuthType::Anonymous
        } else {
            AuthType::Jwt
        };
        let url = self.config.ws_url(auth)?.to_string();
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                user,
                url,
                anonymous,
                reply,
            })
            .map_err(|_| ClientError::Disconnected)?;

        let timeout = self.config.connection.connect_timeout();
        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::ConnectTimeout(timeout)),
        }
    }

    /// Close the connection and wait for the server's acknowledgment.
    ///
    /// Idempotent.
    pub(crate) async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Report a host network change.
    pub(crate) fn set_online(&self, online: bool) {
        let _ = self.commands.send(Command::Network { online });
    }

    /// Epoch of the current session.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether the connection is healthy.
    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

struct ConnectionRuntime {
    state: ConnectionState,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
    connection_id: Arc<ConnectionIdSlot>,
    signals: mpsc::UnboundedSender<Signal>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    user: Option<UserData>,
    url: String,
    anonymous: bool,

    socket: Option<Arc<dyn Connection>>,
    reader: Option<JoinHandle<()>>,
    opener: Option<JoinHandle<()>>,
    closing: Option<JoinHandle<()>>,
    handshake_token: Option<String>,
    confirmed: Option<ConnectionOkEvent>,
    pending_connect: Option<ConnectReply>,

    reconnect_at: Option<Instant>,
    ping_at: Option<Instant>,
    liveness_at: Option<Instant>,

    epoch: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
}

impl ConnectionRuntime {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },

                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),

                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    let epoch = self.state.epoch();
                    self.feed(Event::ReconnectTimerFired { epoch });
                }

                _ = sleep_until_opt(self.ping_at) => self.send_health_check(),

                _ = sleep_until_opt(self.liveness_at) => self.check_liveness(),
            }
        }

        tracing::debug!("connection runtime stopped");
        self.close_socket();
        if let Some(opener) = self.opener.take() {
            opener.abort();
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                user,
                url,
                anonymous,
                reply,
            } => {
                let waiting = self
                    .pending_connect
                    .as_ref()
                    .is_some_and(|pending| !pending.is_closed());
                if waiting || self.state.is_connecting() {
                    let _ = reply.send(Err(ClientError::ConnectInProgress));
                    return;
                }
                if self.state.is_healthy() {
                    if let Some(confirmed) = self.confirmed.clone() {
                        let _ = reply.send(Ok(confirmed));
                        return;
                    }
                }
                tracing::info!("connecting as {}", user.id);
                self.user = Some(user);
                self.url = url;
                self.anonymous = anonymous;
                self.pending_connect = Some(reply);
                self.feed(Event::ConnectRequested);
            }
            Command::Disconnect { reply } => {
                tracing::info!("disconnecting");
                self.feed(Event::DisconnectRequested);
                if let Some(closing) = self.closing.take() {
                    let _ = closing.await;
                }
                let _ = reply.send(());
            }
            Command::Network { online: false } => {
                tracing::info!("host reported offline");
                self.feed(Event::NetworkOffline);
            }
            Command::Network { online: true } => {
                if !self.state.is_healthy() {
                    tracing::info!("host reported online");
                    self.feed(Event::NetworkOnline {
                        delay: self.config.online_reconnect_delay(),
                    });
                }
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Opened {
                epoch,
                connection,
                token,
            } => {
                let current = matches!(self.state, ConnectionState::Connecting { .. })
                    && epoch == self.state.epoch();
                if !current {
                    tracing::debug!("discarding socket opened for stale session {}", epoch);
                    tokio::spawn(async move {
                        let _ = connection.close(WS_CLOSED_SUCCESS, "").await;
                    });
                    return;
                }
                self.opener = None;
                self.handshake_token = token;
                self.reader = Some(spawn_reader(
                    epoch,
                    Arc::clone(&connection),
                    self.internal_tx.clone(),
                ));
                self.socket = Some(connection);
                self.feed(Event::SocketOpened {
                    epoch,
                    at: Instant::now().into_std(),
                });
            }
            Internal::OpenFailed {
                epoch,
                error,
                retryable,
            } => {
                tracing::warn!("socket open failed: {}", error);
                if epoch == self.state.epoch() {
                    self.opener = None;
                }
                self.feed(Event::SocketOpenFailed {
                    epoch,
                    error,
                    retryable,
                });
            }
            Internal::Frame { epoch, frame } => self.on_frame(epoch, frame),
        }
    }

    fn on_frame(&mut self, epoch: u64, frame: Result<Frame, TransportError>) {
        let text = match frame {
            Ok(Frame::Text(text)) => text,
            Ok(Frame::Close { code, reason }) => {
                tracing::info!("socket closed by peer (code {:?}): {}", code, reason);
                self.feed(Event::SocketClosed {
                    epoch,
                    code,
                    reason,
                });
                return;
            }
            Err(e) => {
                tracing::warn!("socket error: {}", e);
                self.feed(Event::SocketErrored {
                    epoch,
                    error: e.to_string(),
                });
                return;
            }
        };

        if epoch != self.state.epoch() {
            tracing::debug!("discarding frame from stale session {}", epoch);
            return;
        }
        self.feed(Event::MessageReceived {
            epoch,
            at: Instant::now().into_std(),
        });

        let event = match WsEvent::from_json(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("dropping undecodable frame: {}", e);
                return;
            }
        };

        match &event {
            WsEvent::ConnectionOk(ok) => {
                tracing::info!("connection confirmed: {}", ok.connection_id);
                self.confirmed = Some(ok.clone());
                self.feed(Event::HandshakeConfirmed {
                    epoch,
                    connection_id: ok.connection_id.clone(),
                });
            }
            WsEvent::ConnectionError(err) => {
                tracing::warn!(
                    "connection error (code {}, status {}): {}",
                    err.error.code,
                    err.error.status_code,
                    err.error.message
                );
                self.feed(Event::ConnectionErrorReceived {
                    epoch,
                    code: err.error.code,
                    status: err.error.status_code,
                    message: err.error.message.clone(),
                    token_refreshable: self.tokens.is_refreshable(),
                });
            }
            WsEvent::HealthCheck(_) => self.feed(Event::HealthCheckReceived { epoch }),
            _ => {}
        }

        let _ = self.signals.send(Signal::Event { epoch, event });
    }

    fn feed(&mut self, event: Event) {
        let state = std::mem::take(&mut self.state);
        let (state, actions) = state.on_event(event);
        self.state = state;
        self.epoch.store(self.state.epoch(), Ordering::SeqCst);
        for action in actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::OpenSocket { epoch } => self.open_socket(epoch),
            Action::SendHandshake { epoch } => self.send_handshake(epoch),
            Action::CloseSocket => self.close_socket(),
            Action::ResetConnectionId => self.connection_id.reset(),
            Action::ResolveConnectionId { connection_id } => {
                self.connection_id.resolve(connection_id)
            }
            Action::RejectConnectionId { reason } => self.connection_id.reject(reason),
            Action::CompleteConnect => {
                if let (Some(reply), Some(confirmed)) =
                    (self.pending_connect.take(), self.confirmed.clone())
                {
                    let _ = reply.send(Ok(confirmed));
                }
            }
            Action::FailConnect { failure } => {
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Err(failure.into()));
                }
            }
            Action::StartHealthCheck { .. } => {
                let now = Instant::now();
                self.ping_at = Some(now + self.config.health_check_interval());
                self.liveness_at = Some(now + self.config.liveness_window());
            }
            Action::StopHealthCheck => {
                self.ping_at = None;
                self.liveness_at = None;
            }
            Action::ScheduleReconnect { delay, .. } => {
                tracing::info!(
                    "reconnecting in {:?} (consecutive failures: {}, total: {})",
                    delay,
                    self.state.session().consecutive_failures,
                    self.state.session().total_failures
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Action::CancelReconnect => self.reconnect_at = None,
            Action::ReloadToken => {
                tracing::info!("token expired, reloading before reconnect");
                self.tokens.invalidate();
            }
            Action::HealthChanged { healthy } => {
                self.healthy.store(healthy, Ordering::SeqCst);
                let _ = self.signals.send(Signal::Health {
                    healthy,
                    connection_id: self.state.connection_id().map(str::to_string),
                    me: self.confirmed.as_ref().and_then(|c| c.me.clone()),
                });
            }
            Action::Recover => {
                let _ = self.signals.send(Signal::Recover {
                    connection_id: self.state.connection_id().map(str::to_string),
                });
            }
        }
    }

    fn open_socket(&mut self, epoch: u64) {
        if let Some(opener) = self.opener.take() {
            opener.abort();
        }
        let transport = Arc::clone(&self.transport);
        let tokens = Arc::clone(&self.tokens);
        let internal = self.internal_tx.clone();
        let url = self.url.clone();
        let anonymous = self.anonymous;

        self.opener = Some(tokio::spawn(async move {
            let token = if anonymous {
                None
            } else {
                match tokens.get_token().await {
                    Ok(token) => Some(token),
                    Err(e) => {
                        let _ = internal.send(Internal::OpenFailed {
                            epoch,
                            error: e.to_string(),
                            retryable: false,
                        });
                        return;
                    }
                }
            };
            let report = match transport.connect(&url).await {
                Ok(connection) => Internal::Opened {
                    epoch,
                    connection,
                    token,
                },
                Err(e) => Internal::OpenFailed {
                    epoch,
                    error: e.to_string(),
                    retryable: true,
                },
            };
            let _ = internal.send(report);
        }));
    }

    fn send_handshake(&mut self, epoch: u64) {
        let (Some(socket), Some(user)) = (self.socket.clone(), self.user.clone()) else {
            return;
        };
        let request = ConnectRequest::new(self.handshake_token.take(), user);
        let text = match request.to_json() {
            Ok(text) => text,
            Err(e) => {
                self.feed(Event::SocketErrored {
                    epoch,
                    error: e.to_string(),
                });
                return;
            }
        };
        self.liveness_at = Some(Instant::now() + self.config.liveness_window());
        self.send_frame(epoch, socket, text);
    }

    fn send_health_check(&mut self) {
        self.ping_at = None;
        let (Some(socket), Some(connection_id)) =
            (self.socket.clone(), self.state.connection_id())
        else {
            return;
        };
        match HealthCheckPing::new(connection_id).to_json() {
            Ok(text) => {
                tracing::trace!("sending health check");
                self.send_frame(self.state.epoch(), socket, text);
            }
            Err(e) => tracing::warn!("failed to encode health check: {}", e),
        }
        self.ping_at = Some(Instant::now() + self.config.health_check_interval());
    }

    fn check_liveness(&mut self) {
        self.liveness_at = None;
        let now = Instant::now();
        let window = self.config.liveness_window();
        self.feed(Event::LivenessCheck {
            epoch: self.state.epoch(),
            now: now.into_std(),
            window,
        });

        let live = matches!(
            self.state,
            ConnectionState::AwaitingHandshake { .. } | ConnectionState::Healthy { .. }
        );
        if live && self.liveness_at.is_none() {
            let last = self
                .state
                .session()
                .last_event_at
                .map_or(now, Instant::from_std);
            self.liveness_at = Some(last + window + Duration::from_millis(1));
        }
    }

    fn send_frame(&self, epoch: u64, socket: Arc<dyn Connection>, text: String) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.send(text).await {
                let _ = internal.send(Internal::Frame {
                    epoch,
                    frame: Err(e),
                });
            }
        });
    }

    /// Detach the socket's reader, then close it and wait for the
    /// acknowledgment in the background.
    fn close_socket(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(opener) = self.opener.take() {
            opener.abort();
        }
        self.handshake_token = None;
        let Some(socket) = self.socket.take() else {
            return;
        };
        let ack_timeout = self.config.close_ack_timeout();
        self.closing = Some(tokio::spawn(async move {
            if !socket.is_connected() {
                return;
            }
            if let Err(e) = socket.close(WS_CLOSED_SUCCESS, "").await {
                tracing::debug!("close frame not sent: {}", e);
                return;
            }
            let ack = tokio::time::timeout(ack_timeout, async {
                while let Ok(Frame::Text(_)) = socket.recv().await {}
            })
            .await;
            if ack.is_err() {
                tracing::debug!("no close acknowledgment within {:?}", ack_timeout);
            }
        }));
    }
}

fn spawn_reader(
    epoch: u64,
    connection: Arc<dyn Connection>,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = connection.recv().await;
            let last = !matches!(frame, Ok(Frame::Text(_)));
            if internal.send(Internal::Frame { epoch, frame }).is_err() || last {
                break;
            }
        }
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::token::{BoxError, TokenSource};
    use crate::transport::MockTransport;
    use feed_types::{FeedData, Fid, TOKEN_EXPIRED_CODE};
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        transport: MockTransport,
        tokens: Arc<TokenManager>,
        slot: Arc<ConnectionIdSlot>,
        handle: ConnectionHandle,
        signals: mpsc::UnboundedReceiver<Signal>,
    }

    impl Harness {
        fn new() -> Self {
            let _ = tracing_subscriber::fmt()
                .with_env_filter("rtfeed_client=debug")
                .with_test_writer()
                .try_init();
            let transport = MockTransport::new();
            let tokens = Arc::new(TokenManager::new(&TokenConfig::default()));
            tokens.set_source(TokenSource::Static("static-token".into()));
            let slot = Arc::new(ConnectionIdSlot::new());
            let (signal_tx, signals) = mpsc::unbounded_channel();
            let handle = ConnectionHandle::spawn(
                Arc::new(ClientConfig::new("key-123").with_base_url("https://feeds.example.com")),
                Arc::new(transport.clone()),
                Arc::clone(&tokens),
                Arc::clone(&slot),
                signal_tx,
            );
            Self {
                transport,
                tokens,
                slot,
                handle,
                signals,
            }
        }

        async fn connect(&self) -> Result<ConnectionOkEvent, ClientError> {
            self.handle.connect(UserData::new("alice"), false).await
        }

        fn drain(&mut self) -> Vec<Signal> {
            let mut out = Vec::new();
            while let Ok(signal) = self.signals.try_recv() {
                out.push(signal);
            }
            out
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn health_flips(signals: &[Signal]) -> Vec<bool> {
        signals
            .iter()
            .filter_map(|s| match s {
                Signal::Health { healthy, .. } => Some(*healthy),
                _ => None,
            })
            .collect()
    }

    fn recoveries(signals: &[Signal]) -> usize {
        signals
            .iter()
            .filter(|s| matches!(s, Signal::Recover { .. }))
            .count()
    }

    fn feed_event(id: &str) -> WsEvent {
        WsEvent::FeedUpdated {
            feed: FeedData::new(Fid::new("user", id), 1),
        }
    }

    // ===========================================
    // Connect and handshake
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn connect_resolves_with_confirmation() {
        let mut h = Harness::new();

        let ok = h.connect().await.unwrap();
        assert_eq!(ok.connection_id, "mock-conn-1");
        assert!(h.handle.is_healthy());
        assert_eq!(h.slot.get().await.unwrap(), "mock-conn-1");

        let handshakes = h.transport.sent_handshakes();
        assert_eq!(handshakes.len(), 1);
        assert_eq!(handshakes[0].token.as_deref(), Some("static-token"));
        assert_eq!(handshakes[0].products, vec!["feeds".to_string()]);

        let url = &h.transport.connected_urls()[0];
        assert!(url.starts_with("wss://feeds.example.com/api/v2/connect?"));
        assert!(url.contains("api_key=key-123"));
        assert!(url.contains("stream-auth-type=jwt"));

        settle().await;
        let signals = h.drain();
        assert_eq!(health_flips(&signals), vec![true]);
        assert_eq!(recoveries(&signals), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_connect_sends_no_token() {
        let h = Harness::new();
        h.handle.connect(UserData::new("guest"), true).await.unwrap();

        assert_eq!(h.transport.sent_handshakes()[0].token, None);
        assert!(h.transport.connected_urls()[0].contains("stream-auth-type=anonymous"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_while_connecting_fails() {
        let h = Harness::new();
        h.transport.set_auto_accept(false);

        let first = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.connect(UserData::new("alice"), false).await })
        };
        settle().await;

        let second = h.connect().await;
        assert!(matches!(second, Err(ClientError::ConnectInProgress)));
        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_without_confirmation() {
        let h = Harness::new();
        h.transport.set_auto_accept(false);

        let result = h.connect().await;
        assert!(matches!(
            result,
            Err(ClientError::ConnectTimeout(d)) if d == Duration::from_secs(15)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_handshake_is_not_retried() {
        let h = Harness::new();
        h.transport.reject_next_handshake(43, 401, "signature invalid");

        let result = h.connect().await;
        match result {
            Err(ClientError::ConnectionRejected {
                code,
                status,
                message,
            }) => {
                assert_eq!(code, 43);
                assert_eq!(status, 401);
                assert_eq!(message, "signature invalid");
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.connect_count(), 1);
        assert!(h.slot.get().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_provider_token_is_reloaded() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        h.tokens.set_source(TokenSource::provider(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, BoxError>(format!("token-{n}")) }.boxed()
        }));
        h.transport
            .reject_next_handshake(TOKEN_EXPIRED_CODE, 401, "token expired");

        let ok = h.connect().await.unwrap();
        assert_eq!(ok.connection_id, "mock-conn-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let tokens: Vec<_> = h
            .transport
            .sent_handshakes()
            .into_iter()
            .map(|r| r.token)
            .collect();
        assert_eq!(
            tokens,
            vec![Some("token-1".to_string()), Some("token-2".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_static_token_is_surfaced() {
        let h = Harness::new();
        h.transport
            .reject_next_handshake(TOKEN_EXPIRED_CODE, 401, "token expired");

        let result = h.connect().await;
        assert!(matches!(
            result,
            Err(ClientError::ConnectionRejected { code: 40, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn token_failure_refuses_connect() {
        let h = Harness::new();
        h.tokens.reset();

        let result = h.connect().await;
        assert!(matches!(result, Err(ClientError::ConnectionRefused(_))));
        assert_eq!(h.transport.connect_count(), 0);
    }

    // ===========================================
    // Reconnection
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn dropped_socket_reconnects_and_recovers() {
        let mut h = Harness::new();
        h.connect().await.unwrap();
        settle().await;
        h.drain();

        h.transport.drop_connection();
        settle().await;
        assert!(!h.handle.is_healthy());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.handle.is_healthy());
        assert_eq!(h.transport.connect_count(), 2);
        assert_eq!(h.slot.current().as_deref(), Some("mock-conn-2"));

        let signals = h.drain();
        assert_eq!(health_flips(&signals), vec![false, true]);
        assert_eq!(recoveries(&signals), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_id_waits_through_reconnect_backoff() {
        let h = Harness::new();
        h.connect().await.unwrap();

        h.transport.drop_connection();
        settle().await;
        assert!(!h.handle.is_healthy());
        assert!(h.slot.is_pending());

        let id = tokio::time::timeout(Duration::from_secs(10), h.slot.get())
            .await
            .unwrap();
        assert_eq!(id.unwrap(), "mock-conn-2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_opens_back_off_until_success() {
        let h = Harness::new();
        h.connect().await.unwrap();
        h.transport.fail_next_connect("refused");
        h.transport.fail_next_connect("refused");

        h.transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert!(h.handle.is_healthy());
        assert_eq!(h.transport.connected_urls().len(), 4);
        assert_eq!(h.transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_success_close_is_final() {
        let mut h = Harness::new();
        h.connect().await.unwrap();

        h.transport.close_from_server(WS_CLOSED_SUCCESS);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!h.handle.is_healthy());
        assert_eq!(h.transport.connect_count(), 1);
        assert_eq!(health_flips(&h.drain()), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects() {
        let h = Harness::new();
        h.connect().await.unwrap();

        h.transport.close_from_server(1006);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(h.handle.is_healthy());
        assert_eq!(h.transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_frames_are_dropped() {
        let mut h = Harness::new();
        h.connect().await.unwrap();
        h.transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(3)).await;
        h.drain();

        h.transport.push_event_to(0, &feed_event("old"));
        h.transport.push_event(&feed_event("new"));
        settle().await;

        let events: Vec<_> = h
            .drain()
            .into_iter()
            .filter_map(|s| match s {
                Signal::Event { epoch, event } => Some((epoch, event)),
                _ => None,
            })
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, h.handle.epoch());
        assert_eq!(events[0].1, feed_event("new"));
    }

    // ===========================================
    // Health checks
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn health_check_is_sent_every_interval() {
        let h = Harness::new();
        h.connect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(h.transport.health_checks_sent(), 1);
        let ping = h.transport.sent_messages().last().cloned().unwrap();
        assert!(ping.contains("mock-conn-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_triggers_reconnect() {
        let h = Harness::new();
        h.connect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(34)).await;
        assert_eq!(h.transport.connect_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_traffic_keeps_connection_alive() {
        let h = Harness::new();
        h.connect().await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            h.transport
                .push_event(&WsEvent::HealthCheck(Default::default()));
        }
        settle().await;
        assert_eq!(h.transport.connect_count(), 1);
        assert!(h.handle.is_healthy());
    }

    // ===========================================
    // Disconnect and network status
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_with_success_code() {
        let h = Harness::new();
        h.connect().await.unwrap();

        h.handle.disconnect().await;
        h.handle.disconnect().await;

        assert_eq!(h.transport.close_codes(), vec![WS_CLOSED_SUCCESS]);
        assert!(!h.handle.is_healthy());
        assert!(h.slot.get().await.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_pending_connect() {
        let h = Harness::new();
        h.transport.set_auto_accept(false);
        let pending = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.connect(UserData::new("alice"), false).await })
        };
        settle().await;

        h.handle.disconnect().await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(ClientError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_id_waits_while_offline() {
        let h = Harness::new();
        h.connect().await.unwrap();
        h.handle.set_online(false);
        settle().await;

        let waiter = {
            let slot = Arc::clone(&h.slot);
            tokio::spawn(async move { slot.get().await })
        };
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());

        h.handle.set_online(true);
        assert_eq!(waiter.await.unwrap().unwrap(), "mock-conn-2");
    }

    #[tokio::test(start_paused = true)]
    async fn offline_then_online_reconnects_quickly() {
        let mut h = Harness::new();
        h.connect().await.unwrap();

        h.handle.set_online(false);
        settle().await;
        assert!(!h.handle.is_healthy());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.connect_count(), 1);

        h.handle.set_online(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.handle.is_healthy());
        assert_eq!(h.transport.connect_count(), 2);
        assert_eq!(health_flips(&h.drain()), vec![true, false, true]);
    }
}
