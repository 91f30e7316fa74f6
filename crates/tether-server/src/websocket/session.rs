//! Relay session lifecycle: handles a single socket from upgrade through
//! disconnect.
//!
//! Inbound events for one socket are handled one at a time in arrival
//! order. Token lookups run as tasks owned by the session; their results
//! are applied only while the connection is still live and unauthenticated.

use std::fmt::Display;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use tether_auth::{AuthError, AuthResolver};
use tether_core::{
    AccountId, AuthRequest, AuthResult, CloseCode, MessageType, Role, auth_reply_frame,
};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::connection::{Outbound, PeerConnection};
use super::keepalive::{AlarmPhase, KeepaliveAlarm};
use super::registry::SessionRegistry;
use crate::metrics::{
    AUTHENTICATIONS_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, FRAMES_DROPPED_TOTAL,
    FRAMES_FORWARDED_TOTAL, KEEPALIVE_TIMEOUTS_TOTAL,
};

/// How long the writer may take to flush its queue after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type AuthOutcome = Result<AccountId, AuthError>;

/// Everything a session needs besides its socket.
#[derive(Clone)]
pub struct RelayContext {
    /// Shared pairing registry.
    pub registry: Arc<SessionRegistry>,
    /// Token lookup.
    pub resolver: Arc<dyn AuthResolver>,
    /// Idle time before a keepalive probe.
    pub ping_interval: Duration,
    /// Time allowed after a probe before closing.
    pub ping_timeout: Duration,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

/// Run a relay session for an upgraded socket.
pub async fn run_peer_session(socket: WebSocket, role: Role, ctx: RelayContext) {
    let (sink, stream) = socket.split();
    serve_connection(sink, stream, role, ctx).await;
}

/// Run a relay session over any message sink/stream pair.
///
/// 1. Indexes a new [`PeerConnection`] in the registry
/// 2. Spawns the writer that owns `sink`
/// 3. Drives the connection state machine until close
/// 4. Lets the writer flush its final frame
pub async fn serve_connection<W, R, E>(sink: W, stream: R, role: Role, ctx: RelayContext)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Arc::new(PeerConnection::new(role, tx));
    ctx.registry.add(Arc::clone(&conn));
    counter!(CONNECTIONS_TOTAL, "role" => role.as_str()).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(write_outbound(sink, rx));
    let abort = writer.abort_handle();

    run_connection(stream, &conn, &ctx).await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(conn_id = %conn.id(), "writer did not drain in time");
        abort.abort();
    }
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

#[instrument(skip_all, fields(conn_id = %conn.id(), role = %conn.role(), account))]
async fn run_connection<R, E>(mut stream: R, conn: &Arc<PeerConnection>, ctx: &RelayContext)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    info!("connection opened");

    let mut alarm = KeepaliveAlarm::new(ctx.ping_interval, ctx.ping_timeout);
    let mut auth_tasks: JoinSet<AuthOutcome> = JoinSet::new();
    let closed = conn.closed_token();

    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => break,
            () = ctx.shutdown.cancelled() => {
                ctx.registry.close(conn, CloseCode::Shutdown);
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(message)) => {
                    if on_message(message, conn, ctx, &mut alarm, &mut auth_tasks).is_break() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "transport error");
                    break;
                }
                None => {
                    debug!("transport closed");
                    break;
                }
            },
            Some(joined) = auth_tasks.join_next() => on_auth_result(joined, conn, ctx),
            phase = alarm.fired() => match phase {
                AlarmPhase::Probe => {
                    trace!("idle, sending keepalive probe");
                    let _ = conn.ping();
                }
                AlarmPhase::Timeout => {
                    info!(timeout_secs = ctx.ping_timeout.as_secs(), "keepalive timed out");
                    counter!(KEEPALIVE_TIMEOUTS_TOTAL).increment(1);
                    ctx.registry.close(conn, CloseCode::Timeout);
                }
            },
        }
    }

    alarm.cancel();
    auth_tasks.abort_all();
    ctx.registry.finish_close(conn);
    info!(age_secs = conn.age().as_secs(), "connection closed");
}

fn on_message(
    message: Message,
    conn: &Arc<PeerConnection>,
    ctx: &RelayContext,
    alarm: &mut KeepaliveAlarm,
    auth_tasks: &mut JoinSet<AuthOutcome>,
) -> ControlFlow<()> {
    match message {
        Message::Binary(data) => {
            alarm.rearm();
            conn.touch();
            if conn.is_authenticated() {
                forward(data, conn, ctx);
                return ControlFlow::Continue(());
            }
            match data.first().map(|&tag| MessageType::try_from(tag)) {
                Some(Ok(MessageType::ProxyAuthentication)) => {
                    start_auth(&data, conn, ctx, auth_tasks);
                }
                tag => {
                    debug!(?tag, "frame before authentication");
                    ctx.registry.close(conn, CloseCode::AuthorizationRequired);
                }
            }
        }
        Message::Text(_) => {
            debug!("text frame rejected");
            ctx.registry.close(conn, CloseCode::UnsupportedDataType);
        }
        Message::Ping(_) | Message::Pong(_) => {
            alarm.rearm();
            conn.touch();
        }
        Message::Close(frame) => {
            match frame.as_ref().map(|f| (f.code, CloseCode::try_from(f.code))) {
                Some((_, Ok(code))) => debug!(%code, "peer sent close frame"),
                Some((raw, Err(_))) => debug!(code = raw, "peer sent close frame"),
                None => debug!("peer sent close frame without code"),
            }
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

fn forward(data: Bytes, conn: &PeerConnection, ctx: &RelayContext) {
    let len = data.len();
    let forwarded = ctx
        .registry
        .peer_of(conn)
        .is_some_and(|peer| peer.send(data));
    if forwarded {
        trace!(len, "frame forwarded");
        counter!(FRAMES_FORWARDED_TOTAL).increment(1);
    } else {
        trace!(len, "no live peer, frame dropped");
        counter!(FRAMES_DROPPED_TOTAL).increment(1);
    }
}

fn start_auth(
    frame: &[u8],
    conn: &PeerConnection,
    ctx: &RelayContext,
    auth_tasks: &mut JoinSet<AuthOutcome>,
) {
    match AuthRequest::parse(frame) {
        Ok(request) => {
            debug!(token_len = request.token().len(), "resolving access token");
            let resolver = Arc::clone(&ctx.resolver);
            let token = request.token().to_owned();
            let _ = auth_tasks.spawn(async move { resolver.resolve(&token).await });
        }
        Err(e) => {
            debug!(error = %e, "malformed authentication frame");
            counter!(AUTHENTICATIONS_TOTAL, "result" => "malformed").increment(1);
            let _ = conn.send(auth_reply_frame(AuthResult::Failed));
        }
    }
}

fn on_auth_result(
    joined: Result<AuthOutcome, JoinError>,
    conn: &Arc<PeerConnection>,
    ctx: &RelayContext,
) {
    if !conn.is_live() {
        debug!("connection gone, discarding authentication result");
        return;
    }
    if conn.is_authenticated() {
        // An overlapping request lost the race; it still gets its reply.
        debug!("already authenticated, rejecting overlapping request");
        counter!(AUTHENTICATIONS_TOTAL, "result" => "superseded").increment(1);
        let _ = conn.send(auth_reply_frame(AuthResult::Failed));
        return;
    }

    let account = match joined {
        Ok(Ok(account)) => account,
        Ok(Err(e)) => {
            warn!(error = %e, kind = e.kind(), "authentication failed");
            counter!(AUTHENTICATIONS_TOTAL, "result" => "failed").increment(1);
            let _ = conn.send(auth_reply_frame(AuthResult::Failed));
            return;
        }
        Err(e) => {
            error!(error = %e, "authentication task failed");
            counter!(AUTHENTICATIONS_TOTAL, "result" => "failed").increment(1);
            let _ = conn.send(auth_reply_frame(AuthResult::Failed));
            return;
        }
    };

    let _ = tracing::Span::current().record("account", account.as_str());
    info!(account = %account, "authenticated");
    counter!(AUTHENTICATIONS_TOTAL, "result" => "success").increment(1);
    let _ = conn.authenticate(account);
    let _ = conn.send(auth_reply_frame(AuthResult::Success));

    if let Err(fault) = ctx.registry.register(conn) {
        error!(error = %fault, "registry rejected connection");
        ctx.registry.close(conn, CloseCode::InternalError);
    }
}

/// Drain the outbound queue into the socket until the terminal item.
async fn write_outbound<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(item) = rx.recv().await {
        let (message, last) = match item {
            Outbound::Binary(frame) => (Message::Binary(frame), false),
            Outbound::Ping => (Message::Ping(Bytes::new()), false),
            Outbound::Close(Some(code)) => (
                Message::Close(Some(CloseFrame {
                    code: code.as_u16(),
                    reason: Utf8Bytes::from_static(code.reason()),
                })),
                true,
            ),
            Outbound::Close(None) => break,
        };
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "socket write failed");
            break;
        }
        if last {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::channel::mpsc as chan;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    use crate::websocket::registry::RegistryEvent;

    /// `good-<account>` resolves to `<account>`; anything else fails.
    #[derive(Default)]
    struct StubResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthResolver for StubResolver {
        async fn resolve(&self, token: &str) -> Result<AccountId, AuthError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            token
                .strip_prefix("good-")
                .map(AccountId::from)
                .ok_or(AuthError::MissingAccount)
        }
    }

    /// Blocks until released.
    struct GatedResolver {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl AuthResolver for GatedResolver {
        async fn resolve(&self, _token: &str) -> Result<AccountId, AuthError> {
            self.gate.notified().await;
            Ok(AccountId::from("late"))
        }
    }

    fn context(resolver: Arc<dyn AuthResolver>) -> RelayContext {
        RelayContext {
            registry: Arc::new(SessionRegistry::new(10)),
            resolver,
            ping_interval: Duration::from_secs(45),
            ping_timeout: Duration::from_secs(120),
            shutdown: CancellationToken::new(),
        }
    }

    struct Client {
        inbound: chan::UnboundedSender<Result<Message, Infallible>>,
        outbound: chan::UnboundedReceiver<Message>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn spawn(ctx: &RelayContext, role: Role) -> Self {
            let (in_tx, in_rx) = chan::unbounded();
            let (out_tx, out_rx) = chan::unbounded();
            let task = tokio::spawn(serve_connection(out_tx, in_rx, role, ctx.clone()));
            Self {
                inbound: in_tx,
                outbound: out_rx,
                task,
            }
        }

        fn send(&self, message: Message) {
            self.inbound.unbounded_send(Ok(message)).unwrap();
        }

        fn send_binary(&self, bytes: &[u8]) {
            self.send(Message::Binary(Bytes::copy_from_slice(bytes)));
        }

        fn auth(&self, token: &str) {
            self.send(Message::Binary(AuthRequest::encode(token)));
        }

        async fn recv(&mut self) -> Option<Message> {
            tokio::time::timeout(Duration::from_secs(600), self.outbound.next())
                .await
                .expect("timed out waiting for outbound message")
        }

        async fn expect_binary(&mut self, expected: &[u8]) {
            assert_eq!(
                self.recv().await,
                Some(Message::Binary(Bytes::copy_from_slice(expected)))
            );
        }

        async fn expect_close(&mut self, code: CloseCode) {
            match self.recv().await {
                Some(Message::Close(Some(frame))) => assert_eq!(frame.code, code.as_u16()),
                other => panic!("expected close {code}, got {other:?}"),
            }
            assert_eq!(self.recv().await, None);
        }
    }

    async fn wait_registered(events: &mut tokio::sync::broadcast::Receiver<RegistryEvent>) {
        loop {
            if let RegistryEvent::Registered { .. } = events.recv().await.unwrap() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn text_frame_closes_with_unsupported_data_type() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut client = Client::spawn(&ctx, Role::Tool);
        client.send(Message::Text("hello".into()));
        client.expect_close(CloseCode::UnsupportedDataType).await;
        client.task.await.unwrap();
        assert_eq!(ctx.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn data_before_auth_closes_with_authorization_required() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut client = Client::spawn(&ctx, Role::Device);
        client.send_binary(&[0x00, 0x01, 0x02]);
        client.expect_close(CloseCode::AuthorizationRequired).await;
    }

    #[tokio::test]
    async fn empty_frame_before_auth_closes_with_authorization_required() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut client = Client::spawn(&ctx, Role::Device);
        client.send_binary(&[]);
        client.expect_close(CloseCode::AuthorizationRequired).await;
    }

    #[tokio::test]
    async fn failed_auth_can_be_retried() {
        let resolver = Arc::new(StubResolver::default());
        let ctx = context(resolver.clone());
        let mut client = Client::spawn(&ctx, Role::Tool);

        client.auth("bad-token");
        client.expect_binary(&[0x09, 0x01]).await;
        client.auth("bad-again");
        client.expect_binary(&[0x09, 0x01]).await;
        client.auth("good-acct");
        client.expect_binary(&[0x09, 0x00]).await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
        let snapshot = ctx.registry.session(&AccountId::from("acct")).unwrap();
        assert!(snapshot.tool.is_some());
    }

    #[tokio::test]
    async fn malformed_auth_frame_fails_without_lookup() {
        let resolver = Arc::new(StubResolver::default());
        let ctx = context(resolver.clone());
        let mut client = Client::spawn(&ctx, Role::Tool);

        client.send_binary(&[0x09]);
        client.expect_binary(&[0x09, 0x01]).await;
        client.send_binary(&[0x09, 0x00]);
        client.expect_binary(&[0x09, 0x01]).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn paired_connections_forward_verbatim() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut events = ctx.registry.subscribe();
        let mut tool = Client::spawn(&ctx, Role::Tool);
        let mut device = Client::spawn(&ctx, Role::Device);

        tool.auth("good-1");
        tool.expect_binary(&[0x09, 0x00]).await;
        wait_registered(&mut events).await;
        device.auth("good-1");
        device.expect_binary(&[0x09, 0x00]).await;

        tool.expect_binary(&[0x08, 0xFF]).await;
        device.expect_binary(&[0x08, 0xFF]).await;

        let payload = [0x00, 0x07, 0xd1, 0x06, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
        tool.send_binary(&payload);
        device.expect_binary(&payload).await;

        device.send_binary(&[0x01, 0x42]);
        tool.expect_binary(&[0x01, 0x42]).await;
    }

    #[tokio::test]
    async fn unpaired_frames_are_dropped() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut tool = Client::spawn(&ctx, Role::Tool);
        tool.auth("good-solo");
        tool.expect_binary(&[0x09, 0x00]).await;

        tool.send_binary(&[0x00, 0x01]);
        // Dropped silently; the next thing on the wire is the close.
        tool.send(Message::Text("x".into()));
        tool.expect_close(CloseCode::UnsupportedDataType).await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_probed_then_timed_out() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut client = Client::spawn(&ctx, Role::Device);
        let start = tokio::time::Instant::now();

        assert!(matches!(client.recv().await, Some(Message::Ping(_))));
        assert!(start.elapsed() >= Duration::from_secs(45));

        client.expect_close(CloseCode::Timeout).await;
        assert!(start.elapsed() >= Duration::from_secs(165));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_restarts_keepalive_window() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut client = Client::spawn(&ctx, Role::Device);

        assert!(matches!(client.recv().await, Some(Message::Ping(_))));
        let answered = tokio::time::Instant::now();
        client.send(Message::Pong(Bytes::new()));

        // A fresh probe instead of the timeout close.
        assert!(matches!(client.recv().await, Some(Message::Ping(_))));
        assert!(answered.elapsed() >= Duration::from_secs(45));
        assert!(answered.elapsed() < Duration::from_secs(120));
    }

    #[tokio::test]
    async fn late_auth_result_is_discarded_after_close() {
        let gate = Arc::new(Notify::new());
        let ctx = context(Arc::new(GatedResolver { gate: gate.clone() }));
        let mut events = ctx.registry.subscribe();
        let mut client = Client::spawn(&ctx, Role::Tool);

        client.auth("pending");
        tokio::task::yield_now().await;
        client.inbound.close_channel();
        assert_eq!(client.recv().await, None);
        client.task.await.unwrap();
        gate.notify_waiters();

        assert_eq!(ctx.registry.connection_count(), 0);
        assert_eq!(ctx.registry.session_count(), 0);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, RegistryEvent::Registered { .. }));
        }
    }

    #[tokio::test]
    async fn overlapping_auth_requests_each_get_one_reply() {
        let resolver = Arc::new(StubResolver::default());
        let ctx = context(resolver.clone());
        let mut client = Client::spawn(&ctx, Role::Tool);

        // Both frames are queued before the session runs.
        client.auth("good-first");
        client.auth("good-second");
        client.expect_binary(&[0x09, 0x00]).await;
        client.expect_binary(&[0x09, 0x01]).await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.registry.authenticated_count(), 1);
        assert_eq!(ctx.registry.session_count(), 1);
    }

    #[tokio::test]
    async fn auth_result_after_writer_failure_is_discarded() {
        let gate = Arc::new(Notify::new());
        let ctx = context(Arc::new(GatedResolver { gate: gate.clone() }));
        let Client {
            inbound,
            outbound,
            task,
        } = Client::spawn(&ctx, Role::Device);

        inbound
            .unbounded_send(Ok(Message::Binary(AuthRequest::encode("pending"))))
            .unwrap();
        drop(outbound);
        // The failure reply for this frame is the write that fails.
        inbound
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(&[0x09]))))
            .unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        gate.notify_one();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(ctx.registry.connection_count(), 1);
        assert_eq!(ctx.registry.authenticated_count(), 0);
        assert_eq!(ctx.registry.session_count(), 0);

        inbound.close_channel();
        task.await.unwrap();
        assert_eq!(ctx.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_with_shutdown_code() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut client = Client::spawn(&ctx, Role::Tool);
        tokio::task::yield_now().await;

        ctx.shutdown.cancel();
        client.expect_close(CloseCode::Shutdown).await;
    }

    #[tokio::test]
    async fn client_close_ends_session_quietly() {
        let ctx = context(Arc::new(StubResolver::default()));
        let mut client = Client::spawn(&ctx, Role::Device);
        client.send(Message::Close(None));
        assert_eq!(client.recv().await, None);
        client.task.await.unwrap();
        assert_eq!(ctx.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn evicted_device_receives_connection_replaced() {
        let ctx = RelayContext {
            registry: Arc::new(SessionRegistry::new(1)),
            ..context(Arc::new(StubResolver::default()))
        };
        let mut events = ctx.registry.subscribe();
        let mut first = Client::spawn(&ctx, Role::Device);
        first.auth("good-9");
        first.expect_binary(&[0x09, 0x00]).await;
        wait_registered(&mut events).await;

        let mut second = Client::spawn(&ctx, Role::Device);
        second.auth("good-9");
        second.expect_binary(&[0x09, 0x00]).await;

        first.expect_close(CloseCode::ConnectionReplaced).await;
    }
}
