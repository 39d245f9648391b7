//! Async signal client for the RoomWire protocol.
//!
//! [`SignalClient`] is a thin handle over a background socket task. The task
//! owns the [`SignalSocket`](crate::socket::SignalSocket) and multiplexes
//! outgoing requests and incoming frames through `tokio::select!`; decoded
//! responses are delivered to the session over an unbounded event channel in
//! exact socket order.
//!
//! Three delivery rules live here:
//!
//! - **Send lane** — every request passes through one async mutex. While a
//!   reconnect is in progress, replayable requests queue there and are
//!   flushed FIFO the moment the socket reopens, before any newer request.
//! - **Response gate** — from the join response until
//!   [`resume_responses`](SignalClient::resume_responses), inbound responses
//!   are held back so the engine can finish building its transports first,
//!   then replayed in arrival order.
//! - **Keepalive** — after join, pings flow at the server-announced interval;
//!   a missing pong for longer than the announced tolerance counts as a
//!   network loss.
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = Arc::new(WebSocketConnector::new());
//! let (signal, join, mut events) =
//!     SignalClient::connect(connector, "wss://rw.example.com", token, options).await?;
//!
//! // ... build peer transports from `join` ...
//! signal.resume_responses();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SignalEvent::Message(msg) => { /* dispatch */ }
//!         SignalEvent::Close(reason) => break,
//!     }
//! }
//! ```

pub mod url;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

use self::url::{build_signal_url, build_validate_url, parse_base_url};
use crate::error::{Result, RoomWireError};
use crate::options::SignalOptions;
use crate::protocol::{
    self, DisconnectReason, JoinPayload, SignalRequest, SignalResponse,
};
use crate::socket::{SignalSocket, SocketConnector, SocketMessage};
use crate::state::{ConnectMode, ConnectionState, ReconnectMode};
use crate::utils::watchable::Watchable;

/// Grace period for the socket task to flush its close frame on user close.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Events delivered to the session.
#[derive(Debug)]
pub enum SignalEvent {
    /// A decoded server message, in socket order.
    Message(Box<SignalResponse>),
    /// The connection failed; the engine decides whether to reconnect.
    /// Emitted at most once per socket.
    Close(String),
}

/// Receiving end of the signal event stream.
pub type SignalEvents = mpsc::UnboundedReceiver<SignalEvent>;

// ── Shared state ────────────────────────────────────────────────────

/// Writer handle plus the reconnect replay queue, behind one async mutex so
/// the queue-or-send decision is atomic with reconnect state flips.
struct SendLane {
    writer: Option<mpsc::UnboundedSender<SignalRequest>>,
    queue: Vec<SignalRequest>,
}

/// Inbound ordering gate: holds responses between join and resume.
struct ResponseGate {
    suspended: bool,
    held: Vec<SignalResponse>,
    join_waiter: Option<oneshot::Sender<Box<JoinPayload>>>,
}

struct SignalInner {
    connector: Arc<dyn SocketConnector>,
    options: SignalOptions,
    base_url: ::url::Url,
    token: Mutex<String>,
    state: Watchable<ConnectionState>,
    emitter: mpsc::UnboundedSender<SignalEvent>,
    send_lane: AsyncMutex<SendLane>,
    gate: Mutex<ResponseGate>,
    socket_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    ping_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_pong: Mutex<Instant>,
    /// Socket generation counter; failure reports from a superseded socket
    /// task are ignored.
    epoch: AtomicU64,
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a signal connection. One instance exists per session epoch; a
/// full reconnect builds a fresh client while a quick resume re-dials through
/// [`restart`](Self::restart).
pub struct SignalClient {
    inner: Arc<SignalInner>,
}

impl SignalClient {
    /// Dial the signal endpoint, perform the join handshake and return the
    /// handle, the join payload and the event stream.
    ///
    /// On return, response delivery is suspended; the caller builds its peer
    /// transports from the join payload and then calls
    /// [`resume_responses`](Self::resume_responses).
    ///
    /// # Errors
    ///
    /// Returns [`RoomWireError::Connect`] when the dial fails (with the
    /// validate probe's reason when the server supplied one) and
    /// [`RoomWireError::Timeout`] when no join response arrives in time.
    pub async fn connect(
        connector: Arc<dyn SocketConnector>,
        url: &str,
        token: &str,
        options: SignalOptions,
    ) -> Result<(Self, JoinPayload, SignalEvents)> {
        let base_url = parse_base_url(url)?;
        let (emitter, events) = mpsc::unbounded_channel();
        let inner = Arc::new(SignalInner {
            connector,
            options,
            base_url,
            token: Mutex::new(token.to_owned()),
            state: Watchable::new(ConnectionState::Connecting {
                mode: ConnectMode::Normal,
            }),
            emitter,
            send_lane: AsyncMutex::new(SendLane {
                writer: None,
                queue: Vec::new(),
            }),
            gate: Mutex::new(ResponseGate {
                suspended: false,
                held: Vec::new(),
                join_waiter: None,
            }),
            socket_task: Mutex::new(None),
            ping_task: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            epoch: AtomicU64::new(0),
        });
        let client = Self { inner };

        let socket = match client.inner.open_socket(false).await {
            Ok(socket) => socket,
            Err(e) => {
                client.inner.state.set(ConnectionState::Disconnected {
                    reason: DisconnectReason::Network,
                });
                return Err(e);
            }
        };

        let join_rx = {
            let (tx, rx) = oneshot::channel();
            client.inner.gate.lock().join_waiter = Some(tx);
            rx
        };
        {
            let mut lane = client.inner.send_lane.lock().await;
            lane.writer = Some(spawn_socket(&client.inner, socket));
        }

        let join_timeout = client.inner.options.join_timeout;
        let join = match tokio::time::timeout(join_timeout, join_rx).await {
            Ok(Ok(join)) => join,
            Ok(Err(_)) => {
                client.inner.cleanup(DisconnectReason::Network).await;
                return Err(RoomWireError::Connect(
                    "signal connection closed before join".into(),
                ));
            }
            Err(_) => {
                client.inner.cleanup(DisconnectReason::Network).await;
                return Err(RoomWireError::Timeout("join response"));
            }
        };

        client.inner.state.set(ConnectionState::Connected {
            mode: ConnectMode::Normal,
        });
        spawn_keepalive(&client.inner, &join);
        debug!(room = %join.room.name, "signal connection established");
        Ok((client, *join, events))
    }

    /// Re-dial the socket for a quick resume, skipping the join handshake.
    ///
    /// Requests issued while the dial is in flight queue on the send lane and
    /// are replayed FIFO once the socket reopens, before anything newer.
    ///
    /// # Errors
    ///
    /// Returns the dial error; the client stays in reconnect mode so the
    /// caller can retry or tear the session down.
    pub async fn restart(&self) -> Result<()> {
        debug!("restarting signal connection");
        {
            let mut lane = self.inner.send_lane.lock().await;
            lane.writer = None;
            if let Some(task) = self.inner.socket_task.lock().take() {
                task.abort();
            }
            self.inner.state.set(ConnectionState::Connecting {
                mode: ConnectMode::Reconnect(ReconnectMode::Quick),
            });
        }
        *self.inner.last_pong.lock() = Instant::now();

        let socket = self.inner.open_socket(true).await?;

        let mut lane = self.inner.send_lane.lock().await;
        let writer = spawn_socket(&self.inner, socket);
        for request in lane.queue.drain(..) {
            debug!(kind = request.kind(), "replaying queued signal request");
            let _ = writer.send(request);
        }
        lane.writer = Some(writer);
        self.inner.state.set(ConnectionState::Connected {
            mode: ConnectMode::Reconnect(ReconnectMode::Quick),
        });
        Ok(())
    }

    /// Send a request, or queue it when a reconnect is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`RoomWireError::State`] when disconnected, or for
    /// non-replayable kinds attempted mid-reconnect (those are dropped, never
    /// queued).
    pub async fn send(&self, request: SignalRequest) -> Result<()> {
        let mut lane = self.inner.send_lane.lock().await;
        let state = self.inner.state.read();
        if state.is_reconnecting() {
            if request.is_queueable() {
                debug!(kind = request.kind(), "queueing signal request during reconnect");
                lane.queue.push(request);
                return Ok(());
            }
            warn!(
                kind = request.kind(),
                "dropping non-replayable signal request during reconnect"
            );
            return Err(RoomWireError::State(format!(
                "cannot send {} while reconnecting",
                request.kind()
            )));
        }
        match &lane.writer {
            Some(writer) if state.is_connected() => writer
                .send(request)
                .map_err(|_| RoomWireError::SocketClosed),
            _ => Err(RoomWireError::State(
                "signal client is not connected".into(),
            )),
        }
    }

    /// Release responses held since the join handshake, in arrival order.
    /// Responses decoded while the drain runs queue behind it.
    pub fn resume_responses(&self) {
        self.inner.resume_responses();
    }

    /// Close the connection and drop all queued state. Idempotent.
    pub async fn close(&self) {
        debug!("signal client close requested");
        let task = self.inner.socket_task.lock().take();
        {
            let mut lane = self.inner.send_lane.lock().await;
            // Dropping the writer lets the socket task send its close frame.
            lane.writer = None;
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("signal socket task did not exit in time; aborting");
                task.abort();
            }
        }
        self.inner.cleanup(DisconnectReason::User).await;
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Current connection state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.read().is_connected()
    }

    /// The access token used for the next (re)connect URL. Updated in place
    /// when the server issues a refresh.
    pub fn token(&self) -> String {
        self.inner.token.lock().clone()
    }
}

impl std::fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalClient")
            .field("state", &self.inner.state.read())
            .finish()
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        // Synchronous context: abort the background tasks so they release
        // their inner references; the socket closes when its stream drops.
        if let Some(task) = self.inner.socket_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.ping_task.lock().take() {
            task.abort();
        }
    }
}

// ── Inner behavior ──────────────────────────────────────────────────

impl SignalInner {
    /// Dial the signal URL; on failure, ask the validate endpoint for a
    /// server-side reason before surfacing the dial error.
    async fn open_socket(&self, reconnect: bool) -> Result<Box<dyn SignalSocket>> {
        let token = self.token.lock().clone();
        let signal_url = build_signal_url(
            &self.base_url,
            &token,
            self.options.auto_subscribe,
            reconnect,
        )?;
        debug!(
            host = self.base_url.host_str().unwrap_or("<none>"),
            reconnect, "dialing signal endpoint"
        );
        match self.connector.connect(signal_url.as_str()).await {
            Ok(socket) => Ok(socket),
            Err(dial_err) => {
                let validate_url =
                    build_validate_url(&self.base_url, &token, self.options.auto_subscribe)?;
                match self.connector.validate(validate_url.as_str()).await {
                    Ok(Some(reason)) => Err(RoomWireError::Connect(reason)),
                    _ => Err(dial_err),
                }
            }
        }
    }

    /// Route one decoded response: keepalive and token refreshes are consumed
    /// here, the join resolves the connect call and closes the gate, and
    /// everything else emits (or queues while the gate is closed).
    fn dispatch_response(&self, response: SignalResponse) {
        if let SignalResponse::Pong { .. } = response {
            *self.last_pong.lock() = Instant::now();
            return;
        }
        if let SignalResponse::RefreshToken { token } = response {
            debug!("received refreshed access token");
            *self.token.lock() = token;
            return;
        }

        let mut gate = self.gate.lock();
        if let SignalResponse::Join(join) = response {
            match gate.join_waiter.take() {
                Some(waiter) => {
                    // Everything after the join is held back until the engine
                    // finishes building transports.
                    gate.suspended = true;
                    let _ = waiter.send(join);
                }
                None => warn!("dropping unexpected join response"),
            }
            return;
        }
        if gate.suspended {
            debug!(kind = response.kind(), "holding response until resume");
            gate.held.push(response);
            return;
        }
        drop(gate);
        self.emit(response);
    }

    fn emit(&self, response: SignalResponse) {
        if self
            .emitter
            .send(SignalEvent::Message(Box::new(response)))
            .is_err()
        {
            debug!("signal event receiver dropped");
        }
    }

    fn resume_responses(&self) {
        let mut gate = self.gate.lock();
        if !gate.suspended {
            return;
        }
        debug!(count = gate.held.len(), "resuming signal responses");
        let held: Vec<_> = gate.held.drain(..).collect();
        for response in held {
            // Emitted while the gate is held so fresh arrivals cannot overtake.
            self.emit(response);
        }
        gate.suspended = false;
    }

    /// Send immediately or not at all; used by the keepalive, which must not
    /// leave stale pings in the replay queue.
    async fn try_send_now(&self, request: SignalRequest) -> Result<()> {
        let lane = self.send_lane.lock().await;
        match &lane.writer {
            Some(writer) if self.state.read().is_connected() => writer
                .send(request)
                .map_err(|_| RoomWireError::SocketClosed),
            _ => Err(RoomWireError::State(
                "signal client is not connected".into(),
            )),
        }
    }

    /// Escalate a socket-level failure: reap state and tell the engine once.
    /// `epoch` identifies the reporting socket task; stale reports are ignored.
    async fn socket_failure(&self, epoch: u64, reason: &str) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if self.state.read().is_disconnected() {
            return;
        }
        // Often called from the socket task itself. Detach the handle rather
        // than letting cleanup abort it mid-teardown; the task exits on its
        // own once cleanup drops the writer.
        drop(self.socket_task.lock().take());
        self.cleanup(DisconnectReason::Network).await;
        let _ = self.emitter.send(SignalEvent::Close(reason.to_owned()));
    }

    /// Drop socket, queues and gate state; terminal until the next dial.
    async fn cleanup(&self, reason: DisconnectReason) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.ping_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.socket_task.lock().take() {
            task.abort();
        }
        {
            let mut lane = self.send_lane.lock().await;
            lane.writer = None;
            lane.queue.clear();
        }
        {
            let mut gate = self.gate.lock();
            gate.suspended = false;
            gate.held.clear();
            gate.join_waiter = None;
        }
        self.state.set(ConnectionState::Disconnected { reason });
    }
}

// ── Socket task ─────────────────────────────────────────────────────

/// Spawn the socket task for a freshly dialed socket and return the writer
/// handle. Bumps the epoch so failure reports from older sockets are ignored.
fn spawn_socket(
    inner: &Arc<SignalInner>,
    socket: Box<dyn SignalSocket>,
) -> mpsc::UnboundedSender<SignalRequest> {
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let task = tokio::spawn(socket_task(Arc::clone(inner), socket, writer_rx, epoch));
    if let Some(old) = inner.socket_task.lock().replace(task) {
        old.abort();
    }
    writer_tx
}

/// Background task owning one socket: encodes and sends outgoing requests,
/// decodes and dispatches incoming frames, reports failures upward.
async fn socket_task(
    inner: Arc<SignalInner>,
    mut socket: Box<dyn SignalSocket>,
    mut writer_rx: mpsc::UnboundedReceiver<SignalRequest>,
    epoch: u64,
) {
    debug!(epoch, "signal socket task started");
    loop {
        tokio::select! {
            outgoing = writer_rx.recv() => {
                match outgoing {
                    Some(request) => {
                        debug!(kind = request.kind(), "sending signal request");
                        match protocol::encode_request(&request) {
                            Ok(bytes) => {
                                if let Err(e) = socket.send(SocketMessage::Binary(bytes)).await {
                                    let reason = format!("signal send failed: {e}");
                                    error!("{reason}");
                                    inner.socket_failure(epoch, &reason).await;
                                    break;
                                }
                            }
                            Err(e) => {
                                // Encoding failures are programming bugs; they
                                // must not take the session down.
                                error!(kind = request.kind(), "failed to encode signal request: {e}");
                            }
                        }
                    }
                    None => {
                        debug!("writer dropped, closing signal socket");
                        let _ = socket.close().await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(frame)) => {
                        let decoded = match &frame {
                            SocketMessage::Binary(bytes) => protocol::decode_response(bytes),
                            SocketMessage::Text(text) => protocol::decode_response_json(text),
                        };
                        match decoded {
                            Ok(response) => inner.dispatch_response(response),
                            Err(e) => warn!("failed to decode signal frame: {e}"),
                        }
                    }
                    Some(Err(e)) => {
                        let reason = format!("signal receive failed: {e}");
                        error!("{reason}");
                        inner.socket_failure(epoch, &reason).await;
                        break;
                    }
                    None => {
                        debug!("signal socket closed by server");
                        inner.socket_failure(epoch, "signal socket closed").await;
                        break;
                    }
                }
            }
        }
    }
    debug!(epoch, "signal socket task exited");
}

/// Start the keepalive loop when the join response announces an interval.
fn spawn_keepalive(inner: &Arc<SignalInner>, join: &JoinPayload) {
    if join.ping_interval == 0 {
        return;
    }
    let interval = Duration::from_secs(u64::from(join.ping_interval));
    let tolerance = Duration::from_secs(u64::from(join.ping_timeout.max(1)));
    let inner = Arc::clone(inner);
    *inner.last_pong.lock() = Instant::now();

    let task = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                if !inner.state.read().is_connected() {
                    continue;
                }
                if inner.last_pong.lock().elapsed() > tolerance {
                    warn!("signal keepalive timed out");
                    let epoch = inner.epoch.load(Ordering::SeqCst);
                    inner.socket_failure(epoch, "signal keepalive timed out").await;
                    return;
                }
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or_default();
                if let Err(e) = inner.try_send_now(SignalRequest::Ping { timestamp }).await {
                    debug!("keepalive ping skipped: {e}");
                }
            }
        }
    });
    if let Some(old) = inner.ping_task.lock().replace(task) {
        old.abort();
    };
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{MutePayload, SessionDescription, SdpKind};
    use async_trait::async_trait;

    struct NullConnector;

    #[async_trait]
    impl SocketConnector for NullConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn SignalSocket>> {
            Err(RoomWireError::Connect("null connector".into()))
        }

        async fn validate(&self, _url: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn test_client() -> (SignalClient, SignalEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let inner = Arc::new(SignalInner {
            connector: Arc::new(NullConnector),
            options: SignalOptions::default(),
            base_url: parse_base_url("ws://localhost:7880").unwrap(),
            token: Mutex::new("tok".into()),
            state: Watchable::new(ConnectionState::new()),
            emitter,
            send_lane: AsyncMutex::new(SendLane {
                writer: None,
                queue: Vec::new(),
            }),
            gate: Mutex::new(ResponseGate {
                suspended: false,
                held: Vec::new(),
                join_waiter: None,
            }),
            socket_task: Mutex::new(None),
            ping_task: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            epoch: AtomicU64::new(0),
        });
        (SignalClient { inner }, events)
    }

    fn speakers(sid: &str) -> SignalResponse {
        SignalResponse::SpeakersChanged {
            speakers: vec![crate::protocol::SpeakerInfo {
                sid: sid.into(),
                level: 0.5,
                active: true,
            }],
        }
    }

    #[tokio::test]
    async fn suspended_responses_replay_in_order_on_resume() {
        let (client, mut events) = test_client();
        client.inner.gate.lock().suspended = true;

        client.inner.dispatch_response(speakers("PA_1"));
        client.inner.dispatch_response(speakers("PA_2"));
        assert!(events.try_recv().is_err());

        client.resume_responses();
        let sids: Vec<String> = (0..2)
            .map(|_| match events.try_recv().unwrap() {
                SignalEvent::Message(msg) => match *msg {
                    SignalResponse::SpeakersChanged { speakers } => {
                        speakers.first().unwrap().sid.clone()
                    }
                    other => panic!("unexpected message: {other:?}"),
                },
                SignalEvent::Close(reason) => panic!("unexpected close: {reason}"),
            })
            .collect();
        assert_eq!(sids, vec!["PA_1".to_string(), "PA_2".to_string()]);

        // Gate is open again: new responses flow straight through.
        client.inner.dispatch_response(speakers("PA_3"));
        assert!(matches!(
            events.try_recv().unwrap(),
            SignalEvent::Message(_)
        ));
    }

    #[tokio::test]
    async fn pong_updates_liveness_without_emitting() {
        let (client, mut events) = test_client();
        *client.inner.last_pong.lock() = Instant::now() - Duration::from_secs(60);

        client
            .inner
            .dispatch_response(SignalResponse::Pong { timestamp: 42 });

        assert!(client.inner.last_pong.lock().elapsed() < Duration::from_secs(1));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn refresh_token_is_consumed_internally() {
        let (client, mut events) = test_client();
        client.inner.dispatch_response(SignalResponse::RefreshToken {
            token: "fresh".into(),
        });
        assert_eq!(client.token(), "fresh");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn queueable_requests_queue_while_reconnecting() {
        let (client, _events) = test_client();
        client.inner.state.set(ConnectionState::Connecting {
            mode: ConnectMode::Reconnect(ReconnectMode::Quick),
        });

        client
            .send(SignalRequest::Mute(MutePayload {
                sid: "TR_1".into(),
                muted: true,
            }))
            .await
            .unwrap();

        let lane = client.inner.send_lane.lock().await;
        assert_eq!(lane.queue.len(), 1);
    }

    #[tokio::test]
    async fn non_replayable_requests_error_while_reconnecting() {
        let (client, _events) = test_client();
        client.inner.state.set(ConnectionState::Connecting {
            mode: ConnectMode::Reconnect(ReconnectMode::Full),
        });

        let err = client
            .send(SignalRequest::Offer(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomWireError::State(_)));

        let lane = client.inner.send_lane.lock().await;
        assert!(lane.queue.is_empty());
    }

    #[tokio::test]
    async fn send_while_disconnected_errors() {
        let (client, _events) = test_client();
        let err = client
            .send(SignalRequest::Ping { timestamp: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomWireError::State(_)));
    }

    #[tokio::test]
    async fn stray_join_does_not_resuspend() {
        let (client, mut events) = test_client();
        let join = JoinPayload {
            room: crate::protocol::RoomInfo {
                sid: "RM_1".into(),
                name: "demo".into(),
                metadata: String::new(),
            },
            participant: crate::protocol::ParticipantInfo {
                sid: "PA_me".into(),
                identity: "me".into(),
                name: "me".into(),
                state: crate::protocol::ParticipantState::Joined,
                metadata: String::new(),
                tracks: Vec::new(),
            },
            other_participants: Vec::new(),
            ice_servers: Vec::new(),
            subscriber_primary: true,
            server_version: "1.0".into(),
            ping_interval: 0,
            ping_timeout: 0,
        };

        // No waiter registered: the join is dropped and the gate stays open.
        client
            .inner
            .dispatch_response(SignalResponse::Join(Box::new(join)));
        client.inner.dispatch_response(speakers("PA_1"));
        assert!(matches!(
            events.try_recv().unwrap(),
            SignalEvent::Message(_)
        ));
    }
}
