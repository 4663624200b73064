use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use digitbot_core::*;
use digitbot_protocol::codec::{self, Frame};
use digitbot_protocol::wire;

use crate::config::TransportConfig;
use crate::correlator::RequestCorrelator;
use crate::registry::{PushSender, SubscriptionRegistry};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The single persistent connection to the broker.
///
/// Cheap to clone; all clones share one socket. Callers never touch the
/// socket directly: they issue correlated requests and open push streams,
/// and the transport demultiplexes inbound frames to whoever is waiting.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    correlator: RequestCorrelator,
    registry: SubscriptionRegistry,
    /// Frames awaiting a connection, oldest first.
    queue: Mutex<VecDeque<String>>,
    /// Write half of the live socket, if any.
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Instant of the last inbound frame of any kind.
    last_inbound: Mutex<Instant>,
    /// Set once by `close()`; distinguishes caller shutdown from failures.
    shutdown: AtomicBool,
    /// Socket generation. Bumped on every connect and forced close so a
    /// stale read loop can never touch a newer socket's state.
    generation: AtomicU64,
    /// Credentials to re-establish after a reconnect.
    auth_token: Mutex<Option<String>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                correlator: RequestCorrelator::new(),
                registry: SubscriptionRegistry::new(),
                queue: Mutex::new(VecDeque::new()),
                writer: Mutex::new(None),
                last_inbound: Mutex::new(Instant::now()),
                shutdown: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                auth_token: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state_tx.send_replace(state);
    }

    fn writer(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.inner.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the socket, spawn its writer and read-loop tasks, and flush any
    /// frames queued while disconnected (oldest first).
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::Closed);
        }
        let first = self.inner.generation.load(Ordering::SeqCst) == 0;
        self.set_state(if first {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let (socket, _response) = connect_async(self.inner.config.endpoint.as_str())
            .await
            .map_err(|e| {
                self.set_state(ConnectionState::Disconnected);
                TransportError::ConnectFailed(e.to_string())
            })?;
        let (sink, stream) = socket.split();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        *self.writer() = Some(write_tx);
        *self
            .inner
            .last_inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();

        tokio::spawn(write_loop(sink, write_rx));
        tokio::spawn(read_loop(self.clone(), stream, generation));

        self.set_state(ConnectionState::Connected);
        info!(endpoint = %self.inner.config.endpoint, "Connected to broker");
        self.flush_queue();
        Ok(())
    }

    /// Caller-initiated shutdown. Idempotent. Pending requests are rejected
    /// immediately; subscriptions are not replayed after this.
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.writer() = None;
        self.set_state(ConnectionState::Disconnected);
        self.inner
            .correlator
            .fail_all(|| RequestError::ConnectionLost);
        info!("Transport closed");
    }

    /// Internally forced close (staleness, failed re-authorization). The
    /// supervisor will observe the transition and reconnect.
    pub(crate) fn force_close(&self, reason: &str) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        warn!(%reason, "Forcing connection closed");
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.writer() = None;
        self.set_state(ConnectionState::Disconnected);
        self.inner
            .correlator
            .fail_all(|| RequestError::ConnectionLost);
    }

    /// Write a frame now, or queue it until the next connect.
    pub fn send_frame(&self, frame: &Value) {
        let text = frame.to_string();
        let writer = if self.state() == ConnectionState::Connected {
            self.writer().clone()
        } else {
            None
        };
        match writer {
            Some(tx) => {
                if tx.send(Message::Text(text.clone())).is_err() {
                    self.enqueue(text);
                }
            }
            None => self.enqueue(text),
        }
    }

    fn enqueue(&self, text: String) {
        let mut queue = self.queue();
        if queue.len() >= self.inner.config.outbound_queue_limit {
            queue.pop_front();
            warn!(
                limit = self.inner.config.outbound_queue_limit,
                "Outbound queue full, dropping oldest frame"
            );
        }
        queue.push_back(text);
    }

    fn flush_queue(&self) {
        let drained: Vec<String> = self.queue().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        info!(frames = drained.len(), "Flushing queued outbound frames");
        let writer = self.writer().clone();
        let Some(tx) = writer else {
            let mut queue = self.queue();
            queue.extend(drained);
            warn!(frames = queue.len(), "Writer gone before flush, frames re-queued");
            return;
        };
        let mut drained = drained.into_iter();
        while let Some(text) = drained.next() {
            if let Err(unsent) = tx.send(Message::Text(text)) {
                // Connection died mid-flush; keep the unsent tail for the
                // next connect instead of silently dropping it.
                let mut queue = self.queue();
                if let Message::Text(text) = unsent.0 {
                    queue.push_back(text);
                }
                queue.extend(drained);
                warn!(frames = queue.len(), "Connection lost during flush, frames re-queued");
                return;
            }
        }
    }

    /// Issue one correlated request and suspend until its response, an error
    /// payload, a detected disconnect, or the configured timeout.
    pub async fn request(&self, mut body: Value) -> Result<Value, RequestError> {
        if self.is_shutdown() {
            return Err(RequestError::Transport(TransportError::Closed));
        }
        if !body.is_object() {
            return Err(RequestError::Protocol(ProtocolError::MissingField(
                "request object",
            )));
        }
        let (id, rx) = self.inner.correlator.register();
        body["req_id"] = Value::from(id);
        self.send_frame(&body);
        match tokio::time::timeout(self.inner.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a resolution; treat as a lost connection.
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                self.inner.correlator.abort(id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Liveness keepalive.
    pub async fn ping(&self) -> Result<(), RequestError> {
        self.request(wire::ping()).await.map(|_| ())
    }

    /// Remove a push stream locally and best-effort cancel it broker-side.
    /// Cancellation failures are logged, not surfaced: the local effect (no
    /// more deliveries) is already guaranteed.
    pub async fn unsubscribe(&self, key: StreamKey) {
        let broker_id = self.inner.registry.remove(&key);
        if let Some(id) = broker_id {
            if let Err(e) = self.request(wire::forget(&id)).await {
                debug!(key = %key, error = %e, "Forget request failed");
            }
        }
    }

    pub(crate) fn last_inbound_elapsed(&self) -> Duration {
        self.inner
            .last_inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn touch_inbound(&self) {
        *self
            .inner
            .last_inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Re-establish credentials after a reconnect, if any were stored.
    pub(crate) async fn reauthorize(&self) -> Result<(), RequestError> {
        let token = self
            .inner
            .auth_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(token) = token else {
            return Ok(());
        };
        let body = self.request(wire::authorize(&token)).await?;
        let account = codec::parse_account(&body)?;
        info!(loginid = %account.loginid, "Re-authorized after reconnect");
        Ok(())
    }

    /// Re-issue the subscribe request for every registered stream key.
    /// Subscribers keep their existing receivers and observe nothing beyond
    /// a gap in pushes.
    pub(crate) async fn replay_subscriptions(&self) {
        for (key, request) in self.inner.registry.replay_requests() {
            match self.request(request).await {
                Ok(body) => {
                    if let Some(id) = codec::parse_subscription_id(&body) {
                        self.inner.registry.set_broker_id(&key, id);
                    }
                    info!(key = %key, "Resubscribed after reconnect");
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to resubscribe"),
            }
        }
    }

    /// Register a push stream and issue the wire subscribe if the key is new.
    async fn open_stream(
        &self,
        key: StreamKey,
        sender: PushSender,
        request: Value,
    ) -> Result<(), RequestError> {
        let is_new = self.inner.registry.insert(key.clone(), sender, request.clone());
        if !is_new {
            return Ok(());
        }
        match self.request(request).await {
            Ok(body) => {
                if let Some(id) = codec::parse_subscription_id(&body) {
                    self.inner.registry.set_broker_id(&key, id);
                }
                Ok(())
            }
            Err(e) => {
                // Never leave a phantom entry for a stream the broker
                // rejected; it would be replayed forever.
                self.inner.registry.remove(&key);
                Err(e)
            }
        }
    }

    /// Demultiplex one inbound text frame.
    fn handle_text(&self, text: &str) {
        self.touch_inbound();
        let raw = match codec::decode(text) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };
        let frame = codec::classify(raw, |id| self.inner.correlator.is_pending(id));
        match frame {
            Some(Frame::Response { req_id, result }) => {
                let result = result.map_err(|e| RequestError::Api {
                    code: e.code,
                    message: e.message,
                });
                if !self.inner.correlator.resolve(req_id, result) {
                    debug!(req_id, "Response arrived after caller gave up");
                }
            }
            Some(Frame::Push { key, payload }) => self.dispatch_push(key, &payload),
            Some(Frame::Keepalive) => {}
            None => debug!("Dropping unmatched frame"),
        }
    }

    fn dispatch_push(&self, key: StreamKey, payload: &Value) {
        match &key {
            StreamKey::Ticks(_) => match codec::parse_tick(payload) {
                Ok(tick) => self.inner.registry.dispatch_tick(&key, tick),
                Err(e) => warn!(key = %key, error = %e, "Dropping unparseable tick push"),
            },
            StreamKey::Contract(_) => match codec::parse_contract(payload) {
                Ok(contract) => self.inner.registry.dispatch_contract(&key, contract),
                Err(e) => warn!(key = %key, error = %e, "Dropping unparseable contract push"),
            },
        }
    }

    /// Socket failure observed by the read loop. Never called for caller-
    /// initiated shutdown.
    fn handle_disconnect(&self) {
        if self.is_shutdown() {
            return;
        }
        *self.writer() = None;
        self.set_state(ConnectionState::Disconnected);
        self.inner
            .correlator
            .fail_all(|| RequestError::ConnectionLost);
        warn!("Connection to broker lost");
    }
}

/// Forward outbound frames to the socket until the channel closes.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// The one inbound read loop per live socket. Exits silently when a newer
/// socket generation has taken over.
async fn read_loop(transport: Transport, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(frame) = stream.next().await {
        if transport.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match frame {
            Ok(Message::Text(text)) => transport.handle_text(&text),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => transport.touch_inbound(),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                break;
            }
        }
    }
    if transport.inner.generation.load(Ordering::SeqCst) == generation {
        transport.handle_disconnect();
    }
}

// ---------------------------------------------------------------------------
// BrokerLink
// ---------------------------------------------------------------------------

#[async_trait]
impl BrokerLink for Transport {
    async fn authorize(&self, token: &str) -> Result<AccountInfo, RequestError> {
        let body = self.request(wire::authorize(token)).await?;
        let account = codec::parse_account(&body)?;
        *self
            .inner
            .auth_token
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
        info!(loginid = %account.loginid, balance = %account.balance, "Authorized");
        Ok(account)
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>, RequestError> {
        let key = StreamKey::Ticks(symbol.to_string());
        let (tx, rx) = mpsc::channel(self.inner.config.push_buffer);
        self.open_stream(key, PushSender::Ticks(tx), wire::ticks(symbol))
            .await?;
        Ok(rx)
    }

    async fn request_proposal(
        &self,
        request: &ProposalRequest,
    ) -> Result<Proposal, RequestError> {
        let body = self.request(wire::proposal(request)).await?;
        Ok(codec::parse_proposal(&body)?)
    }

    async fn buy(
        &self,
        proposal_id: &str,
        price: Decimal,
    ) -> Result<ContractPurchase, RequestError> {
        let body = self.request(wire::buy(proposal_id, price)).await?;
        Ok(codec::parse_purchase(&body)?)
    }

    async fn track_contract(
        &self,
        contract_id: u64,
    ) -> Result<mpsc::Receiver<Contract>, RequestError> {
        let key = StreamKey::Contract(contract_id);
        let (tx, rx) = mpsc::channel(self.inner.config.push_buffer);
        self.open_stream(key, PushSender::Contract(tx), wire::track_contract(contract_id))
            .await?;
        Ok(rx)
    }

    async fn forget_contract(&self, contract_id: u64) {
        self.unsubscribe(StreamKey::Contract(contract_id)).await;
    }

    async fn forget_ticks(&self, symbol: &str) {
        self.unsubscribe(StreamKey::Ticks(symbol.to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_request_while_disconnected_times_out_and_queues() {
        let transport = Transport::new(TransportConfig {
            request_timeout_ms: 1_000,
            ..Default::default()
        });
        let result = transport.request(json!({"ping": 1})).await;
        assert!(matches!(result, Err(RequestError::Timeout)));
        // The frame was queued for the next connect, not lost.
        assert_eq!(transport.queue().len(), 1);
        assert_eq!(transport.inner.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_beyond_bound() {
        let transport = Transport::new(TransportConfig {
            outbound_queue_limit: 2,
            ..Default::default()
        });
        transport.send_frame(&json!({"seq": 1}));
        transport.send_frame(&json!({"seq": 2}));
        transport.send_frame(&json!({"seq": 3}));
        let queue = transport.queue().clone();
        assert_eq!(queue.len(), 2);
        assert!(queue[0].contains("\"seq\":2"));
        assert!(queue[1].contains("\"seq\":3"));
    }

    #[tokio::test]
    async fn test_flush_requeues_frames_when_writer_is_gone() {
        let transport = Transport::new(TransportConfig::default());
        transport.send_frame(&json!({"seq": 1}));
        transport.send_frame(&json!({"seq": 2}));

        // A writer whose socket task has already died.
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        *transport.writer() = Some(tx);

        transport.flush_queue();
        let queue = transport.queue().clone();
        assert_eq!(queue.len(), 2);
        assert!(queue[0].contains("\"seq\":1"));
        assert!(queue[1].contains("\"seq\":2"));
    }

    #[tokio::test]
    async fn test_non_object_request_body_is_rejected() {
        let transport = Transport::new(TransportConfig::default());
        let result = transport.request(json!("ping")).await;
        assert!(matches!(result, Err(RequestError::Protocol(_))));
        assert_eq!(transport.inner.correlator.pending_count(), 0);
        assert!(transport.queue().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_pending() {
        let transport = Transport::new(TransportConfig::default());
        let (_, rx) = transport.inner.correlator.register();
        transport.close();
        transport.close();
        assert!(transport.is_shutdown());
        assert!(matches!(
            rx.await.unwrap(),
            Err(RequestError::ConnectionLost)
        ));
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_inbound_response_resolves_pending_caller() {
        let transport = Transport::new(TransportConfig::default());
        let (id, rx) = transport.inner.correlator.register();
        transport.handle_text(&format!(
            r#"{{"msg_type":"ping","ping":"pong","req_id":{}}}"#,
            id
        ));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_not_fatal() {
        let transport = Transport::new(TransportConfig::default());
        transport.handle_text("{truncated");
        transport.handle_text(r#"{"msg_type":"tick","tick":{}}"#);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
