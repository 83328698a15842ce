use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::engine::throttle::Backoff;
use crate::error::AppError;
use crate::transport::ack::AckRegistry;
use crate::transport::blacklist::TokenBlacklist;
use crate::transport::events::{DriverIdentity, InboundEvent, OutboundEvent};
use crate::transport::frame::Frame;
use crate::transport::{ConnectionState, EventSink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: String,
    pub token: String,
    pub identity: DriverIdentity,
    /// `max_attempts` bounds consecutive failed connection attempts.
    pub reconnect: Backoff,
    pub event_buffer: usize,
}

/// Persistent, self-reconnecting event channel to the dispatch server.
pub struct SocketClient {
    outbound: mpsc::UnboundedSender<Frame>,
    acks: Arc<AckRegistry>,
    inbound: broadcast::Sender<InboundEvent>,
    connection: watch::Receiver<ConnectionState>,
    identity: watch::Sender<DriverIdentity>,
    task: JoinHandle<()>,
}

impl SocketClient {
    pub fn spawn(config: SocketConfig, blacklist: Arc<TokenBlacklist>) -> Result<Self, AppError> {
        if blacklist.is_rejected(&config.token) {
            return Err(AppError::Unauthorized(
                "token was already rejected by the server".to_string(),
            ));
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _unused_rx) = broadcast::channel(config.event_buffer.max(1));
        let (status_tx, connection) = watch::channel(ConnectionState::Connecting);
        let (identity, identity_rx) = watch::channel(config.identity.clone());
        let acks = Arc::new(AckRegistry::new());

        let link = Link {
            config,
            blacklist,
            outbound_rx,
            acks: acks.clone(),
            inbound: inbound.clone(),
            status: status_tx,
            identity: identity_rx,
        };
        let task = tokio::spawn(link.run());

        Ok(Self {
            outbound,
            acks,
            inbound,
            connection,
            identity,
            task,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound.subscribe()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn close(&self) {
        self.task.abort();
    }

    fn enqueue(&self, frame: Frame) -> Result<(), AppError> {
        self.outbound
            .send(frame)
            .map_err(|_| AppError::Transport("socket task is not running".to_string()))
    }
}

impl EventSink for SocketClient {
    fn emit(&self, event: OutboundEvent) -> Result<(), AppError> {
        self.enqueue(Frame::outbound(&event, None)?)
    }

    fn emit_with_ack(&self, event: OutboundEvent) -> Result<oneshot::Receiver<Value>, AppError> {
        self.acks.prune();
        let (id, rx) = self.acks.register();
        self.enqueue(Frame::outbound(&event, Some(id))?)?;
        Ok(rx)
    }

    fn set_identity(&self, identity: DriverIdentity) {
        self.identity.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            *current = identity;
            true
        });
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum ConnectError {
    Rejected(StatusCode),
    Failed(String),
}

enum LinkEnd {
    Lost(String),
    ClosedByClient,
}

struct Link {
    config: SocketConfig,
    blacklist: Arc<TokenBlacklist>,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    acks: Arc<AckRegistry>,
    inbound: broadcast::Sender<InboundEvent>,
    status: watch::Sender<ConnectionState>,
    identity: watch::Receiver<DriverIdentity>,
}

impl Link {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut connected_before = false;

        loop {
            self.status.send_replace(ConnectionState::Connecting);

            match self.connect().await {
                Ok(stream) => {
                    if connected_before || failures > 0 {
                        self.discard_queued();
                    }
                    failures = 0;
                    info!(url = %self.config.url, reconnected = connected_before, "socket connected");
                    self.status.send_replace(ConnectionState::Connected {
                        reconnected: connected_before,
                    });
                    connected_before = true;

                    match self.pump(stream).await {
                        LinkEnd::ClosedByClient => {
                            info!("socket closed by client");
                            return;
                        }
                        LinkEnd::Lost(reason) => {
                            let abandoned = self.acks.fail_all();
                            warn!(reason = %reason, abandoned_acks = abandoned, "socket connection lost");
                            self.status
                                .send_replace(ConnectionState::Disconnected { reason });
                        }
                    }
                }
                Err(ConnectError::Rejected(status)) => {
                    error!(status = %status, "server rejected socket token; not retrying");
                    self.blacklist.reject(&self.config.token);
                    self.status.send_replace(ConnectionState::AuthRejected);
                    return;
                }
                Err(ConnectError::Failed(reason)) => {
                    warn!(reason = %reason, attempt = failures + 1, "socket connect failed");
                    self.status
                        .send_replace(ConnectionState::Disconnected { reason });
                }
            }

            failures += 1;
            match self.config.reconnect.delay_for(failures) {
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(attempts = failures, "giving up on socket reconnect");
                    self.status
                        .send_replace(ConnectionState::GaveUp { attempts: failures });
                    return;
                }
            }
        }
    }

    /// Frames queued while the link was down are dropped, and their ack
    /// waiters with them.
    fn discard_queued(&mut self) {
        let mut dropped = 0;
        while let Ok(frame) = self.outbound_rx.try_recv() {
            if let Some(id) = frame.ack {
                self.acks.cancel(id);
            }
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, pending_acks = self.acks.pending(), "dropped events queued while disconnected");
        }
    }

    async fn connect(&self) -> Result<WsStream, ConnectError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::Failed(format!("invalid socket url: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|err| ConnectError::Failed(format!("invalid token header: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match connect_async(request).await {
            Ok((stream, _response)) => Ok(stream),
            Err(WsError::Http(response))
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                Err(ConnectError::Rejected(response.status()))
            }
            Err(err) => Err(ConnectError::Failed(err.to_string())),
        }
    }

    async fn pump(&mut self, stream: WsStream) -> LinkEnd {
        let (mut sink, mut source) = stream.split();

        let identity = self.identity.borrow().clone();
        let announce = Frame::outbound(&OutboundEvent::RegisterDriver(identity), None)
            .and_then(|frame| frame.to_text());
        match announce {
            Ok(text) => {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    return LinkEnd::Lost(err.to_string());
                }
            }
            Err(err) => warn!(error = %err, "failed to encode identity announcement"),
        }

        loop {
            tokio::select! {
                outgoing = self.outbound_rx.recv() => match outgoing {
                    Some(frame) => {
                        let text = match frame.to_text() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(event = %frame.event, error = %err, "dropping unencodable frame");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            return LinkEnd::Lost(err.to_string());
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return LinkEnd::ClosedByClient;
                    }
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.dispatch(&text) {
                            if let Ok(text) = reply.to_text() {
                                if let Err(err) = sink.send(Message::Text(text)).await {
                                    return LinkEnd::Lost(err.to_string());
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return LinkEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return LinkEnd::Lost(err.to_string()),
                    None => return LinkEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }

    /// Routes one inbound text message. Returns the ack reply to send back,
    /// if the server asked for one.
    fn dispatch(&self, text: &str) -> Option<Frame> {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "ignoring malformed frame");
                return None;
            }
        };

        if frame.is_ack() {
            if let Some(id) = frame.ack {
                self.acks.resolve(id, frame.data);
            }
            return None;
        }

        let reply_to = frame.ack;
        match frame.into_inbound() {
            Ok(event) => {
                debug!(event = event.name(), "inbound event");
                if self.inbound.send(event).is_err() {
                    debug!("no subscribers for inbound event");
                }
            }
            Err(err) => warn!(error = %err, "ignoring unreadable event"),
        }

        reply_to.map(|id| Frame::ack_reply(id, json!({ "received": true })))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

    use super::{SocketClient, SocketConfig};
    use crate::engine::throttle::Backoff;
    use crate::error::AppError;
    use crate::transport::blacklist::TokenBlacklist;
    use crate::transport::events::{DriverIdentity, DriverRef, InboundEvent, OutboundEvent};
    use crate::transport::{ConnectionState, EventSink};

    const WAIT: Duration = Duration::from_secs(5);

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn config(url: String, max_attempts: u32) -> SocketConfig {
        SocketConfig {
            url,
            token: "token-1".to_string(),
            identity: DriverIdentity {
                driver_id: "d1".to_string(),
                vehicle_type: None,
                pickup_location: None,
            },
            reconnect: Backoff {
                initial: Duration::from_millis(10),
                factor: 2.0,
                max_delay: Duration::from_millis(50),
                max_attempts,
            },
            event_buffer: 16,
        }
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for(
        client: &SocketClient,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut connection = client.connection();
        let state = tokio::time::timeout(WAIT, connection.wait_for(predicate))
            .await
            .unwrap()
            .unwrap()
            .clone();
        state
    }

    fn go_offline() -> OutboundEvent {
        OutboundEvent::DriverGoOffline(DriverRef {
            driver_id: "d1".to_string(),
        })
    }

    #[tokio::test]
    async fn announces_identity_on_every_connect() {
        let (listener, url) = listen().await;
        let client = SocketClient::spawn(config(url, 3), Arc::new(TokenBlacklist::new())).unwrap();

        let mut ws = accept(&listener).await;
        let hello = next_json(&mut ws).await;
        assert_eq!(hello["event"], "registerDriver");
        assert_eq!(hello["data"]["driverId"], "d1");
        let state = wait_for(&client, |state| state.is_connected()).await;
        assert_eq!(state, ConnectionState::Connected { reconnected: false });

        ws.close(None).await.unwrap();
        drop(ws);

        let mut ws = accept(&listener).await;
        let hello = next_json(&mut ws).await;
        assert_eq!(hello["event"], "registerDriver");
        let state = wait_for(&client, |state| {
            *state == ConnectionState::Connected { reconnected: true }
        })
        .await;
        assert!(state.is_connected());
    }

    #[tokio::test]
    async fn server_ack_resolves_the_waiter() {
        let (listener, url) = listen().await;
        let client = SocketClient::spawn(config(url, 3), Arc::new(TokenBlacklist::new())).unwrap();
        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;
        wait_for(&client, |state| state.is_connected()).await;

        let reply = client.emit_with_ack(go_offline()).unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["event"], "driverGoOffline");
        let id = frame["ack"].as_u64().unwrap();

        let answer = json!({ "event": "ack", "ack": id, "data": { "success": true } });
        ws.send(Message::Text(answer.to_string())).await.unwrap();

        let data = tokio::time::timeout(WAIT, reply).await.unwrap().unwrap();
        assert_eq!(data, json!({ "success": true }));
    }

    #[tokio::test]
    async fn inbound_event_asking_for_ack_gets_a_receipt() {
        let (listener, url) = listen().await;
        let client = SocketClient::spawn(config(url, 3), Arc::new(TokenBlacklist::new())).unwrap();
        let mut events = client.subscribe();
        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;

        let push = json!({ "event": "rideTaken", "data": { "rideId": "A" }, "ack": 7 });
        ws.send(Message::Text(push.to_string())).await.unwrap();

        let receipt = next_json(&mut ws).await;
        assert_eq!(receipt, json!({ "event": "ack", "ack": 7, "data": { "received": true } }));
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, InboundEvent::RideTaken(ref taken) if taken.ride_id == "A"));
    }

    #[tokio::test]
    async fn rejected_handshake_blacklists_the_token() {
        let (listener, url) = listen().await;
        let blacklist = Arc::new(TokenBlacklist::new());
        let client = SocketClient::spawn(config(url.clone(), 3), blacklist.clone()).unwrap();

        let (stream, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let refuse = |_request: &Request, _response: Response| -> Result<Response, ErrorResponse> {
            let mut denied = ErrorResponse::new(None);
            *denied.status_mut() = StatusCode::UNAUTHORIZED;
            Err(denied)
        };
        assert!(accept_hdr_async(stream, refuse).await.is_err());

        let state = wait_for(&client, |state| state.is_terminal()).await;
        assert_eq!(state, ConnectionState::AuthRejected);
        assert!(blacklist.is_rejected("token-1"));
        assert!(matches!(
            SocketClient::spawn(config(url, 3), blacklist),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn gives_up_once_attempts_run_out() {
        let (listener, url) = listen().await;
        drop(listener);
        let client = SocketClient::spawn(config(url, 2), Arc::new(TokenBlacklist::new())).unwrap();

        let state = wait_for(&client, |state| state.is_terminal()).await;
        assert_eq!(state, ConnectionState::GaveUp { attempts: 3 });
    }

    #[tokio::test]
    async fn lost_link_releases_pending_acks() {
        let (listener, url) = listen().await;
        let client = SocketClient::spawn(config(url, 3), Arc::new(TokenBlacklist::new())).unwrap();
        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;
        wait_for(&client, |state| state.is_connected()).await;

        let reply = client.emit_with_ack(go_offline()).unwrap();
        next_json(&mut ws).await;
        ws.close(None).await.unwrap();

        assert!(tokio::time::timeout(WAIT, reply).await.unwrap().is_err());
    }

    #[tokio::test]
    async fn events_queued_while_down_are_not_replayed() {
        let (listener, url) = listen().await;
        let client = SocketClient::spawn(config(url, 3), Arc::new(TokenBlacklist::new())).unwrap();
        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;
        wait_for(&client, |state| state.is_connected()).await;

        ws.close(None).await.unwrap();
        drop(ws);
        wait_for(&client, |state| !state.is_connected()).await;
        let stale = client.emit_with_ack(go_offline()).unwrap();

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await["event"], "registerDriver");
        assert!(tokio::time::timeout(WAIT, stale).await.unwrap().is_err());

        client
            .emit(OutboundEvent::RegisterDriver(DriverIdentity {
                driver_id: "d1".to_string(),
                vehicle_type: None,
                pickup_location: Some("booth-2".to_string()),
            }))
            .unwrap();
        let next = next_json(&mut ws).await;
        assert_eq!(next["event"], "registerDriver");
        assert_eq!(next["data"]["pickupLocation"], "booth-2");
    }
}
