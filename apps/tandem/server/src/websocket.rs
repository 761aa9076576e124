use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use std::{borrow::Cow, ops::ControlFlow, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use tandem_core::{CloseReason, EndpointId, MessageError, ServerEvent, SignalingMessage};

use crate::relay::{EndpointHandle, Outbound, RelayFrame, RouteError};
use crate::session::Departure;
use crate::telemetry::{CONNECTIONS_TOTAL, MESSAGES_DROPPED};
use crate::AppState;

/// Session joined by clients that connect to `/ws` without naming one.
pub const DEFAULT_SESSION: &str = "default";

const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub async fn default_session_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, DEFAULT_SESSION.to_string()))
}

pub async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let endpoint_id = EndpointId::generate();
    counter!(CONNECTIONS_TOTAL, 1);
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(state.config.outbound_buffer);
    let mut writer = spawn_writer(ws_tx, rx, endpoint_id.clone(), state.config.ping_interval);
    info!(session_id = %session_id, endpoint_id = %endpoint_id, "connection opened");

    let mut connection = Connection {
        state: Arc::clone(&state),
        session_id,
        endpoint: EndpointHandle::new(endpoint_id, tx),
    };
    let heartbeat = state.config.heartbeat_timeout;
    let mut writer_done = false;

    let departure = loop {
        let next = tokio::select! {
            // The core closed this connection: evicted, torn down or unwritable.
            _ = &mut writer => {
                writer_done = true;
                break Departure::Unexpected;
            }
            next = tokio::time::timeout(heartbeat, ws_rx.next()) => next,
        };
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                warn!(endpoint_id = %connection.endpoint.id, error = %err, "error receiving message");
                break Departure::Unexpected;
            }
            Ok(None) => break Departure::Unexpected,
            Err(_) => {
                warn!(
                    endpoint_id = %connection.endpoint.id,
                    idle_secs = heartbeat.as_secs(),
                    "connection idle; closing"
                );
                connection.endpoint.send_event(&ServerEvent::SessionClosed {
                    reason: CloseReason::IdleTimeout,
                });
                connection.endpoint.close(CloseReason::IdleTimeout);
                break Departure::Unexpected;
            }
        };

        let flow = match message {
            Message::Text(text) => connection.on_text(text).await,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => connection.on_text(text).await,
                Err(_) => {
                    connection.reject(&RouteError::Malformed(MessageError::NotUtf8));
                    ControlFlow::Continue(())
                }
            },
            Message::Close(frame) => {
                debug!(
                    endpoint_id = %connection.endpoint.id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                ControlFlow::Break(Departure::Unexpected)
            }
            Message::Ping(_) | Message::Pong(_) => ControlFlow::Continue(()),
        };
        if let ControlFlow::Break(departure) = flow {
            break departure;
        }
    };

    let Connection {
        session_id,
        endpoint,
        ..
    } = connection;
    let endpoint_id = endpoint.id.clone();
    let removed = state.registry.unregister(&endpoint_id, departure).await;
    // With every sender gone the writer flushes what is queued and closes.
    drop(endpoint);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(
        session_id = %session_id,
        endpoint_id = %endpoint_id,
        ?departure,
        removed,
        "connection closed"
    );
}

struct Connection {
    state: Arc<AppState>,
    session_id: String,
    endpoint: EndpointHandle,
}

impl Connection {
    async fn on_text(&mut self, text: String) -> ControlFlow<Departure> {
        let message = match SignalingMessage::parse(&text) {
            Ok(message) => message,
            Err(err) => {
                self.reject(&RouteError::Malformed(err));
                return ControlFlow::Continue(());
            }
        };

        match message {
            SignalingMessage::RegisterRole(role) => self.register(&role).await,
            SignalingMessage::SessionClose => {
                info!(endpoint_id = %self.endpoint.id, "endpoint closed its session");
                ControlFlow::Break(Departure::Explicit)
            }
            SignalingMessage::Ping => {
                self.endpoint.send_event(&ServerEvent::Pong);
                ControlFlow::Continue(())
            }
            relayed => {
                let frame = RelayFrame::new(text, relayed);
                if let Err(err) = self.state.registry.route(&self.endpoint.id, frame).await {
                    self.reject(&err);
                }
                ControlFlow::Continue(())
            }
        }
    }

    async fn register(&mut self, role: &str) -> ControlFlow<Departure> {
        match self
            .state
            .registry
            .register(&self.session_id, self.endpoint.clone(), role)
            .await
        {
            Ok(registration) => {
                debug!(
                    endpoint_id = %self.endpoint.id,
                    session_id = %registration.session_id,
                    role = %registration.role,
                    ready = registration.ready,
                    "registration accepted"
                );
                ControlFlow::Continue(())
            }
            Err(err) => {
                warn!(endpoint_id = %self.endpoint.id, error = %err, "registration refused");
                counter!(MESSAGES_DROPPED, 1, "reason" => err.metric_label());
                self.endpoint.send_event(&ServerEvent::Error {
                    kind: err.metric_label().to_string(),
                    message: err.to_string(),
                });
                self.endpoint.close(err.close_reason());
                ControlFlow::Break(Departure::Explicit)
            }
        }
    }

    fn reject(&self, err: &RouteError) {
        debug!(endpoint_id = %self.endpoint.id, error = %err, "frame dropped");
        counter!(MESSAGES_DROPPED, 1, "reason" => err.metric_label());
        self.endpoint.send_event(&err.to_event());
    }
}

/// Owns the socket's write half. Besides queued frames it sends a protocol
/// ping every `ping_interval`; the client's automatic pong counts as traffic
/// for the idle check.
fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    endpoint_id: EndpointId,
    ping_interval: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pings = ping_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        loop {
            let outbound = tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(outbound) => outbound,
                    None => break,
                },
                _ = next_ping(&mut pings) => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            match outbound {
                Outbound::Text(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code_for(reason),
                        reason: Cow::Borrowed(reason.as_str()),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
        debug!(endpoint_id = %endpoint_id, "writer task finished");
    })
}

async fn next_ping(pings: &mut Option<Interval>) {
    match pings {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn close_code_for(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::InvalidRole | CloseReason::SessionLimit => close_code::POLICY,
        CloseReason::Shutdown => close_code::AWAY,
        _ => close_code::NORMAL,
    }
}
