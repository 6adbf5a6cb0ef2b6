//! Per-connection driver: handshake, control-frame dispatch and teardown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::StreamExt;
use relay_core::errors::{CLOSE_AUTH_FAILED, CLOSE_POLICY};
use relay_core::metrics::{WS_AUTH_FAILURES_TOTAL, WS_CONNECTIONS_TOTAL};
use relay_core::{ConnectionId, SubscriptionId};
use relay_hub::Subscriber;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use super::connection::{Connection, ConnectionState};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::protocol::{ClientFrame, ErrorCode, ProtocolError, ServerFrame};
use super::writer::{CLOSE_GOING_AWAY, WriterCommand, run_writer};
use super::{ConnectionSlot, Gateway};
use crate::auth::{AuthError, Identity};

/// Commands buffered between reader and writer.
const COMMAND_BUFFER: usize = 64;

/// Time the writer gets to flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the reader does after a frame.
enum Flow {
    Continue,
    Close(u16, String),
    Stop,
}

/// Serve one upgraded socket until it closes. `token` is the credential
/// taken from the upgrade request, if any.
#[instrument(skip_all, fields(conn_id))]
pub async fn serve_connection(
    gateway: Arc<Gateway>,
    mut socket: WebSocket,
    token: Option<String>,
    slot: ConnectionSlot,
) {
    let conn = Arc::new(Connection::new(ConnectionId::new(), gateway.child_token()));
    let _ = tracing::Span::current().record("conn_id", conn.id.as_str());
    metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(conn_id = %conn.id, "websocket client connected");

    let first_frame = match handshake(&gateway, &mut socket, token).await {
        Ok((identity, first_frame)) => {
            conn.set_identity(identity);
            first_frame
        }
        Err(e) => {
            metrics::counter!(WS_AUTH_FAILURES_TOTAL).increment(1);
            warn!(conn_id = %conn.id, error = %e, "authentication failed");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_AUTH_FAILED,
                    reason: "authentication failed".into(),
                })))
                .await;
            let _ = conn.transition(ConnectionState::Closed);
            drop(slot);
            return;
        }
    };
    let _ = conn.transition(ConnectionState::Authenticated);
    if first_frame {
        let sent = socket.send(Message::Text(ServerFrame::authenticated().to_text().into())).await;
        if sent.is_err() {
            let _ = conn.transition(ConnectionState::Closing);
            let _ = conn.transition(ConnectionState::Closed);
            return;
        }
    }
    let _ = conn.transition(ConnectionState::Active);
    conn.mark_alive();
    gateway.insert(Arc::clone(&conn));

    let (sink, mut stream) = socket.split();
    let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
    let config = gateway.config().clone();
    let mut writer = tokio::spawn(run_writer(sink, Arc::clone(&conn), rx, config.heartbeat_interval));

    let cancel = conn.cancel_token().clone();
    let heartbeat = run_heartbeat(
        Arc::clone(&conn),
        config.heartbeat_interval,
        config.heartbeat_timeout,
        cancel.clone(),
    );
    tokio::pin!(heartbeat);

    let mut reader = Reader {
        gateway: &gateway,
        conn: &conn,
        commands: &commands,
        protocol_errors: 0,
    };

    let close = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            result = &mut heartbeat => {
                if result == HeartbeatResult::TimedOut {
                    info!(conn_id = %conn.id, idle = ?conn.idle_for(), "heartbeat timed out");
                    break Some((CLOSE_GOING_AWAY, "heartbeat timeout".to_owned()));
                }
                break None;
            }
            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    conn.mark_alive();
                    match reader.on_message(msg).await {
                        Flow::Continue => {}
                        Flow::Close(code, reason) => break Some((code, reason)),
                        Flow::Stop => break None,
                    }
                }
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, error = %e, "websocket read failed");
                    break None;
                }
                None => break None,
            },
        }
    };

    let _ = conn.transition(ConnectionState::Closing);
    if let Some((code, reason)) = close {
        let _ = commands.send(WriterCommand::Close { code, reason }).await;
    }
    drop(commands);
    if time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!(conn_id = %conn.id, "writer did not stop in time");
        writer.abort();
    }
    cancel.cancel();

    let registry = gateway.registry();
    for (key, sub) in conn.take_subscriptions() {
        let _ = registry.unsubscribe(&key, sub.id());
    }
    gateway.remove(&conn.id);
    let _ = conn.transition(ConnectionState::Closed);
    info!(conn_id = %conn.id, age = ?conn.age(), "websocket client disconnected");
    drop(slot);
}

/// Establish the connection's identity before it may subscribe.
///
/// A token from the upgrade request is checked immediately. Without one,
/// and with authentication required, the first frame must be
/// `authenticate`. The flag is `true` when that path was taken.
async fn handshake(
    gateway: &Gateway,
    socket: &mut WebSocket,
    token: Option<String>,
) -> Result<(Identity, bool), AuthError> {
    let auth = gateway.auth();
    if token.is_some() || !auth.is_required() {
        return auth.authenticate(token.as_deref()).map(|id| (id, false));
    }
    let token = time::timeout(gateway.config().handshake_timeout, first_frame_token(socket))
        .await
        .map_err(|_| AuthError::Timeout)??;
    auth.authenticate(Some(&token)).map(|id| (id, true))
}

async fn first_frame_token(socket: &mut WebSocket) -> Result<String, AuthError> {
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match ClientFrame::parse(text.as_str()) {
                    Ok(ClientFrame::Authenticate { token }) => Ok(token),
                    _ => Err(AuthError::MissingToken),
                };
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(_) | Err(_) => break,
        }
    }
    Err(AuthError::MissingToken)
}

struct Reader<'a> {
    gateway: &'a Gateway,
    conn: &'a Arc<Connection>,
    commands: &'a mpsc::Sender<WriterCommand>,
    protocol_errors: u32,
}

impl Reader<'_> {
    async fn on_message(&mut self, msg: Message) -> Flow {
        match msg {
            Message::Text(text) => match ClientFrame::parse(text.as_str()) {
                Ok(frame) => self.on_frame(frame).await,
                Err(e) => self.protocol_error(e).await,
            },
            Message::Binary(_) => {
                self.protocol_error(ProtocolError::new(ErrorCode::InvalidFrame, "binary frames are not supported"))
                    .await
            }
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
            Message::Close(frame) => {
                debug!(conn_id = %self.conn.id, ?frame, "client closed");
                Flow::Stop
            }
        }
    }

    async fn on_frame(&mut self, frame: ClientFrame) -> Flow {
        match frame {
            ClientFrame::Subscribe {
                session_id,
                result_type,
            } => {
                let key = match ClientFrame::subscription_key(&session_id, &result_type) {
                    Ok(key) => key,
                    Err(e) => return self.protocol_error(e).await,
                };
                if self.conn.follows(&key) {
                    return self.send(ServerFrame::error(ProtocolError::new(
                        ErrorCode::AlreadySubscribed,
                        format!("already subscribed to {key}"),
                    )))
                    .await;
                }

                let config = self.gateway.config();
                let sub = Arc::new(Subscriber::new(
                    self.conn.id.clone(),
                    config.queue_capacity,
                    self.conn.waker(),
                ));
                let registry = self.gateway.registry();
                let events = registry.subscribe(key.clone(), Arc::clone(&sub));
                if self.conn.add_subscription(key.clone(), Arc::clone(&sub)).is_err() {
                    let _ = registry.unsubscribe(&key, sub.id());
                    return self.send(ServerFrame::error(ProtocolError::new(
                        ErrorCode::AlreadySubscribed,
                        format!("already subscribed to {key}"),
                    )))
                    .await;
                }
                info!(
                    conn_id = %self.conn.id,
                    subscription_id = %sub.id(),
                    session_id = %key.session_id,
                    result_type = %key.result_type,
                    snapshot_len = events.len(),
                    "subscribed"
                );
                let snapshot = ServerFrame::Snapshot {
                    subscription_id: sub.id().clone(),
                    session_id: key.session_id,
                    result_type: key.result_type,
                    events,
                };
                self.command(WriterCommand::Attach {
                    snapshot,
                    subscriber: sub,
                })
                .await
            }
            ClientFrame::Unsubscribe { subscription_id } => self.unsubscribe(subscription_id).await,
            ClientFrame::Authenticate { token } => match self.gateway.auth().authenticate(Some(&token)) {
                Ok(identity) => {
                    self.conn.set_identity(identity);
                    self.send(ServerFrame::authenticated()).await
                }
                Err(e) => {
                    metrics::counter!(WS_AUTH_FAILURES_TOTAL).increment(1);
                    warn!(conn_id = %self.conn.id, error = %e, "re-authentication failed");
                    Flow::Close(CLOSE_AUTH_FAILED, "authentication failed".to_owned())
                }
            },
            ClientFrame::Ping => self.send(ServerFrame::pong()).await,
        }
    }

    async fn unsubscribe(&mut self, subscription_id: SubscriptionId) -> Flow {
        let Some((key, sub)) = self.conn.remove_subscription(&subscription_id) else {
            return self.send(ServerFrame::error(ProtocolError::new(
                ErrorCode::UnknownSubscription,
                format!("no subscription {subscription_id}"),
            )))
            .await;
        };
        let _ = self.gateway.registry().unsubscribe(&key, sub.id());
        info!(conn_id = %self.conn.id, %subscription_id, "unsubscribed");
        if let Flow::Stop = self.command(WriterCommand::Detach(subscription_id.clone())).await {
            return Flow::Stop;
        }
        self.send(ServerFrame::unsubscribed(subscription_id)).await
    }

    async fn protocol_error(&mut self, error: ProtocolError) -> Flow {
        self.protocol_errors += 1;
        let limit = self.gateway.config().max_protocol_errors;
        debug!(
            conn_id = %self.conn.id,
            code = ?error.code,
            count = self.protocol_errors,
            "protocol error"
        );
        if self.protocol_errors > limit {
            warn!(conn_id = %self.conn.id, count = self.protocol_errors, "too many protocol errors");
            return Flow::Close(CLOSE_POLICY, "too many protocol errors".to_owned());
        }
        self.send(ServerFrame::error(error)).await
    }

    async fn send(&self, frame: ServerFrame) -> Flow {
        self.command(WriterCommand::Frame(frame)).await
    }

    async fn command(&self, command: WriterCommand) -> Flow {
        if self.commands.send(command).await.is_err() {
            debug!(conn_id = %self.conn.id, "writer gone");
            return Flow::Stop;
        }
        Flow::Continue
    }
}
