//! The per-connection writer task.
//!
//! It is the only code that touches the socket's send half. Subscribers are
//! attached only after their snapshot frame has been written, so live events
//! queued meanwhile always reach the client after the snapshot.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt};
use relay_core::SubscriptionId;
use relay_hub::{Outbound, Subscriber};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

use super::connection::Connection;
use super::protocol::ServerFrame;

/// Items drained from one subscriber per wakeup before moving to the next.
const DRAIN_BATCH: usize = 64;

/// Close code sent on shutdown or heartbeat expiry (RFC 6455 "going away").
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Instructions from the reader to the writer.
#[derive(Debug)]
pub enum WriterCommand {
    /// Write `snapshot`, then start draining `subscriber`.
    Attach {
        /// Snapshot frame.
        snapshot: ServerFrame,
        /// Subscriber whose queue follows the snapshot.
        subscriber: Arc<Subscriber>,
    },
    /// Stop draining a subscriber.
    Detach(SubscriptionId),
    /// Write a standalone frame.
    Frame(ServerFrame),
    /// Send a close frame and stop.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Why the writer stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum WriterExit {
    /// A close frame was sent.
    Closed,
    /// The reader went away without asking for a close frame.
    Finished,
    /// Writing to the socket failed.
    SocketError,
}

/// Drive the send half of a socket until closed.
pub async fn run_writer<S>(
    mut sink: S,
    connection: Arc<Connection>,
    mut commands: mpsc::Receiver<WriterCommand>,
    ping_interval: Duration,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let waker = connection.waker();
    let cancel = connection.cancel_token().clone();
    let mut attached: Vec<Arc<Subscriber>> = Vec::new();
    let mut ping = time::interval_at(time::Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = send_close(&mut sink, CLOSE_GOING_AWAY, "server shutting down").await;
                break WriterExit::Closed;
            }
            command = commands.recv() => match command {
                Some(WriterCommand::Attach { snapshot, subscriber }) => {
                    let sent = send_frame(&mut sink, &snapshot).await;
                    attached.push(subscriber);
                    sent
                }
                Some(WriterCommand::Detach(id)) => {
                    attached.retain(|s| s.id() != &id);
                    Ok(())
                }
                Some(WriterCommand::Frame(frame)) => send_frame(&mut sink, &frame).await,
                Some(WriterCommand::Close { code, reason }) => {
                    let _ = flush_queues(&mut sink, &attached).await;
                    let _ = send_close(&mut sink, code, &reason).await;
                    break WriterExit::Closed;
                }
                None => break WriterExit::Finished,
            },
            () = waker.notified() => Ok(()),
            _ = ping.tick() => {
                trace!(conn_id = %connection.id, "sending ping");
                sink.send(Message::Ping(Vec::new().into())).await.map_err(|e| e.to_string())
            }
        };

        let flushed = match sent {
            Ok(()) => flush_queues(&mut sink, &attached).await,
            Err(e) => Err(e),
        };
        match flushed {
            Ok(more) => {
                if more {
                    waker.notify_one();
                }
            }
            Err(e) => {
                debug!(conn_id = %connection.id, error = %e, "socket write failed");
                break WriterExit::SocketError;
            }
        }
    };

    let _ = sink.close().await;
    debug!(conn_id = %connection.id, ?exit, "writer stopped");
    exit
}

/// Write up to a batch from every attached subscriber. Returns whether any
/// queue may still hold items.
async fn flush_queues<S>(sink: &mut S, attached: &[Arc<Subscriber>]) -> Result<bool, String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut more = false;
    for sub in attached {
        let batch = sub.drain(DRAIN_BATCH);
        more |= batch.len() == DRAIN_BATCH;
        for item in batch {
            let frame = match item {
                Outbound::Event(event) => ServerFrame::Event {
                    subscription_id: sub.id().clone(),
                    event,
                },
                Outbound::Gap { missed } => ServerFrame::gap(sub.id().clone(), missed),
            };
            send_frame(sink, &frame).await?;
        }
    }
    Ok(more)
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(frame.to_text().into()))
        .await
        .map_err(|e| e.to_string())
}

async fn send_close<S>(sink: &mut S, code: u16, reason: &str) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    })))
    .await
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::channel::mpsc as fmpsc;
    use relay_core::{Category, ConnectionId, Event, ResultType, SessionId};
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    fn ev(sequence: u64) -> Arc<Event> {
        Arc::new(Event {
            category: Category::ResultAdded,
            session_id: SessionId::new("S1"),
            result_type: ResultType::new("mx:integrate"),
            payload: Value::Null,
            sequence,
            channel: String::new(),
        })
    }

    fn text(msg: &Message) -> Value {
        match msg {
            Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    struct Harness {
        conn: Arc<Connection>,
        commands: mpsc::Sender<WriterCommand>,
        out: fmpsc::UnboundedReceiver<Message>,
        task: tokio::task::JoinHandle<WriterExit>,
    }

    fn spawn_writer() -> Harness {
        let conn = Arc::new(Connection::new(ConnectionId::new(), CancellationToken::new()));
        let (tx, rx) = mpsc::channel(8);
        let (sink, out) = fmpsc::unbounded::<Message>();
        let task = tokio::spawn(run_writer(sink, Arc::clone(&conn), rx, Duration::from_secs(30)));
        Harness {
            conn,
            commands: tx,
            out,
            task,
        }
    }

    fn subscriber(conn: &Connection) -> Arc<Subscriber> {
        Arc::new(Subscriber::new(conn.id.clone(), 8, conn.waker()))
    }

    #[tokio::test]
    async fn snapshot_precedes_queued_events() {
        let mut h = spawn_writer();
        let sub = subscriber(&h.conn);
        let _ = sub.push_event(ev(2));

        h.commands
            .send(WriterCommand::Attach {
                snapshot: ServerFrame::Snapshot {
                    subscription_id: sub.id().clone(),
                    session_id: SessionId::new("S1"),
                    result_type: ResultType::new("mx:integrate"),
                    events: vec![ev(1)],
                },
                subscriber: Arc::clone(&sub),
            })
            .await
            .unwrap();

        let first = text(&h.out.next().await.unwrap());
        assert_eq!(first["events"][0]["sequence"], 1);
        let second = text(&h.out.next().await.unwrap());
        assert_eq!(second["event"]["sequence"], 2);

        let _ = sub.push_gap();
        let third = text(&h.out.next().await.unwrap());
        assert_eq!(third["gap"], true);

        drop(h.commands);
        assert_eq!(h.task.await.unwrap(), WriterExit::Finished);
    }

    #[tokio::test]
    async fn detached_subscriber_is_not_drained() {
        let mut h = spawn_writer();
        let sub = subscriber(&h.conn);
        h.commands
            .send(WriterCommand::Attach {
                snapshot: ServerFrame::pong(),
                subscriber: Arc::clone(&sub),
            })
            .await
            .unwrap();
        let _ = h.out.next().await.unwrap();

        h.commands.send(WriterCommand::Detach(sub.id().clone())).await.unwrap();
        h.commands.send(WriterCommand::Frame(ServerFrame::pong())).await.unwrap();
        let _ = h.out.next().await.unwrap();
        let _ = sub.push_event(ev(1));
        h.commands.send(WriterCommand::Frame(ServerFrame::pong())).await.unwrap();
        assert_eq!(text(&h.out.next().await.unwrap()), serde_json::json!({"pong": true}));
        assert_eq!(sub.len(), 1);
    }

    #[tokio::test]
    async fn close_command_sends_close_frame() {
        let mut h = spawn_writer();
        h.commands
            .send(WriterCommand::Close {
                code: 1008,
                reason: "too many protocol errors".into(),
            })
            .await
            .unwrap();
        match h.out.next().await.unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason.as_str(), "too many protocol errors");
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(h.task.await.unwrap(), WriterExit::Closed);
    }

    #[tokio::test]
    async fn cancellation_sends_going_away() {
        let mut h = spawn_writer();
        h.conn.cancel_token().cancel();
        match h.out.next().await.unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_GOING_AWAY),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(h.task.await.unwrap(), WriterExit::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_interval() {
        let mut h = spawn_writer();
        time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(h.out.next().await.unwrap(), Message::Ping(_)));
    }

    #[tokio::test]
    async fn failed_write_stops_writer() {
        let conn = Arc::new(Connection::new(ConnectionId::new(), CancellationToken::new()));
        let (tx, rx) = mpsc::channel(8);
        let (sink, out) = fmpsc::unbounded::<Message>();
        drop(out);
        let task = tokio::spawn(run_writer(sink, conn, rx, Duration::from_secs(30)));
        tx.send(WriterCommand::Frame(ServerFrame::pong())).await.unwrap();
        assert_eq!(task.await.unwrap(), WriterExit::SocketError);
    }
}
