//! Redis backend over RESP2.
//!
//! Subscriptions get a dedicated connection each, read by a spawned task that
//! forwards `message` pushes into the returned stream. Commands share one
//! lazily (re)established connection.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::bus::{BusStream, MessageBus, PresenceStore, RawMessage, WorkQueue};
use crate::error::BusError;
use crate::resp::{RespCodec, RespValue};

const DEFAULT_PORT: u16 = 6379;
const SUBSCRIPTION_BUFFER: usize = 256;

type Connection = Framed<TcpStream, RespCodec>;

/// Connection parameters parsed from a `redis://` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// `AUTH` password.
    pub password: Option<String>,
    /// Database index for commands.
    pub db: Option<u32>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl RedisConfig {
    /// Parse `redis://[:password@]host[:port][/db]`.
    pub fn from_url(url: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidUrl(url.to_owned());
        let rest = url.strip_prefix("redis://").ok_or_else(invalid)?;

        let (auth, rest) = match rest.rsplit_once('@') {
            Some((auth, rest)) => (Some(auth), rest),
            None => (None, rest),
        };
        let password = auth
            .map(|a| a.split_once(':').map_or(a, |(_, pw)| pw))
            .filter(|pw| !pw.is_empty())
            .map(str::to_owned);

        let (hostport, db) = match rest.split_once('/') {
            Some((hp, "")) => (hp, None),
            Some((hp, db)) => (hp, Some(db.parse::<u32>().map_err(|_| invalid())?)),
            None => (rest, None),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().map_err(|_| invalid())?),
            None => (hostport, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            password,
            db,
            connect_timeout: Duration::from_secs(5),
        })
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Redis client implementing every bus interface.
pub struct RedisBus {
    config: RedisConfig,
    command: Mutex<Option<Connection>>,
}

impl RedisBus {
    /// Create a client. No connection is made until first use.
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            command: Mutex::new(None),
        }
    }

    async fn connect(&self, select_db: bool) -> Result<Connection, BusError> {
        let addr = self.config.addr();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BusError::ConnectTimeout { addr: addr.clone() })??;
        stream.set_nodelay(true)?;
        let mut conn = Framed::new(stream, RespCodec::default());

        if let Some(password) = &self.config.password {
            let _ = request(&mut conn, "AUTH", RespValue::command(["AUTH", password.as_str()])).await?;
        }
        if select_db {
            if let Some(db) = self.config.db {
                let _ = request(&mut conn, "SELECT", RespValue::command(["SELECT", db.to_string().as_str()])).await?;
            }
        }
        debug!(%addr, "connected to redis");
        Ok(conn)
    }

    /// Run one command on the shared connection, dropping it on failure.
    async fn execute(&self, name: &'static str, cmd: RespValue) -> Result<RespValue, BusError> {
        let mut guard = self.command.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(true).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(BusError::Closed);
        };
        let result = request(conn, name, cmd).await;
        if let Err(err) = &result {
            if err.is_connection_error() {
                warn!(command = name, error = %err, "redis command connection dropped");
                *guard = None;
            }
        }
        result
    }
}

async fn request(
    conn: &mut Connection,
    name: &'static str,
    cmd: RespValue,
) -> Result<RespValue, BusError> {
    conn.send(cmd).await?;
    let reply = match conn.next().await {
        Some(Ok(RespValue::Error(msg))) => Err(BusError::Server(msg)),
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(err),
        None => Err(BusError::Closed),
    };
    reply.inspect_err(|err| debug!(command = name, error = %err, "redis request failed"))
}

fn unexpected(command: &'static str, reply: &RespValue) -> BusError {
    BusError::UnexpectedReply {
        command,
        reply: format!("{reply:?}"),
    }
}

/// Extract `(channel, payload)` from a `message` push.
fn message_push(value: RespValue) -> Option<RawMessage> {
    let RespValue::Array(mut parts) = value else {
        return None;
    };
    if parts.len() != 3 || parts[0].as_text() != Some("message") {
        return None;
    }
    let payload = match parts.pop()? {
        RespValue::Bulk(b) => b,
        _ => return None,
    };
    let channel = parts.pop()?.as_text()?.to_owned();
    Some(RawMessage { channel, payload })
}

async fn pump_subscription(mut conn: Connection, tx: mpsc::Sender<Result<RawMessage, BusError>>) {
    loop {
        let frame = tokio::select! {
            frame = conn.next() => frame,
            () = tx.closed() => return,
        };
        match frame {
            Some(Ok(value)) => {
                if let Some(msg) = message_push(value) {
                    if tx.send(Ok(msg)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
            None => {
                let _ = tx.send(Err(BusError::Closed)).await;
                return;
            }
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, BusError> {
        let mut conn = self.connect(false).await?;
        let mut cmd = vec!["SUBSCRIBE"];
        cmd.extend(channels.iter().map(String::as_str));
        conn.send(RespValue::command(cmd)).await?;

        // One confirmation per channel: ["subscribe", channel, count].
        for _ in channels {
            match conn.next().await {
                Some(Ok(RespValue::Array(parts)))
                    if parts.first().and_then(RespValue::as_text) == Some("subscribe") => {}
                Some(Ok(RespValue::Error(msg))) => return Err(BusError::Server(msg)),
                Some(Ok(other)) => return Err(unexpected("SUBSCRIBE", &other)),
                Some(Err(err)) => return Err(err),
                None => return Err(BusError::Closed),
            }
        }
        debug!(?channels, "redis subscription established");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        drop(tokio::spawn(pump_subscription(conn, tx)));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, BusError> {
        let cmd = RespValue::Array(vec![
            RespValue::bulk("PUBLISH"),
            RespValue::bulk(channel),
            RespValue::Bulk(payload),
        ]);
        match self.execute("PUBLISH", cmd).await? {
            RespValue::Integer(n) => Ok(u64::try_from(n).unwrap_or(0)),
            other => Err(unexpected("PUBLISH", &other)),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisBus {
    async fn push(&self, queue: &str, job: &str) -> Result<u64, BusError> {
        match self
            .execute("LPUSH", RespValue::command(["LPUSH", queue, job]))
            .await?
        {
            RespValue::Integer(n) => Ok(u64::try_from(n).unwrap_or(0)),
            other => Err(unexpected("LPUSH", &other)),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisBus {
    async fn set_expiring(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError> {
        let secs = ttl.as_secs().max(1).to_string();
        match self
            .execute("SET", RespValue::command(["SET", key, value, "EX", secs.as_str()]))
            .await?
        {
            RespValue::Simple(ok) if ok == "OK" => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }
}
