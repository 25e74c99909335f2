use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::error::ProxyError;
use crate::tls;

/// Outbound WebSocket stream to the backend.
pub type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Per-connection metadata carried into every log line of a relay pair.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Unique identifier for this inbound connection.
    pub connection_id: uuid::Uuid,
    /// The TCP address of the connecting client.
    pub remote_addr: SocketAddr,
    /// Path of the inbound request, reused verbatim for the backend.
    pub path: String,
}

/// Direction of message flow within a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client -> backend
    Upstream,
    /// Backend -> client
    Downstream,
}

/// Lifecycle of a relay pair. There is no way back from `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Outbound dial in flight.
    Connecting,
    /// Both sockets open, forwarding in both directions.
    Relaying,
    Closed,
}

/// The event that moved a pair into [`PairState::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    InboundClosed,
    InboundError(String),
    OutboundClosed,
    OutboundError(String),
    DialFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InboundClosed => f.write_str("client closed the connection"),
            Self::InboundError(err) => write!(f, "client connection failed: {err}"),
            Self::OutboundClosed => f.write_str("backend closed the connection"),
            Self::OutboundError(err) => write!(f, "backend connection failed: {err}"),
            Self::DialFailed(err) => write!(f, "backend dial failed: {err}"),
        }
    }
}

impl CloseReason {
    /// Whether the pair ended because of the backend rather than the client.
    pub fn is_backend_side(&self) -> bool {
        matches!(
            self,
            Self::OutboundClosed | Self::OutboundError(_) | Self::DialFailed(_)
        )
    }
}

impl Direction {
    fn read_failed(self, err: String) -> CloseReason {
        match self {
            Self::Upstream => CloseReason::InboundError(err),
            Self::Downstream => CloseReason::OutboundError(err),
        }
    }

    fn write_failed(self, err: String) -> CloseReason {
        match self {
            Self::Upstream => CloseReason::OutboundError(err),
            Self::Downstream => CloseReason::InboundError(err),
        }
    }

    fn reader_closed(self) -> CloseReason {
        match self {
            Self::Upstream => CloseReason::InboundClosed,
            Self::Downstream => CloseReason::OutboundClosed,
        }
    }
}

/// The fixed backend every inbound session is paired with.
#[derive(Clone)]
pub struct Backend {
    base_url: String,
    connector: Connector,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Backend {
    /// Validate `base_url` (`ws://` or `wss://` with a host) and prepare the
    /// TLS connector used for `wss://` dials.
    pub fn new(base_url: &str, verify_certificate: bool) -> Result<Self, ProxyError> {
        let base = base_url.trim_end_matches('/');
        let invalid = || ProxyError::InvalidBackendUrl(base_url.to_string());

        let uri: http::Uri = base.parse().map_err(|_| invalid())?;
        if !matches!(uri.scheme_str(), Some("ws") | Some("wss")) || uri.host().is_none() {
            return Err(invalid());
        }

        Ok(Self {
            base_url: base.to_string(),
            connector: Connector::Rustls(tls::client_config(verify_certificate)?),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `<base url><path>`, with the path copied verbatim.
    pub fn target_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Open the outbound session for `path`. No timeout, no retry.
    pub async fn dial(&self, path: &str) -> Result<BackendStream, ProxyError> {
        let url = self.target_url(path);
        let (stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url,
            None,
            false,
            Some(self.connector.clone()),
        )
        .await?;
        Ok(stream)
    }
}

/// Prepare a backend message for the client. Binary payloads are decoded as
/// UTF-8 and sent as text; invalid sequences become U+FFFD.
pub fn coerce_downstream(msg: Message) -> Message {
    match msg {
        Message::Binary(data) => Message::text(String::from_utf8_lossy(&data).into_owned()),
        other => other,
    }
}

/// Upper bound on flushing the close reply to a client that started the
/// close handshake.
const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

fn normal_close() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }
}

/// Pair an accepted inbound session with a fresh backend session and relay
/// until either side ends.
///
/// A failed dial closes the inbound session and ends the pair straight from
/// `Connecting`.
pub async fn relay_session<S>(
    mut inbound: WebSocketStream<S>,
    backend: &Backend,
    ctx: Arc<ConnectionContext>,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = backend.target_url(&ctx.path);
    tracing::info!(
        connection_id = %ctx.connection_id,
        backend = %target,
        state = ?PairState::Connecting,
        "connecting to backend"
    );

    let outbound = match backend.dial(&ctx.path).await {
        Ok(outbound) => outbound,
        Err(err) => {
            tracing::error!(
                connection_id = %ctx.connection_id,
                backend = %target,
                %err,
                "backend connection error"
            );
            if let Err(err) = inbound.close(Some(normal_close())).await {
                tracing::debug!(connection_id = %ctx.connection_id, %err, "closing client failed");
            }
            tracing::debug!(connection_id = %ctx.connection_id, state = ?PairState::Closed, "pair closed");
            return CloseReason::DialFailed(err.to_string());
        }
    };

    tracing::debug!(
        connection_id = %ctx.connection_id,
        backend = %target,
        state = ?PairState::Relaying,
        "backend connected"
    );

    let reason = run_pair(inbound, outbound, Arc::clone(&ctx)).await;

    tracing::debug!(
        connection_id = %ctx.connection_id,
        state = ?PairState::Closed,
        %reason,
        "pair closed"
    );
    reason
}

/// Run both forwarding directions until one of them ends, then cancel the
/// other. Dropping the halves tears down both sockets.
pub async fn run_pair<S, T>(
    inbound: WebSocketStream<S>,
    outbound: WebSocketStream<T>,
    ctx: Arc<ConnectionContext>,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_write, inbound_read) = inbound.split();
    let (outbound_write, outbound_read) = outbound.split();

    let mut up_task = tokio::spawn(relay_messages(
        inbound_read,
        outbound_write,
        Arc::clone(&ctx),
        Direction::Upstream,
    ));

    let mut down_task = tokio::spawn(relay_messages(
        outbound_read,
        inbound_write,
        Arc::clone(&ctx),
        Direction::Downstream,
    ));

    tokio::select! {
        result = &mut up_task => {
            down_task.abort();
            task_reason(result, Direction::Upstream)
        }
        result = &mut down_task => {
            up_task.abort();
            task_reason(result, Direction::Downstream)
        }
    }
}

fn task_reason(result: Result<CloseReason, JoinError>, direction: Direction) -> CloseReason {
    result.unwrap_or_else(|err| direction.read_failed(format!("relay task failed: {err}")))
}

/// Complete the close handshake the client started.
///
/// tungstenite queues the close reply when it reads the client's close frame
/// and writes it on the next poll. Polling the read half until it ends sends
/// the reply; the backend socket is not touched.
async fn finish_client_close<R>(reader: &mut R, ctx: &ConnectionContext)
where
    R: StreamExt<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let drained = tokio::time::timeout(CLOSE_REPLY_TIMEOUT, async {
        while let Some(Ok(_)) = reader.next().await {}
    })
    .await;

    if drained.is_err() {
        tracing::debug!(connection_id = %ctx.connection_id, "client did not take the close reply in time");
    }
}

/// Forward data messages from `reader` to `writer` until the reader ends.
///
/// Only text and binary messages are forwarded; ping/pong are answered by the
/// WebSocket layer. When the backend side ends, the client is sent a normal
/// close frame. When the client side ends, nothing is sent to the backend.
async fn relay_messages<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: Arc<ConnectionContext>,
    direction: Direction,
) -> CloseReason
where
    R: StreamExt<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: SinkExt<Message, Error = tungstenite::Error> + Unpin,
{
    let reason = loop {
        let msg = match reader.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                tracing::warn!(
                    connection_id = %ctx.connection_id,
                    ?direction,
                    %err,
                    "read error, closing relay"
                );
                break direction.read_failed(err.to_string());
            }
            None => break direction.reader_closed(),
        };

        let msg = match msg {
            Message::Text(_) => msg,
            Message::Binary(_) if direction == Direction::Downstream => {
                tracing::debug!(connection_id = %ctx.connection_id, "decoding binary backend message as text");
                coerce_downstream(msg)
            }
            Message::Binary(_) => msg,
            Message::Close(ref frame) => {
                tracing::debug!(connection_id = %ctx.connection_id, ?direction, ?frame, "close frame received");
                if direction == Direction::Upstream {
                    finish_client_close(&mut reader, &ctx).await;
                }
                break direction.reader_closed();
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        tracing::debug!(
            connection_id = %ctx.connection_id,
            ?direction,
            len = msg.len(),
            "relaying message"
        );

        if let Err(err) = writer.send(msg).await {
            tracing::debug!(
                connection_id = %ctx.connection_id,
                ?direction,
                %err,
                "write error, closing relay"
            );
            break direction.write_failed(err.to_string());
        }
    };

    match &reason {
        CloseReason::InboundClosed => {
            tracing::info!(
                connection_id = %ctx.connection_id,
                path = %ctx.path,
                "client disconnected"
            );
        }
        CloseReason::InboundError(_) => {
            tracing::info!(
                connection_id = %ctx.connection_id,
                path = %ctx.path,
                %reason,
                "client connection lost"
            );
        }
        CloseReason::OutboundClosed => {
            tracing::info!(
                connection_id = %ctx.connection_id,
                %reason,
                "backend closed, closing client"
            );
        }
        CloseReason::OutboundError(_) | CloseReason::DialFailed(_) => {
            tracing::error!(
                connection_id = %ctx.connection_id,
                %reason,
                "backend connection error, closing client"
            );
        }
    }

    if direction == Direction::Downstream && reason.is_backend_side() {
        if let Err(err) = writer.send(Message::Close(Some(normal_close()))).await {
            tracing::debug!(connection_id = %ctx.connection_id, %err, "closing client failed");
        }
    }

    reason
}
