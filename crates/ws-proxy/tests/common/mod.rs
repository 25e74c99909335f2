#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use ws_proxy::{Proxy, ProxyConfig};

pub const WAIT: Duration = Duration::from_secs(5);

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type BackendSession = WebSocketStream<TcpStream>;

/// A WebSocket server standing in for the real backend. Every accepted
/// session is handed to the test together with the request target it was
/// opened on.
pub struct MockBackend {
    pub addr: SocketAddr,
    sessions: mpsc::UnboundedReceiver<(String, BackendSession)>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, sessions) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut target = String::new();
                    let callback =
                        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            target = req.uri().to_string();
                            Ok(resp)
                        };
                    if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                        let _ = tx.send((target, ws));
                    }
                });
            }
        });

        Self { addr, sessions }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn next_session(&mut self) -> (String, BackendSession) {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("timeout waiting for backend session")
            .expect("mock backend stopped")
    }

    pub async fn has_session_within(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.sessions.recv()).await,
            Ok(Some(_))
        )
    }
}

/// Start a plain-transport proxy on an ephemeral port in front of `backend_url`.
pub async fn start_proxy(backend_url: String) -> SocketAddr {
    start_proxy_with(ProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        backend_url,
        ..ProxyConfig::default()
    })
    .await
}

pub async fn start_proxy_with(config: ProxyConfig) -> SocketAddr {
    let proxy = Proxy::bind(config).await.unwrap();
    let addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run());
    addr
}

pub async fn connect_client(proxy: SocketAddr, path: &str) -> ClientStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{proxy}{path}"))
        .await
        .unwrap();
    ws
}

/// Next data message, skipping control frames.
pub async fn recv<S>(ws: &mut S) -> Message
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(msg)) => return msg,
                other => panic!("stream ended while waiting for a message: {other:?}"),
            }
        }
    })
    .await
    .expect("timeout waiting for message")
}

pub async fn recv_text<S>(ws: &mut S) -> String
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    match recv(ws).await {
        Message::Text(text) => text.to_string(),
        other => panic!("expected text message, got {other:?}"),
    }
}

/// Assert the stream is closed (close frame, EOF or error) without any
/// further data message arriving first.
pub async fn expect_closed<S>(ws: &mut S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(other)) => panic!("unexpected message before close: {other:?}"),
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed in time");
}

/// Send a bare `GET` and read the whole response.
pub async fn http_get<S>(stream: S, path: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    http_exchange(stream, &request).await
}

/// Write a raw request and read until the server closes the connection.
pub async fn http_exchange<S>(mut stream: S, request: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = tokio::time::timeout(WAIT, async {
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
            }
        }
        response
    })
    .await
    .expect("timeout waiting for http response");

    String::from_utf8(response).unwrap()
}
