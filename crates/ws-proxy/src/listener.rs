use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::error::ProxyError;
use crate::handshake;
use crate::relay::{self, Backend, ConnectionContext};
use crate::tls;

/// Default listening address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8442";

/// Default backend base address. The inbound path is appended to it.
pub const DEFAULT_BACKEND_URL: &str = "wss://mosquitto.sre.turtle-feature.com:8443";

/// How the listening socket is exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Plain HTTP / `ws://`.
    Plain,
    /// HTTPS / `wss://` with a static PEM certificate chain and private key.
    Tls { cert_path: PathBuf, key_path: PathBuf },
}

impl Transport {
    /// Body of the `200 OK` reply served to non-WebSocket requests.
    pub fn status_body(&self) -> &'static str {
        match self {
            Self::Plain => "WebSocket proxy server",
            Self::Tls { .. } => "WebSocket proxy server with HTTPS",
        }
    }
}

/// Configuration for the WebSocket relay.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Backend base address (`ws://` or `wss://`), without a trailing path.
    pub backend_url: String,
    /// Verify the backend's certificate on `wss://` dials. Off by default so
    /// self-signed backends are accepted.
    pub verify_backend_certificate: bool,
    pub transport: Transport,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8442)),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            verify_backend_certificate: false,
            transport: Transport::Plain,
        }
    }
}

/// State shared by every connection task.
struct Shared {
    backend: Backend,
    acceptor: Option<TlsAcceptor>,
    status_body: &'static str,
}

/// The WebSocket relay server.
///
/// Accepts client connections, answers plain HTTP requests with a status
/// line, and pairs every WebSocket session with its own backend session.
pub struct Proxy {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Proxy {
    /// Load TLS material (if configured), validate the backend address and
    /// bind the listening socket. Any failure here is fatal for the caller.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        let acceptor = match &config.transport {
            Transport::Plain => None,
            Transport::Tls {
                cert_path,
                key_path,
            } => Some(TlsAcceptor::from(tls::server_config(cert_path, key_path)?)),
        };

        let backend = Backend::new(&config.backend_url, config.verify_backend_certificate)?;
        let listener = TcpListener::bind(config.listen_addr).await?;

        tracing::info!(
            addr = %listener.local_addr()?,
            backend = %backend.base_url(),
            tls = acceptor.is_some(),
            "ws-proxy listening"
        );

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                backend,
                acceptor,
                status_body: config.transport.status_body(),
            }),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), ProxyError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Each connection is
    /// handled in its own Tokio task; pairs already running are left to end
    /// on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::error!(%err, "failed to accept connection");
                            continue;
                        }
                    };
                    let shared = Arc::clone(&self.shared);

                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, remote_addr, shared).await {
                            tracing::debug!(%remote_addr, %err, "connection handler error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("ws-proxy no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single TCP connection from accept through relay teardown.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), ProxyError> {
    match &shared.acceptor {
        None => serve(stream, remote_addr, &shared).await,
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            serve(stream, remote_addr, &shared).await
        }
    }
}

async fn serve<S>(mut stream: S, remote_addr: SocketAddr, shared: &Shared) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (request, leftover) = handshake::read_request_head(&mut stream).await?;

    if !handshake::is_websocket_upgrade(&request) {
        tracing::debug!(
            %remote_addr,
            method = %request.method(),
            uri = %request.uri(),
            "serving status response"
        );
        return handshake::serve_status(&mut stream, shared.status_body).await;
    }

    let path = handshake::target_path(&request);
    let inbound = handshake::accept_upgrade(stream, &request, leftover).await?;

    let ctx = Arc::new(ConnectionContext {
        connection_id: uuid::Uuid::new_v4(),
        remote_addr,
        path,
    });

    tracing::info!(
        connection_id = %ctx.connection_id,
        %remote_addr,
        path = %ctx.path,
        "client connected"
    );

    let reason = relay::relay_session(inbound, &shared.backend, Arc::clone(&ctx)).await;

    tracing::info!(
        connection_id = %ctx.connection_id,
        %remote_addr,
        %reason,
        "connection closed"
    );

    Ok(())
}
