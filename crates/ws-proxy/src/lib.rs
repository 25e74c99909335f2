//! Bidirectional WebSocket relay.
//!
//! Every client session accepted on the listening port is paired with its own
//! outbound session to a fixed backend. The inbound request path is appended
//! verbatim to the backend base address; nothing else from the request is
//! propagated.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS/WSS-->  ws-proxy  <--WS/WSS-->  Backend
//!                          |
//!                 [status reply for plain HTTP]
//! ```
//!
//! Each pair runs two forwarding loops (client-to-backend and
//! backend-to-client). Whichever ends first cancels the other. Binary frames
//! from the backend are decoded as UTF-8 text before they reach the client.
//! Messages are forwarded as soon as they are read; there is no queue and no
//! flow control beyond what the sockets themselves provide.

pub mod error;
pub mod handshake;
pub mod listener;
pub mod relay;
pub mod tls;

// Re-export the primary public types at the crate root for convenience.
pub use error::ProxyError;
pub use listener::{Proxy, ProxyConfig, Transport, DEFAULT_BACKEND_URL, DEFAULT_LISTEN_ADDR};
pub use relay::{Backend, CloseReason, ConnectionContext, Direction, PairState};
