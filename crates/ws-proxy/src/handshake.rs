use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{HeaderValue, Request, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::server::create_response;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::error::ProxyError;

/// Upper bound on the size of an HTTP request head.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Parse an HTTP/1.x request head from `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, or the parsed request and
/// the number of bytes the head occupied.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(Request<()>, usize)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(ProxyError::MalformedRequest(err.to_string())),
    };

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or("GET"))
        .uri(parsed.path.unwrap_or("/"))
        .version(version);

    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    let request = builder
        .body(())
        .map_err(|err| ProxyError::MalformedRequest(err.to_string()))?;

    Ok(Some((request, head_len)))
}

/// Read from `stream` until a complete request head has arrived.
///
/// Bytes received after the head are returned alongside the request so they
/// can be handed to the WebSocket layer.
pub async fn read_request_head<S>(stream: &mut S) -> Result<(Request<()>, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::IncompleteRequest);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((request, head_len)) = parse_request_head(&buf)? {
            let leftover = buf.split_off(head_len);
            return Ok((request, leftover));
        }

        if buf.len() > MAX_HEAD_LEN {
            return Err(ProxyError::RequestTooLarge(MAX_HEAD_LEN));
        }
    }
}

/// Whether any value of header `name` contains `token` as a comma-separated,
/// case-insensitive element.
fn header_has_token(request: &Request<()>, name: http::header::HeaderName, token: &str) -> bool {
    request
        .headers()
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Returns `true` if the request asks to switch to the WebSocket protocol.
pub fn is_websocket_upgrade(request: &Request<()>) -> bool {
    header_has_token(request, UPGRADE, "websocket") && header_has_token(request, CONNECTION, "upgrade")
}

/// The path component of the request target, without query or fragment.
pub fn target_path(request: &Request<()>) -> String {
    let path = request.uri().path();
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// First subprotocol offered by the client, if any.
fn first_subprotocol(request: &Request<()>) -> Option<HeaderValue> {
    request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').map(str::trim).find(|p| !p.is_empty()))
        .and_then(|p| HeaderValue::from_str(p).ok())
}

/// Serialize a response head, followed by `body`.
fn encode_response(response: &Response<()>, body: &[u8]) -> Vec<u8> {
    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();

    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn plain_response(status: StatusCode, body: &str) -> Vec<u8> {
    let mut response = Response::new(());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    encode_response(&response, body.as_bytes())
}

/// The `200 OK` plain-text reply served to non-upgrade requests.
pub fn status_response(body: &str) -> Vec<u8> {
    plain_response(StatusCode::OK, body)
}

/// Answer a plain HTTP request with the status body and close the stream.
pub async fn serve_status<S>(stream: &mut S, body: &str) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&status_response(body)).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Complete the server side of the WebSocket handshake for `request`.
///
/// Invalid upgrade requests are answered with `400 Bad Request`. `leftover`
/// holds any bytes the client sent after the request head.
pub async fn accept_upgrade<S>(
    mut stream: S,
    request: &Request<()>,
    leftover: Vec<u8>,
) -> Result<WebSocketStream<S>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut response = match create_response(request) {
        Ok(response) => response,
        Err(err) => {
            let reply = plain_response(StatusCode::BAD_REQUEST, &err.to_string());
            stream.write_all(&reply).await?;
            stream.shutdown().await?;
            return Err(err.into());
        }
    };

    if let Some(protocol) = first_subprotocol(request) {
        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }

    stream.write_all(&encode_response(&response, &[])).await?;
    stream.flush().await?;

    Ok(WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await)
}
