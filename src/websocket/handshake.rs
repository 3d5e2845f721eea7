use std::{io, time::Duration};

use bytes::BytesMut;
use http::{
    header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE},
    HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Version,
};
use httparse::Status;
use monoio::io::AsyncReadRent;
use monoio_http::common::body::HttpBody;

use crate::{
    error::{HttpError, Result},
    http::{request_body, Activity},
    request::{
        headers::{assemble, HeaderPlan},
        ServerInfo,
    },
    response::ResponseHead,
};

const READ_CHUNK: usize = 4 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// A random nonce for `Sec-WebSocket-Key`.
#[inline]
pub(crate) fn generate_key() -> String {
    tungstenite::handshake::client::generate_key()
}

/// The `Sec-WebSocket-Accept` value a server must answer `key` with.
#[inline]
pub(crate) fn accept_key(key: &str) -> String {
    tungstenite::handshake::derive_accept_key(key.as_bytes())
}

/// The upgrade request for `path`, offering `key`.
pub(crate) fn upgrade_request(
    path: &str,
    headers: &[(HeaderName, HeaderValue)],
    server: &ServerInfo,
    user_agent: &str,
    key: &str,
) -> Result<Request<HttpBody>> {
    let mut map = assemble(&HeaderPlan {
        headers,
        body: None,
        server,
        version: Version::HTTP_11,
        accept_compressed: false,
        keep_alive: true,
        user_agent,
    })?;
    map.insert(UPGRADE, HeaderValue::from_static("websocket"));
    map.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    map.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    map.insert(
        SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(key).map_err(|e| HttpError::protocol(e.to_string()))?,
    );
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .version(Version::HTTP_11)
        .body(request_body(None))?;
    *request.headers_mut() = map;
    Ok(request)
}

fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let len = match resp.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };
    let status = resp
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| HttpError::protocol("invalid status code"))?;
    let version = match resp.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut map = HeaderMap::with_capacity(resp.headers.len());
    for h in resp.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| HttpError::protocol(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| HttpError::protocol(format!("invalid value for header {}", h.name)))?;
        map.append(name, value);
    }
    Ok(Some((
        ResponseHead {
            status,
            version,
            headers: map,
        },
        len,
    )))
}

/// Read the answer to the upgrade request. Bytes after the head already
/// belong to the frame stream and are handed back with it.
pub(crate) async fn read_response<R: AsyncReadRent>(
    stream: &mut R,
    idle: Option<Duration>,
) -> Result<(ResponseHead, BytesMut)> {
    let activity = Activity::new();
    let mut buf = BytesMut::new();
    loop {
        if let Some((head, len)) = parse_head(&buf)? {
            let _ = buf.split_to(len);
            return Ok((head, buf));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::protocol("handshake response head too large"));
        }
        let (res, chunk) = activity
            .watch(idle, stream.read(Vec::with_capacity(READ_CHUNK)))
            .await?;
        match res? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during the websocket handshake",
                )
                .into())
            }
            n => buf.extend_from_slice(&chunk[..n.min(chunk.len())]),
        }
    }
}

fn has_token(head: &ResponseHead, name: HeaderName, token: &str) -> bool {
    head.headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Check that `head` accepts the upgrade offered with `key`.
pub(crate) fn validate(head: &ResponseHead, key: &str) -> Result<()> {
    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(HttpError::protocol(format!(
            "websocket upgrade refused with status {}",
            head.status
        )));
    }
    if !has_token(head, UPGRADE, "websocket") {
        return Err(HttpError::protocol("missing `Upgrade: websocket` in handshake response"));
    }
    if !has_token(head, CONNECTION, "upgrade") {
        return Err(HttpError::protocol("missing `Connection: upgrade` in handshake response"));
    }
    let accept = head
        .headers
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if accept != Some(accept_key(key).as_str()) {
        return Err(HttpError::protocol("invalid Sec-WebSocket-Accept in handshake response"));
    }
    Ok(())
}
