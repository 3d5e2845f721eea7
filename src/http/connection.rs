use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{
    header::{CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderMap, Method, Request, StatusCode,
};
use monoio::io::{
    sink::{Sink, SinkExt},
    stream::Stream as _,
};
use monoio_http::{
    common::body::{Body, HttpBody},
    h1::{
        codec::{
            decoder::{DecodeError, PayloadDecoder},
            ClientCodec,
        },
        payload::{stream_payload_pair, FixedPayload, Payload},
    },
};

use super::idle::{Activity, ActivityIo};
use crate::{
    connectors::{Connector, Stream},
    error::{CodecError, HttpError, Result},
    key::Key,
    request::PreparedBody,
    response::ResponseHead,
};

/// Write `request` to `sink` and flush it.
pub(crate) async fn send_request<S, E>(sink: &mut S, request: Request<HttpBody>) -> Result<()>
where
    S: Sink<Request<HttpBody>, Error = E>,
    E: Into<CodecError>,
{
    sink.send_and_flush(request)
        .await
        .map_err(|e| HttpError::from(Into::<CodecError>::into(e)))
}

/// The body of a request as the codec wants it: length-delimited when the
/// length is known, chunked otherwise.
pub(crate) fn request_body(body: Option<&PreparedBody>) -> HttpBody {
    let payload = match body {
        None => Payload::None,
        Some(body) if body.is_chunked() => {
            let (payload, mut sender) = stream_payload_pair();
            for chunk in body.chunks.iter().filter(|c| !c.is_empty()) {
                sender.feed_data(Some(chunk.clone()));
            }
            sender.feed_data(None);
            Payload::Stream(payload)
        }
        Some(body) => {
            let data = match body.chunks.as_slice() {
                [single] => single.clone(),
                chunks => chunks
                    .iter()
                    .fold(BytesMut::new(), |mut all, c| {
                        all.extend_from_slice(c);
                        all
                    })
                    .freeze(),
            };
            Payload::Fixed(FixedPayload::new(data))
        }
    };
    HttpBody::H1(payload)
}

/// Whether a response to `method` carries a body at all.
fn has_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Whether the end of the response is known without the peer closing.
fn delimited(method: &Method, head: &ResponseHead) -> bool {
    !has_body(method, head.status)
        || head.headers.contains_key(CONTENT_LENGTH)
        || is_chunked(&head.headers)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// An HTTP/1.x channel: the client codec over a transport whose progress
/// drives the idle timeout.
pub(crate) struct HttpChannel {
    codec: ClientCodec<ActivityIo<Stream>>,
    activity: Activity,
}

impl HttpChannel {
    pub(crate) fn new(io: Stream) -> Self {
        let activity = Activity::new();
        Self {
            codec: ClientCodec::new(ActivityIo::new(io, activity.clone())),
            activity,
        }
    }

    /// Write the request head and body.
    pub(crate) async fn send(
        &mut self,
        request: Request<HttpBody>,
        idle: Option<Duration>,
    ) -> Result<()> {
        self.activity
            .watch(idle, send_request(&mut self.codec, request))
            .await?
    }

    /// Read one response to `method`. `on_head` runs once the final head is
    /// in, before the body is read. Interim `1xx` heads other than `101` are
    /// skipped. The flag reports whether the response had a definite end,
    /// i.e. the channel is in a clean state for another exchange.
    pub(crate) async fn receive(
        &mut self,
        method: &Method,
        idle: Option<Duration>,
        on_head: impl FnOnce(),
    ) -> Result<(ResponseHead, Bytes, bool)> {
        let (head, decoder) = loop {
            let response = match self.activity.watch(idle, self.codec.next()).await? {
                Some(Ok(response)) => response,
                Some(Err(e)) => return Err(CodecError::from(e).into()),
                None => return Err(CodecError::from(DecodeError::UnexpectedEof).into()),
            };
            let (parts, decoder) = response.into_parts();
            if parts.status.is_informational() && parts.status != StatusCode::SWITCHING_PROTOCOLS {
                #[cfg(feature = "logging")]
                tracing::trace!("skipping interim {} response", parts.status);
                continue;
            }
            let head = ResponseHead {
                status: parts.status,
                version: parts.version,
                headers: parts.headers,
            };
            break (head, decoder);
        };
        on_head();

        let definite = delimited(method, &head);
        if !has_body(method, head.status) {
            return Ok((head, Bytes::new(), definite));
        }
        let body = match decoder {
            PayloadDecoder::None => Bytes::new(),
            PayloadDecoder::Fixed(_) => {
                let mut payload = decoder.with_io(&mut self.codec);
                match self.activity.watch(idle, payload.next_data()).await? {
                    Some(data) => data.map_err(CodecError::from)?,
                    None => Bytes::new(),
                }
            }
            PayloadDecoder::Streamed(_) => {
                let mut payload = decoder.with_io(&mut self.codec);
                let mut body = BytesMut::new();
                while let Some(data) = self.activity.watch(idle, payload.next_data()).await? {
                    body.extend_from_slice(&data.map_err(CodecError::from)?);
                }
                body.freeze()
            }
        };
        Ok((head, body, definite))
    }
}

/// Opens transport channels and puts the HTTP/1.x codec on them.
#[derive(Debug, Clone)]
pub(crate) struct HttpChannelConnector<C>(pub(crate) C);

impl<C> Connector<Key> for HttpChannelConnector<C>
where
    C: Connector<Key, Connection = Stream, Error = HttpError>,
{
    type Connection = HttpChannel;
    type Error = HttpError;

    #[inline]
    async fn connect(&self, key: Key) -> Result<HttpChannel> {
        Ok(HttpChannel::new(self.0.connect(key).await?))
    }
}
