//! HTTP/1.x exchanges over `monoio-http`'s client codec. The transport
//! underneath records its progress, which drives the idle timeout.
mod connection;
mod decompress;
mod idle;

pub(crate) use connection::{request_body, send_request, HttpChannel, HttpChannelConnector};
pub(crate) use decompress::decompress;
pub(crate) use idle::Activity;
