use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};

use crate::{
    error::{HttpError, Result},
    response::ResponseHead,
};

fn read_all(mut decoder: impl Read) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Undo a `gzip` or `deflate` content coding. Unknown codings are left alone.
/// On success the `Content-Encoding` header is removed and `Content-Length`
/// no longer applies.
pub(crate) fn decompress(head: &mut ResponseHead, body: Bytes) -> Result<Bytes> {
    let Some(coding) = head
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
    else {
        return Ok(body);
    };
    if body.is_empty() {
        return Ok(body);
    }
    let decoded = match coding.as_str() {
        "gzip" | "x-gzip" => read_all(MultiGzDecoder::new(&body[..])),
        // Servers disagree on whether "deflate" means zlib-wrapped or raw.
        "deflate" => read_all(ZlibDecoder::new(&body[..]))
            .or_else(|_| read_all(DeflateDecoder::new(&body[..]))),
        _ => return Ok(body),
    }
    .map_err(|e| HttpError::protocol(format!("cannot decode {coding} body: {e}")))?;

    head.headers.remove(CONTENT_ENCODING);
    head.headers.remove(CONTENT_LENGTH);
    Ok(Bytes::from(decoded))
}
