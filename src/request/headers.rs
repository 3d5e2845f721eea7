use http::{
    header::{
        ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
        TRANSFER_ENCODING, USER_AGENT,
    },
    HeaderMap, HeaderName, HeaderValue, Version,
};

use super::{body::PreparedBody, ServerInfo};
use crate::error::{HttpError, Result};

pub(crate) const ACCEPT_ANY: &str = "*/*";
pub(crate) const COMPRESSED_ENCODINGS: &str = "gzip,deflate";

/// Inputs to header assembly for one attempt of one request.
pub(crate) struct HeaderPlan<'a> {
    pub(crate) headers: &'a [(HeaderName, HeaderValue)],
    pub(crate) body: Option<&'a PreparedBody>,
    pub(crate) server: &'a ServerInfo,
    pub(crate) version: Version,
    pub(crate) accept_compressed: bool,
    pub(crate) keep_alive: bool,
    pub(crate) user_agent: &'a str,
}

fn value(v: impl AsRef<str>) -> Result<HeaderValue> {
    HeaderValue::from_str(v.as_ref())
        .map_err(|e| {
            HttpError::Configuration(format!("invalid header value {:?}: {e}", v.as_ref()))
        })
}

/// Merge caller headers with the headers the client is responsible for.
pub(crate) fn assemble(plan: &HeaderPlan<'_>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(plan.headers.len() + 6);
    for (name, v) in plan.headers {
        map.append(name.clone(), v.clone());
    }

    if plan.accept_compressed && !map.contains_key(ACCEPT_ENCODING) {
        map.insert(ACCEPT_ENCODING, HeaderValue::from_static(COMPRESSED_ENCODINGS));
    }

    match plan.body {
        Some(body) if body.is_chunked() => {
            map.remove(CONTENT_LENGTH);
            map.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        Some(body) => {
            map.remove(TRANSFER_ENCODING);
            map.insert(CONTENT_LENGTH, HeaderValue::from(body.content_length as u64));
        }
        None => {
            map.remove(CONTENT_LENGTH);
            map.remove(TRANSFER_ENCODING);
        }
    }

    if let Some(content_type) = plan.body.and_then(|b| b.content_type.as_deref()) {
        let charset = plan.body.and_then(|b| b.charset.as_deref());
        let merged = match charset {
            Some(cs) if !content_type.to_ascii_lowercase().contains("charset=") => {
                format!("{content_type};charset={cs}")
            }
            _ => content_type.to_string(),
        };
        map.insert(CONTENT_TYPE, value(merged)?);
    }

    if !map.contains_key(ACCEPT) {
        map.insert(ACCEPT, HeaderValue::from_static(ACCEPT_ANY));
    }
    if !map.contains_key(USER_AGENT) {
        map.insert(USER_AGENT, value(plan.user_agent)?);
    }
    map.insert(HOST, value(plan.server.host_header())?);

    if !plan.keep_alive {
        map.insert(CONNECTION, HeaderValue::from_static("close"));
    } else if plan.version == Version::HTTP_10 && !map.contains_key(CONNECTION) {
        map.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    Ok(map)
}
