use std::{
    fmt,
    io::{self, Read},
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{HttpError, Result};

const STREAM_CHUNK: usize = 8 * 1024;
pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A caller-supplied request body.
pub trait CustomBody: Send + Sync + 'static {
    /// Length in bytes; negative when unknown, which selects chunked transfer.
    fn content_length(&self) -> i64;

    fn content_type(&self) -> Option<String> {
        None
    }

    /// The body as a sequence of chunks. Called once per execution attempt,
    /// on the caller thread.
    fn chunks(&self) -> io::Result<Vec<Bytes>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Bytes,
    File,
    Stream,
    Form,
    Custom,
}

impl fmt::Display for BodyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BodyKind::Bytes => "bytes",
            BodyKind::File => "file",
            BodyKind::Stream => "input stream",
            BodyKind::Form => "form parameters",
            BodyKind::Custom => "custom body",
        })
    }
}

type SharedReader = Arc<Mutex<Option<Box<dyn Read + Send>>>>;

#[derive(Clone)]
pub(crate) enum RequestBody {
    Bytes(Bytes),
    File(PathBuf),
    /// Single use: the first execution drains the reader.
    Stream(SharedReader),
    Form(Vec<(String, String)>),
    Custom(Arc<dyn CustomBody>),
}

impl RequestBody {
    pub(crate) fn stream(reader: impl Read + Send + 'static) -> Self {
        RequestBody::Stream(Arc::new(Mutex::new(Some(Box::new(reader)))))
    }

    pub(crate) fn kind(&self) -> BodyKind {
        match self {
            RequestBody::Bytes(_) => BodyKind::Bytes,
            RequestBody::File(_) => BodyKind::File,
            RequestBody::Stream(_) => BodyKind::Stream,
            RequestBody::Form(_) => BodyKind::Form,
            RequestBody::Custom(_) => BodyKind::Custom,
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestBody::File(p) => f.debug_tuple("File").field(p).finish(),
            RequestBody::Stream(_) => f.write_str("Stream"),
            RequestBody::Form(p) => f.debug_tuple("Form").field(p).finish(),
            RequestBody::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// The body as configured on a request: kind plus content type and charset.
#[derive(Debug, Clone, Default)]
pub struct BodyDescriptor {
    pub(crate) body: Option<RequestBody>,
    pub(crate) content_type: Option<String>,
    pub(crate) charset: Option<String>,
}

impl BodyDescriptor {
    pub fn kind(&self) -> Option<BodyKind> {
        self.body.as_ref().map(RequestBody::kind)
    }

    /// Known length, `-1` when unknown, `None` without a body. Files are
    /// measured on disk.
    pub fn content_length(&self) -> Option<i64> {
        Some(match self.body.as_ref()? {
            RequestBody::Bytes(b) => b.len() as i64,
            RequestBody::File(p) => std::fs::metadata(p).map(|m| m.len() as i64).unwrap_or(-1),
            RequestBody::Stream(_) => -1,
            RequestBody::Form(params) => encode_form(params).len() as i64,
            RequestBody::Custom(c) => c.content_length(),
        })
    }

    pub fn content_type(&self) -> Option<String> {
        match self.body.as_ref()? {
            RequestBody::Form(_) => Some(FORM_CONTENT_TYPE.to_string()),
            RequestBody::Custom(c) => self.content_type.clone().or_else(|| c.content_type()),
            _ => self.content_type.clone(),
        }
    }

    #[inline]
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// Materialise the body for one execution attempt. Blocking reads happen
    /// here, on the caller thread.
    pub(crate) fn prepare(&self) -> Result<Option<PreparedBody>> {
        let Some(body) = self.body.as_ref() else {
            return Ok(None);
        };
        let (chunks, content_length) = match body {
            RequestBody::Bytes(b) => (vec![b.clone()], b.len() as i64),
            RequestBody::File(path) => {
                let data = Bytes::from(std::fs::read(path)?);
                let len = data.len() as i64;
                (vec![data], len)
            }
            RequestBody::Stream(reader) => {
                let reader = reader.lock().take().ok_or_else(|| {
                    HttpError::Configuration("input stream body was already consumed".into())
                })?;
                (drain(reader)?, -1)
            }
            RequestBody::Form(params) => {
                let data = Bytes::from(encode_form(params));
                let len = data.len() as i64;
                (vec![data], len)
            }
            RequestBody::Custom(custom) => {
                let chunks = custom.chunks()?;
                let declared = custom.content_length();
                let actual: usize = chunks.iter().map(Bytes::len).sum();
                if declared >= 0 && declared as usize != actual {
                    return Err(HttpError::Configuration(format!(
                        "custom body declared {declared} bytes but produced {actual}"
                    )));
                }
                (chunks, declared)
            }
        };
        Ok(Some(PreparedBody {
            chunks,
            content_length,
            content_type: self.content_type(),
            charset: self.charset.clone(),
        }))
    }
}

fn drain(mut reader: Box<dyn Read + Send>) -> io::Result<Vec<Bytes>> {
    let mut chunks = Vec::new();
    loop {
        let mut buf = vec![0; STREAM_CHUNK];
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(chunks),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        buf.truncate(n);
        chunks.push(Bytes::from(buf));
    }
}

pub(crate) fn encode_form(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

/// A body ready to be written: chunks in order plus the framing decision.
#[derive(Debug, Clone)]
pub(crate) struct PreparedBody {
    pub(crate) chunks: Vec<Bytes>,
    /// Negative means unknown and selects chunked transfer coding.
    pub(crate) content_length: i64,
    pub(crate) content_type: Option<String>,
    pub(crate) charset: Option<String>,
}

impl PreparedBody {
    #[inline]
    pub(crate) fn is_chunked(&self) -> bool {
        self.content_length < 0
    }
}
