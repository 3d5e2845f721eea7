use std::fmt;

use smol_str::SmolStr;
use url::{Host, Url};

use crate::error::{HttpError, Result};

/// Destination of one execution attempt, derived from the resolved URI.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerInfo {
    pub host: SmolStr,
    pub port: u16,
    pub secure: bool,
}

impl ServerInfo {
    /// Value for the `Host` header. Ports 80 and 443 are never written.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.to_string()
        };
        match self.port {
            80 | 443 => host,
            port => format!("{host}:{port}"),
        }
    }

    #[inline]
    pub(crate) fn same_authority(&self, other: &ServerInfo) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.secure == other.secure
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Output of the resolver: where to connect and what to put on the request line.
#[derive(Clone, Debug)]
pub struct ResolvedTarget {
    pub server: ServerInfo,
    /// Path plus query, never empty.
    pub path: String,
    pub(crate) url: Url,
}

impl ResolvedTarget {
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Parse `uri`, append `query` after any query already present and split the
/// result into a [`ServerInfo`] and a relative path.
pub fn resolve(uri: &str, query: &[(String, String)]) -> Result<ResolvedTarget> {
    let mut url = Url::parse(uri).map_err(|e| HttpError::uri(uri, e))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in query {
            pairs.append_pair(name, value);
        }
    }
    from_url(url)
}

/// Resolve a `Location` header, absolute or relative, against the current target.
pub fn resolve_location(current: &ResolvedTarget, location: &str) -> Result<ResolvedTarget> {
    let url = current
        .url
        .join(location)
        .map_err(|e| HttpError::uri(location, e))?;
    from_url(url)
}

fn from_url(mut url: Url) -> Result<ResolvedTarget> {
    let secure = match url.scheme() {
        "http" | "ws" => false,
        "https" | "wss" => true,
        other => {
            return Err(HttpError::uri(
                url.as_str(),
                format!("unsupported scheme {other}"),
            ))
        }
    };
    let host: SmolStr = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.into(),
        Some(Host::Ipv4(addr)) => addr.to_string().into(),
        Some(Host::Ipv6(addr)) => addr.to_string().into(),
        _ => return Err(HttpError::uri(url.as_str(), "missing host")),
    };
    let port = url
        .port_or_known_default()
        .unwrap_or(if secure { 443 } else { 80 });
    url.set_fragment(None);

    let mut path = url.path().to_owned();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }

    Ok(ResolvedTarget {
        server: ServerInfo { host, port, secure },
        path,
        url,
    })
}
