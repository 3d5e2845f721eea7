use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
};

use rustls::pki_types::ServerName;
use smol_str::SmolStr;

use crate::{
    error::{HttpError, Result},
    request::ServerInfo,
};

/// Pool key for a transport channel: host, port and, for secure targets,
/// the TLS server name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    pub host: SmolStr,
    pub port: u16,
    pub server_name: Option<ServerName<'static>>,
}

impl Key {
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.server_name.is_some()
    }
}

impl TryFrom<&ServerInfo> for Key {
    type Error = HttpError;

    fn try_from(server: &ServerInfo) -> Result<Self, Self::Error> {
        let server_name = if server.secure {
            let name = ServerName::try_from(server.host.as_str())
                .map_err(|e| HttpError::Tls(format!("invalid server name {}: {e}", server.host)))?
                .to_owned();
            Some(name)
        } else {
            None
        };
        Ok(Key {
            host: server.host.clone(),
            port: server.port,
            server_name,
        })
    }
}

impl ToSocketAddrs for Key {
    type Iter = std::vec::IntoIter<SocketAddr>;

    #[inline]
    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::resolve;

    #[test]
    fn secure_targets_carry_a_server_name() {
        let plain = resolve("http://example.test:8080/", &[]).unwrap();
        let key = Key::try_from(&plain.server).unwrap();
        assert!(!key.is_secure());
        assert_eq!(key.to_string(), "example.test:8080");

        let tls = resolve("https://example.test/", &[]).unwrap();
        let key = Key::try_from(&tls.server).unwrap();
        assert!(key.is_secure());
        assert_eq!(key.port, 443);
    }

    #[test]
    fn ip_literals_are_valid_server_names() {
        let tls = resolve("https://127.0.0.1:8443/", &[]).unwrap();
        let key = Key::try_from(&tls.server).unwrap();
        assert!(matches!(key.server_name, Some(ServerName::IpAddress(_))));
    }
}
