use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Opaque, stable identifier of a configured endpoint. Handles are never reused during the
///  lifetime of a streaming manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointHandle(pub(crate) u64);

impl Display for EndpointHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportKind {
    Tcp,
    Tls,
    Quic,
}
impl TransportKind {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "ssl",
            TransportKind::Quic => "quic",
        }
    }

    pub fn requires_client_cert(&self) -> bool {
        !matches!(self, TransportKind::Tcp)
    }
}

/// Unique key of an endpoint, e.g. `ssl:tak.example.com:8089`
pub fn endpoint_key(transport: TransportKind, host: &str, port: u16) -> String {
    format!("{}:{}:{}", transport.key_prefix(), host, port)
}

/// The identity of an endpoint as reported to listeners
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EndpointInfo {
    pub handle: EndpointHandle,
    pub key: Arc<str>,
}

/// Certificate material for TLS and QUIC endpoints: PEM, or password protected PKCS#12 keystores
#[derive(Clone, Default)]
pub struct EndpointCredentials {
    /// client certificate chain and private key
    pub client_cert: Option<Vec<u8>>,
    /// certificates the server's certificate chain is validated against
    pub ca_cert: Option<Vec<u8>>,
    pub cert_password: Option<String>,
    pub ca_cert_password: Option<String>,
}

#[derive(Clone)]
pub struct EndpointParams {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    /// CoT types that are sent to this endpoint by a broadcast honoring type filters
    pub type_filter: Vec<String>,
    pub credentials: EndpointCredentials,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EndpointParams {
    pub fn tcp(host: &str, port: u16) -> EndpointParams {
        EndpointParams {
            transport: TransportKind::Tcp,
            host: host.to_string(),
            port,
            type_filter: vec![],
            credentials: EndpointCredentials::default(),
            username: None,
            password: None,
        }
    }

    pub fn tls(host: &str, port: u16, client_cert: Vec<u8>, ca_cert: Vec<u8>) -> EndpointParams {
        EndpointParams {
            transport: TransportKind::Tls,
            credentials: EndpointCredentials {
                client_cert: Some(client_cert),
                ca_cert: Some(ca_cert),
                ..EndpointCredentials::default()
            },
            ..EndpointParams::tcp(host, port)
        }
    }

    pub fn quic(host: &str, port: u16, client_cert: Vec<u8>, ca_cert: Vec<u8>) -> EndpointParams {
        EndpointParams {
            transport: TransportKind::Quic,
            ..EndpointParams::tls(host, port, client_cert, ca_cert)
        }
    }

    pub fn with_type_filter(mut self, types: &[&str]) -> EndpointParams {
        self.type_filter = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_auth(mut self, username: &str, password: &str) -> EndpointParams {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn key(&self) -> String {
        endpoint_key(self.transport, &self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::tcp(TransportKind::Tcp, "tcp:host:8087")]
    #[case::tls(TransportKind::Tls, "ssl:host:8087")]
    #[case::quic(TransportKind::Quic, "quic:host:8087")]
    fn test_endpoint_key(#[case] transport: TransportKind, #[case] expected: &str) {
        assert_eq!(endpoint_key(transport, "host", 8087), expected);
    }

    #[test]
    fn test_params() {
        let params = EndpointParams::quic("srv", 8090, b"cert".to_vec(), b"ca".to_vec())
            .with_auth("joe", "pw")
            .with_type_filter(&["a-f-G"]);
        assert_eq!(params.key(), "quic:srv:8090");
        assert_eq!(params.credentials.client_cert.as_deref(), Some(&b"cert"[..]));
        assert_eq!(params.type_filter, vec!["a-f-G".to_string()]);
        assert!(params.transport.requires_client_cert());
    }
}
