use std::io;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use mio::net::TcpStream;
use p12_keystore::{KeyStore, KeyStoreEntry};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, trace, warn};

use crate::error::{CommoError, NetErrorCode, TransportError};
use crate::stream::endpoint::EndpointCredentials;
use crate::stream::selector::{NetSelector, SocketId};
use crate::stream::transport::tcp::TcpTransport;
use crate::stream::transport::{FirstTraffic, TransportOps};

/// Upper bound for plaintext buffered inside a TLS session before writes report 'would block'
const TLS_SEND_BUFFER_LIMIT: usize = 64 * 1024;

/// TLS settings shared by all endpoints of a streaming manager: the crypto provider and the
///  protocol versions it offers. Per-endpoint material (client certificate, trust store) is
///  combined with this into a [ClientConfig] when the endpoint is added.
pub struct TlsContext {
    provider: Arc<CryptoProvider>,
}

impl TlsContext {
    pub fn new() -> TlsContext {
        TlsContext {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn client_config(&self, credentials: &EndpointCredentials, alpn: Option<&[u8]>) -> Result<Arc<ClientConfig>, CommoError> {
        let mut roots = RootCertStore::empty();
        if let Some(ca_cert) = &credentials.ca_cert {
            for cert in load_trusted_certs(ca_cert, credentials.ca_cert_password.as_deref())? {
                roots.add(cert).map_err(|e| {
                    debug!("unusable CA certificate: {}", e);
                    CommoError::InvalidCaCert
                })?;
            }
        }

        let client_cert = credentials.client_cert.as_deref()
            .ok_or(CommoError::InvalidCert)?;
        let (chain, key) = load_client_identity(client_cert, credentials.cert_password.as_deref())?;

        let verifier = Arc::new(TrustChainVerifier::new(roots, self.provider.clone()));

        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| {
                warn!("TLS provider does not support the default protocol versions: {}", e);
                CommoError::IllegalArgument
            })?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(chain, key)
            .map_err(|e| {
                debug!("client certificate does not match its private key: {}", e);
                CommoError::InvalidCert
            })?;

        if let Some(alpn) = alpn {
            config.alpn_protocols = vec![alpn.to_vec()];
        }
        Ok(Arc::new(config))
    }
}

impl Default for TlsContext {
    fn default() -> TlsContext {
        TlsContext::new()
    }
}

/// Validates the server's certificate chain against the configured trust store. The host name is
///  not checked.
#[derive(Debug)]
struct TrustChainVerifier {
    /// `None` if there are no trusted certificates, in which case no chain validates
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl TrustChainVerifier {
    fn new(roots: RootCertStore, provider: Arc<CryptoProvider>) -> TrustChainVerifier {
        let inner = if roots.is_empty() {
            None
        }
        else {
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| warn!("failed to set up certificate verification: {}", e))
                .ok()
        };

        TrustChainVerifier {
            inner,
            provider,
        }
    }
}

impl ServerCertVerifier for TrustChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(inner) = &self.inner else {
            return Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer));
        };

        match inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) |
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext { .. })) => {
                trace!("ignoring name mismatch for {:?}", server_name);
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn is_pem(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN")
}

/// Checks that `data` is a single DER SEQUENCE. A keystore that has this shape but does not open
///  was most likely given the wrong password.
fn is_der_sequence(data: &[u8]) -> bool {
    let (Some(&0x30), Some(&len_byte)) = (data.first(), data.get(1)) else {
        return false;
    };
    if len_byte < 0x80 {
        return data.len() == 2 + len_byte as usize;
    }

    let num_len_bytes = (len_byte & 0x7f) as usize;
    if num_len_bytes == 0 || num_len_bytes > 4 || data.len() < 2 + num_len_bytes {
        return false;
    }
    let len = data[2..2 + num_len_bytes].iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    data.len() == 2 + num_len_bytes + len
}

fn open_keystore(data: &[u8], password: Option<&str>, bad_password: CommoError, malformed: CommoError) -> Result<KeyStore, CommoError> {
    KeyStore::from_pkcs12(data, password.unwrap_or_default())
        .map_err(|e| {
            debug!("cannot open PKCS#12 keystore: {}", e);
            if is_der_sequence(data) { bad_password } else { malformed }
        })
}

/// Reads the client certificate chain and private key, either from PEM or from a password
///  protected PKCS#12 keystore
fn load_client_identity(data: &[u8], password: Option<&str>) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CommoError> {
    if is_pem(data) {
        let chain = CertificateDer::pem_slice_iter(data)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                debug!("unparseable client certificate: {}", e);
                CommoError::InvalidCert
            })?;
        if chain.is_empty() {
            return Err(CommoError::InvalidCert);
        }
        // NB: encrypted PEM keys are not supported, a password only changes the error code
        let key = PrivateKeyDer::from_pem_slice(data)
            .map_err(|e| {
                debug!("no usable private key with the client certificate: {}", e);
                if password.is_some() { CommoError::InvalidCertPassword } else { CommoError::InvalidCert }
            })?;
        return Ok((chain, key));
    }

    let keystore = open_keystore(data, password, CommoError::InvalidCertPassword, CommoError::InvalidCert)?;
    let Some((alias, key_chain)) = keystore.private_key_chain() else {
        debug!("client keystore contains no private key");
        return Err(CommoError::InvalidCert);
    };
    trace!("using client certificate '{}'", alias);

    let chain = key_chain.chain().iter()
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect::<Vec<_>>();
    if chain.is_empty() {
        return Err(CommoError::InvalidCert);
    }
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_chain.key().to_vec()));
    Ok((chain, key))
}

/// Reads the trusted CA certificates, either from PEM or from a password protected PKCS#12 store
fn load_trusted_certs(data: &[u8], password: Option<&str>) -> Result<Vec<CertificateDer<'static>>, CommoError> {
    if is_pem(data) {
        return CertificateDer::pem_slice_iter(data)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                debug!("unparseable CA certificate: {}", e);
                CommoError::InvalidCaCert
            });
    }

    let keystore = open_keystore(data, password, CommoError::InvalidCaCertPassword, CommoError::InvalidCaCert)?;
    let mut result = Vec::new();
    for (_, entry) in keystore.entries() {
        match entry {
            KeyStoreEntry::Certificate(cert) => result.push(CertificateDer::from(cert.as_der().to_vec())),
            KeyStoreEntry::PrivateKeyChain(chain) => {
                result.extend(chain.chain().iter().map(|cert| CertificateDer::from(cert.as_der().to_vec())));
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }
    if result.is_empty() {
        debug!("CA keystore contains no certificates");
        return Err(CommoError::InvalidCaCert);
    }
    Ok(result)
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, CommoError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| CommoError::IllegalArgument)
}

/// Maps a TLS failure during the handshake to its error category
fn handshake_error(e: rustls::Error) -> TransportError {
    let code = match &e {
        rustls::Error::InvalidCertificate(_) => NetErrorCode::SslPeerCertNotTrusted,
        rustls::Error::NoCertificatesPresented => NetErrorCode::SslNoPeerCert,
        _ => NetErrorCode::SslHandshake,
    };
    TransportError::new(code, format!("TLS handshake failed: {}", e))
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HandshakeWant {
    None,
    Read,
    Write,
}

/// TLS on top of a [TcpTransport]. The TLS session is created once the TCP connection is
///  established, and the handshake is pumped by [TransportOps::connection_do_post].
pub struct TlsTransport {
    tcp: TcpTransport,
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    conn: Option<ClientConnection>,
    want: HandshakeWant,
    /// the last read may have left decrypted data in the session
    plaintext_pending: bool,
}

impl TlsTransport {
    pub fn new(config: Arc<ClientConfig>, host: &str) -> Result<TlsTransport, CommoError> {
        Ok(TlsTransport {
            tcp: TcpTransport::new(),
            config,
            server_name: server_name(host)?,
            conn: None,
            want: HandshakeWant::None,
            plaintext_pending: false,
        })
    }

    fn set_want(&mut self, want: HandshakeWant, rebuild: &mut bool) {
        if self.want != want {
            self.want = want;
            *rebuild = true;
        }
    }

    fn session(&mut self) -> Result<(&mut ClientConnection, &mut TcpStream), TransportError> {
        let conn = self.conn.as_mut()
            .ok_or_else(|| TransportError::new(NetErrorCode::Internal, "no TLS session"))?;
        Ok((conn, self.tcp.stream_mut()?))
    }

    /// Writes buffered TLS records to the socket until they are all sent or the socket would block
    fn flush_tls(conn: &mut ClientConnection, stream: &mut TcpStream) -> Result<(), TransportError> {
        while conn.wants_write() {
            match conn.write_tls(stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::io(e)),
            }
        }
        Ok(())
    }
}

impl TransportOps for TlsTransport {
    fn socket(&self) -> Option<SocketId> {
        self.tcp.socket()
    }

    fn connection_init_socket(&mut self, remote: SocketAddr) -> Result<bool, TransportError> {
        self.tcp.connection_init_socket(remote)
    }

    fn connection_in_progress(&self) -> bool {
        self.tcp.connection_in_progress()
    }

    fn connection_check_connected(&mut self) -> Result<bool, TransportError> {
        self.tcp.connection_check_connected()
    }

    fn connection_do_post(&mut self, rebuild: &mut bool) -> Result<bool, TransportError> {
        if self.conn.is_none() {
            let mut conn = ClientConnection::new(self.config.clone(), self.server_name.clone())
                .map_err(|e| TransportError::new(NetErrorCode::SslHandshake, format!("creating TLS session failed: {}", e)))?;
            conn.set_buffer_limit(Some(TLS_SEND_BUFFER_LIMIT));
            self.conn = Some(conn);
        }

        let want = {
            let (conn, stream) = self.session()?;
            loop {
                if conn.wants_write() {
                    match conn.write_tls(stream) {
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Some(HandshakeWant::Write),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(TransportError::new(NetErrorCode::SslHandshake, format!("TLS handshake failed: {}", e))),
                    }
                }

                if !conn.is_handshaking() {
                    break None;
                }

                match conn.read_tls(stream) {
                    Ok(0) => return Err(TransportError::new(NetErrorCode::SslHandshake, "connection closed during TLS handshake")),
                    Ok(_) => {
                        if let Err(e) = conn.process_new_packets() {
                            // send the alert if possible
                            let _ = conn.write_tls(stream);
                            return Err(handshake_error(e));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Some(HandshakeWant::Read),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(TransportError::new(NetErrorCode::SslHandshake, format!("TLS handshake failed: {}", e))),
                }
            }
        };

        match want {
            Some(want) => {
                self.set_want(want, rebuild);
                Ok(false)
            }
            None => {
                let (conn, _) = self.session()?;
                if conn.peer_certificates().map(|c| c.is_empty()).unwrap_or(true) {
                    return Err(TransportError::new(NetErrorCode::SslNoPeerCert, "server presented no certificate"));
                }
                debug!("TLS handshake complete, protocol {:?}", conn.protocol_version());
                self.set_want(HandshakeWant::None, rebuild);
                Ok(true)
            }
        }
    }

    fn connection_post_wants_read(&self) -> bool {
        self.want == HandshakeWant::Read
    }

    fn connection_post_wants_write(&self) -> bool {
        self.want == HandshakeWant::Write
    }

    fn first_traffic(&self) -> FirstTraffic {
        FirstTraffic::Auth
    }

    fn io_wants_write(&self, tx_pending: bool) -> bool {
        tx_pending || self.conn.as_ref().map(|c| c.wants_write()).unwrap_or(false)
    }

    fn io_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (conn, stream) = self.session()?;
        let result = loop {
            match conn.reader().read(buf) {
                Ok(0) => return Err(TransportError::new(NetErrorCode::Io, "TLS session closed by peer")),
                Ok(n) => break Ok((n, true)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(TransportError::io(e)),
            }

            match conn.read_tls(stream) {
                Ok(0) => return Err(TransportError::new(NetErrorCode::Io, "connection closed by peer")),
                Ok(_) => {
                    conn.process_new_packets()
                        .map_err(|e| TransportError::new(NetErrorCode::Io, format!("TLS error: {}", e)))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok((0, false)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::io(e)),
            }
        };

        result.map(|(n, pending)| {
            self.plaintext_pending = pending;
            n
        })
    }

    fn io_read_ready(&self, selector: &dyn NetSelector) -> bool {
        self.plaintext_pending || self.tcp.io_read_ready(selector)
    }

    fn io_write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let (conn, stream) = self.session()?;
        let n = conn.writer().write(buf)
            .map_err(TransportError::io)?;
        Self::flush_tls(conn, stream)?;
        Ok(n)
    }

    fn io_write_ready(&self, selector: &dyn NetSelector) -> bool {
        self.tcp.io_write_ready(selector)
    }

    fn io_write_flush(&mut self) -> Result<(), TransportError> {
        let (conn, stream) = self.session()?;
        Self::flush_tls(conn, stream)
    }

    fn reset(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.send_close_notify();
            if let Ok(stream) = self.tcp.stream_mut() {
                let _ = conn.write_tls(stream);
            }
        }
        self.tcp.reset();
        self.want = HandshakeWant::None;
        self.plaintext_pending = false;
    }
}
