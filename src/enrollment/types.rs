use std::fmt::{Display, Formatter};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EnrollmentId(pub u32);

impl Display for EnrollmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "enrollment #{}", self.0)
    }
}

/// Steps are passed strictly in this order
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EnrollmentStep {
    KeyGen,
    Csr,
    Sign,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FileIoStatus {
    InProgress,
    Success,
    HostResolutionFail,
    ConnectFail,
    UrlInvalid,
    UrlUnsupported,
    UrlNoResource,
    AuthError,
    AccessDenied,
    SslUntrustedServer,
    SslOtherError,
    TransferTimeout,
    OtherError,
}

impl FileIoStatus {
    pub fn from_http_status(status: u16) -> FileIoStatus {
        match status {
            200 => FileIoStatus::Success,
            401 => FileIoStatus::AuthError,
            403 => FileIoStatus::AccessDenied,
            404 | 410 => FileIoStatus::UrlNoResource,
            _ => FileIoStatus::OtherError,
        }
    }
}

/// Progress of one enrollment, reported to the [crate::enrollment::collaborators::EnrollmentObserver]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EnrollmentUpdate {
    pub id: EnrollmentId,
    pub step: EnrollmentStep,
    pub status: FileIoStatus,
    pub additional_info: Option<String>,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// KEYGEN: the private key PEM. SIGN: the client keystore.
    pub private_result: Option<Vec<u8>>,
    /// SIGN: the keystore with the returned CA certificates, if there were any
    pub ca_result: Option<Vec<u8>>,
}

impl EnrollmentUpdate {
    pub fn new(id: EnrollmentId, step: EnrollmentStep, status: FileIoStatus) -> EnrollmentUpdate {
        EnrollmentUpdate {
            id,
            step,
            status,
            additional_info: None,
            bytes_transferred: 0,
            total_bytes: 0,
            private_result: None,
            ca_result: None,
        }
    }

    /// No further updates follow a terminal update for the same enrollment
    pub fn is_terminal(&self) -> bool {
        match self.status {
            FileIoStatus::InProgress => false,
            FileIoStatus::Success => self.step == EnrollmentStep::Sign,
            _ => true,
        }
    }
}

pub struct EnrollmentParams {
    pub host: String,
    pub port: u16,
    /// check the server's host name against its certificate
    pub verify_host: bool,
    pub user: String,
    /// the password for basic auth, or the token for token auth
    pub password: String,
    pub use_token_auth: bool,
    /// trust store for the server connection
    pub ca_cert: Option<Vec<u8>>,
    pub ca_cert_password: Option<String>,
    /// protects the resulting client keystore
    pub client_cert_password: String,
    /// protects the resulting CA keystore
    pub enrolled_trust_password: String,
    pub key_password: String,
    pub key_length: u32,
    pub client_version: Option<String>,
}

impl EnrollmentParams {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> EnrollmentParams {
        EnrollmentParams {
            host: host.to_string(),
            port,
            verify_host: true,
            user: user.to_string(),
            password: password.to_string(),
            use_token_auth: false,
            ca_cert: None,
            ca_cert_password: None,
            client_cert_password: String::new(),
            enrolled_trust_password: String::new(),
            key_password: String::new(),
            key_length: 2048,
            client_version: None,
        }
    }
}
