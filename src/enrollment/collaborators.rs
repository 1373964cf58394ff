use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use url::Url;

use crate::enrollment::types::{EnrollmentUpdate, FileIoStatus};

/// Upper bound for documents exchanged with the enrollment server
pub const MAX_DOCUMENT_SIZE: usize = 10 * 1024 * 1024;

/// An X.509 certificate as understood by the [EnrollmentCrypto] implementation
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate {
    pub der: Vec<u8>,
    /// friendly name inside a keystore
    pub alias: Option<String>,
}

/// Key and certificate handling. Keys travel as (encrypted) PEM strings, keystores as opaque
///  password protected blobs.
#[cfg_attr(test, automock)]
pub trait EnrollmentCrypto: Send + Sync {
    /// Returns the new private key as PEM, encrypted with `key_password`
    fn generate_key(&self, key_password: &str, key_length: u32) -> anyhow::Result<String>;

    /// Returns the CSR as PEM. `subject` holds the distinguished name entries in order.
    fn generate_csr(&self, subject: &[(String, String)], private_key_pem: &str, key_password: &str) -> anyhow::Result<String>;

    fn parse_cert(&self, pem: &str) -> anyhow::Result<Certificate>;

    /// Reads the certificates of a password protected CA bundle
    fn parse_ca_bundle(&self, data: &[u8], password: &str) -> anyhow::Result<Vec<Certificate>>;

    fn client_keystore(&self, cert: &Certificate, private_key_pem: &str, key_password: &str, ca_certs: &[Certificate], store_password: &str, friendly_name: &str) -> anyhow::Result<Vec<u8>>;

    fn ca_keystore(&self, ca_certs: &[Certificate], store_password: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UrlAuth {
    Basic { user: String, password: String },
    Bearer(String),
}

#[derive(Debug, Clone)]
pub struct UrlRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub auth: UrlAuth,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Server certificates are validated against these. `None` means the platform's trust store.
    pub trust: Option<Vec<Certificate>>,
    pub verify_host: bool,
    /// larger response documents are a transfer error
    pub max_size: usize,
}

/// Reported by a [UrlTransfer]. Any status other than [FileIoStatus::InProgress] completes the
///  transfer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransferOutcome {
    pub status: FileIoStatus,
    pub additional_info: Option<String>,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// the response body, present on success
    pub document: Vec<u8>,
}

impl TransferOutcome {
    pub fn success(document: Vec<u8>) -> TransferOutcome {
        let len = document.len() as u64;
        TransferOutcome {
            status: FileIoStatus::Success,
            additional_info: None,
            bytes_transferred: len,
            total_bytes: len,
            document,
        }
    }

    pub fn failure(status: FileIoStatus, info: &str) -> TransferOutcome {
        TransferOutcome {
            status,
            additional_info: Some(info.to_string()),
            bytes_transferred: 0,
            total_bytes: 0,
            document: vec![],
        }
    }
}

pub type TransferCallback = Arc<dyn Fn(TransferOutcome) + Send + Sync>;

/// Performs HTTPS transfers. The callback may be called any number of times with progress, and
///  exactly once with a final outcome. It may be called from any thread, including the calling
///  thread before `start` returns.
#[cfg_attr(test, automock)]
pub trait UrlTransfer: Send + Sync {
    fn start(&self, request: UrlRequest, on_update: TransferCallback);
}

#[cfg_attr(test, automock)]
pub trait EnrollmentObserver: Send + Sync {
    fn enrollment_update(&self, update: &EnrollmentUpdate);
}
