use anyhow::{anyhow, bail};
use tracing::{debug, error};
use url::Url;

use crate::enrollment::collaborators::{Certificate, EnrollmentCrypto, HttpMethod, TransferOutcome, UrlAuth, UrlRequest, MAX_DOCUMENT_SIZE};
use crate::enrollment::types::{EnrollmentId, EnrollmentParams, EnrollmentStep, EnrollmentUpdate, FileIoStatus};

const PEM_CERT_HEADER: &str = "-----BEGIN CERTIFICATE-----\n";
const PEM_CERT_FOOTER: &str = "-----END CERTIFICATE-----\n";
const PEM_CSR_HEADER: &str = "-----BEGIN CERTIFICATE REQUEST-----\n";
const PEM_CSR_FOOTER: &str = "-----END CERTIFICATE REQUEST-----\n";

pub const CLIENT_KEYSTORE_NAME: &str = "TAK Client Cert";
const CA_ALIAS_PREFIX: &str = "enrollCaResult";

/// One enrollment, advancing KEYGEN -> CSR -> SIGN. `completed` is set once, by SIGN success
///  or by the first failure.
pub struct EnrollmentRequest {
    pub id: EnrollmentId,
    pub step: EnrollmentStep,
    pub completed: bool,
    params: EnrollmentParams,
    my_uid: String,
    trust: Option<Vec<Certificate>>,
    private_key_pem: String,
    /// base64 body of the CSR, without the PEM banner lines
    csr: String,
}

impl EnrollmentRequest {
    pub fn new(id: EnrollmentId, params: EnrollmentParams, my_uid: &str, trust: Option<Vec<Certificate>>) -> EnrollmentRequest {
        EnrollmentRequest {
            id,
            step: EnrollmentStep::KeyGen,
            completed: false,
            params,
            my_uid: my_uid.to_string(),
            trust,
            private_key_pem: String::new(),
            csr: String::new(),
        }
    }

    fn status_string(&self) -> &'static str {
        if self.completed {
            return "complete";
        }
        match self.step {
            EnrollmentStep::KeyGen => "keygen",
            EnrollmentStep::Csr => "csrconfig",
            EnrollmentStep::Sign => "signv2",
        }
    }

    /// Runs the KEYGEN step
    pub fn generate_key(&mut self, crypto: &dyn EnrollmentCrypto) -> EnrollmentUpdate {
        debug!("{}: generating key, length {}", self.id, self.params.key_length);
        let mut update = EnrollmentUpdate::new(self.id, EnrollmentStep::KeyGen, FileIoStatus::Success);

        match crypto.generate_key(&self.params.key_password, self.params.key_length) {
            Ok(pem) => {
                update.private_result = Some(pem.as_bytes().to_vec());
                self.private_key_pem = pem;
                self.step = EnrollmentStep::Csr;
            }
            Err(e) => {
                error!("{}: key generation failed: {}", self.id, e);
                update.status = FileIoStatus::OtherError;
                update.additional_info = Some("key generation failed".to_string());
                self.completed = true;
            }
        }
        debug!("{}: state is now {}", self.id, self.status_string());
        update
    }

    /// The server request for the current step
    pub fn url_request(&self) -> anyhow::Result<UrlRequest> {
        let mut url = self.base_url()?;
        let mut headers = Vec::new();
        let mut body = Vec::new();

        let method = match self.step {
            EnrollmentStep::KeyGen => bail!("key generation has no server request"),
            EnrollmentStep::Csr => {
                url.set_path("/Marti/api/tls/config");
                HttpMethod::Get
            }
            EnrollmentStep::Sign => {
                url.set_path("/Marti/api/tls/signClient/v2");
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("clientUid", &self.my_uid);
                    if let Some(version) = self.params.client_version.as_deref().filter(|v| !v.is_empty()) {
                        query.append_pair("version", version);
                    }
                }
                headers.push(("Accept".to_string(), "application/xml".to_string()));
                headers.push(("Content-Type".to_string(), "application/octet-stream".to_string()));
                body = self.csr.as_bytes().to_vec();
                HttpMethod::Post
            }
        };

        let auth = if self.params.use_token_auth {
            UrlAuth::Bearer(self.params.password.clone())
        }
        else {
            UrlAuth::Basic {
                user: self.params.user.clone(),
                password: self.params.password.clone(),
            }
        };

        Ok(UrlRequest {
            method,
            url,
            auth,
            headers,
            body,
            trust: self.trust.clone(),
            verify_host: self.params.verify_host,
            max_size: MAX_DOCUMENT_SIZE,
        })
    }

    fn base_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse("https://localhost/")?;
        let host = &self.params.host;
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        }
        else {
            host.clone()
        };
        url.set_host(Some(&host))?;
        url.set_port(Some(self.params.port))
            .map_err(|_| anyhow!("invalid port {}", self.params.port))?;
        Ok(url)
    }

    /// Advances the CSR or SIGN step with the final outcome of its transfer
    pub fn on_transfer_complete(&mut self, crypto: &dyn EnrollmentCrypto, outcome: TransferOutcome) -> EnrollmentUpdate {
        let step = self.step;
        let mut update = EnrollmentUpdate {
            bytes_transferred: outcome.bytes_transferred,
            total_bytes: outcome.total_bytes,
            ..EnrollmentUpdate::new(self.id, step, outcome.status)
        };

        if outcome.status != FileIoStatus::Success {
            error!("{}: {} transfer failed: {:?} ({})", self.id, self.status_string(), outcome.status, outcome.additional_info.as_deref().unwrap_or(""));
            update.additional_info = outcome.additional_info;
            self.completed = true;
            return update;
        }

        let result = match step {
            EnrollmentStep::KeyGen => Err(anyhow!("no transfer in the key generation step")),
            EnrollmentStep::Csr => self.process_csr_config(crypto, &outcome.document)
                .map(|_| self.step = EnrollmentStep::Sign),
            EnrollmentStep::Sign => self.process_signing_response(crypto, &outcome.document)
                .map(|(client, ca)| {
                    update.private_result = Some(client);
                    update.ca_result = ca;
                    self.completed = true;
                }),
        };

        if let Err(e) = result {
            error!("{}: processing the {} response failed: {}", self.id, self.status_string(), e);
            update.status = FileIoStatus::OtherError;
            update.additional_info = Some(e.to_string());
            self.completed = true;
        }
        debug!("{}: state is now {}", self.id, self.status_string());
        update
    }

    fn process_csr_config(&mut self, crypto: &dyn EnrollmentCrypto, document: &[u8]) -> anyhow::Result<()> {
        let subject = parse_csr_config(document, &self.params.user)?;
        let csr = crypto.generate_csr(&subject, &self.private_key_pem, &self.params.key_password)
            .map_err(|e| anyhow!("CSR generation failed using provided parameters: {}", e))?;
        self.csr = strip_csr_banner(&csr);
        Ok(())
    }

    /// Returns the client keystore and, if the server returned CA certificates, the CA keystore
    fn process_signing_response(&self, crypto: &dyn EnrollmentCrypto, document: &[u8]) -> anyhow::Result<(Vec<u8>, Option<Vec<u8>>)> {
        let mut client_cert = None;
        let mut ca_certs = Vec::new();

        for (name, pem) in parse_signing_response(document)? {
            let mut cert = crypto.parse_cert(&normalize_pem(&pem))
                .map_err(|e| anyhow!("invalid certificate returned by server: {}", e))?;
            if name == "signedCert" {
                if client_cert.is_some() {
                    bail!("multiple signed certificates returned by server");
                }
                client_cert = Some(cert);
            }
            else {
                cert.alias = Some(format!("{}{}", CA_ALIAS_PREFIX, ca_certs.len() + 1));
                ca_certs.push(cert);
            }
        }
        let client_cert = client_cert
            .ok_or_else(|| anyhow!("no signed certificate returned by server"))?;

        let client = crypto.client_keystore(&client_cert, &self.private_key_pem, &self.params.key_password, &ca_certs, &self.params.client_cert_password, CLIENT_KEYSTORE_NAME)
            .map_err(|e| anyhow!("client keystore generation failed: {}", e))?;
        let ca = if ca_certs.is_empty() {
            None
        }
        else {
            Some(crypto.ca_keystore(&ca_certs, &self.params.enrolled_trust_password)
                .map_err(|e| anyhow!("CA keystore generation failed: {}", e))?)
        };
        Ok((client, ca))
    }
}

/// Extracts the CSR subject from the server's certificate configuration, starting with the
///  user name as the common name
fn parse_csr_config(document: &[u8], user: &str) -> anyhow::Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(document)?;
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| anyhow!("invalid xml document: {}", e))?;

    let root = doc.root_element();
    if !root.has_tag_name("certificateConfig") {
        bail!("invalid root node for xml response");
    }
    let entries = root.children()
        .find(|n| n.has_tag_name("nameEntries"))
        .ok_or_else(|| anyhow!("invalid xml response structure - missing nameEntries"))?;

    let mut subject = vec![("CN".to_string(), user.to_string())];
    for entry in entries.children().filter(|n| n.has_tag_name("nameEntry")) {
        if let (Some(name), Some(value)) = (entry.attribute("name"), entry.attribute("value")) {
            subject.push((name.to_string(), value.to_string()));
        }
    }
    Ok(subject)
}

/// Returns (element name, PEM text) for every certificate in the signing response
fn parse_signing_response(document: &[u8]) -> anyhow::Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(document)?;
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| anyhow!("invalid xml document: {}", e))?;

    let root = doc.root_element();
    if !root.has_tag_name("enrollment") {
        bail!("invalid root node for signing xml response");
    }

    Ok(root.children()
        .filter(|n| n.is_element())
        .map(|n| {
            let pem = n.descendants()
                .filter(|d| d.is_text())
                .filter_map(|d| d.text())
                .collect::<String>();
            (n.tag_name().name().to_string(), pem)
        })
        .collect())
}

/// The server may omit the PEM header and footer and the final newline
pub fn normalize_pem(pem: &str) -> String {
    let mut result = String::with_capacity(pem.len() + PEM_CERT_HEADER.len() + PEM_CERT_FOOTER.len() + 1);
    if !pem.starts_with(PEM_CERT_HEADER) {
        result.push_str(PEM_CERT_HEADER);
    }
    result.push_str(pem);
    if !result.ends_with('\n') {
        result.push('\n');
    }
    if !result.ends_with(PEM_CERT_FOOTER) {
        result.push_str(PEM_CERT_FOOTER);
    }
    result
}

/// The signing endpoint expects the bare base64 body
pub fn strip_csr_banner(csr: &str) -> String {
    csr.replacen(PEM_CSR_HEADER, "", 1)
        .replacen(PEM_CSR_FOOTER, "", 1)
}

#[cfg(test)]
mod tests {
    use mockall::predicate::{always, eq, function};
    use rstest::rstest;
    use crate::enrollment::collaborators::MockEnrollmentCrypto;
    use super::*;

    const CSR_CONFIG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<certificateConfig validityDays="30">
    <nameEntries>
        <nameEntry name="O" value="TAK"/>
        <nameEntry name="OU" value="Test"/>
    </nameEntries>
</certificateConfig>"#;

    fn request(step: EnrollmentStep) -> EnrollmentRequest {
        let mut params = EnrollmentParams::new("tak.example.com", 8446, "alice", "secret");
        params.key_password = "keypass".to_string();
        params.client_cert_password = "clientpass".to_string();
        params.enrolled_trust_password = "trustpass".to_string();
        let mut request = EnrollmentRequest::new(EnrollmentId(3), params, "ANDROID-1234", None);
        request.step = step;
        request.private_key_pem = "KEY".to_string();
        request.csr = "MIIB\n".to_string();
        request
    }

    fn cert(pem: &str) -> Certificate {
        Certificate { der: pem.as_bytes().to_vec(), alias: None }
    }

    #[rstest]
    #[case::bare("MIIC", "-----BEGIN CERTIFICATE-----\nMIIC\n-----END CERTIFICATE-----\n")]
    #[case::trailing_newline("MIIC\n", "-----BEGIN CERTIFICATE-----\nMIIC\n-----END CERTIFICATE-----\n")]
    #[case::complete("-----BEGIN CERTIFICATE-----\nMIIC\n-----END CERTIFICATE-----\n", "-----BEGIN CERTIFICATE-----\nMIIC\n-----END CERTIFICATE-----\n")]
    #[case::no_final_newline("-----BEGIN CERTIFICATE-----\nMIIC\n-----END CERTIFICATE-----", "-----BEGIN CERTIFICATE-----\nMIIC\n-----END CERTIFICATE-----\n")]
    fn test_normalize_pem(#[case] pem: &str, #[case] expected: &str) {
        assert_eq!(normalize_pem(pem), expected);
    }

    #[test]
    fn test_strip_csr_banner() {
        assert_eq!(strip_csr_banner("-----BEGIN CERTIFICATE REQUEST-----\nMIIB\nabc\n-----END CERTIFICATE REQUEST-----\n"), "MIIB\nabc\n");
        assert_eq!(strip_csr_banner("MIIB\n"), "MIIB\n");
    }

    #[test]
    fn test_csr_url() {
        let request = request(EnrollmentStep::Csr).url_request().unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url.as_str(), "https://tak.example.com:8446/Marti/api/tls/config");
        assert_eq!(request.auth, UrlAuth::Basic { user: "alice".to_string(), password: "secret".to_string() });
        assert!(request.headers.is_empty());
        assert_eq!(request.max_size, MAX_DOCUMENT_SIZE);
    }

    #[rstest]
    #[case::without_version(None, "https://tak.example.com:8446/Marti/api/tls/signClient/v2?clientUid=ANDROID-1234")]
    #[case::empty_version(Some(""), "https://tak.example.com:8446/Marti/api/tls/signClient/v2?clientUid=ANDROID-1234")]
    #[case::with_version(Some("ATAK 5.1 (abc)"), "https://tak.example.com:8446/Marti/api/tls/signClient/v2?clientUid=ANDROID-1234&version=ATAK+5.1+%28abc%29")]
    fn test_sign_url(#[case] version: Option<&str>, #[case] expected: &str) {
        let mut request = request(EnrollmentStep::Sign);
        request.params.client_version = version.map(|v| v.to_string());
        request.params.use_token_auth = true;

        let request = request.url_request().unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url.as_str(), expected);
        assert_eq!(request.auth, UrlAuth::Bearer("secret".to_string()));
        assert_eq!(request.body, b"MIIB\n");
        assert!(request.headers.contains(&("Accept".to_string(), "application/xml".to_string())));
        assert!(request.headers.contains(&("Content-Type".to_string(), "application/octet-stream".to_string())));
    }

    #[test]
    fn test_ipv6_url() {
        let mut request = request(EnrollmentStep::Csr);
        request.params.host = "::1".to_string();
        assert_eq!(request.url_request().unwrap().url.as_str(), "https://[::1]:8446/Marti/api/tls/config");
    }

    #[test]
    fn test_keygen_has_no_url() {
        assert!(request(EnrollmentStep::KeyGen).url_request().is_err());
    }

    #[test]
    fn test_keygen_failure() {
        let mut crypto = MockEnrollmentCrypto::new();
        crypto.expect_generate_key()
            .returning(|_, _| Err(anyhow!("no entropy")));

        let mut request = request(EnrollmentStep::KeyGen);
        let update = request.generate_key(&crypto);
        assert_eq!(update.status, FileIoStatus::OtherError);
        assert!(update.private_result.is_none());
        assert!(request.completed);
        assert_eq!(request.step, EnrollmentStep::KeyGen);
    }

    #[test]
    fn test_csr_config() {
        let mut crypto = MockEnrollmentCrypto::new();
        crypto.expect_generate_csr()
            .with(function(|subject: &[(String, String)]| subject == [
                ("CN".to_string(), "alice".to_string()),
                ("O".to_string(), "TAK".to_string()),
                ("OU".to_string(), "Test".to_string()),
            ]), eq("KEY"), eq("keypass"))
            .times(1)
            .returning(|_, _, _| Ok(format!("{}MIIB\n{}", PEM_CSR_HEADER, PEM_CSR_FOOTER)));

        let mut request = request(EnrollmentStep::Csr);
        request.csr.clear();
        let update = request.on_transfer_complete(&crypto, TransferOutcome::success(CSR_CONFIG.as_bytes().to_vec()));
        assert_eq!(update.status, FileIoStatus::Success);
        assert_eq!(update.step, EnrollmentStep::Csr);
        assert_eq!(update.total_bytes, CSR_CONFIG.len() as u64);
        assert!(!request.completed);
        assert_eq!(request.step, EnrollmentStep::Sign);
        assert_eq!(request.csr, "MIIB\n");
    }

    #[rstest]
    #[case::not_xml("this is not xml")]
    #[case::wrong_root("<enrollment><nameEntries/></enrollment>")]
    #[case::missing_name_entries("<certificateConfig><other/></certificateConfig>")]
    fn test_csr_config_invalid(#[case] document: &str) {
        let crypto = MockEnrollmentCrypto::new();
        let mut request = request(EnrollmentStep::Csr);
        let update = request.on_transfer_complete(&crypto, TransferOutcome::success(document.as_bytes().to_vec()));
        assert_eq!(update.status, FileIoStatus::OtherError);
        assert!(update.additional_info.is_some());
        assert!(request.completed);
    }

    #[test]
    fn test_transfer_failure_passes_status_through() {
        let crypto = MockEnrollmentCrypto::new();
        let mut request = request(EnrollmentStep::Csr);
        let update = request.on_transfer_complete(&crypto, TransferOutcome::failure(FileIoStatus::AuthError, "401"));
        assert_eq!(update.status, FileIoStatus::AuthError);
        assert_eq!(update.additional_info.as_deref(), Some("401"));
        assert!(request.completed);
    }

    #[test]
    fn test_signing_response() {
        let document = "<enrollment><signedCert>CLIENT</signedCert><ca>CA1\n</ca><ca>CA2</ca></enrollment>";

        let mut crypto = MockEnrollmentCrypto::new();
        crypto.expect_parse_cert()
            .returning(|pem| Ok(cert(pem)));
        crypto.expect_client_keystore()
            .with(
                function(|c: &Certificate| c.der == normalize_pem("CLIENT").into_bytes()),
                eq("KEY"),
                eq("keypass"),
                function(|cas: &[Certificate]| cas.iter().map(|c| c.alias.clone().unwrap()).collect::<Vec<_>>() == vec!["enrollCaResult1", "enrollCaResult2"]),
                eq("clientpass"),
                eq(CLIENT_KEYSTORE_NAME))
            .times(1)
            .returning(|_, _, _, _, _, _| Ok(b"client-p12".to_vec()));
        crypto.expect_ca_keystore()
            .with(always(), eq("trustpass"))
            .times(1)
            .returning(|_, _| Ok(b"ca-p12".to_vec()));

        let mut request = request(EnrollmentStep::Sign);
        let update = request.on_transfer_complete(&crypto, TransferOutcome::success(document.as_bytes().to_vec()));
        assert_eq!(update.status, FileIoStatus::Success);
        assert!(update.is_terminal());
        assert_eq!(update.private_result.as_deref(), Some(b"client-p12".as_slice()));
        assert_eq!(update.ca_result.as_deref(), Some(b"ca-p12".as_slice()));
        assert!(request.completed);
    }

    #[test]
    fn test_signing_response_without_ca() {
        let mut crypto = MockEnrollmentCrypto::new();
        crypto.expect_parse_cert()
            .returning(|pem| Ok(cert(pem)));
        crypto.expect_client_keystore()
            .returning(|_, _, _, _, _, _| Ok(b"client-p12".to_vec()));
        crypto.expect_ca_keystore()
            .never();

        let mut request = request(EnrollmentStep::Sign);
        let update = request.on_transfer_complete(&crypto, TransferOutcome::success(b"<enrollment><signedCert>CLIENT</signedCert></enrollment>".to_vec()));
        assert_eq!(update.status, FileIoStatus::Success);
        assert!(update.ca_result.is_none());
    }

    #[rstest]
    #[case::no_signed_cert("<enrollment><ca>CA1</ca></enrollment>")]
    #[case::two_signed_certs("<enrollment><signedCert>A</signedCert><signedCert>B</signedCert></enrollment>")]
    #[case::wrong_root("<certificateConfig><signedCert>A</signedCert></certificateConfig>")]
    fn test_signing_response_invalid(#[case] document: &str) {
        let mut crypto = MockEnrollmentCrypto::new();
        crypto.expect_parse_cert()
            .returning(|pem| Ok(cert(pem)));

        let mut request = request(EnrollmentStep::Sign);
        let update = request.on_transfer_complete(&crypto, TransferOutcome::success(document.as_bytes().to_vec()));
        assert_eq!(update.status, FileIoStatus::OtherError);
        assert!(update.private_result.is_none());
        assert!(request.completed);
    }
}
