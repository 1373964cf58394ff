//! Transport-internal messages: keep-alive pings and pongs, the protocol negotiation exchange,
//!  and the authentication document sent when a TLS or QUIC connection comes up.
//!
//! Negotiation works like this: after connecting, the server advertises the protocol versions it
//!  supports (`t-x-takp-v`). If binary version 1 is among them, the client asks to switch
//!  (`t-x-takp-q`) and stops sending until the server responds (`t-x-takp-r`) with accept or
//!  reject. On accept, both sides switch to binary framing immediately after the response.

use std::time::Duration;

use anyhow::anyhow;

use crate::message::cot::{escape_xml, CotMessage, CotPoint};
use crate::message::wire::ProtocolVersion;

pub const PING_TYPE: &str = "t-x-c-t";
pub const PONG_TYPE: &str = "t-x-c-t-r";
pub const PING_HOW: &str = "m-g";
pub const PING_UID_SUFFIX: &str = "-ping";

pub const PROTOCOL_SUPPORT_TYPE: &str = "t-x-takp-v";
pub const PROTOCOL_REQUEST_TYPE: &str = "t-x-takp-q";
pub const PROTOCOL_RESPONSE_TYPE: &str = "t-x-takp-r";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TakControlKind {
    ProtocolSupport,
    ProtocolRequest,
    ProtocolResponse,
}

impl CotMessage {
    pub fn tak_control_kind(&self) -> Option<TakControlKind> {
        match self.event_type.as_str() {
            PROTOCOL_SUPPORT_TYPE => Some(TakControlKind::ProtocolSupport),
            PROTOCOL_REQUEST_TYPE => Some(TakControlKind::ProtocolRequest),
            PROTOCOL_RESPONSE_TYPE => Some(TakControlKind::ProtocolResponse),
            _ => None,
        }
    }

    pub fn is_pong(&self) -> bool {
        self.event_type == PONG_TYPE
    }

    /// Protocol versions advertised by a `t-x-takp-v` message. Unknown version numbers are
    ///  skipped.
    pub fn supported_protocol_versions(&self) -> anyhow::Result<Vec<ProtocolVersion>> {
        let wrapped = format!("<detail>{}</detail>", self.detail);
        let doc = roxmltree::Document::parse(&wrapped)?;
        let tak_control = tak_control_element(&doc)?;

        Ok(tak_control.children()
            .filter(|n| n.has_tag_name("TakProtocolSupport"))
            .filter_map(|n| n.attribute("version"))
            .filter_map(|v| v.parse::<u32>().ok())
            .filter_map(|v| ProtocolVersion::try_from(v).ok())
            .collect())
    }

    /// The server's verdict in a `t-x-takp-r` message
    pub fn protocol_response_accepted(&self) -> anyhow::Result<bool> {
        let wrapped = format!("<detail>{}</detail>", self.detail);
        let doc = roxmltree::Document::parse(&wrapped)?;
        let response = tak_control_element(&doc)?
            .children()
            .find(|n| n.has_tag_name("TakResponse"))
            .ok_or_else(|| anyhow!("protocol response has no <TakResponse>"))?;

        Ok(response.attribute("status")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false))
    }
}

fn tak_control_element<'a, 'input>(doc: &'a roxmltree::Document<'input>) -> anyhow::Result<roxmltree::Node<'a, 'input>> {
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("TakControl"))
        .ok_or_else(|| anyhow!("control message has no <TakControl>"))
}

pub fn ping(my_uid: &str, stale_after: Duration) -> CotMessage {
    let uid = format!("{}{}", my_uid, PING_UID_SUFFIX);
    CotMessage::new(&uid, PING_TYPE, PING_HOW, CotPoint::new(0.0, 0.0), stale_after)
}

/// Asks the server to switch to the given protocol version. The request reuses the uid of the
///  server's support advertisement.
pub fn protocol_request(uid: &str, version: ProtocolVersion, stale_after: Duration) -> CotMessage {
    CotMessage::new(uid, PROTOCOL_REQUEST_TYPE, PING_HOW, CotPoint::new(0.0, 0.0), stale_after)
        .with_detail(format!(r#"<TakControl><TakRequest version="{}"/></TakControl>"#, u32::from(version)))
}

pub fn protocol_support(uid: &str, versions: &[ProtocolVersion], stale_after: Duration) -> CotMessage {
    let mut detail = String::from("<TakControl>");
    for v in versions {
        detail.push_str(&format!(r#"<TakProtocolSupport version="{}"/>"#, u32::from(*v)));
    }
    detail.push_str("</TakControl>");
    CotMessage::new(uid, PROTOCOL_SUPPORT_TYPE, PING_HOW, CotPoint::new(0.0, 0.0), stale_after)
        .with_detail(detail)
}

pub fn protocol_response(uid: &str, accepted: bool, stale_after: Duration) -> CotMessage {
    CotMessage::new(uid, PROTOCOL_RESPONSE_TYPE, PING_HOW, CotPoint::new(0.0, 0.0), stale_after)
        .with_detail(format!(r#"<TakControl><TakResponse status="{}"/></TakControl>"#, accepted))
}

/// The document a TLS or QUIC client sends first to authenticate. There is none unless both a
///  non-empty user name and a password are configured.
pub fn auth_document(username: Option<&str>, password: Option<&str>, my_uid: &str) -> Option<String> {
    match (username, password) {
        (Some(username), Some(password)) if !username.is_empty() => Some(format!(
            "<?xml version=\"1.0\"?>\n<auth><cot username=\"{}\" password=\"{}\" uid=\"{}\"/></auth>",
            escape_xml(username),
            escape_xml(password),
            escape_xml(my_uid),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_ping() {
        let ping = ping("ANDROID-1", Duration::from_secs(10));
        assert_eq!(ping.uid, "ANDROID-1-ping");
        assert_eq!(ping.event_type, "t-x-c-t");
        assert_eq!(ping.how, "m-g");
        assert_eq!((ping.stale - ping.time).num_seconds(), 10);
        assert!(!ping.is_pong());
        assert_eq!(ping.tak_control_kind(), None);
    }

    #[test]
    fn test_supported_versions() {
        let msg = CotMessage::new("srv", PROTOCOL_SUPPORT_TYPE, "m-g", CotPoint::new(0.0, 0.0), Duration::from_secs(60))
            .with_detail(r#"<TakControl><TakProtocolSupport version="1"/><TakProtocolSupport version="7"/><TakProtocolSupport version="x"/></TakControl>"#);
        assert_eq!(msg.tak_control_kind(), Some(TakControlKind::ProtocolSupport));
        assert_eq!(msg.supported_protocol_versions().unwrap(), vec![ProtocolVersion::TakProtoV1]);
    }

    #[test]
    fn test_supported_versions_without_tak_control() {
        let msg = CotMessage::new("srv", PROTOCOL_SUPPORT_TYPE, "m-g", CotPoint::new(0.0, 0.0), Duration::from_secs(60));
        assert!(msg.supported_protocol_versions().is_err());
    }

    #[rstest]
    #[case::accepted(true)]
    #[case::rejected(false)]
    fn test_response_status(#[case] accepted: bool) {
        let msg = protocol_response("srv", accepted, Duration::from_secs(60));
        assert_eq!(msg.tak_control_kind(), Some(TakControlKind::ProtocolResponse));
        assert_eq!(msg.protocol_response_accepted().unwrap(), accepted);
    }

    #[test]
    fn test_request() {
        let msg = protocol_request("srv-uid", ProtocolVersion::TakProtoV1, Duration::from_secs(60));
        assert_eq!(msg.uid, "srv-uid");
        assert_eq!(msg.tak_control_kind(), Some(TakControlKind::ProtocolRequest));
        assert_eq!(msg.detail, r#"<TakControl><TakRequest version="1"/></TakControl>"#);
    }

    #[rstest]
    #[case::complete(Some("joe"), Some("secret"), Some("<?xml version=\"1.0\"?>\n<auth><cot username=\"joe\" password=\"secret\" uid=\"me\"/></auth>"))]
    #[case::escaped(Some("joe"), Some("a\"b"), Some("<?xml version=\"1.0\"?>\n<auth><cot username=\"joe\" password=\"a&quot;b\" uid=\"me\"/></auth>"))]
    #[case::empty_user(Some(""), Some("secret"), None)]
    #[case::no_password(Some("joe"), None, None)]
    #[case::nothing(None, None, None)]
    fn test_auth_document(#[case] user: Option<&str>, #[case] password: Option<&str>, #[case] expected: Option<&str>) {
        assert_eq!(auth_document(user, password, "me").as_deref(), expected);
    }
}
