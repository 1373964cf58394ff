use std::borrow::Cow;
use std::fmt::Write;

use anyhow::{anyhow, bail};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Marker for 'no value' in optional point fields
pub const COT_NO_VALUE: f64 = 9999999.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CotPoint {
    pub lat: f64,
    pub lon: f64,
    /// height above ellipsoid
    pub hae: f64,
    /// circular error
    pub ce: f64,
    /// linear error
    pub le: f64,
}
impl CotPoint {
    pub fn new(lat: f64, lon: f64) -> CotPoint {
        CotPoint {
            lat,
            lon,
            hae: COT_NO_VALUE,
            ce: COT_NO_VALUE,
            le: COT_NO_VALUE,
        }
    }
}

/// A single CoT event. The `detail` is kept as raw (inner) XML: streaming does not interpret it
///  apart from protocol control messages.
#[derive(Debug, Clone, PartialEq)]
pub struct CotMessage {
    pub uid: String,
    pub event_type: String,
    pub how: String,
    pub access: Option<String>,
    pub qos: Option<String>,
    pub opex: Option<String>,
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub stale: DateTime<Utc>,
    pub point: CotPoint,
    pub detail: String,
}

impl CotMessage {
    /// Creates a message that is valid from now until `now + stale_after`. Timestamps are
    ///  truncated to milliseconds, the resolution of both wire formats.
    pub fn new(uid: &str, event_type: &str, how: &str, point: CotPoint, stale_after: std::time::Duration) -> CotMessage {
        let now = Utc::now().trunc_subsecs(3);
        let stale = now + chrono::Duration::from_std(stale_after)
            .unwrap_or(chrono::Duration::zero());
        CotMessage {
            uid: uid.to_string(),
            event_type: event_type.to_string(),
            how: how.to_string(),
            access: None,
            qos: None,
            opex: None,
            time: now,
            start: now,
            stale,
            point,
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> CotMessage {
        self.detail = detail.into();
        self
    }

    pub fn to_xml(&self) -> String {
        let mut result = String::with_capacity(256 + self.detail.len());
        result.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        let _ = write!(result, r#"<event version="2.0" uid="{}" type="{}" how="{}" time="{}" start="{}" stale="{}""#,
            escape_xml(&self.uid),
            escape_xml(&self.event_type),
            escape_xml(&self.how),
            format_time(&self.time),
            format_time(&self.start),
            format_time(&self.stale),
        );
        for (name, value) in [("access", &self.access), ("qos", &self.qos), ("opex", &self.opex)] {
            if let Some(value) = value {
                let _ = write!(result, r#" {}="{}""#, name, escape_xml(value));
            }
        }
        let _ = write!(result, r#"><point lat="{}" lon="{}" hae="{}" ce="{}" le="{}"/>"#,
            self.point.lat, self.point.lon, self.point.hae, self.point.ce, self.point.le);
        result.push_str("<detail>");
        result.push_str(&self.detail);
        result.push_str("</detail></event>");
        result
    }

    pub fn from_xml(xml: &str) -> anyhow::Result<CotMessage> {
        let source = xml.trim_start();
        let doc = roxmltree::Document::parse(source)?;
        let event = doc.root_element();
        if event.tag_name().name() != "event" {
            bail!("root element is <{}> rather than <event>", event.tag_name().name());
        }

        let point = event.children()
            .find(|n| n.has_tag_name("point"))
            .ok_or_else(|| anyhow!("event has no <point> element"))?;

        let detail = event.children()
            .find(|n| n.has_tag_name("detail"))
            .map(|n| inner_xml(source, n))
            .unwrap_or_default();

        Ok(CotMessage {
            uid: required_attribute(event, "uid")?.to_string(),
            event_type: required_attribute(event, "type")?.to_string(),
            how: event.attribute("how").unwrap_or_default().to_string(),
            access: event.attribute("access").map(str::to_string),
            qos: event.attribute("qos").map(str::to_string),
            opex: event.attribute("opex").map(str::to_string),
            time: parse_time(required_attribute(event, "time")?)?,
            start: parse_time(required_attribute(event, "start")?)?,
            stale: parse_time(required_attribute(event, "stale")?)?,
            point: CotPoint {
                lat: required_attribute(point, "lat")?.parse()?,
                lon: required_attribute(point, "lon")?.parse()?,
                hae: optional_number(point, "hae")?,
                ce: optional_number(point, "ce")?,
                le: optional_number(point, "le")?,
            },
            detail: detail.to_string(),
        })
    }
}

fn required_attribute<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> anyhow::Result<&'a str> {
    node.attribute(name)
        .ok_or_else(|| anyhow!("<{}> has no attribute '{}'", node.tag_name().name(), name))
}

fn optional_number(node: roxmltree::Node, name: &str) -> anyhow::Result<f64> {
    match node.attribute(name) {
        Some(s) => Ok(s.parse()?),
        None => Ok(COT_NO_VALUE),
    }
}

/// The raw source text between an element's start and end tags
fn inner_xml<'a>(source: &'a str, node: roxmltree::Node) -> &'a str {
    match (node.first_child(), node.last_child()) {
        (Some(first), Some(last)) => &source[first.range().start..last.range().end],
        _ => "",
    }
}

pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

pub(crate) fn escape_xml(s: &str) -> Cow<str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }

    let mut result = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&apos;"),
            c => result.push(c),
        }
    }
    Cow::Owned(result)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<event version="2.0" uid="ANDROID-1234" type="a-f-G-U-C" how="h-e" time="2024-05-01T10:00:00.000Z" start="2024-05-01T10:00:00.000Z" stale="2024-05-01T10:05:00.000Z">
  <point lat="48.1" lon="11.5" hae="520" ce="9.9" le="9999999"/>
  <detail><contact callsign="Alpha &amp; Omega"/><__group name="Cyan" role="Team Member"/></detail>
</event>"#;

    #[test]
    fn test_parse() {
        let msg = CotMessage::from_xml(SAMPLE).unwrap();
        assert_eq!(msg.uid, "ANDROID-1234");
        assert_eq!(msg.event_type, "a-f-G-U-C");
        assert_eq!(msg.how, "h-e");
        assert_eq!(msg.access, None);
        assert_eq!(format_time(&msg.stale), "2024-05-01T10:05:00.000Z");
        assert_eq!(msg.point, CotPoint { lat: 48.1, lon: 11.5, hae: 520.0, ce: 9.9, le: COT_NO_VALUE });
        assert_eq!(msg.detail, r#"<contact callsign="Alpha &amp; Omega"/><__group name="Cyan" role="Team Member"/>"#);
    }

    #[test]
    fn test_xml_round_trip() {
        let mut msg = CotMessage::new("uid-\"1\"", "a-f-G", "m-g", CotPoint::new(1.5, -2.25), Duration::from_secs(30))
            .with_detail("<remarks>a &lt; b</remarks>");
        msg.qos = Some("1-r-c".to_string());

        let xml = msg.to_xml();
        assert!(xml.ends_with("</event>"));
        assert_eq!(CotMessage::from_xml(&xml).unwrap(), msg);
    }

    #[test]
    fn test_leading_whitespace_is_ignored() {
        let msg = CotMessage::new("a", "b", "c", CotPoint::new(0.0, 0.0), Duration::from_secs(1));
        let xml = format!("\r\n  {}", msg.to_xml());
        assert_eq!(CotMessage::from_xml(&xml).unwrap(), msg);
    }

    #[test]
    fn test_empty_detail() {
        let xml = SAMPLE.replace(r#"<detail><contact callsign="Alpha &amp; Omega"/><__group name="Cyan" role="Team Member"/></detail>"#, "<detail/>");
        assert_eq!(CotMessage::from_xml(&xml).unwrap().detail, "");
    }

    #[rstest]
    #[case::wrong_root(r#"<evnt uid="a"/>"#)]
    #[case::no_point(r#"<event uid="a" type="t" time="2024-05-01T10:00:00Z" start="2024-05-01T10:00:00Z" stale="2024-05-01T10:00:00Z"/>"#)]
    #[case::no_uid(r#"<event type="t" time="2024-05-01T10:00:00Z" start="2024-05-01T10:00:00Z" stale="2024-05-01T10:00:00Z"><point lat="1" lon="2"/></event>"#)]
    #[case::bad_time(r#"<event uid="a" type="t" time="yesterday" start="2024-05-01T10:00:00Z" stale="2024-05-01T10:00:00Z"><point lat="1" lon="2"/></event>"#)]
    #[case::bad_lat(r#"<event uid="a" type="t" time="2024-05-01T10:00:00Z" start="2024-05-01T10:00:00Z" stale="2024-05-01T10:00:00Z"><point lat="north" lon="2"/></event>"#)]
    #[case::truncated(r#"<event uid="a" type="t""#)]
    fn test_parse_invalid(#[case] xml: &str) {
        assert!(CotMessage::from_xml(xml).is_err());
    }

    #[rstest]
    #[case::plain("abc", "abc")]
    #[case::all("<&>\"'", "&lt;&amp;&gt;&quot;&apos;")]
    fn test_escape_xml(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(escape_xml(raw), expected);
    }
}
