//! Protobuf messages of the binary ('TAK protocol version 1') wire format. Only the parts
//!  that streaming connections use are modelled: detail content travels as raw XML.

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::message::cot::{CotMessage, CotPoint};

#[derive(Clone, PartialEq, prost::Message)]
pub struct TakMessage {
    #[prost(message, optional, tag = "1")]
    pub tak_control: Option<TakControl>,
    #[prost(message, optional, tag = "2")]
    pub cot_event: Option<CotEvent>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TakControl {
    #[prost(uint32, tag = "1")]
    pub min_proto_version: u32,
    #[prost(uint32, tag = "2")]
    pub max_proto_version: u32,
    #[prost(string, tag = "3")]
    pub contact_uid: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CotEvent {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub access: String,
    #[prost(string, tag = "3")]
    pub qos: String,
    #[prost(string, tag = "4")]
    pub opex: String,
    #[prost(string, tag = "5")]
    pub uid: String,
    /// milliseconds since the epoch
    #[prost(uint64, tag = "6")]
    pub send_time: u64,
    #[prost(uint64, tag = "7")]
    pub start_time: u64,
    #[prost(uint64, tag = "8")]
    pub stale_time: u64,
    #[prost(string, tag = "9")]
    pub how: String,
    #[prost(double, tag = "10")]
    pub lat: f64,
    #[prost(double, tag = "11")]
    pub lon: f64,
    #[prost(double, tag = "12")]
    pub hae: f64,
    #[prost(double, tag = "13")]
    pub ce: f64,
    #[prost(double, tag = "14")]
    pub le: f64,
    #[prost(message, optional, tag = "15")]
    pub detail: Option<Detail>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Detail {
    #[prost(string, tag = "1")]
    pub xml_detail: String,
}

impl From<&CotMessage> for CotEvent {
    fn from(msg: &CotMessage) -> Self {
        CotEvent {
            r#type: msg.event_type.clone(),
            access: msg.access.clone().unwrap_or_default(),
            qos: msg.qos.clone().unwrap_or_default(),
            opex: msg.opex.clone().unwrap_or_default(),
            uid: msg.uid.clone(),
            send_time: to_millis(&msg.time),
            start_time: to_millis(&msg.start),
            stale_time: to_millis(&msg.stale),
            how: msg.how.clone(),
            lat: msg.point.lat,
            lon: msg.point.lon,
            hae: msg.point.hae,
            ce: msg.point.ce,
            le: msg.point.le,
            detail: if msg.detail.is_empty() {
                None
            }
            else {
                Some(Detail { xml_detail: msg.detail.clone() })
            },
        }
    }
}

impl TryFrom<CotEvent> for CotMessage {
    type Error = anyhow::Error;

    fn try_from(event: CotEvent) -> anyhow::Result<Self> {
        Ok(CotMessage {
            uid: event.uid,
            event_type: event.r#type,
            how: event.how,
            access: non_empty(event.access),
            qos: non_empty(event.qos),
            opex: non_empty(event.opex),
            time: from_millis(event.send_time)?,
            start: from_millis(event.start_time)?,
            stale: from_millis(event.stale_time)?,
            point: CotPoint {
                lat: event.lat,
                lon: event.lon,
                hae: event.hae,
                ce: event.ce,
                le: event.le,
            },
            detail: event.detail.map(|d| d.xml_detail).unwrap_or_default(),
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn to_millis(t: &DateTime<Utc>) -> u64 {
    t.timestamp_millis().max(0) as u64
}

fn from_millis(millis: u64) -> anyhow::Result<DateTime<Utc>> {
    i64::try_from(millis).ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| anyhow!("timestamp out of range: {}", millis))
}
