use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use prost::Message;

use crate::message::cot::CotMessage;
use crate::message::tak_proto::{CotEvent, TakMessage};
use crate::util::buf_ext::BufMutExt;

/// First byte of every binary frame
pub const TAK_PROTO_MAGIC: u8 = 0xbf;

/// Terminates every document in XML mode
pub const XML_DELIMITER: &[u8] = b"</event>";

/// The message encodings a streaming connection can use. The numbers are the version numbers
///  exchanged during protocol negotiation.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ProtocolVersion {
    Xml = 0,
    TakProtoV1 = 1,
}

/// Serializes a message for transmission, including framing. XML documents are self-delimiting,
///  binary messages get the magic byte and a varint length prefix.
pub fn serialize(msg: &CotMessage, version: ProtocolVersion) -> Bytes {
    match version {
        ProtocolVersion::Xml => Bytes::from(msg.to_xml()),
        ProtocolVersion::TakProtoV1 => {
            let payload = TakMessage {
                tak_control: None,
                cot_event: Some(CotEvent::from(msg)),
            }.encode_to_vec();

            let mut buf = BytesMut::with_capacity(payload.len() + 6);
            buf.put_u8(TAK_PROTO_MAGIC);
            buf.put_usize_varint_prefixed(&payload);
            buf.freeze()
        }
    }
}

/// Parses a single received document: a complete XML document, or the payload of a binary frame
///  (without magic byte and length prefix).
pub fn deserialize(payload: &[u8], version: ProtocolVersion) -> anyhow::Result<CotMessage> {
    match version {
        ProtocolVersion::Xml => CotMessage::from_xml(std::str::from_utf8(payload)?),
        ProtocolVersion::TakProtoV1 => {
            let msg = TakMessage::decode(payload)?;
            msg.cot_event
                .ok_or_else(|| anyhow!("binary message contains no CoT event"))?
                .try_into()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use crate::message::cot::CotPoint;
    use crate::util::buf_ext::decode_exact_varint;
    use super::*;

    fn sample() -> CotMessage {
        CotMessage::new("abc", "a-f-G", "m-g", CotPoint::new(1.0, 2.0), Duration::from_secs(5))
            .with_detail("<remarks>hi</remarks>")
    }

    #[test]
    fn test_binary_framing() {
        let msg = sample();
        let framed = serialize(&msg, ProtocolVersion::TakProtoV1);
        assert_eq!(framed[0], TAK_PROTO_MAGIC);

        let (len_bytes, prefix_len) = if framed[1] & 0x80 == 0 { (&framed[1..2], 1) } else { (&framed[1..3], 2) };
        let payload_len = decode_exact_varint(len_bytes).unwrap();
        assert_eq!(framed.len(), 1 + prefix_len + payload_len);

        assert_eq!(deserialize(&framed[1 + prefix_len..], ProtocolVersion::TakProtoV1).unwrap(), msg);
    }

    #[test]
    fn test_xml_framing() {
        let msg = sample();
        let framed = serialize(&msg, ProtocolVersion::Xml);
        assert!(framed.ends_with(XML_DELIMITER));
        assert_eq!(deserialize(&framed, ProtocolVersion::Xml).unwrap(), msg);
    }

    #[rstest]
    #[case::xml(0, Some(ProtocolVersion::Xml))]
    #[case::v1(1, Some(ProtocolVersion::TakProtoV1))]
    #[case::unknown(2, None)]
    fn test_version_numbers(#[case] raw: u32, #[case] expected: Option<ProtocolVersion>) {
        assert_eq!(ProtocolVersion::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_deserialize_garbage() {
        assert!(deserialize(&[0xff, 0xff, 0xff], ProtocolVersion::TakProtoV1).is_err());
        assert!(deserialize(&[0xff, 0xfe], ProtocolVersion::Xml).is_err());
    }
}
