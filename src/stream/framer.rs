//! Finds message boundaries in the byte stream received on a connection.
//!
//! A connection starts out in XML mode where documents are delimited by a closing `</event>` tag.
//!  Once protocol negotiation switches to binary mode, every message is framed as
//!  `0xBF varint(len) payload`. The switch happens in the middle of a received chunk: the bytes
//!  directly after the accepting negotiation response are binary.
//!
//! The framer does not interpret documents. It hands them to a [FrameSink] which may change the
//!  protocol state in response (see [crate::stream::negotiation]).

use tracing::{debug, warn};

use crate::message::wire::{ProtocolVersion, TAK_PROTO_MAGIC, XML_DELIMITER};
use crate::stream::rx_buffer::{Compaction, RxBuffer};
use crate::util::buf_ext::decode_exact_varint;

/// a u64 varint never has more than 10 bytes
const MAX_VARINT_LEN: usize = 10;

/// The receive-side protocol state of a connection. The first three states are XML framing (with
///  negotiation going on or finished), the rest are the binary framing loop.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum ProtoState {
    /// waiting for the server's protocol support advertisement
    XmlNegotiate,
    /// a switch request was sent, waiting for the server's response
    WaitResponse,
    /// negotiation is over, and the connection stays XML
    XmlOnly,
    HdrMagic,
    HdrLen,
    Data,
}
impl ProtoState {
    pub fn is_xml(&self) -> bool {
        *self <= ProtoState::XmlOnly
    }
}

pub trait FrameSink {
    /// Called for every complete document in wire order. Setting `state` to a binary state switches
    ///  framing for all bytes following this document.
    fn on_frame(&mut self, payload: &[u8], version: ProtocolVersion, state: &mut ProtoState);
}

pub struct Framer {
    state: ProtoState,
    rx: RxBuffer,
    data_len: usize,
    skipped_bytes: usize,
}

impl Framer {
    pub fn new(rx_capacity: usize) -> Framer {
        Framer {
            state: ProtoState::XmlNegotiate,
            rx: RxBuffer::new(rx_capacity),
            data_len: 0,
            skipped_bytes: 0,
        }
    }

    pub fn state(&self) -> ProtoState {
        self.state
    }

    pub fn set_state(&mut self, state: ProtoState) {
        self.state = state;
    }

    pub fn rx_buffer(&self) -> &RxBuffer {
        &self.rx
    }

    /// Space for the next read. It is never empty: scanning compacts the buffer when it fills up.
    pub fn write_space(&mut self) -> &mut [u8] {
        self.rx.write_space()
    }

    pub fn reset(&mut self) {
        self.state = ProtoState::XmlNegotiate;
        self.rx.clear();
        self.data_len = 0;
        self.skipped_bytes = 0;
    }

    /// Scans `num_new` bytes that were just read into [Framer::write_space], passing every
    ///  complete document to the sink. Returns true if at least one document was found.
    pub fn scan(&mut self, num_new: usize, sink: &mut impl FrameSink) -> bool {
        // In XML mode, the delimiter may span the boundary to the previous read, so the tail of
        //  the old data is scanned again
        let mut i = if self.state.is_xml() && self.rx.unconsumed_len() > XML_DELIMITER.len() {
            self.rx.offset() - XML_DELIMITER.len()
        }
        else {
            self.rx.start()
        };

        self.rx.commit(num_new);
        let scan_end = self.rx.offset();

        let mut start = self.rx.start();
        let mut delimiter_idx = 0;
        let mut found = false;

        while i < scan_end {
            match self.state {
                ProtoState::XmlNegotiate | ProtoState::WaitResponse | ProtoState::XmlOnly => {
                    let b = self.rx.byte(i);
                    if b == XML_DELIMITER[delimiter_idx] {
                        delimiter_idx += 1;
                        if delimiter_idx == XML_DELIMITER.len() {
                            sink.on_frame(self.rx.slice(start, i+1), ProtocolVersion::Xml, &mut self.state);
                            found = true;
                            start = i + 1;
                            delimiter_idx = 0;
                        }
                    }
                    else {
                        delimiter_idx = if b == XML_DELIMITER[0] { 1 } else { 0 };
                    }
                    i += 1;
                }
                ProtoState::HdrMagic => {
                    if self.rx.byte(i) == TAK_PROTO_MAGIC {
                        if self.skipped_bytes > 0 {
                            debug!("found magic byte after skipping {} bytes", self.skipped_bytes);
                            self.skipped_bytes = 0;
                        }
                        self.state = ProtoState::HdrLen;
                    }
                    else {
                        if self.skipped_bytes == 0 {
                            warn!("unexpected byte {:#04x} where a magic byte was expected - skipping until the next magic byte", self.rx.byte(i));
                        }
                        self.skipped_bytes += 1;
                    }
                    i += 1;
                    start = i;
                }
                ProtoState::HdrLen => {
                    let varint_len = i + 1 - start;
                    if self.rx.byte(i) & 0x80 == 0 {
                        match decode_exact_varint(self.rx.slice(start, i+1)) {
                            Ok(len) if len <= self.rx.capacity() => {
                                self.data_len = len;
                                self.state = ProtoState::Data;
                            }
                            Ok(len) => {
                                warn!("binary message length {} exceeds the receive buffer - resyncing", len);
                                self.state = ProtoState::HdrMagic;
                            }
                            Err(e) => {
                                warn!("invalid binary message length: {} - resyncing", e);
                                self.state = ProtoState::HdrMagic;
                            }
                        }
                        i += 1;
                        start = i;
                    }
                    else if varint_len >= MAX_VARINT_LEN {
                        warn!("binary message length prefix is too long - resyncing");
                        self.state = ProtoState::HdrMagic;
                        i += 1;
                        start = i;
                    }
                    else {
                        i += 1;
                    }
                }
                ProtoState::Data => {
                    if scan_end - i >= self.data_len {
                        let end = i + self.data_len;
                        sink.on_frame(self.rx.slice(i, end), ProtocolVersion::TakProtoV1, &mut self.state);
                        found = true;
                        i = end;
                        start = end;
                        // binary framing always continues with the next header
                        self.state = ProtoState::HdrMagic;
                    }
                    else {
                        // wait for more data
                        break;
                    }
                }
            }
        }

        self.rx.consume_to(start);

        if self.rx.compact() == Compaction::DiscardedHalf {
            warn!("receive buffer is full without a complete message - discarding {} bytes", self.rx.capacity() - self.rx.offset());
            if !self.state.is_xml() {
                self.state = ProtoState::HdrMagic;
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    /// records frames, switching to binary after a document that is exactly `switch_after`
    struct RecordingSink {
        frames: Vec<(Vec<u8>, ProtocolVersion)>,
        switch_after: Option<Vec<u8>>,
    }
    impl RecordingSink {
        fn new() -> RecordingSink {
            RecordingSink { frames: vec![], switch_after: None }
        }
    }
    impl FrameSink for RecordingSink {
        fn on_frame(&mut self, payload: &[u8], version: ProtocolVersion, state: &mut ProtoState) {
            self.frames.push((payload.to_vec(), version));
            if self.switch_after.as_deref() == Some(payload) {
                *state = ProtoState::HdrMagic;
            }
        }
    }

    fn feed(framer: &mut Framer, sink: &mut RecordingSink, data: &[u8], chunk_size: usize) {
        for chunk in data.chunks(chunk_size) {
            let mut chunk = chunk;
            while !chunk.is_empty() {
                let space = framer.write_space();
                let n = space.len().min(chunk.len());
                space[..n].copy_from_slice(&chunk[..n]);
                framer.scan(n, sink);
                chunk = &chunk[n..];
            }
        }
    }

    fn binary_frame(payload: &[u8]) -> Vec<u8> {
        let mut result = vec![TAK_PROTO_MAGIC];
        let mut len = payload.len();
        loop {
            if len < 0x80 {
                result.push(len as u8);
                break;
            }
            result.push((len as u8 & 0x7f) | 0x80);
            len >>= 7;
        }
        result.extend_from_slice(payload);
        result
    }

    fn xml_docs() -> Vec<Vec<u8>> {
        vec![
            b"<event uid=\"1\"><detail>a</detail></event>".to_vec(),
            b"\n<event uid=\"2\"><detail><</detail></event>".to_vec(),
            b"<event uid=\"3\"></event>".to_vec(),
            b"\r\n<?xml version=\"1.0\"?><event uid=\"4\"><detail></even</detail></event>".to_vec(),
        ]
    }

    #[rstest]
    #[case::one_chunk(1000)]
    #[case::single_bytes(1)]
    #[case::two(2)]
    #[case::seven(7)]
    #[case::thirteen(13)]
    fn test_xml_chunking(#[case] chunk_size: usize) {
        let docs = xml_docs();
        let stream = docs.concat();

        let mut framer = Framer::new(1024);
        let mut sink = RecordingSink::new();
        feed(&mut framer, &mut sink, &stream, chunk_size);

        let expected = docs.into_iter()
            .map(|d| (d, ProtocolVersion::Xml))
            .collect::<Vec<_>>();
        assert_eq!(sink.frames, expected);
        assert_eq!(framer.rx_buffer().unconsumed_len(), 0);
    }

    #[test]
    fn test_xml_delimiter_after_partial_match() {
        let mut framer = Framer::new(256);
        let mut sink = RecordingSink::new();
        feed(&mut framer, &mut sink, b"<event><</event>", 100);
        assert_eq!(sink.frames.len(), 1);
    }

    fn payloads() -> Vec<Vec<u8>> {
        vec![
            b"first".to_vec(),
            vec![],
            vec![0xbf; 40],
            (0..200u8).collect(),
            b"last one".to_vec(),
        ]
    }

    #[rstest]
    #[case::one_chunk(10_000, 1024)]
    #[case::single_bytes(1, 1024)]
    #[case::three(3, 1024)]
    #[case::small_buffer_one_chunk(10_000, 256)]
    #[case::small_buffer_single_bytes(1, 256)]
    #[case::small_buffer_odd(17, 256)]
    fn test_binary_chunking(#[case] chunk_size: usize, #[case] capacity: usize) {
        let stream = payloads().iter()
            .map(|p| binary_frame(p))
            .collect::<Vec<_>>()
            .concat();

        let mut framer = Framer::new(capacity);
        framer.set_state(ProtoState::HdrMagic);
        let mut sink = RecordingSink::new();
        feed(&mut framer, &mut sink, &stream, chunk_size);

        let expected = payloads().into_iter()
            .map(|p| (p, ProtocolVersion::TakProtoV1))
            .collect::<Vec<_>>();
        assert_eq!(sink.frames, expected);
        assert_eq!(framer.state(), ProtoState::HdrMagic);
    }

    #[rstest]
    #[case::one_chunk(10_000)]
    #[case::single_bytes(1)]
    fn test_resync_after_corrupt_length(#[case] chunk_size: usize) {
        let mut stream = binary_frame(b"before");
        let corrupt_start = stream.len();
        stream.extend(binary_frame(b"corrupted"));
        stream.extend(binary_frame(b"after 1"));
        stream.extend(binary_frame(b"after 2"));

        // continuation bit set: the first payload byte completes a length beyond the buffer capacity
        stream[corrupt_start + 1] = 0xff;

        let mut framer = Framer::new(256);
        framer.set_state(ProtoState::HdrMagic);
        let mut sink = RecordingSink::new();
        feed(&mut framer, &mut sink, &stream, chunk_size);

        let payloads = sink.frames.into_iter().map(|(p, _)| p).collect::<Vec<_>>();
        assert_eq!(payloads, vec![b"before".to_vec(), b"after 1".to_vec(), b"after 2".to_vec()]);
    }

    #[test]
    fn test_garbage_before_magic_is_consumed() {
        let mut stream = b"garbage".to_vec();
        stream.extend(binary_frame(b"payload"));

        let mut framer = Framer::new(64);
        framer.set_state(ProtoState::HdrMagic);
        let mut sink = RecordingSink::new();
        feed(&mut framer, &mut sink, &stream, 3);

        assert_eq!(sink.frames, vec![(b"payload".to_vec(), ProtocolVersion::TakProtoV1)]);
        assert_eq!(framer.rx_buffer().unconsumed_len(), 0);
    }

    #[rstest]
    #[case::one_chunk(10_000)]
    #[case::single_bytes(1)]
    #[case::five(5)]
    fn test_switch_mid_chunk(#[case] chunk_size: usize) {
        let switch_doc = b"<event uid=\"response\"></event>".to_vec();
        let mut stream = b"<event uid=\"x\"></event>".to_vec();
        stream.extend(&switch_doc);
        stream.extend(binary_frame(b"binary 1"));
        stream.extend(binary_frame(b"</event>"));

        let mut framer = Framer::new(1024);
        let mut sink = RecordingSink::new();
        sink.switch_after = Some(switch_doc.clone());
        feed(&mut framer, &mut sink, &stream, chunk_size);

        assert_eq!(sink.frames, vec![
            (b"<event uid=\"x\"></event>".to_vec(), ProtocolVersion::Xml),
            (switch_doc, ProtocolVersion::Xml),
            (b"binary 1".to_vec(), ProtocolVersion::TakProtoV1),
            (b"</event>".to_vec(), ProtocolVersion::TakProtoV1),
        ]);
    }

    #[test]
    fn test_overflow_discards_older_half() {
        let mut framer = Framer::new(64);
        let mut sink = RecordingSink::new();

        feed(&mut framer, &mut sink, &[b'x'; 64], 64);
        assert!(sink.frames.is_empty());
        assert_eq!(framer.rx_buffer().offset(), 32);

        feed(&mut framer, &mut sink, b"</event>", 64);
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].0.len(), 40);
    }

    #[test]
    fn test_message_of_buffer_capacity() {
        let payload = vec![7u8; 64];
        let mut framer = Framer::new(64);
        framer.set_state(ProtoState::HdrMagic);
        let mut sink = RecordingSink::new();

        feed(&mut framer, &mut sink, &binary_frame(&payload), 1000);
        assert_eq!(sink.frames, vec![(payload, ProtocolVersion::TakProtoV1)]);
    }

    #[test]
    fn test_length_beyond_capacity_resyncs() {
        let mut framer = Framer::new(64);
        framer.set_state(ProtoState::HdrMagic);
        let mut sink = RecordingSink::new();

        let mut stream = vec![TAK_PROTO_MAGIC, 65];
        stream.extend([b'x'; 20]);
        stream.extend(binary_frame(b"ok"));
        feed(&mut framer, &mut sink, &stream, 1000);

        assert_eq!(sink.frames, vec![(b"ok".to_vec(), ProtocolVersion::TakProtoV1)]);
    }

    #[test]
    fn test_reset() {
        let mut framer = Framer::new(64);
        framer.set_state(ProtoState::Data);
        let mut sink = RecordingSink::new();
        feed(&mut framer, &mut sink, b"abc", 64);

        framer.reset();
        assert_eq!(framer.state(), ProtoState::XmlNegotiate);
        assert_eq!(framer.rx_buffer().unconsumed_len(), 0);
    }
}
