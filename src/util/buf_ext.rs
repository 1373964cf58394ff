use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntResult, VarIntSupport, VarIntSupportMut};


pub trait BufMutExt: BufMut + VarIntSupportMut {
    fn put_usize_varint_prefixed(&mut self, data: &[u8]) {
        self.put_u64_varint(data.len() as u64);
        self.put_slice(data);
    }
}
impl <T: BufMut + VarIntSupportMut> BufMutExt for T {}


pub trait DummyErrorAdapter<T> {
    fn a(self) -> anyhow::Result<T>;
}
impl <T> DummyErrorAdapter<T> for VarIntResult<T> {
    fn a(self) -> anyhow::Result<T> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(anyhow!("VarInt error: {:?}", e)),
        }
    }
}

/// Decodes a varint that is expected to span *exactly* the given bytes, returning the value if
///  it does. A value that decodes from fewer bytes, or does not decode at all, is an error.
pub fn decode_exact_varint(bytes: &[u8]) -> anyhow::Result<usize> {
    let mut buf = bytes;
    let value = buf.try_get_u64_varint().a()?;
    if buf.has_remaining() {
        return Err(anyhow!("varint length mismatch: {} bytes left over", buf.remaining()));
    }
    usize::try_from(value)
        .map_err(|_| anyhow!("varint value {} exceeds platform range", value))
}
