use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    CodecError, Reader, Writer,
    varint::{self, decode_varint, varint_len},
};

/// Hard cap for any Java frame.
pub const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

/// One Java wire frame: `varint(len) || varint(id) || payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Builds a packet by letting `f` fill the payload.
    pub fn build(id: i32, f: impl FnOnce(&mut Writer)) -> Self {
        let mut w = Writer::new();
        f(&mut w);
        Self::new(id, w.into_inner())
    }

    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.payload)
    }

    /// Length of the id + payload, i.e. the value of the leading length varint.
    pub fn body_len(&self) -> usize {
        varint_len(self.id) + self.payload.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(varint::MAX_VARINT_LEN + self.body_len());
        varint::put_varint(out, self.body_len() as i32);
        varint::put_varint(out, self.id);
        out.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the packet and
    /// the number of bytes it occupied.
    pub fn decode_frame(buf: &[u8], max_len: usize) -> Result<Option<(Packet, usize)>, CodecError> {
        let Some((len, len_n)) = decode_varint(buf)? else {
            return Ok(None);
        };
        let len = check_frame_len(len, max_len)?;
        let total = len_n + len;
        if buf.len() < total {
            return Ok(None);
        }
        let packet = split_body(&buf[len_n..total])?;
        Ok(Some((packet, total)))
    }
}

fn check_frame_len(len: i32, max_len: usize) -> Result<usize, CodecError> {
    if len <= 0 {
        return Err(CodecError::MalformedFrame(format!("invalid length {len}")));
    }
    let len = len as usize;
    if len > max_len.min(MAX_PACKET_LEN) {
        return Err(CodecError::MalformedFrame(format!(
            "length {len} exceeds limit {}",
            max_len.min(MAX_PACKET_LEN)
        )));
    }
    Ok(len)
}

fn split_body(body: &[u8]) -> Result<Packet, CodecError> {
    let mut r = Reader::new(body);
    let id = r
        .read_varint()
        .map_err(|_| CodecError::MalformedFrame("missing packet id".into()))?;
    if id < 0 {
        return Err(CodecError::MalformedFrame(format!("negative packet id {id}")));
    }
    Ok(Packet::new(id, Bytes::copy_from_slice(r.rest())))
}

/// Reads exactly one frame from `r`, rejecting frames longer than `max_len`.
pub async fn read_packet<R>(r: &mut R, max_len: usize) -> Result<Packet, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (len, _) = varint::read_varint(r).await?;
    let len = check_frame_len(len, max_len)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    split_body(&body)
}

pub async fn write_packet<W>(w: &mut W, packet: &Packet) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&packet.encode()).await?;
    Ok(())
}

pub async fn write_packets<W>(w: &mut W, packets: &[Packet]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out = Vec::new();
    for p in packets {
        p.encode_into(&mut out);
    }
    w.write_all(&out).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_matches_following_bytes() {
        for (id, len) in [(0, 0usize), (1, 8), (0x7F, 300), (0x80, 70_000)] {
            let p = Packet::new(id, vec![0xAB; len]);
            let raw = p.encode();
            let (declared, n) = decode_varint(&raw).unwrap().unwrap();
            assert_eq!(declared as usize, raw.len() - n);
        }
    }

    #[test]
    fn decode_frame_waits_for_full_body() {
        let raw = Packet::new(1, 42i64.to_be_bytes().to_vec()).encode();
        assert!(
            Packet::decode_frame(&raw[..raw.len() - 1], MAX_PACKET_LEN)
                .unwrap()
                .is_none()
        );
        let (p, used) = Packet::decode_frame(&raw, MAX_PACKET_LEN).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(p.id, 1);
        assert_eq!(p.reader().read_i64_be().unwrap(), 42);
    }

    #[test]
    fn zero_and_oversized_lengths_are_malformed() {
        assert!(matches!(
            Packet::decode_frame(&[0x00], MAX_PACKET_LEN),
            Err(CodecError::MalformedFrame(_))
        ));
        let mut raw = Vec::new();
        varint::put_varint(&mut raw, (MAX_PACKET_LEN + 1) as i32);
        assert!(matches!(
            Packet::decode_frame(&raw, usize::MAX),
            Err(CodecError::MalformedFrame(_))
        ));
        let mut raw = Vec::new();
        varint::put_varint(&mut raw, 300);
        assert!(matches!(
            Packet::decode_frame(&raw, 264),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn stream_ending_early_is_malformed() {
        let raw = Packet::new(0, vec![1, 2, 3, 4]).encode();
        let mut r = &raw[..raw.len() - 2];
        assert!(matches!(
            read_packet(&mut r, MAX_PACKET_LEN).await,
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn write_then_read_large_payload() {
        let p = Packet::new(0x10, vec![7u8; MAX_PACKET_LEN - 1]);
        let mut out = Vec::new();
        write_packet(&mut out, &p).await.unwrap();
        let mut r = &out[..];
        let got = read_packet(&mut r, MAX_PACKET_LEN).await.unwrap();
        assert_eq!(got, p);
    }
}
