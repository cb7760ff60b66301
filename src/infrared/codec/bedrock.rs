//! Bedrock batch framing and the handful of packets the proxy inspects.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{Compression as FlateLevel, read::DeflateDecoder, write::DeflateEncoder};
use serde::{Deserialize, Serialize};

use super::{CodecError, Reader, Writer, varint};

pub const BATCH_HEADER: u8 = 0xFE;
pub const MAX_BATCH_PACKETS: usize = 512 + 256;
/// Ceiling on the decompressed size of a single batch.
pub const MAX_DECOMPRESSED_LEN: usize = 8 * 1024 * 1024;
/// Headroom over twice the batch size that a packet buffer may reserve before
/// its bytes have arrived.
const ALLOC_SLACK: usize = 4096;
/// First protocol that prefixes compressed batches with an algorithm byte.
pub const ALGORITHM_PREFIX_PROTOCOL: i32 = 649;
const PREFIX_NONE: u8 = 0xFF;

pub const ID_LOGIN: u32 = 0x01;
pub const ID_DISCONNECT: u32 = 0x05;
pub const ID_NETWORK_SETTINGS: u32 = 0x8F;
pub const ID_REQUEST_NETWORK_SETTINGS: u32 = 0xC1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Flate,
    Snappy,
}

impl Compression {
    pub fn id(self) -> u16 {
        match self {
            Compression::Flate => 0,
            Compression::Snappy => 1,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Compression::Flate),
            1 => Some(Compression::Snappy),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::Flate => "flate",
            Compression::Snappy => "snappy",
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Compression::Flate => {
                let mut enc = DeflateEncoder::new(Vec::with_capacity(data.len() / 2 + 16), FlateLevel::new(6));
                enc.write_all(data)
                    .map_err(|e| CodecError::Compression(format!("flate: {e}")))?;
                enc.finish()
                    .map_err(|e| CodecError::Compression(format!("flate: {e}")))
            }
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| CodecError::Compression(format!("snappy: {e}"))),
        }
    }
}

/// Batch encoder/decoder for one direction of a connection.
#[derive(Debug, Clone, Default)]
pub struct BatchCodec {
    compression: Option<Compression>,
    algorithm_prefix: bool,
    check_packet_limit: bool,
}

impl BatchCodec {
    pub fn new() -> Self {
        Self {
            compression: None,
            algorithm_prefix: false,
            check_packet_limit: true,
        }
    }

    /// Backend connections may legitimately send larger batches.
    pub fn without_packet_limit(mut self) -> Self {
        self.check_packet_limit = false;
        self
    }

    pub fn enable_compression(&mut self, compression: Compression, protocol: i32) {
        self.compression = Some(compression);
        self.algorithm_prefix = protocol >= ALGORITHM_PREFIX_PROTOCOL;
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    /// Splits one batch into its packets.
    ///
    /// Decompression is streamed so that an oversized batch fails as soon as
    /// the packet cap is crossed, without inflating the remainder.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        let Some((&header, body)) = data.split_first() else {
            return Ok(Vec::new());
        };
        if header != BATCH_HEADER {
            return Err(CodecError::MalformedFrame(format!(
                "invalid batch header {header:#04x}"
            )));
        }

        let mut algorithm = self.compression;
        let mut body = body;
        if self.compression.is_some() && self.algorithm_prefix {
            let Some((&prefix, rest)) = body.split_first() else {
                return Err(CodecError::Truncated { need: 1 });
            };
            algorithm = match prefix {
                PREFIX_NONE => None,
                id => Some(Compression::from_id(id as u16).ok_or_else(|| {
                    CodecError::Compression(format!("unknown algorithm {id:#04x}"))
                })?),
            };
            body = rest;
        }

        let limit = self.check_packet_limit.then_some(MAX_BATCH_PACKETS);
        match algorithm {
            None => split_slice(body, limit),
            Some(Compression::Flate) => {
                let reader = DeflateDecoder::new(body).take(MAX_DECOMPRESSED_LEN as u64);
                split_stream(reader, limit, initial_capacity_bound(body.len()))
            }
            Some(Compression::Snappy) => {
                let declared = snap::raw::decompress_len(body)
                    .map_err(|e| CodecError::Compression(format!("snappy: {e}")))?;
                if declared > MAX_DECOMPRESSED_LEN {
                    return Err(CodecError::Compression(format!(
                        "snappy: declared size {declared} exceeds {MAX_DECOMPRESSED_LEN}"
                    )));
                }
                let raw = snap::raw::Decoder::new()
                    .decompress_vec(body)
                    .map_err(|e| CodecError::Compression(format!("snappy: {e}")))?;
                split_slice(&raw, limit)
            }
        }
    }

    /// Joins `packets` into a single batch.
    pub fn encode<P: AsRef<[u8]>>(&self, packets: &[P]) -> Result<Vec<u8>, CodecError> {
        let mut raw = Vec::new();
        for p in packets {
            let p = p.as_ref();
            varint::put_varuint32(&mut raw, p.len() as u32);
            raw.extend_from_slice(p);
        }

        let mut out = Vec::with_capacity(raw.len() + 2);
        out.push(BATCH_HEADER);
        match self.compression {
            None => out.extend_from_slice(&raw),
            Some(c) => {
                if self.algorithm_prefix {
                    out.push(c.id() as u8);
                }
                out.extend_from_slice(&c.compress(&raw)?);
            }
        }
        Ok(out)
    }
}

fn initial_capacity_bound(input_len: usize) -> usize {
    input_len.saturating_mul(2).saturating_add(ALLOC_SLACK)
}

fn check_next(packets: usize, limit: Option<usize>, total: usize) -> Result<(), CodecError> {
    if let Some(max) = limit
        && packets >= max
    {
        return Err(CodecError::BatchTooLarge { max });
    }
    if total > MAX_DECOMPRESSED_LEN {
        return Err(CodecError::Compression(format!(
            "batch exceeds {MAX_DECOMPRESSED_LEN} bytes"
        )));
    }
    Ok(())
}

/// Splits an in-memory batch. A declared length is checked against the
/// bytes present before anything is copied.
fn split_slice(data: &[u8], limit: Option<usize>) -> Result<Vec<Bytes>, CodecError> {
    let mut packets = Vec::new();
    let mut total = 0usize;
    let mut rest = data;
    while let Some(len) = varint::read_varuint32_from(&mut rest)? {
        let len = len as usize;
        total += len;
        check_next(packets.len(), limit, total)?;
        if len > rest.len() {
            return Err(CodecError::Truncated { need: len });
        }
        let (body, tail) = rest.split_at(len);
        packets.push(Bytes::copy_from_slice(body));
        rest = tail;
    }
    Ok(packets)
}

/// Splits a decompressing stream. Buffers start at most `cap_bound` bytes
/// and only grow as decompressed bytes arrive.
fn split_stream<R: Read>(
    mut r: R,
    limit: Option<usize>,
    cap_bound: usize,
) -> Result<Vec<Bytes>, CodecError> {
    let mut packets = Vec::new();
    let mut total = 0usize;
    while let Some(len) = varint::read_varuint32_from(&mut r)? {
        let len = len as usize;
        total += len;
        check_next(packets.len(), limit, total)?;
        let buf = read_body(&mut r, len, cap_bound)?;
        packets.push(Bytes::from(buf));
    }
    Ok(packets)
}

fn body_buffer(len: usize, cap_bound: usize) -> Vec<u8> {
    Vec::with_capacity(len.min(cap_bound))
}

fn read_body<R: Read>(r: &mut R, len: usize, cap_bound: usize) -> Result<Vec<u8>, CodecError> {
    let mut buf = body_buffer(len, cap_bound);
    r.take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    if buf.len() < len {
        return Err(CodecError::Truncated { need: len });
    }
    Ok(buf)
}

/// Packed varuint32 in front of every packet body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: u32,
    pub sender_sub_client: u8,
    pub target_sub_client: u8,
}

impl PacketHeader {
    pub fn new(packet_id: u32) -> Self {
        Self {
            packet_id,
            ..Self::default()
        }
    }

    pub fn write(&self, w: &mut Writer) {
        w.write_varuint32(
            (self.packet_id & 0x3FF)
                | ((self.sender_sub_client as u32 & 0x3) << 10)
                | ((self.target_sub_client as u32 & 0x3) << 12),
        );
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let v = r.read_varuint32()?;
        Ok(Self {
            packet_id: v & 0x3FF,
            sender_sub_client: ((v >> 10) & 0x3) as u8,
            target_sub_client: ((v >> 12) & 0x3) as u8,
        })
    }
}

pub trait BedrockPacket: Sized {
    const ID: u32;

    fn marshal(&self, w: &mut Writer);
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Header and body, ready to be placed in a batch.
    fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        PacketHeader::new(Self::ID).write(&mut w);
        self.marshal(&mut w);
        w.into_inner()
    }
}

/// One packet taken out of a batch, keeping the raw bytes for forwarding.
#[derive(Debug, Clone)]
pub struct PacketData {
    pub header: PacketHeader,
    pub full: Bytes,
    body_offset: usize,
}

impl PacketData {
    pub fn parse(full: Bytes) -> Result<Self, CodecError> {
        let mut r = Reader::new(&full);
        let header = PacketHeader::read(&mut r)?;
        let body_offset = r.position();
        Ok(Self {
            header,
            full,
            body_offset,
        })
    }

    pub fn id(&self) -> u32 {
        self.header.packet_id
    }

    pub fn body(&self) -> &[u8] {
        &self.full[self.body_offset..]
    }

    pub fn decode<P: BedrockPacket>(&self) -> Result<P, CodecError> {
        if self.header.packet_id != P::ID {
            return Err(CodecError::UnexpectedPacketId {
                expected: P::ID as i32,
                got: self.header.packet_id as i32,
            });
        }
        P::unmarshal(&mut Reader::new(self.body()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestNetworkSettings {
    pub client_protocol: i32,
}

impl BedrockPacket for RequestNetworkSettings {
    const ID: u32 = ID_REQUEST_NETWORK_SETTINGS;

    fn marshal(&self, w: &mut Writer) {
        w.write_i32_be(self.client_protocol);
    }

    fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            client_protocol: r.read_i32_be()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSettings {
    pub compression_threshold: u16,
    pub compression: Compression,
    pub client_throttle: bool,
    pub client_throttle_threshold: u8,
    pub client_throttle_scalar: f32,
}

impl NetworkSettings {
    pub fn new(compression: Compression) -> Self {
        Self {
            compression_threshold: 1,
            compression,
            client_throttle: false,
            client_throttle_threshold: 0,
            client_throttle_scalar: 0.0,
        }
    }
}

impl BedrockPacket for NetworkSettings {
    const ID: u32 = ID_NETWORK_SETTINGS;

    fn marshal(&self, w: &mut Writer) {
        w.write_u16_le(self.compression_threshold);
        w.write_u16_le(self.compression.id());
        w.write_bool(self.client_throttle);
        w.write_u8(self.client_throttle_threshold);
        w.write_f32_le(self.client_throttle_scalar);
    }

    fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let compression_threshold = r.read_u16_le()?;
        let id = r.read_u16_le()?;
        let compression = Compression::from_id(id)
            .ok_or_else(|| CodecError::Compression(format!("unknown algorithm id {id}")))?;
        Ok(Self {
            compression_threshold,
            compression,
            client_throttle: r.read_bool()?,
            client_throttle_threshold: r.read_u8()?,
            client_throttle_scalar: r.read_f32_le()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub client_protocol: i32,
    pub connection_request: Bytes,
}

impl BedrockPacket for Login {
    const ID: u32 = ID_LOGIN;

    fn marshal(&self, w: &mut Writer) {
        w.write_i32_be(self.client_protocol);
        w.write_bedrock_bytes(&self.connection_request);
    }

    fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            client_protocol: r.read_i32_be()?,
            connection_request: Bytes::copy_from_slice(r.read_bedrock_bytes()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub hide_disconnection_screen: bool,
    pub message: String,
}

impl Disconnect {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            hide_disconnection_screen: false,
            message: message.into(),
        }
    }
}

impl BedrockPacket for Disconnect {
    const ID: u32 = ID_DISCONNECT;

    fn marshal(&self, w: &mut Writer) {
        w.write_bool(self.hide_disconnection_screen);
        if !self.hide_disconnection_screen {
            w.write_bedrock_string(&self.message);
        }
    }

    fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let hide_disconnection_screen = r.read_bool()?;
        let message = if hide_disconnection_screen {
            String::new()
        } else {
            r.read_bedrock_string()?
        };
        Ok(Self {
            hide_disconnection_screen,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(c: Option<Compression>, protocol: i32) -> BatchCodec {
        let mut codec = BatchCodec::new();
        if let Some(c) = c {
            codec.enable_compression(c, protocol);
        }
        codec
    }

    #[test]
    fn batches_survive_each_compression() {
        let packets = vec![
            RequestNetworkSettings {
                client_protocol: 630,
            }
            .to_bytes(),
            Disconnect::with_message("bye").to_bytes(),
        ];
        for (c, protocol) in [
            (None, 630),
            (Some(Compression::Flate), 630),
            (Some(Compression::Snappy), 630),
            (Some(Compression::Flate), 685),
            (Some(Compression::Snappy), 685),
        ] {
            let codec = codec(c, protocol);
            let raw = codec.encode(&packets).unwrap();
            assert_eq!(raw[0], BATCH_HEADER);
            let got = codec.decode(&raw).unwrap();
            assert_eq!(got.len(), 2, "{c:?}/{protocol}");
            assert_eq!(&got[0][..], &packets[0][..]);
            assert_eq!(&got[1][..], &packets[1][..]);
        }
    }

    #[test]
    fn prefixed_batch_may_be_uncompressed() {
        let codec = codec(Some(Compression::Flate), 700);
        let mut raw = vec![BATCH_HEADER, PREFIX_NONE];
        varint::put_varuint32(&mut raw, 2);
        raw.extend_from_slice(&[0x05, 0x01]);
        let got = codec.decode(&raw).unwrap();
        assert_eq!(got.len(), 1);
        let data = PacketData::parse(got[0].clone()).unwrap();
        let d: Disconnect = data.decode().unwrap();
        assert!(d.hide_disconnection_screen);
    }

    #[test]
    fn batch_of_800_packets_is_rejected() {
        let packets: Vec<Vec<u8>> = (0..800).map(|_| vec![0x00]).collect();
        for c in [None, Some(Compression::Flate), Some(Compression::Snappy)] {
            let raw = codec(c, 630).encode(&packets).unwrap();
            assert!(
                matches!(
                    codec(c, 630).decode(&raw),
                    Err(CodecError::BatchTooLarge { max: 768 })
                ),
                "{c:?}"
            );
            let ok = codec(c, 630).without_packet_limit().decode(&raw).unwrap();
            assert_eq!(ok.len(), 800);
        }
    }

    #[test]
    fn wrong_header_is_malformed() {
        assert!(matches!(
            BatchCodec::new().decode(&[0x00, 0x01]),
            Err(CodecError::MalformedFrame(_))
        ));
        assert!(BatchCodec::new().decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_payload_is_reported() {
        let mut raw = vec![BATCH_HEADER];
        varint::put_varuint32(&mut raw, 10);
        raw.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            BatchCodec::new().decode(&raw),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn huge_declared_length_in_a_tiny_batch_fails_fast() {
        let declared = MAX_DECOMPRESSED_LEN - 1;
        let mut raw = vec![BATCH_HEADER];
        varint::put_varuint32(&mut raw, declared as u32);
        raw.push(0xAA);
        assert_eq!(raw.len(), 6);
        assert!(matches!(
            BatchCodec::new().decode(&raw),
            Err(CodecError::Truncated { need }) if need == declared
        ));
    }

    #[test]
    fn huge_declared_length_in_a_tiny_flate_batch_fails_fast() {
        let declared = 4 * 1024 * 1024;
        let mut inner = Vec::new();
        varint::put_varuint32(&mut inner, declared as u32);
        inner.extend_from_slice(&[0xAA; 3]);
        let mut raw = vec![BATCH_HEADER];
        raw.extend_from_slice(&Compression::Flate.compress(&inner).unwrap());
        assert!(raw.len() < 32);

        let err = codec(Some(Compression::Flate), 630).decode(&raw).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { need } if need == declared));
    }

    #[test]
    fn packet_buffers_reserve_within_the_input_bound() {
        let bound = initial_capacity_bound(6);
        assert_eq!(bound, 2 * 6 + ALLOC_SLACK);
        assert!(body_buffer(MAX_DECOMPRESSED_LEN - 1, bound).capacity() <= bound);
        assert_eq!(body_buffer(10, bound).capacity(), 10);

        let data = vec![7u8; 3 * ALLOC_SLACK];
        let body = read_body(&mut data.as_slice(), data.len(), ALLOC_SLACK).unwrap();
        assert_eq!(body, data);
        assert!(matches!(
            read_body(&mut &data[..5], 6, ALLOC_SLACK),
            Err(CodecError::Truncated { need: 6 })
        ));
    }

    #[test]
    fn header_packs_sub_client_ids() {
        let h = PacketHeader {
            packet_id: 0x8F,
            sender_sub_client: 1,
            target_sub_client: 2,
        };
        let mut w = Writer::new();
        h.write(&mut w);
        let buf = w.into_inner();
        assert_eq!(PacketHeader::read(&mut Reader::new(&buf)).unwrap(), h);
    }

    #[test]
    fn network_settings_round_trip() {
        let ns = NetworkSettings::new(Compression::Snappy);
        let data = PacketData::parse(Bytes::from(ns.to_bytes())).unwrap();
        assert_eq!(data.id(), ID_NETWORK_SETTINGS);
        assert_eq!(data.decode::<NetworkSettings>().unwrap(), ns);
        assert!(matches!(
            data.decode::<Login>(),
            Err(CodecError::UnexpectedPacketId { .. })
        ));
    }
}
