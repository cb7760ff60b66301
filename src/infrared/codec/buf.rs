use super::{
    CodecError,
    varint::{decode_varint, decode_varuint32, put_varint, put_varuint32},
};

/// Cursor over a byte slice. Every read advances the cursor or fails with
/// `Truncated` without consuming anything.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                need: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_be(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64_be(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_uuid(&mut self) -> Result<u128, CodecError> {
        Ok(u128::from_be_bytes(self.read_array()?))
    }

    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        match decode_varint(self.rest())? {
            Some((v, n)) => {
                self.pos += n;
                Ok(v)
            }
            None => Err(CodecError::Truncated { need: 1 }),
        }
    }

    pub fn read_varuint32(&mut self) -> Result<u32, CodecError> {
        match decode_varuint32(self.rest())? {
            Some((v, n)) => {
                self.pos += n;
                Ok(v)
            }
            None => Err(CodecError::Truncated { need: 1 }),
        }
    }

    /// Java string: varint byte length, UTF-8 bytes, at most `max_chars` characters.
    pub fn read_string(&mut self, max_chars: usize) -> Result<String, CodecError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(CodecError::InvalidString(format!("negative length {len}")));
        }
        let len = len as usize;
        if len > max_chars * 4 {
            return Err(CodecError::InvalidString(format!(
                "length {len} exceeds {max_chars} characters"
            )));
        }
        let raw = self.read_bytes(len)?;
        let s = std::str::from_utf8(raw)
            .map_err(|e| CodecError::InvalidString(e.to_string()))?;
        if s.chars().count() > max_chars {
            return Err(CodecError::InvalidString(format!(
                "more than {max_chars} characters"
            )));
        }
        Ok(s.to_string())
    }

    /// Bedrock string: varuint32 byte length, UTF-8 bytes.
    pub fn read_bedrock_string(&mut self) -> Result<String, CodecError> {
        let raw = self.read_bedrock_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|e| CodecError::InvalidString(e.to_string()))
    }

    /// Byte array with a varint length prefix (Java).
    pub fn read_byte_array(&mut self, max_len: usize) -> Result<&'a [u8], CodecError> {
        let len = self.read_varint()?;
        if len < 0 || len as usize > max_len {
            return Err(CodecError::MalformedFrame(format!(
                "byte array length {len} out of range"
            )));
        }
        self.read_bytes(len as usize)
    }

    /// Byte slice with a varuint32 length prefix (Bedrock).
    pub fn read_bedrock_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_varuint32()? as usize;
        self.read_bytes(len)
    }
}

/// Growable output buffer mirroring [`Reader`].
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32_be(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i32_le(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64_be(&mut self, v: i64) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f32_le(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_uuid(&mut self, v: u128) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_varint(&mut self, v: i32) {
        put_varint(&mut self.buf, v);
    }

    pub fn write_varuint32(&mut self, v: u32) {
        put_varuint32(&mut self.buf, v);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_varint(s.len() as i32);
        self.write_bytes(s.as_bytes());
    }

    pub fn write_bedrock_string(&mut self, s: &str) {
        self.write_bedrock_bytes(s.as_bytes());
    }

    pub fn write_byte_array(&mut self, b: &[u8]) {
        self.write_varint(b.len() as i32);
        self.write_bytes(b);
    }

    pub fn write_bedrock_bytes(&mut self, b: &[u8]) {
        self.write_varuint32(b.len() as u32);
        self.write_bytes(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut w = Writer::new();
        w.write_u8(7);
        w.write_bool(true);
        w.write_u16_be(25565);
        w.write_u16_le(512);
        w.write_i32_be(-42);
        w.write_i32_le(i32::MIN);
        w.write_i64_be(0xCAFE_BABE);
        w.write_f32_le(0.5);
        w.write_uuid(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        w.write_varint(-1);
        w.write_string("mc.example.com");
        w.write_byte_array(&[1, 2, 3]);
        w.write_bedrock_string("Steve");

        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u16_be().unwrap(), 25565);
        assert_eq!(r.read_u16_le().unwrap(), 512);
        assert_eq!(r.read_i32_be().unwrap(), -42);
        assert_eq!(r.read_i32_le().unwrap(), i32::MIN);
        assert_eq!(r.read_i64_be().unwrap(), 0xCAFE_BABE);
        assert_eq!(r.read_f32_le().unwrap(), 0.5);
        assert_eq!(
            r.read_uuid().unwrap(),
            0x0123_4567_89ab_cdef_0123_4567_89ab_cdef
        );
        assert_eq!(r.read_varint().unwrap(), -1);
        assert_eq!(r.read_string(255).unwrap(), "mc.example.com");
        assert_eq!(r.read_byte_array(16).unwrap(), &[1, 2, 3]);
        assert_eq!(r.read_bedrock_string().unwrap(), "Steve");
        assert!(r.is_empty());
    }

    #[test]
    fn max_length_string_round_trips() {
        let s = "a".repeat(32767);
        let mut w = Writer::new();
        w.write_string(&s);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string(32767).unwrap(), s);
    }

    #[test]
    fn short_buffer_is_truncated_and_not_consumed() {
        let buf = [0x00, 0x01];
        let mut r = Reader::new(&buf);
        assert!(matches!(
            r.read_i32_be(),
            Err(CodecError::Truncated { need: 2 })
        ));
        assert_eq!(r.position(), 0);
        assert_eq!(r.read_u16_be().unwrap(), 1);
    }

    #[test]
    fn string_longer_than_limit_is_rejected() {
        let mut w = Writer::new();
        w.write_string("Notch_is_a_very_long_name");
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        assert!(matches!(
            r.read_string(16),
            Err(CodecError::InvalidString(_))
        ));
    }

    #[test]
    fn string_length_past_end_is_truncated() {
        let buf = [0x05, b'a', b'b'];
        let mut r = Reader::new(&buf);
        assert!(matches!(
            r.read_string(16),
            Err(CodecError::Truncated { need: 3 })
        ));
    }
}
