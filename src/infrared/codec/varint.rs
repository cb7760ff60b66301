use std::io::Read;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::CodecError;

pub const MAX_VARINT_LEN: usize = 5;

/// Number of bytes `v` occupies as a varint. Negative values always take five.
pub fn varint_len(v: i32) -> usize {
    let mut n = v as u32;
    let mut len = 1;
    while n >= 0x80 {
        n >>= 7;
        len += 1;
    }
    len
}

pub fn put_varint(out: &mut Vec<u8>, v: i32) {
    put_varuint32(out, v as u32);
}

pub fn put_varuint32(out: &mut Vec<u8>, mut v: u32) {
    loop {
        let mut temp = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            temp |= 0x80;
        }
        out.push(temp);
        if v == 0 {
            break;
        }
    }
}

/// Decodes a varint from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the varint terminates.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(i32, usize)>, CodecError> {
    Ok(decode_varuint32(buf)?.map(|(v, n)| (v as i32, n)))
}

pub fn decode_varuint32(buf: &[u8]) -> Result<Option<(u32, usize)>, CodecError> {
    let mut result: u32 = 0;
    for (i, &read) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(CodecError::VarintTooLong);
        }
        result |= ((read & 0x7F) as u32) << (7 * i);
        if (read & 0x80) == 0 {
            return Ok(Some((result, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(CodecError::VarintTooLong);
    }
    Ok(None)
}

/// Reads a varuint32 from a blocking reader (used over decompressed batch data).
///
/// Returns `Ok(None)` on a clean end of input before the first byte.
pub fn read_varuint32_from<R: Read>(r: &mut R) -> Result<Option<u32>, CodecError> {
    let mut result: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut b = [0u8; 1];
        let n = r
            .read(&mut b)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(CodecError::Truncated { need: 1 });
        }
        result |= ((b[0] & 0x7F) as u32) << (7 * i);
        if (b[0] & 0x80) == 0 {
            return Ok(Some(result));
        }
    }
    Err(CodecError::VarintTooLong)
}

/// Reads a varint from an async stream, returning the value and its raw bytes.
pub async fn read_varint<R>(r: &mut R) -> Result<(i32, usize), CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut result: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let read = r.read_u8().await?;
        result |= ((read & 0x7F) as u32) << (7 * i);
        if (read & 0x80) == 0 {
            return Ok((result as i32, i + 1));
        }
    }
    Err(CodecError::VarintTooLong)
}
