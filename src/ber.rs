// BER (ASN.1) codec for the SNMPv2c subset

//! Minimal BER encoder/decoder
//!
//! Implements exactly the subset of ASN.1 BER that SNMPv2c community
//! messages need: definite-length TLVs, INTEGER, OCTET STRING, NULL,
//! OBJECT IDENTIFIER, SEQUENCE, the SNMP application types (IpAddress,
//! Counter32, Gauge32, TimeTicks, Counter64) and the v2c exception
//! markers (noSuchObject, noSuchInstance, endOfMibView).

use anyhow::{bail, Result};

/// Universal tag: INTEGER
pub const TAG_INTEGER: u8 = 0x02;
/// Universal tag: OCTET STRING
pub const TAG_OCTET_STRING: u8 = 0x04;
/// Universal tag: NULL
pub const TAG_NULL: u8 = 0x05;
/// Universal tag: OBJECT IDENTIFIER
pub const TAG_OID: u8 = 0x06;
/// Universal constructed tag: SEQUENCE
pub const TAG_SEQUENCE: u8 = 0x30;

/// A decoded SNMP varbind value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// INTEGER
    Integer(i64),
    /// OCTET STRING
    OctetString(Vec<u8>),
    /// NULL
    Null,
    /// OBJECT IDENTIFIER
    Oid(Vec<u32>),
    /// IpAddress (application 0)
    IpAddress([u8; 4]),
    /// Counter32 / Gauge32 / TimeTicks / Counter64 collapse into one
    /// unsigned bucket; the distinction does not matter for FDB walks
    Unsigned(u64),
    /// noSuchObject exception
    NoSuchObject,
    /// noSuchInstance exception
    NoSuchInstance,
    /// endOfMibView exception
    EndOfMibView,
}

impl Value {
    /// The value as an integer, if it is one (signed or unsigned).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// The value as raw bytes, if it is an OCTET STRING.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::OctetString(b) => Some(b),
            _ => None,
        }
    }

    /// Whether this value is one of the v2c end-of-data exceptions.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView
        )
    }
}

// --- Encoding ---

/// Append a definite BER length.
pub fn write_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let significant = &bytes[skip..];
        buf.push(0x80 | significant.len() as u8);
        buf.extend_from_slice(significant);
    }
}

/// Append a TLV with the given tag and already-encoded content.
pub fn write_tlv(buf: &mut Vec<u8>, tag: u8, content: &[u8]) {
    buf.push(tag);
    write_length(buf, content.len());
    buf.extend_from_slice(content);
}

/// Append an INTEGER in minimal two's-complement form.
pub fn write_integer(buf: &mut Vec<u8>, value: i64) {
    let bytes = value.to_be_bytes();
    // Drop redundant leading bytes while the sign bit stays intact
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        if (cur == 0x00 && next & 0x80 == 0) || (cur == 0xff && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    write_tlv(buf, TAG_INTEGER, &bytes[start..]);
}

/// Append an OCTET STRING.
pub fn write_octet_string(buf: &mut Vec<u8>, data: &[u8]) {
    write_tlv(buf, TAG_OCTET_STRING, data);
}

/// Append a NULL.
pub fn write_null(buf: &mut Vec<u8>) {
    buf.push(TAG_NULL);
    buf.push(0x00);
}

/// Append an OBJECT IDENTIFIER.
pub fn write_oid(buf: &mut Vec<u8>, oid: &[u32]) -> Result<()> {
    if oid.len() < 2 || oid[0] > 2 || (oid[0] < 2 && oid[1] > 39) {
        bail!("Invalid OID: {oid:?}");
    }
    let mut content = Vec::new();
    content.push((oid[0] * 40 + oid[1]) as u8);
    for &arc in &oid[2..] {
        write_base128(&mut content, arc);
    }
    write_tlv(buf, TAG_OID, &content);
    Ok(())
}

fn write_base128(buf: &mut Vec<u8>, value: u32) {
    if value < 0x80 {
        buf.push(value as u8);
        return;
    }
    let mut parts = [0u8; 5];
    let mut n = 0;
    let mut v = value;
    while v > 0 {
        parts[n] = (v & 0x7f) as u8;
        v >>= 7;
        n += 1;
    }
    for i in (0..n).rev() {
        let mut byte = parts[i];
        if i != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
    }
}

// --- Decoding ---

/// Cursor over a BER-encoded byte slice.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Wrap a byte slice for reading.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Whether all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            bail!("BER: truncated input");
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one TLV, returning the tag and its content bytes.
    pub fn read_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.take(1)?[0];
        let first = self.take(1)?[0];
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let n = (first & 0x7f) as usize;
            if n == 0 || n > 4 {
                bail!("BER: unsupported length of length {n}");
            }
            let mut len = 0usize;
            for &b in self.take(n)? {
                len = (len << 8) | b as usize;
            }
            len
        };
        Ok((tag, self.take(len)?))
    }

    /// Read a TLV and require the given tag.
    pub fn expect_tlv(&mut self, expected: u8) -> Result<&'a [u8]> {
        let (tag, content) = self.read_tlv()?;
        if tag != expected {
            bail!("BER: expected tag {expected:#04x}, got {tag:#04x}");
        }
        Ok(content)
    }

    /// Read an INTEGER.
    pub fn read_integer(&mut self) -> Result<i64> {
        let content = self.expect_tlv(TAG_INTEGER)?;
        decode_signed(content)
    }

    /// Read one varbind value of any supported type.
    pub fn read_value(&mut self) -> Result<Value> {
        let (tag, content) = self.read_tlv()?;
        decode_value(tag, content)
    }
}

fn decode_signed(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        bail!("BER: bad integer length {}", content.len());
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        value = (value << 8) | b as i64;
    }
    Ok(value)
}

fn decode_unsigned(content: &[u8]) -> Result<u64> {
    let trimmed = if content.first() == Some(&0x00) {
        &content[1..]
    } else {
        content
    };
    if trimmed.len() > 8 {
        bail!("BER: bad unsigned length {}", content.len());
    }
    let mut value: u64 = 0;
    for &b in trimmed {
        value = (value << 8) | b as u64;
    }
    Ok(value)
}

/// Decode an OBJECT IDENTIFIER content into its arcs.
pub fn decode_oid(content: &[u8]) -> Result<Vec<u32>> {
    if content.is_empty() {
        bail!("BER: empty OID");
    }
    let first = content[0] as u32;
    let mut oid = if first < 80 {
        vec![first / 40, first % 40]
    } else {
        vec![2, first - 80]
    };
    let mut arc: u32 = 0;
    let mut in_arc = false;
    for &b in &content[1..] {
        arc = arc
            .checked_shl(7)
            .and_then(|a| a.checked_add((b & 0x7f) as u32))
            .ok_or_else(|| anyhow::anyhow!("BER: OID arc overflow"))?;
        in_arc = true;
        if b & 0x80 == 0 {
            oid.push(arc);
            arc = 0;
            in_arc = false;
        }
    }
    if in_arc {
        bail!("BER: truncated OID arc");
    }
    Ok(oid)
}

fn decode_value(tag: u8, content: &[u8]) -> Result<Value> {
    match tag {
        TAG_INTEGER => Ok(Value::Integer(decode_signed(content)?)),
        TAG_OCTET_STRING => Ok(Value::OctetString(content.to_vec())),
        TAG_NULL => Ok(Value::Null),
        TAG_OID => Ok(Value::Oid(decode_oid(content)?)),
        // Application types
        0x40 => {
            if content.len() != 4 {
                bail!("BER: bad IpAddress length {}", content.len());
            }
            Ok(Value::IpAddress([content[0], content[1], content[2], content[3]]))
        }
        0x41 | 0x42 | 0x43 | 0x46 => Ok(Value::Unsigned(decode_unsigned(content)?)),
        // v2c exceptions (context class, primitive)
        0x80 => Ok(Value::NoSuchObject),
        0x81 => Ok(Value::NoSuchInstance),
        0x82 => Ok(Value::EndOfMibView),
        other => bail!("BER: unsupported value tag {other:#04x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_oid(oid: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_oid(&mut buf, oid).unwrap();
        buf
    }

    #[test]
    fn test_length_short_and_long_form() {
        let mut buf = Vec::new();
        write_length(&mut buf, 5);
        assert_eq!(buf, [0x05]);

        let mut buf = Vec::new();
        write_length(&mut buf, 0x81);
        assert_eq!(buf, [0x81, 0x81]);

        let mut buf = Vec::new();
        write_length(&mut buf, 0x1234);
        assert_eq!(buf, [0x82, 0x12, 0x34]);
    }

    #[test]
    fn test_integer_roundtrip() {
        for value in [0i64, 1, 127, 128, 255, 256, -1, -128, -129, 50_000, i64::MAX, i64::MIN] {
            let mut buf = Vec::new();
            write_integer(&mut buf, value);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_integer().unwrap(), value, "value {value}");
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_integer_minimal_encoding() {
        let mut buf = Vec::new();
        write_integer(&mut buf, 127);
        assert_eq!(buf, [0x02, 0x01, 0x7f]);

        let mut buf = Vec::new();
        write_integer(&mut buf, 128);
        // 128 needs a leading zero to stay positive
        assert_eq!(buf, [0x02, 0x02, 0x00, 0x80]);

        let mut buf = Vec::new();
        write_integer(&mut buf, -1);
        assert_eq!(buf, [0x02, 0x01, 0xff]);
    }

    #[test]
    fn test_oid_roundtrip() {
        for oid in [
            vec![1, 3, 6, 1, 2, 1, 17, 7, 1, 2, 2, 1, 2],
            vec![1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 1],
            vec![1, 3, 6, 1, 4, 1, 9, 9, 23],
            vec![1, 3, 6, 1, 2, 1, 17, 7, 1, 2, 2, 1, 2, 100, 0, 17, 34, 51, 68, 85],
        ] {
            let buf = encode_oid(&oid);
            let mut reader = Reader::new(&buf);
            let content = reader.expect_tlv(TAG_OID).unwrap();
            assert_eq!(decode_oid(content).unwrap(), oid);
        }
    }

    #[test]
    fn test_oid_large_arc() {
        // 8802 (LLDP) needs two base-128 bytes
        let oid = vec![1, 0, 8802, 1, 1, 2];
        let buf = encode_oid(&oid);
        let mut reader = Reader::new(&buf);
        let content = reader.expect_tlv(TAG_OID).unwrap();
        assert_eq!(decode_oid(content).unwrap(), oid);
    }

    #[test]
    fn test_octet_string_roundtrip() {
        let mut buf = Vec::new();
        write_octet_string(&mut buf, b"public");
        let mut reader = Reader::new(&buf);
        assert_eq!(
            reader.read_value().unwrap(),
            Value::OctetString(b"public".to_vec())
        );
    }

    #[test]
    fn test_decode_exceptions() {
        for (tag, expected) in [
            (0x80u8, Value::NoSuchObject),
            (0x81, Value::NoSuchInstance),
            (0x82, Value::EndOfMibView),
        ] {
            let buf = vec![tag, 0x00];
            let mut reader = Reader::new(&buf);
            let value = reader.read_value().unwrap();
            assert_eq!(value, expected);
            assert!(value.is_exception());
        }
    }

    #[test]
    fn test_decode_unsigned_counters() {
        // Counter32 with high bit set: 0xFFFFFFFF
        let buf = vec![0x41, 0x05, 0x00, 0xff, 0xff, 0xff, 0xff];
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_value().unwrap(), Value::Unsigned(0xFFFF_FFFF));
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut reader = Reader::new(&[0x02, 0x04, 0x01]);
        assert!(reader.read_integer().is_err());

        let mut reader = Reader::new(&[0x02]);
        assert!(reader.read_integer().is_err());
    }

    #[test]
    fn test_reject_indefinite_length() {
        // 0x80 length byte = indefinite form, not allowed in SNMP
        let mut reader = Reader::new(&[0x30, 0x80, 0x00, 0x00]);
        assert!(reader.read_tlv().is_err());
    }
}
