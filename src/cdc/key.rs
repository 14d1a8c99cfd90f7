// ABOUTME: Order-preserving encoding of primary-key tuples into comparable byte keys
// ABOUTME: Byte-wise comparison of two encodings matches comparison of the encoded values

use anyhow::{anyhow, bail, Result};

use super::batch::Value;
use super::timestamp::Timestamp;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TIMESTAMP: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

const SIGN_BIT: u64 = 1 << 63;

/// Encode a tuple of values into one comparable byte key.
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 9);
    for value in values {
        encode_value(value, &mut out);
    }
    out
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&((*i as u64) ^ SIGN_BIT).to_be_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            let bits = f.to_bits();
            let ordered = if bits & SIGN_BIT != 0 {
                !bits
            } else {
                bits ^ SIGN_BIT
            };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        Value::Timestamp(ts) => {
            out.push(TAG_TIMESTAMP);
            out.extend_from_slice(&((ts.physical() as u64) ^ SIGN_BIT).to_be_bytes());
            out.extend_from_slice(&ts.logical().to_be_bytes());
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            encode_escaped(s.as_bytes(), out);
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            encode_escaped(b, out);
        }
    }
}

fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPED_ZERO);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

/// Decode a key produced by [`encode_key`] back into its values.
pub fn decode_key(mut input: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    while let Some((&tag, rest)) = input.split_first() {
        input = rest;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_BOOL => {
                let (b, rest) = take(input, 1)?;
                input = rest;
                Value::Bool(b[0] != 0)
            }
            TAG_INT => {
                let (raw, rest) = take_u64(input)?;
                input = rest;
                Value::Int((raw ^ SIGN_BIT) as i64)
            }
            TAG_FLOAT => {
                let (raw, rest) = take_u64(input)?;
                input = rest;
                let bits = if raw & SIGN_BIT != 0 {
                    raw ^ SIGN_BIT
                } else {
                    !raw
                };
                Value::Float(f64::from_bits(bits))
            }
            TAG_TIMESTAMP => {
                let (physical, rest) = take_u64(input)?;
                let (logical, rest) = take(rest, 4)?;
                input = rest;
                let logical = u32::from_be_bytes([logical[0], logical[1], logical[2], logical[3]]);
                Value::Timestamp(Timestamp::new((physical ^ SIGN_BIT) as i64, logical))
            }
            TAG_TEXT => {
                let (bytes, rest) = decode_escaped(input)?;
                input = rest;
                let text = String::from_utf8(bytes)
                    .map_err(|e| anyhow!("encoded key holds invalid utf-8 text: {}", e))?;
                Value::Text(text)
            }
            TAG_BYTES => {
                let (bytes, rest) = decode_escaped(input)?;
                input = rest;
                Value::Bytes(bytes)
            }
            other => bail!("unknown tag 0x{:02x} in encoded key", other),
        };
        values.push(value);
    }
    Ok(values)
}

fn take(input: &[u8], n: usize) -> Result<(&[u8], &[u8])> {
    if input.len() < n {
        bail!(
            "encoded key truncated: need {} bytes, {} left",
            n,
            input.len()
        );
    }
    Ok(input.split_at(n))
}

fn take_u64(input: &[u8]) -> Result<(u64, &[u8])> {
    let (raw, rest) = take(input, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok((u64::from_be_bytes(buf), rest))
}

fn decode_escaped(mut input: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    loop {
        let (&b, rest) = input
            .split_first()
            .ok_or_else(|| anyhow!("encoded key truncated inside a string"))?;
        input = rest;
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        let (&marker, rest) = input
            .split_first()
            .ok_or_else(|| anyhow!("encoded key truncated after escape byte"))?;
        input = rest;
        match marker {
            ESCAPED_ZERO => out.push(ESCAPE),
            TERMINATOR => return Ok((out, input)),
            other => bail!("invalid escape sequence 0x00 0x{:02x} in encoded key", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: Value) -> Vec<u8> {
        encode_key(&[v])
    }

    #[test]
    fn test_int_order() {
        let values = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        for pair in values.windows(2) {
            assert!(enc(Value::Int(pair[0])) < enc(Value::Int(pair[1])));
        }
    }

    #[test]
    fn test_float_order() {
        let values = [-1e9, -2.5, -0.0, 0.0, 1.5, 1e12];
        for pair in values.windows(2) {
            assert!(enc(Value::Float(pair[0])) <= enc(Value::Float(pair[1])));
        }
    }

    #[test]
    fn test_text_order_with_prefixes_and_zero_bytes() {
        assert!(enc(Value::from("a")) < enc(Value::from("a\0")));
        assert!(enc(Value::from("a\0")) < enc(Value::from("ab")));
        assert!(enc(Value::from("ab")) < enc(Value::from("b")));
        assert!(enc(Value::from("")) < enc(Value::from("a")));
    }

    #[test]
    fn test_composite_order_is_lexicographic() {
        let a = encode_key(&[Value::Int(1), Value::from("z")]);
        let b = encode_key(&[Value::Int(2), Value::from("a")]);
        let c = encode_key(&[Value::Int(2), Value::from("b")]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_decode_composite() {
        let values = vec![
            Value::Int(-7),
            Value::from("order\0-1"),
            Value::Bytes(vec![0, 1, 0xFF]),
            Value::Bool(true),
            Value::Null,
            Value::Float(-3.25),
            Value::Timestamp(Timestamp::new(99, 4)),
        ];
        let decoded = decode_key(&encode_key(&values)).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let mut key = encode_key(&[Value::Int(5)]);
        key.pop();
        assert!(decode_key(&key).is_err());
        assert!(decode_key(&[TAG_TEXT, b'a']).is_err());
        assert!(decode_key(&[0x7F]).is_err());
    }
}
