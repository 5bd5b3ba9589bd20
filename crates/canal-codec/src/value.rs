use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("rlp: {0}")]
    Rlp(#[from] DecoderError),

    #[error("trailing bytes after value")]
    TrailingBytes,

    #[error("expected byte string, found list")]
    ExpectedBytes,

    #[error("expected list, found byte string")]
    ExpectedList,

    #[error("integer wider than 128 bits")]
    IntegerTooWide,

    #[error("non-canonical integer (leading zero byte)")]
    LeadingZero,

    #[error("invalid sign byte: {0}")]
    InvalidSign(u8),

    #[error("non-canonical signed zero (sign byte 1 with zero magnitude)")]
    NegativeZero,

    #[error("signed pair must have exactly two elements, got {0}")]
    SignedPairArity(usize),
}

/// A recursive byte-list value: the single canonical building block for
/// everything this workspace hashes or puts on a wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(items)
    }

    /// Non-negative integer: big-endian bytes with leading zeros stripped.
    /// Zero encodes as the empty byte string.
    pub fn uint(n: u128) -> Self {
        let be = n.to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count();
        Value::Bytes(be[skip..].to_vec())
    }

    /// Signed integer as the pair `[sign, abs]` with sign 0 for >= 0 and
    /// 1 for < 0.
    pub fn sint(n: i128) -> Self {
        let sign = if n < 0 { 1 } else { 0 };
        Value::List(vec![Value::uint(sign), Value::uint(n.unsigned_abs())])
    }

    pub fn as_bytes(&self) -> Result<&[u8], CodecError> {
        match self {
            Value::Bytes(b) => Ok(b),
            Value::List(_) => Err(CodecError::ExpectedBytes),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], CodecError> {
        match self {
            Value::Bytes(_) => Err(CodecError::ExpectedList),
            Value::List(items) => Ok(items),
        }
    }

    pub fn as_uint(&self) -> Result<u128, CodecError> {
        let b = self.as_bytes()?;
        if b.len() > 16 {
            return Err(CodecError::IntegerTooWide);
        }
        if b.first() == Some(&0) {
            return Err(CodecError::LeadingZero);
        }
        let mut n: u128 = 0;
        for byte in b {
            n = (n << 8) | u128::from(*byte);
        }
        Ok(n)
    }

    pub fn as_sint(&self) -> Result<i128, CodecError> {
        let pair = self.as_list()?;
        if pair.len() != 2 {
            return Err(CodecError::SignedPairArity(pair.len()));
        }
        let sign = pair[0].as_uint()?;
        let abs = pair[1].as_uint()?;
        match sign {
            0 => i128::try_from(abs).map_err(|_| CodecError::IntegerTooWide),
            1 => {
                // Zero carries sign byte 0; accepting `-0` would give it a
                // second encoding.
                if abs == 0 {
                    return Err(CodecError::NegativeZero);
                }
                // i128::MIN has no positive counterpart; handle it exactly.
                if abs == i128::MAX as u128 + 1 {
                    Ok(i128::MIN)
                } else {
                    let v = i128::try_from(abs).map_err(|_| CodecError::IntegerTooWide)?;
                    Ok(-v)
                }
            }
            s => Err(CodecError::InvalidSign(s as u8)),
        }
    }

    /// Canonical binary encoding.
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Decode a value, requiring the input to be consumed exactly.
    pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
        let rlp = Rlp::new(bytes);
        let value = <Value as Decodable>::decode(&rlp)?;
        let info = rlp.payload_info()?;
        if info.header_len + info.value_len != bytes.len() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(value)
    }
}

impl Encodable for Value {
    fn rlp_append(&self, s: &mut RlpStream) {
        match self {
            Value::Bytes(b) => {
                s.append(b);
            }
            Value::List(items) => {
                s.begin_list(items.len());
                for item in items {
                    s.append(item);
                }
            }
        }
    }
}

impl Decodable for Value {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.is_list() {
            let mut items = Vec::with_capacity(rlp.item_count()?);
            for item in rlp.iter() {
                items.push(<Value as Decodable>::decode(&item)?);
            }
            Ok(Value::List(items))
        } else {
            Ok(Value::Bytes(rlp.data()?.to_vec()))
        }
    }
}
