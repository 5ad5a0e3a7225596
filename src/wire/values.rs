//! Value codec seam: parameter encoding and result decoding.
//!
//! Scalars are self-describing on the wire: a one-byte type tag followed by
//! the payload. Parameters and result cells share the same encoding, so the
//! whole value layout lives in this one module and the rest of the driver is
//! oblivious to it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{Error, Result};

/// Wire type tags.
pub const TAG_NULL: u8 = 0;
pub const TAG_BOOL: u8 = 1;
pub const TAG_I8: u8 = 2;
pub const TAG_I16: u8 = 3;
pub const TAG_I32: u8 = 4;
pub const TAG_I64: u8 = 5;
pub const TAG_F64: u8 = 6;
pub const TAG_STRING: u8 = 7;
pub const TAG_VARBINARY: u8 = 8;

/// Longest string or varbinary accepted as a single value.
pub const MAX_VALUE_BYTES: usize = u32::MAX as usize;

fn put_len_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > MAX_VALUE_BYTES {
        return Err(Error::bad_argument(format!(
            "value too large: {} bytes",
            data.len()
        )));
    }
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    Ok(())
}

fn short_frame() -> Error {
    Error::transport_lost("malformed value: payload truncated")
}

fn get_len_prefixed(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(short_frame());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(short_frame());
    }
    Ok(buf.split_to(len))
}

/// A single dynamically-typed wire value. Result cells decode into this; it
/// also backs the type-erased parameter list for long arities.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Bytes),
}

impl ScalarValue {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            ScalarValue::Null => buf.put_u8(TAG_NULL),
            ScalarValue::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*v));
            }
            ScalarValue::I8(v) => {
                buf.put_u8(TAG_I8);
                buf.put_i8(*v);
            }
            ScalarValue::I16(v) => {
                buf.put_u8(TAG_I16);
                buf.put_i16(*v);
            }
            ScalarValue::I32(v) => {
                buf.put_u8(TAG_I32);
                buf.put_i32(*v);
            }
            ScalarValue::I64(v) => {
                buf.put_u8(TAG_I64);
                buf.put_i64(*v);
            }
            ScalarValue::F64(v) => {
                buf.put_u8(TAG_F64);
                buf.put_f64(*v);
            }
            ScalarValue::Str(v) => {
                buf.put_u8(TAG_STRING);
                put_len_prefixed(buf, v.as_bytes())?;
            }
            ScalarValue::Bytes(v) => {
                buf.put_u8(TAG_VARBINARY);
                put_len_prefixed(buf, v)?;
            }
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(short_frame());
        }
        let tag = buf.get_u8();
        let value = match tag {
            TAG_NULL => ScalarValue::Null,
            TAG_BOOL => {
                if !buf.has_remaining() {
                    return Err(short_frame());
                }
                ScalarValue::Bool(buf.get_u8() != 0)
            }
            TAG_I8 => {
                if !buf.has_remaining() {
                    return Err(short_frame());
                }
                ScalarValue::I8(buf.get_i8())
            }
            TAG_I16 => {
                if buf.remaining() < 2 {
                    return Err(short_frame());
                }
                ScalarValue::I16(buf.get_i16())
            }
            TAG_I32 => {
                if buf.remaining() < 4 {
                    return Err(short_frame());
                }
                ScalarValue::I32(buf.get_i32())
            }
            TAG_I64 => {
                if buf.remaining() < 8 {
                    return Err(short_frame());
                }
                ScalarValue::I64(buf.get_i64())
            }
            TAG_F64 => {
                if buf.remaining() < 8 {
                    return Err(short_frame());
                }
                ScalarValue::F64(buf.get_f64())
            }
            TAG_STRING => {
                let raw = get_len_prefixed(buf)?;
                let s = std::str::from_utf8(&raw)
                    .map_err(|_| Error::transport_lost("malformed value: invalid UTF-8"))?;
                ScalarValue::Str(s.to_string())
            }
            TAG_VARBINARY => ScalarValue::Bytes(get_len_prefixed(buf)?),
            other => {
                return Err(Error::transport_lost(format!(
                    "malformed value: unknown type tag 0x{:02X}",
                    other
                )));
            }
        };
        Ok(value)
    }
}

/// Types that can travel as a procedure parameter.
pub trait WireValue {
    fn encode(&self, buf: &mut BytesMut) -> Result<()>;
}

macro_rules! scalar_wire_value {
    ($ty:ty, $variant:ident) => {
        impl WireValue for $ty {
            fn encode(&self, buf: &mut BytesMut) -> Result<()> {
                ScalarValue::$variant(*self).encode(buf)
            }
        }
    };
}

scalar_wire_value!(bool, Bool);
scalar_wire_value!(i8, I8);
scalar_wire_value!(i16, I16);
scalar_wire_value!(i32, I32);
scalar_wire_value!(i64, I64);
scalar_wire_value!(f64, F64);

impl WireValue for &str {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(TAG_STRING);
        put_len_prefixed(buf, self.as_bytes())
    }
}

impl WireValue for String {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.as_str().encode(buf)
    }
}

impl WireValue for &[u8] {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(TAG_VARBINARY);
        put_len_prefixed(buf, self)
    }
}

impl WireValue for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.as_slice().encode(buf)
    }
}

impl WireValue for ScalarValue {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        ScalarValue::encode(self, buf)
    }
}

// Null-coalescing: absent optionals travel as typed nulls.
impl<T: WireValue> WireValue for Option<T> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Some(v) => v.encode(buf),
            None => {
                buf.put_u8(TAG_NULL);
                Ok(())
            }
        }
    }
}

/// An ordered parameter list. Implemented for tuples of arity 0..=16 and for
/// `Vec<ScalarValue>` when the arity outgrows the typed tuples.
pub trait ParamPack {
    fn arity(&self) -> usize;
    fn encode_into(&self, buf: &mut BytesMut) -> Result<()>;
}

impl ParamPack for () {
    fn arity(&self) -> usize {
        0
    }

    fn encode_into(&self, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

macro_rules! tuple_param_pack {
    ($count:literal, $($name:ident : $idx:tt),+) => {
        impl<$($name: WireValue),+> ParamPack for ($($name,)+) {
            fn arity(&self) -> usize {
                $count
            }

            fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
                $(self.$idx.encode(buf)?;)+
                Ok(())
            }
        }
    };
}

tuple_param_pack!(1, A: 0);
tuple_param_pack!(2, A: 0, B: 1);
tuple_param_pack!(3, A: 0, B: 1, C: 2);
tuple_param_pack!(4, A: 0, B: 1, C: 2, D: 3);
tuple_param_pack!(5, A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_param_pack!(6, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
tuple_param_pack!(7, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
tuple_param_pack!(8, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
tuple_param_pack!(9, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8);
tuple_param_pack!(10, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9);
tuple_param_pack!(11, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10);
tuple_param_pack!(12, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11);
tuple_param_pack!(13, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12);
tuple_param_pack!(14, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13);
tuple_param_pack!(15, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13, O: 14);
tuple_param_pack!(16, A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13, O: 14, P: 15);

// Type-erased fallback for arities beyond the typed tuples.
impl ParamPack for Vec<ScalarValue> {
    fn arity(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        for value in self {
            value.encode(buf)?;
        }
        Ok(())
    }
}

/// One decoded result row.
pub type Row = Vec<ScalarValue>;

/// Result payloads decodable from a response frame. The handle's type
/// parameter selects the decoder; a shape mismatch against what the server
/// sent surfaces as `BadArgument`.
pub trait ResultShape: Sized + Send + 'static {
    fn decode(payload: Bytes) -> Result<Self>;
}

fn decode_rows(mut payload: Bytes) -> Result<Vec<Row>> {
    if payload.remaining() < 4 {
        return Err(short_frame());
    }
    let row_count = payload.get_u32() as usize;
    let mut rows = Vec::with_capacity(row_count.min(1024));
    for _ in 0..row_count {
        if payload.remaining() < 2 {
            return Err(short_frame());
        }
        let cell_count = payload.get_u16() as usize;
        let mut row = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            row.push(ScalarValue::decode(&mut payload)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Encode rows into a result payload. The server side of the wire format;
/// lives here so tests and mock servers share the real layout.
pub fn encode_rows(rows: &[Row]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(rows.len() as u32);
    for row in rows {
        if row.len() > u16::MAX as usize {
            return Err(Error::bad_argument(format!(
                "row too wide: {} cells",
                row.len()
            )));
        }
        buf.put_u16(row.len() as u16);
        for cell in row {
            cell.encode(&mut buf)?;
        }
    }
    Ok(buf.freeze())
}

/// Full table of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Rowset(pub Vec<Row>);

impl ResultShape for Rowset {
    fn decode(payload: Bytes) -> Result<Self> {
        Ok(Rowset(decode_rows(payload)?))
    }
}

/// First row of the result.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleRow(pub Row);

impl ResultShape for SingleRow {
    fn decode(payload: Bytes) -> Result<Self> {
        let mut rows = decode_rows(payload)?;
        if rows.is_empty() {
            return Err(Error::bad_argument(
                "result shape SingleRow requires at least one row",
            ));
        }
        Ok(SingleRow(rows.swap_remove(0)))
    }
}

/// First column of every row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarColumn(pub Vec<ScalarValue>);

impl ResultShape for ScalarColumn {
    fn decode(payload: Bytes) -> Result<Self> {
        let rows = decode_rows(payload)?;
        let mut column = Vec::with_capacity(rows.len());
        for mut row in rows {
            if row.is_empty() {
                return Err(Error::bad_argument(
                    "result shape ScalarColumn requires non-empty rows",
                ));
            }
            column.push(row.swap_remove(0));
        }
        Ok(ScalarColumn(column))
    }
}

/// Single cell of the first row.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar(pub ScalarValue);

impl ResultShape for Scalar {
    fn decode(payload: Bytes) -> Result<Self> {
        let SingleRow(mut row) = SingleRow::decode(payload)?;
        if row.is_empty() {
            return Err(Error::bad_argument(
                "result shape Scalar requires a non-empty row",
            ));
        }
        Ok(Scalar(row.swap_remove(0)))
    }
}

// Fire-and-forget: the payload is left undecoded.
impl ResultShape for () {
    fn decode(_payload: Bytes) -> Result<Self> {
        Ok(())
    }
}
