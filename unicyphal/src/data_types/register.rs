//! `uavcan.register` data types: `Value.1.0`, `Name.1.0`, and the
//! `List.1.0` / `Access.1.0` service payloads
//!
//! Hand-written codecs, bit-compatible with the regulated DSDL
//! definitions. Array capacities determine the length-prefix width (the
//! smallest unsigned type that can hold the capacity); elements are
//! little-endian; bit arrays are packed LSB first.

use alloc::string::String;
use alloc::vec::Vec;

use crate::data_types::cursor::Cursor;

/// `uavcan.register.List.1.0` fixed service id.
pub const LIST_SERVICE_ID: u16 = 385;
/// `uavcan.register.Access.1.0` fixed service id.
pub const ACCESS_SERVICE_ID: u16 = 384;

/// Extent of `List.Request` (a bare `uint16 index`).
pub const LIST_REQUEST_EXTENT: usize = 2;
/// Extent of `Access.Request` (`Name` plus `Value` at their maxima).
pub const ACCESS_REQUEST_EXTENT: usize = NAME_MAX_SIZE + VALUE_MAX_SIZE;

/// `Name.1.0` is `uint8[<=255]`: one length byte plus the characters.
const NAME_CAPACITY: usize = 255;
const NAME_MAX_SIZE: usize = 1 + NAME_CAPACITY;
/// `Value.1.0` at its largest: tag, u16 length, 256 string bytes.
const VALUE_MAX_SIZE: usize = 1 + 2 + 256;

/// Failure to decode a received payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeserializeError;

/// `uavcan.register.Value.1.0` — the union of every register value shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    /// `uavcan.primitive.String.1.0`, `uint8[<=256]`.
    String(Vec<u8>),
    /// `uavcan.primitive.Unstructured.1.0`, `uint8[<=256]`.
    Unstructured(Vec<u8>),
    /// `uavcan.primitive.array.Bit.1.0`, `bool[<=2048]`.
    Bit(Vec<bool>),
    Integer64(Vec<i64>),
    Integer32(Vec<i32>),
    Integer16(Vec<i16>),
    Integer8(Vec<i8>),
    Natural64(Vec<u64>),
    Natural32(Vec<u32>),
    Natural16(Vec<u16>),
    Natural8(Vec<u8>),
    Real64(Vec<f64>),
    Real32(Vec<f32>),
    /// `uavcan.primitive.array.Real16.1.0`; stored widened, encoded as
    /// IEEE 754 binary16.
    Real16(Vec<f32>),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::Empty => 0,
            Value::String(_) => 1,
            Value::Unstructured(_) => 2,
            Value::Bit(_) => 3,
            Value::Integer64(_) => 4,
            Value::Integer32(_) => 5,
            Value::Integer16(_) => 6,
            Value::Integer8(_) => 7,
            Value::Natural64(_) => 8,
            Value::Natural32(_) => 9,
            Value::Natural16(_) => 10,
            Value::Natural8(_) => 11,
            Value::Real64(_) => 12,
            Value::Real32(_) => 13,
            Value::Real16(_) => 14,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            Value::Empty => {}
            Value::String(bytes) | Value::Unstructured(bytes) => {
                let length = bytes.len().min(256);
                out.extend_from_slice(&(length as u16).to_le_bytes());
                out.extend_from_slice(&bytes[..length]);
            }
            Value::Bit(bits) => {
                let length = bits.len().min(2048);
                out.extend_from_slice(&(length as u16).to_le_bytes());
                let mut byte = 0u8;
                for (i, &bit) in bits[..length].iter().enumerate() {
                    byte |= u8::from(bit) << (i % 8);
                    if i % 8 == 7 {
                        out.push(byte);
                        byte = 0;
                    }
                }
                if length % 8 != 0 {
                    out.push(byte);
                }
            }
            Value::Integer64(v) => serialize_array(out, v, 32, |out, &x| {
                out.extend_from_slice(&x.to_le_bytes())
            }),
            Value::Integer32(v) => serialize_array(out, v, 64, |out, &x| {
                out.extend_from_slice(&x.to_le_bytes())
            }),
            Value::Integer16(v) => serialize_array(out, v, 128, |out, &x| {
                out.extend_from_slice(&x.to_le_bytes())
            }),
            Value::Integer8(v) => {
                let length = v.len().min(256);
                out.extend_from_slice(&(length as u16).to_le_bytes());
                out.extend(v[..length].iter().map(|&x| x as u8));
            }
            Value::Natural64(v) => serialize_array(out, v, 32, |out, &x| {
                out.extend_from_slice(&x.to_le_bytes())
            }),
            Value::Natural32(v) => serialize_array(out, v, 64, |out, &x| {
                out.extend_from_slice(&x.to_le_bytes())
            }),
            Value::Natural16(v) => serialize_array(out, v, 128, |out, &x| {
                out.extend_from_slice(&x.to_le_bytes())
            }),
            Value::Natural8(v) => {
                let length = v.len().min(256);
                out.extend_from_slice(&(length as u16).to_le_bytes());
                out.extend_from_slice(&v[..length]);
            }
            Value::Real64(v) => serialize_array(out, v, 32, |out, &x| {
                out.extend_from_slice(&x.to_bits().to_le_bytes())
            }),
            Value::Real32(v) => serialize_array(out, v, 64, |out, &x| {
                out.extend_from_slice(&x.to_bits().to_le_bytes())
            }),
            Value::Real16(v) => serialize_array(out, v, 128, |out, &x| {
                out.extend_from_slice(&f32_to_f16(x).to_le_bytes())
            }),
        }
    }

    pub(crate) fn deserialize_from(cursor: &mut Cursor<'_>) -> Result<Value, DeserializeError> {
        let tag = cursor.u8();
        Ok(match tag {
            0 => Value::Empty,
            1 => Value::String(read_u8_array(cursor, 256)?),
            2 => Value::Unstructured(read_u8_array(cursor, 256)?),
            3 => {
                let length = cursor.u16() as usize;
                if length > 2048 {
                    return Err(DeserializeError);
                }
                let mut bits = Vec::with_capacity(length);
                let mut byte = 0;
                for i in 0..length {
                    if i % 8 == 0 {
                        byte = cursor.u8();
                    }
                    bits.push((byte >> (i % 8)) & 1 != 0);
                }
                Value::Bit(bits)
            }
            4 => Value::Integer64(read_array(cursor, 32, |c| c.u64() as i64)?),
            5 => Value::Integer32(read_array(cursor, 64, |c| c.u32() as i32)?),
            6 => Value::Integer16(read_array(cursor, 128, |c| c.u16() as i16)?),
            7 => {
                let length = cursor.u16() as usize;
                if length > 256 {
                    return Err(DeserializeError);
                }
                Value::Integer8((0..length).map(|_| cursor.u8() as i8).collect())
            }
            8 => Value::Natural64(read_array(cursor, 32, |c| c.u64())?),
            9 => Value::Natural32(read_array(cursor, 64, |c| c.u32())?),
            10 => Value::Natural16(read_array(cursor, 128, |c| c.u16())?),
            11 => Value::Natural8(read_u8_array(cursor, 256)?),
            12 => Value::Real64(read_array(cursor, 32, |c| c.f64())?),
            13 => Value::Real32(read_array(cursor, 64, |c| c.f32())?),
            14 => Value::Real16(read_array(cursor, 128, |c| f16_to_f32(c.u16()))?),
            _ => return Err(DeserializeError),
        })
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Value, DeserializeError> {
        Self::deserialize_from(&mut Cursor::new(bytes))
    }

    /// Converts `self` into the variant kind of `template`.
    ///
    /// Same kind passes through; numeric kinds (including bit arrays)
    /// convert element-wise with clamping; string and unstructured
    /// interconvert. Anything else is not coercible.
    pub fn coerce_to(&self, template: &Value) -> Option<Value> {
        if self.tag() == template.tag() {
            return Some(self.clone());
        }
        match template {
            Value::Empty => None,
            Value::String(_) => match self {
                Value::Unstructured(b) => Some(Value::String(b.clone())),
                _ => None,
            },
            Value::Unstructured(_) => match self {
                Value::String(b) => Some(Value::Unstructured(b.clone())),
                _ => None,
            },
            Value::Bit(_) => {
                let reals = self.as_reals()?;
                Some(Value::Bit(reals.iter().map(|&x| x != 0.0).collect()))
            }
            Value::Integer64(_) => self.coerce_ints(i64::MIN as i128, i64::MAX as i128, |v| {
                Value::Integer64(v.iter().map(|&x| x as i64).collect())
            }),
            Value::Integer32(_) => self.coerce_ints(i32::MIN as i128, i32::MAX as i128, |v| {
                Value::Integer32(v.iter().map(|&x| x as i32).collect())
            }),
            Value::Integer16(_) => self.coerce_ints(i16::MIN as i128, i16::MAX as i128, |v| {
                Value::Integer16(v.iter().map(|&x| x as i16).collect())
            }),
            Value::Integer8(_) => self.coerce_ints(i8::MIN as i128, i8::MAX as i128, |v| {
                Value::Integer8(v.iter().map(|&x| x as i8).collect())
            }),
            Value::Natural64(_) => self.coerce_ints(0, u64::MAX as i128, |v| {
                Value::Natural64(v.iter().map(|&x| x as u64).collect())
            }),
            Value::Natural32(_) => self.coerce_ints(0, u32::MAX as i128, |v| {
                Value::Natural32(v.iter().map(|&x| x as u32).collect())
            }),
            Value::Natural16(_) => self.coerce_ints(0, u16::MAX as i128, |v| {
                Value::Natural16(v.iter().map(|&x| x as u16).collect())
            }),
            Value::Natural8(_) => self.coerce_ints(0, u8::MAX as i128, |v| {
                Value::Natural8(v.iter().map(|&x| x as u8).collect())
            }),
            Value::Real64(_) => Some(Value::Real64(self.as_reals()?)),
            Value::Real32(_) => {
                Some(Value::Real32(self.as_reals()?.iter().map(|&x| x as f32).collect()))
            }
            Value::Real16(_) => {
                Some(Value::Real16(self.as_reals()?.iter().map(|&x| x as f32).collect()))
            }
        }
    }

    fn coerce_ints(&self, min: i128, max: i128, build: impl Fn(&[i128]) -> Value) -> Option<Value> {
        let reals = self.as_reals()?;
        let clamped: Vec<i128> = reals
            .iter()
            .map(|&x| {
                if x.is_nan() {
                    0
                } else {
                    (x as i128).clamp(min, max)
                }
            })
            .collect();
        Some(build(&clamped))
    }

    /// Elements of any numeric-ish variant widened to `f64`.
    fn as_reals(&self) -> Option<Vec<f64>> {
        Some(match self {
            Value::Bit(v) => v.iter().map(|&b| f64::from(u8::from(b))).collect(),
            Value::Integer64(v) => v.iter().map(|&x| x as f64).collect(),
            Value::Integer32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Integer16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Integer8(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Natural64(v) => v.iter().map(|&x| x as f64).collect(),
            Value::Natural32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Natural16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Natural8(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Real64(v) => v.clone(),
            Value::Real32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Real16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Value::Empty | Value::String(_) | Value::Unstructured(_) => return None,
        })
    }
}

fn serialize_array<T>(
    out: &mut Vec<u8>,
    elems: &[T],
    capacity: usize,
    write: impl Fn(&mut Vec<u8>, &T),
) {
    let length = elems.len().min(capacity);
    out.push(length as u8);
    for elem in &elems[..length] {
        write(out, elem);
    }
}

fn read_array<T>(
    cursor: &mut Cursor<'_>,
    capacity: usize,
    read: impl Fn(&mut Cursor<'_>) -> T,
) -> Result<Vec<T>, DeserializeError> {
    let length = cursor.u8() as usize;
    if length > capacity {
        return Err(DeserializeError);
    }
    Ok((0..length).map(|_| read(cursor)).collect())
}

fn read_u8_array(cursor: &mut Cursor<'_>, capacity: usize) -> Result<Vec<u8>, DeserializeError> {
    let length = cursor.u16() as usize;
    if length > capacity {
        return Err(DeserializeError);
    }
    Ok((0..length).map(|_| cursor.u8()).collect())
}

// IEEE 754 binary16 conversion, round-to-nearest-even on the way down.

fn f16_to_f32(h: u16) -> f32 {
    let sign = u32::from(h >> 15) << 31;
    let exponent = (h >> 10) & 0x1f;
    let mantissa = u32::from(h & 0x3ff);
    let bits = match exponent {
        0 => {
            if mantissa == 0 {
                sign
            } else {
                // Subnormal: renormalize.
                let mut shift = 0u32;
                let mut significand = mantissa;
                while significand & 0x400 == 0 {
                    significand <<= 1;
                    shift += 1;
                }
                let exponent = 127 - 15 + 1 - shift;
                sign | (exponent << 23) | ((significand & 0x3ff) << 13)
            }
        }
        0x1f => sign | 0x7f80_0000 | (mantissa << 13),
        _ => sign | ((u32::from(exponent) + 127 - 15) << 23) | (mantissa << 13),
    };
    f32::from_bits(bits)
}

fn f32_to_f16(f: f32) -> u16 {
    let bits = f.to_bits();
    let sign = ((bits >> 31) as u16) << 15;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x7f_ffff;

    if exponent == 0xff {
        // Inf / NaN.
        let payload = if mantissa != 0 { 0x200 } else { 0 };
        return sign | 0x7c00 | payload;
    }
    let unbiased = exponent - 127;
    if unbiased > 15 {
        return sign | 0x7c00; // overflow to infinity
    }
    if unbiased >= -14 {
        // Normal half.
        let mut half = ((unbiased + 15) as u16) << 10 | (mantissa >> 13) as u16;
        // Round to nearest even.
        let round = mantissa & 0x1fff;
        if round > 0x1000 || (round == 0x1000 && half & 1 != 0) {
            half += 1;
        }
        return sign | half;
    }
    if unbiased >= -24 {
        // Subnormal half.
        let full = mantissa | 0x80_0000;
        let shift = (-14 - unbiased + 13) as u32;
        let mut half = (full >> shift) as u16;
        let remainder = full & ((1 << shift) - 1);
        let halfway = 1u32 << (shift - 1);
        if remainder > halfway || (remainder == halfway && half & 1 != 0) {
            half += 1;
        }
        return sign | half;
    }
    sign // underflow to zero
}

/// `uavcan.register.List.1.0.Request`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub index: u16,
}

impl ListRequest {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.index.to_le_bytes());
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        let mut cursor = Cursor::new(bytes);
        Ok(Self { index: cursor.u16() })
    }
}

/// `uavcan.register.List.1.0.Response` (a `Name.1.0`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResponse {
    pub name: Vec<u8>,
}

impl ListResponse {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_name(out, &self.name);
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            name: read_name(&mut cursor)?,
        })
    }
}

/// `uavcan.register.Access.1.0.Request`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRequest {
    pub name: Vec<u8>,
    pub value: Value,
}

impl AccessRequest {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_name(out, &self.name);
        self.value.serialize(out);
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            name: read_name(&mut cursor)?,
            value: Value::deserialize_from(&mut cursor)?,
        })
    }
}

/// `uavcan.register.Access.1.0.Response`.
///
/// The timestamp is wire-mandatory but time synchronization is outside
/// this stack; it is transmitted as zero (unknown).
#[derive(Debug, Clone, PartialEq)]
pub struct AccessResponse {
    /// `uavcan.time.SynchronizedTimestamp.1.0`, a truncated uint56.
    pub timestamp_usec: u64,
    pub mutable: bool,
    pub persistent: bool,
    pub value: Value,
}

impl AccessResponse {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp_usec.to_le_bytes()[..7]);
        out.push(u8::from(self.mutable) | (u8::from(self.persistent) << 1));
        self.value.serialize(out);
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        let mut cursor = Cursor::new(bytes);
        let timestamp_usec = cursor.u56();
        let flags = cursor.u8();
        Ok(Self {
            timestamp_usec,
            mutable: flags & 1 != 0,
            persistent: flags & 2 != 0,
            value: Value::deserialize_from(&mut cursor)?,
        })
    }
}

fn serialize_name(out: &mut Vec<u8>, name: &[u8]) {
    let length = name.len().min(NAME_CAPACITY);
    out.push(length as u8);
    out.extend_from_slice(&name[..length]);
}

fn read_name(cursor: &mut Cursor<'_>) -> Result<Vec<u8>, DeserializeError> {
    let length = cursor.u8() as usize;
    if length > NAME_CAPACITY {
        return Err(DeserializeError);
    }
    Ok((0..length).map(|_| cursor.u8()).collect())
}

/// Lossless-enough name recovery for registry lookups; register names are
/// ASCII by convention.
pub(crate) fn name_to_string(name: &[u8]) -> Option<String> {
    core::str::from_utf8(name).ok().map(String::from)
}
