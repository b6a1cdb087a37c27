use crate::error::JdError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Numeric element formats, usable standalone or as `T[]` array elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumFmt {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Unsigned fixed point with `int_bits` integer and `frac_bits` fractional bits
    UFixed { int_bits: u8, frac_bits: u8 },
    /// Signed (two's complement) fixed point
    IFixed { int_bits: u8, frac_bits: u8 },
}

impl NumFmt {
    /// Storage width in bytes.
    pub fn size(&self) -> usize {
        match self {
            NumFmt::U8 | NumFmt::I8 => 1,
            NumFmt::U16 | NumFmt::I16 => 2,
            NumFmt::U32 | NumFmt::I32 | NumFmt::F32 => 4,
            NumFmt::U64 | NumFmt::I64 | NumFmt::F64 => 8,
            NumFmt::UFixed {
                int_bits,
                frac_bits,
            }
            | NumFmt::IFixed {
                int_bits,
                frac_bits,
            } => (*int_bits as usize + *frac_bits as usize).div_ceil(8),
        }
    }

    /// The value produced when the buffer ends before this field.
    fn zero(&self) -> Value {
        match self {
            NumFmt::U8 | NumFmt::U16 | NumFmt::U32 | NumFmt::U64 => Value::Unsigned(0),
            NumFmt::I8 | NumFmt::I16 | NumFmt::I32 | NumFmt::I64 => Value::Signed(0),
            _ => Value::Float(0.0),
        }
    }
}

impl fmt::Display for NumFmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumFmt::U8 => write!(f, "u8"),
            NumFmt::U16 => write!(f, "u16"),
            NumFmt::U32 => write!(f, "u32"),
            NumFmt::U64 => write!(f, "u64"),
            NumFmt::I8 => write!(f, "i8"),
            NumFmt::I16 => write!(f, "i16"),
            NumFmt::I32 => write!(f, "i32"),
            NumFmt::I64 => write!(f, "i64"),
            NumFmt::F32 => write!(f, "f32"),
            NumFmt::F64 => write!(f, "f64"),
            NumFmt::UFixed {
                int_bits,
                frac_bits,
            } => write!(f, "u{int_bits}.{frac_bits}"),
            NumFmt::IFixed {
                int_bits,
                frac_bits,
            } => write!(f, "i{int_bits}.{frac_bits}"),
        }
    }
}

/// One field of a format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Num(NumFmt),
    /// `T[]`: as many `T` elements as the rest of the buffer holds
    NumArray(NumFmt),
    /// `b[K]` or open-ended `b`
    Bytes(Option<usize>),
    /// `s[K]` or open-ended `s`, UTF-8, NUL-padded when sized
    Str(Option<usize>),
    /// `z`: NUL-terminated string, self-delimiting
    ZStr,
    /// `x[K]`: padding, produces and consumes no value
    Skip(usize),
}

impl Token {
    /// Tokens that consume the rest of the buffer.
    fn is_open_ended(&self) -> bool {
        matches!(
            self,
            Token::NumArray(_) | Token::Bytes(None) | Token::Str(None)
        )
    }

    /// Fewest bytes a field of this shape can occupy.
    fn min_size(&self) -> usize {
        match self {
            Token::Num(n) => n.size(),
            Token::NumArray(_) | Token::Bytes(None) | Token::Str(None) => 0,
            Token::Bytes(Some(k)) | Token::Str(Some(k)) | Token::Skip(k) => *k,
            Token::ZStr => 1,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "{n}"),
            Token::NumArray(n) => write!(f, "{n}[]"),
            Token::Bytes(Some(k)) => write!(f, "b[{k}]"),
            Token::Bytes(None) => write!(f, "b"),
            Token::Str(Some(k)) => write!(f, "s[{k}]"),
            Token::Str(None) => write!(f, "s"),
            Token::ZStr => write!(f, "z"),
            Token::Skip(k) => write!(f, "x[{k}]"),
        }
    }
}

/// A decoded (or to-be-encoded) field value.
///
/// Integer fields narrower than 64 bits widen to `Unsigned`/`Signed`;
/// fixed-point fields decode to `Float`. A `r:` section decodes to a single
/// `Records` value holding one row per repetition.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bytes(Bytes),
    String(String),
    Array(Vec<Value>),
    Records(Vec<Vec<Value>>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) => Some(*v),
            Value::Signed(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Signed(v) => Some(*v),
            Value::Unsigned(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }

    /// Numeric view of the value, lossy for 64-bit integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Unsigned(v) => Some(*v as f64),
            Value::Signed(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_records(&self) -> Option<&[Vec<Value>]> {
        match self {
            Value::Records(rows) => Some(rows),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Unsigned(v as u64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Unsigned(v as u64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Unsigned(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Signed(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Signed(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(v))
    }
}

/// A parsed format string, ready to pack and unpack payloads.
///
/// The grammar is a whitespace-separated token list: integer fields
/// `u8..u64`/`i8..i64`, floats `f32`/`f64`, fixed point `uM.N`/`iM.N`
/// (stored in `ceil((M+N)/8)` bytes, scaled by `2^N`), byte blobs `b[K]`/`b`,
/// strings `s[K]`/`s` and NUL-terminated `z`, padding `x[K]`, trailing
/// numeric arrays `T[]`, and a final `r:` marking the remaining tokens as a
/// record repeated to the end of the buffer.
///
/// Parse once and reuse; parsing validates the grammar so that `unpack`
/// never fails on payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadFormat {
    source: String,
    head: Vec<Token>,
    repeat: Vec<Token>,
}

impl PayloadFormat {
    pub fn parse(format: &str) -> Result<Self, JdError> {
        let mut head = Vec::new();
        let mut repeat = Vec::new();
        let mut in_repeat = false;
        for tok in format.split_whitespace() {
            if tok == "r:" {
                if in_repeat {
                    return Err(JdError::format(format, "more than one `r:` section"));
                }
                in_repeat = true;
                continue;
            }
            let token = parse_token(tok, format)?;
            if in_repeat {
                repeat.push(token);
            } else {
                head.push(token);
            }
        }
        if in_repeat && repeat.is_empty() {
            return Err(JdError::format(format, "`r:` with no tokens after it"));
        }
        for (i, t) in head.iter().enumerate() {
            if t.is_open_ended() && !(repeat.is_empty() && i == head.len() - 1) {
                return Err(JdError::format(
                    format,
                    format!("open-ended `{t}` must be the final token"),
                ));
            }
        }
        for t in &repeat {
            if t.is_open_ended() {
                return Err(JdError::format(
                    format,
                    format!("open-ended `{t}` cannot appear in a repeating section"),
                ));
            }
        }
        if !repeat.is_empty() && section_min_size(&repeat) == 0 {
            return Err(JdError::format(
                format,
                "repeating section must consume at least one byte per record",
            ));
        }
        Ok(PayloadFormat {
            source: format.to_string(),
            head,
            repeat,
        })
    }

    /// The format string this was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of values `unpack` produces and `pack` expects.
    pub fn value_count(&self) -> usize {
        let head = self
            .head
            .iter()
            .filter(|t| !matches!(t, Token::Skip(_)))
            .count();
        head + usize::from(!self.repeat.is_empty())
    }

    /// Decode a payload.
    ///
    /// Decoding is total: a buffer ending before a fixed-width field yields
    /// that field's zero value, a trailing partial array element or record is
    /// ignored, and bytes past the last field are ignored.
    pub fn unpack(&self, data: &[u8]) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.value_count());
        let mut off = 0usize;
        for t in &self.head {
            if let Some(v) = decode_token(t, data, &mut off) {
                out.push(v);
            }
        }
        if !self.repeat.is_empty() {
            // parse() guarantees min >= 1, so this loop always advances
            let min = section_min_size(&self.repeat);
            let mut rows = Vec::new();
            while data.len().saturating_sub(off) >= min {
                let mut row = Vec::with_capacity(self.repeat.len());
                for t in &self.repeat {
                    if let Some(v) = decode_token(t, data, &mut off) {
                        row.push(v);
                    }
                }
                rows.push(row);
            }
            out.push(Value::Records(rows));
        }
        out
    }

    /// Encode `values` into a payload.
    ///
    /// Values must match the format's fields in order and kind; a `r:`
    /// section consumes one final `Records` value. Out-of-range numerics,
    /// wrong-length `b[K]` blobs and interior NULs in `z` strings are errors.
    pub fn pack(&self, values: &[Value]) -> Result<Bytes, JdError> {
        let mut buf = BytesMut::new();
        let mut vals = values.iter();
        for t in &self.head {
            encode_token(t, &mut vals, &mut buf, &self.source)?;
        }
        if !self.repeat.is_empty() {
            let v = vals
                .next()
                .ok_or_else(|| JdError::format(&self.source, "missing records value"))?;
            let Value::Records(rows) = v else {
                return Err(JdError::format(
                    &self.source,
                    format!("expected records for `r:` section, got {v:?}"),
                ));
            };
            for row in rows {
                let mut row_vals = row.iter();
                for t in &self.repeat {
                    encode_token(t, &mut row_vals, &mut buf, &self.source)?;
                }
                if row_vals.next().is_some() {
                    return Err(JdError::format(&self.source, "too many values in record"));
                }
            }
        }
        if vals.next().is_some() {
            return Err(JdError::format(&self.source, "too many values for format"));
        }
        Ok(buf.freeze())
    }
}

impl FromStr for PayloadFormat {
    type Err = JdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PayloadFormat::parse(s)
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Decode `data` against `format` in one step.
pub fn unpack(format: &str, data: &[u8]) -> Result<Vec<Value>, JdError> {
    Ok(PayloadFormat::parse(format)?.unpack(data))
}

/// Encode `values` against `format` in one step.
pub fn pack(format: &str, values: &[Value]) -> Result<Bytes, JdError> {
    PayloadFormat::parse(format)?.pack(values)
}

fn section_min_size(tokens: &[Token]) -> usize {
    tokens.iter().map(Token::min_size).sum()
}

fn parse_token(tok: &str, format: &str) -> Result<Token, JdError> {
    if let Some(base) = tok.strip_suffix("[]") {
        let Some(num) = parse_num(base, format)? else {
            return Err(JdError::format(
                format,
                format!("`{tok}`: array element must be numeric"),
            ));
        };
        return Ok(Token::NumArray(num));
    }
    if let Some(num) = parse_num(tok, format)? {
        return Ok(Token::Num(num));
    }
    let (base, len) = split_sized(tok, format)?;
    match (base, len) {
        ("b", k) => Ok(Token::Bytes(k)),
        ("s", k) => Ok(Token::Str(k)),
        ("z", None) => Ok(Token::ZStr),
        ("x", Some(k)) => Ok(Token::Skip(k)),
        ("x", None) => Err(JdError::format(format, "`x` requires a length, e.g. `x[4]`")),
        _ => Err(JdError::format(format, format!("unknown token `{tok}`"))),
    }
}

/// Recognize scalar numeric tokens, including `uM.N`/`iM.N` fixed point.
fn parse_num(tok: &str, format: &str) -> Result<Option<NumFmt>, JdError> {
    let fmt = match tok {
        "u8" => NumFmt::U8,
        "u16" => NumFmt::U16,
        "u32" => NumFmt::U32,
        "u64" => NumFmt::U64,
        "i8" => NumFmt::I8,
        "i16" => NumFmt::I16,
        "i32" => NumFmt::I32,
        "i64" => NumFmt::I64,
        "f32" => NumFmt::F32,
        "f64" => NumFmt::F64,
        _ => {
            let Some(rest) = tok.strip_prefix(['u', 'i']) else {
                return Ok(None);
            };
            let Some((int_part, frac_part)) = rest.split_once('.') else {
                return Ok(None);
            };
            let (Ok(int_bits), Ok(frac_bits)) =
                (int_part.parse::<u8>(), frac_part.parse::<u8>())
            else {
                return Ok(None);
            };
            let total = int_bits as u32 + frac_bits as u32;
            if total == 0 || total > 64 {
                return Err(JdError::format(
                    format,
                    format!("`{tok}`: fixed-point width must be 1..=64 bits"),
                ));
            }
            if tok.starts_with('u') {
                NumFmt::UFixed {
                    int_bits,
                    frac_bits,
                }
            } else {
                NumFmt::IFixed {
                    int_bits,
                    frac_bits,
                }
            }
        }
    };
    Ok(Some(fmt))
}

/// Split `b[8]`-style tokens into base and length; length must be positive.
fn split_sized<'a>(tok: &'a str, format: &str) -> Result<(&'a str, Option<usize>), JdError> {
    let Some((base, rest)) = tok.split_once('[') else {
        return Ok((tok, None));
    };
    let Some(digits) = rest.strip_suffix(']') else {
        return Err(JdError::format(format, format!("unterminated `{tok}`")));
    };
    let len = digits
        .parse::<usize>()
        .map_err(|_| JdError::format(format, format!("bad length in `{tok}`")))?;
    if len == 0 {
        return Err(JdError::format(format, format!("zero length in `{tok}`")));
    }
    Ok((base, Some(len)))
}

/// Decode one token at `off`, advancing it. `Skip` yields no value.
fn decode_token(t: &Token, data: &[u8], off: &mut usize) -> Option<Value> {
    match t {
        Token::Num(fmt) => {
            let v = decode_num(*fmt, data, *off);
            *off += fmt.size();
            Some(v)
        }
        Token::NumArray(fmt) => {
            let size = fmt.size();
            let mut elems = Vec::new();
            while data.len().saturating_sub(*off) >= size {
                elems.push(decode_num(*fmt, data, *off));
                *off += size;
            }
            *off = data.len();
            Some(Value::Array(elems))
        }
        Token::Bytes(len) => {
            let chunk = take(data, off, *len);
            Some(Value::Bytes(Bytes::copy_from_slice(chunk)))
        }
        Token::Str(len) => {
            let chunk = take(data, off, *len);
            let end = chunk.iter().position(|b| *b == 0).unwrap_or(chunk.len());
            Some(Value::String(
                String::from_utf8_lossy(&chunk[..end]).into_owned(),
            ))
        }
        Token::ZStr => {
            let start = (*off).min(data.len());
            match data[start..].iter().position(|b| *b == 0) {
                Some(i) => {
                    *off = start + i + 1;
                    Some(Value::String(
                        String::from_utf8_lossy(&data[start..start + i]).into_owned(),
                    ))
                }
                None => {
                    *off = data.len();
                    Some(Value::String(
                        String::from_utf8_lossy(&data[start..]).into_owned(),
                    ))
                }
            }
        }
        Token::Skip(k) => {
            *off += k;
            None
        }
    }
}

/// Slice out a sized or rest-of-buffer field, clamped to what is available.
fn take<'a>(data: &'a [u8], off: &mut usize, len: Option<usize>) -> &'a [u8] {
    let start = (*off).min(data.len());
    match len {
        Some(k) => {
            let end = (start + k).min(data.len());
            *off += k;
            &data[start..end]
        }
        None => {
            *off = data.len();
            &data[start..]
        }
    }
}

fn decode_num(fmt: NumFmt, data: &[u8], off: usize) -> Value {
    let size = fmt.size();
    if off + size > data.len() {
        return fmt.zero();
    }
    let chunk = &data[off..off + size];
    match fmt {
        NumFmt::U8 | NumFmt::U16 | NumFmt::U32 | NumFmt::U64 => Value::Unsigned(read_le(chunk)),
        NumFmt::I8 | NumFmt::I16 | NumFmt::I32 | NumFmt::I64 => {
            Value::Signed(sign_extend(read_le(chunk), size))
        }
        NumFmt::F32 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(chunk);
            Value::Float(f32::from_le_bytes(b) as f64)
        }
        NumFmt::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            Value::Float(f64::from_le_bytes(b))
        }
        NumFmt::UFixed { frac_bits, .. } => {
            Value::Float(read_le(chunk) as f64 / 2f64.powi(frac_bits as i32))
        }
        NumFmt::IFixed { frac_bits, .. } => {
            let raw = sign_extend(read_le(chunk), size);
            Value::Float(raw as f64 / 2f64.powi(frac_bits as i32))
        }
    }
}

fn read_le(chunk: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, b) in chunk.iter().enumerate() {
        v |= (*b as u64) << (8 * i);
    }
    v
}

/// Sign-extend a little-endian value read from `size` bytes.
fn sign_extend(v: u64, size: usize) -> i64 {
    if size >= 8 {
        return v as i64;
    }
    let bits = 8 * size as u32;
    let sign = 1u64 << (bits - 1);
    if v & sign != 0 {
        (v | !(sign.wrapping_mul(2).wrapping_sub(1))) as i64
    } else {
        v as i64
    }
}

fn encode_token(
    t: &Token,
    vals: &mut std::slice::Iter<'_, Value>,
    buf: &mut BytesMut,
    format: &str,
) -> Result<(), JdError> {
    if let Token::Skip(k) = t {
        buf.put_bytes(0, *k);
        return Ok(());
    }
    let v = vals
        .next()
        .ok_or_else(|| JdError::format(format, format!("not enough values, expected `{t}`")))?;
    match t {
        Token::Num(fmt) => encode_num(*fmt, v, buf, format),
        Token::NumArray(fmt) => {
            let Value::Array(elems) = v else {
                return Err(type_mismatch(t, v, format));
            };
            for e in elems {
                encode_num(*fmt, e, buf, format)?;
            }
            Ok(())
        }
        Token::Bytes(len) => {
            let Value::Bytes(b) = v else {
                return Err(type_mismatch(t, v, format));
            };
            if let Some(k) = len {
                if b.len() != *k {
                    return Err(JdError::format(
                        format,
                        format!("`{t}` needs exactly {k} bytes, got {}", b.len()),
                    ));
                }
            }
            buf.put_slice(b);
            Ok(())
        }
        Token::Str(len) => {
            let Value::String(s) = v else {
                return Err(type_mismatch(t, v, format));
            };
            let bytes = s.as_bytes();
            match len {
                Some(k) => {
                    let used = bytes.len().min(*k);
                    buf.put_slice(&bytes[..used]);
                    buf.put_bytes(0, k - used);
                }
                None => buf.put_slice(bytes),
            }
            Ok(())
        }
        Token::ZStr => {
            let Value::String(s) = v else {
                return Err(type_mismatch(t, v, format));
            };
            if s.as_bytes().contains(&0) {
                return Err(JdError::format(format, "NUL byte inside `z` string"));
            }
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
            Ok(())
        }
        Token::Skip(_) => unreachable!("handled above"),
    }
}

fn encode_num(fmt: NumFmt, v: &Value, buf: &mut BytesMut, format: &str) -> Result<(), JdError> {
    let size = fmt.size();
    match fmt {
        NumFmt::U8 | NumFmt::U16 | NumFmt::U32 | NumFmt::U64 => {
            let raw = v
                .as_u64()
                .ok_or_else(|| type_mismatch(&Token::Num(fmt), v, format))?;
            if size < 8 && raw > (1u64 << (8 * size)) - 1 {
                return Err(range_error(fmt, v, format));
            }
            put_le(buf, raw, size);
            Ok(())
        }
        NumFmt::I8 | NumFmt::I16 | NumFmt::I32 | NumFmt::I64 => {
            let raw = v
                .as_i64()
                .ok_or_else(|| type_mismatch(&Token::Num(fmt), v, format))?;
            if size < 8 {
                let bits = 8 * size as u32;
                let max = (1i64 << (bits - 1)) - 1;
                let min = -(1i64 << (bits - 1));
                if raw < min || raw > max {
                    return Err(range_error(fmt, v, format));
                }
            }
            put_le(buf, raw as u64, size);
            Ok(())
        }
        NumFmt::F32 => {
            let f = v
                .as_f64()
                .ok_or_else(|| type_mismatch(&Token::Num(fmt), v, format))?;
            buf.put_f32_le(f as f32);
            Ok(())
        }
        NumFmt::F64 => {
            let f = v
                .as_f64()
                .ok_or_else(|| type_mismatch(&Token::Num(fmt), v, format))?;
            buf.put_f64_le(f);
            Ok(())
        }
        NumFmt::UFixed {
            int_bits,
            frac_bits,
        } => {
            let f = v
                .as_f64()
                .ok_or_else(|| type_mismatch(&Token::Num(fmt), v, format))?;
            let raw = (f * 2f64.powi(frac_bits as i32)).round();
            let limit = 2f64.powi(int_bits as i32 + frac_bits as i32);
            if !raw.is_finite() || raw < 0.0 || raw >= limit {
                return Err(range_error(fmt, v, format));
            }
            put_le(buf, raw as u64, size);
            Ok(())
        }
        NumFmt::IFixed {
            int_bits,
            frac_bits,
        } => {
            let f = v
                .as_f64()
                .ok_or_else(|| type_mismatch(&Token::Num(fmt), v, format))?;
            let raw = (f * 2f64.powi(frac_bits as i32)).round();
            let bound = 2f64.powi(int_bits as i32 + frac_bits as i32 - 1);
            if !raw.is_finite() || raw < -bound || raw >= bound {
                return Err(range_error(fmt, v, format));
            }
            put_le(buf, (raw as i64) as u64, size);
            Ok(())
        }
    }
}

fn put_le(buf: &mut BytesMut, raw: u64, size: usize) {
    for i in 0..size {
        buf.put_u8((raw >> (8 * i)) as u8);
    }
}

fn type_mismatch(t: &Token, v: &Value, format: &str) -> JdError {
    JdError::format(format, format!("`{t}` cannot encode {v:?}"))
}

fn range_error(fmt: NumFmt, v: &Value, format: &str) -> JdError {
    JdError::format(format, format!("{v:?} out of range for `{fmt}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_widths() {
        assert_eq!(NumFmt::U8.size(), 1);
        assert_eq!(NumFmt::I64.size(), 8);
        assert_eq!(
            NumFmt::IFixed {
                int_bits: 6,
                frac_bits: 10
            }
            .size(),
            2
        );
        assert_eq!(
            NumFmt::UFixed {
                int_bits: 22,
                frac_bits: 10
            }
            .size(),
            4
        );
        assert_eq!(
            NumFmt::UFixed {
                int_bits: 0,
                frac_bits: 8
            }
            .size(),
            1
        );
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0xff, 1), -1);
        assert_eq!(sign_extend(0x7f, 1), 127);
        assert_eq!(sign_extend(0x8000, 2), -32768);
        assert_eq!(sign_extend(0xffff_ffff, 4), -1);
        assert_eq!(sign_extend(u64::MAX, 8), -1);
    }

    #[test]
    fn rejects_mangled_formats() {
        assert!(PayloadFormat::parse("u7").is_err());
        assert!(PayloadFormat::parse("q16").is_err());
        assert!(PayloadFormat::parse("b[").is_err());
        assert!(PayloadFormat::parse("b[0]").is_err());
        assert!(PayloadFormat::parse("x").is_err());
        assert!(PayloadFormat::parse("b u8").is_err());
        assert!(PayloadFormat::parse("u8[] u8").is_err());
        assert!(PayloadFormat::parse("r:").is_err());
        assert!(PayloadFormat::parse("r: u8 r: u8").is_err());
        assert!(PayloadFormat::parse("r: b").is_err());
        assert!(PayloadFormat::parse("r: x[2]").is_ok());
        assert!(PayloadFormat::parse("u0.0").is_err());
        assert!(PayloadFormat::parse("u60.10").is_err());
        assert!(PayloadFormat::parse("s[3]x").is_err());
    }

    #[test]
    fn value_counts_skip_padding() {
        let f = PayloadFormat::parse("u8 x[2] u16 r: u8 u8").unwrap();
        assert_eq!(f.value_count(), 3);
    }
}
