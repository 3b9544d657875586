// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words structclone refmap reftab INTZ REFZ nrefs refno upvalues

//! Structural clone codec: serializes a sequence of [`Value`]s into a
//! self-describing byte stream and reconstructs equivalent values on the
//! other side, preserving sharing (a value referenced multiple times decodes
//! to one object). This is how payloads travel between workers.
//!
//! Wire format:
//!
//! ```text
//! ┌────────────────────┬──────────────────┬──────────────────────────┐
//! │ header (4 B)       │ encoded values   │ refmap (nrefs × 1 or 4 B)│
//! │ tag|version<<5,    │                  │ refno per referenced     │
//! │ nrefs:u24 LE       │                  │ value, in stream order   │
//! └────────────────────┴──────────────────┴──────────────────────────┘
//! ```
//!
//! Each value starts with one tag byte: low 4 bits type, bit 4 "has-ref"
//! flag (for referable types), upper bits a small embedded value where
//! applicable. Integers are little-endian throughout.
//!
//! During encode, the first occurrence of a referable value (long strings,
//! arrays, dicts, functions, buffers) is emitted verbatim with its byte
//! offset remembered, keyed by value identity. Later occurrences emit a
//! `REFZ`/`REF` pointing at the refno assigned on first re-reference; the
//! refmap written at the stream tail maps decode-encounter order back to
//! refno, so the decoder resolves back-references in O(1).

use rustc_hash::FxHashMap;

use crate::codec::value::{DictKey, SHORT_STR_MAX, Value};
use crate::error::ErrCode;

const TAG_HEADER: u8 = 0x0;
const TAG_NIL: u8 = 0x1;
const TAG_BOOL: u8 = 0x2; // bool bit embedded in tag
const TAG_INTZ: u8 = 0x3; // small unsigned int embedded in tag
const TAG_INT: u8 = 0x4; // 8-byte integer
const TAG_FLOAT: u8 = 0x5; // 8-byte double
const TAG_STR1: u8 = 0x6; // 1-byte length prefix; up to 255 B
const TAG_STR4: u8 = 0x7; // 4-byte length prefix
const TAG_ARRAY: u8 = 0x8;
const TAG_DICT: u8 = 0x9;
const TAG_FUN: u8 = 0xA;
const TAG_UVAL: u8 = 0xB;
const TAG_REFZ: u8 = 0xC; // refno embedded in tag
const TAG_REF: u8 = 0xD; // u24 refno

const CODEC_VERSION: u8 = 1;

const TAG_TYPE_MASK: u8 = 0x0f;
const TAG_VAL_SHIFT: u32 = 4;
const TAG_VAL_MAX: u32 = 0x0f;
const TAG_HAS_REF: u8 = 1 << 4;

/// Userdata type tags carried in `UVAL` bodies.
const UVAL_BUF: u8 = 1;

/// Refmap entries are one byte each when the count allows it.
const COMPACT_REFMAP_MAX: u32 = 256;

#[derive(Debug, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid encoded data: {0}")]
    #[diagnostic(code(skein::structclone::invalid))]
    Invalid(&'static str),

    #[error("partial value")]
    #[diagnostic(code(skein::structclone::short))]
    Short,

    #[error("too many references")]
    #[diagnostic(code(skein::structclone::too_many_refs))]
    TooManyRefs,

    #[error("string too large")]
    #[diagnostic(code(skein::structclone::string_too_large))]
    StringTooLarge,

    #[error("cannot clone value of type {0}")]
    #[diagnostic(code(skein::structclone::unsupported))]
    Unsupported(&'static str),
}

impl CodecError {
    #[must_use]
    pub fn code(&self) -> ErrCode {
        match self {
            CodecError::Invalid(_) | CodecError::Short | CodecError::Unsupported(_) => {
                ErrCode::Invalid
            }
            CodecError::TooManyRefs | CodecError::StringTooLarge => ErrCode::Overflow,
        }
    }
}

// ———— encoder ————

#[derive(Debug, Default)]
struct RefSlot {
    /// Byte offset of the value's tag in the output stream.
    offset: usize,
    /// Assigned on the first back-reference.
    refno: Option<u32>,
}

struct Encoder {
    buf: Vec<u8>,
    reftab: FxHashMap<usize, RefSlot>,
    nrefs: u32,
}

impl Encoder {
    /// Registers identity `ident` at the current offset, or emits a
    /// back-reference if it was seen before. Returns `true` when the caller
    /// should emit the value body.
    fn intern(&mut self, ident: usize) -> Result<bool, CodecError> {
        if let Some(slot) = self.reftab.get_mut(&ident) {
            let refno = match slot.refno {
                Some(n) => n,
                None => {
                    let n = self.nrefs;
                    self.nrefs += 1;
                    self.buf[slot.offset] |= TAG_HAS_REF;
                    slot.refno = Some(n);
                    n
                }
            };
            if refno <= TAG_VAL_MAX {
                self.buf.push(TAG_REFZ | ((refno as u8) << TAG_VAL_SHIFT));
            } else if refno < (1 << 24) {
                self.buf.push(TAG_REF);
                self.buf.extend_from_slice(&refno.to_le_bytes()[..3]);
            } else {
                return Err(CodecError::TooManyRefs);
            }
            Ok(false)
        } else {
            self.reftab.insert(ident, RefSlot { offset: self.buf.len(), refno: None });
            Ok(true)
        }
    }

    fn encode_value(&mut self, v: &Value) -> Result<(), CodecError> {
        match v {
            Value::Nil => self.buf.push(TAG_NIL),
            Value::Bool(b) => self.buf.push(TAG_BOOL | (u8::from(*b) << TAG_VAL_SHIFT)),
            Value::Int(i) => {
                if (0..=i64::from(TAG_VAL_MAX)).contains(i) {
                    self.buf.push(TAG_INTZ | ((*i as u8) << TAG_VAL_SHIFT));
                } else {
                    self.buf.push(TAG_INT);
                    self.buf.extend_from_slice(&i.to_le_bytes());
                }
            }
            Value::Float(f) => {
                self.buf.push(TAG_FLOAT);
                self.buf.extend_from_slice(&f.to_le_bytes());
            }
            Value::Str(s) => {
                if s.len() > SHORT_STR_MAX && !self.intern(v.ref_identity().unwrap_or(0))? {
                    return Ok(());
                }
                self.encode_str_body(s.as_bytes())?;
            }
            Value::Array(a) => {
                if !self.intern(v.ref_identity().unwrap_or(0))? {
                    return Ok(());
                }
                let items = a.borrow();
                let count = u32::try_from(items.len())
                    .map_err(|_| CodecError::Invalid("array too large"))?;
                self.buf.push(TAG_ARRAY);
                self.buf.extend_from_slice(&count.to_le_bytes());
                for item in items.iter() {
                    self.encode_value(item)?;
                }
            }
            Value::Dict(d) => {
                if !self.intern(v.ref_identity().unwrap_or(0))? {
                    return Ok(());
                }
                let entries = d.borrow();
                let count = u32::try_from(entries.len())
                    .map_err(|_| CodecError::Invalid("dict too large"))?;
                self.buf.push(TAG_DICT);
                self.buf.extend_from_slice(&count.to_le_bytes());
                for (k, val) in entries.iter() {
                    self.encode_value(&k.to_value())?;
                    self.encode_value(val)?;
                }
            }
            Value::Func(f) => {
                if !self.intern(v.ref_identity().unwrap_or(0))? {
                    return Ok(());
                }
                let ups = f.upvalues.borrow();
                let nups =
                    u8::try_from(ups.len()).map_err(|_| CodecError::Invalid("too many upvalues"))?;
                let len = u32::try_from(f.code.len())
                    .map_err(|_| CodecError::Invalid("function too large"))?;
                self.buf.push(TAG_FUN);
                self.buf.push(nups);
                self.buf.extend_from_slice(&len.to_le_bytes());
                self.buf.extend_from_slice(&f.code);
                for up in ups.iter() {
                    self.encode_value(up)?;
                }
            }
            Value::Buf(b) => {
                if !self.intern(v.ref_identity().unwrap_or(0))? {
                    return Ok(());
                }
                let bytes = b.borrow();
                self.buf.push(TAG_UVAL);
                self.buf.push(UVAL_BUF);
                self.buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                self.buf.extend_from_slice(&bytes);
            }
            Value::Opaque(o) => return Err(CodecError::Unsupported(o.type_name)),
        }
        Ok(())
    }

    fn encode_str_body(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if bytes.len() <= 255 {
            self.buf.push(TAG_STR1);
            self.buf.push(bytes.len() as u8);
        } else {
            let len = u32::try_from(bytes.len()).map_err(|_| CodecError::StringTooLarge)?;
            self.buf.push(TAG_STR4);
            self.buf.extend_from_slice(&len.to_le_bytes());
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Trailing refmap: refnos of referenced values in stream (offset)
    /// order, byte-sized when they all fit.
    fn encode_refmap(&mut self) {
        let mut pairs: Vec<(usize, u32)> = self
            .reftab
            .values()
            .filter_map(|slot| slot.refno.map(|n| (slot.offset, n)))
            .collect();
        pairs.sort_unstable_by_key(|(offset, _)| *offset);
        if self.nrefs <= COMPACT_REFMAP_MAX {
            for (_, refno) in pairs {
                self.buf.push(refno as u8);
            }
        } else {
            for (_, refno) in pairs {
                self.buf.extend_from_slice(&refno.to_le_bytes());
            }
        }
    }
}

/// Serializes `values` into a self-describing byte stream.
///
/// # Errors
///
/// [`CodecError::Unsupported`] for opaque host objects, and size/overflow
/// errors for values exceeding the wire limits.
pub fn encode(values: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut enc =
        Encoder { buf: vec![0u8; 4], reftab: FxHashMap::default(), nrefs: 0 };
    for v in values {
        enc.encode_value(v)?;
    }
    if enc.nrefs > 0 {
        if enc.nrefs > (1 << 24) - 1 {
            return Err(CodecError::TooManyRefs);
        }
        enc.encode_refmap();
    }
    enc.buf[0] = TAG_HEADER | (CODEC_VERSION << 5);
    enc.buf[1..4].copy_from_slice(&enc.nrefs.to_le_bytes()[..3]);
    Ok(enc.buf)
}

// ———— decoder ————

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    /// End of the value stream (start of the refmap).
    end: usize,
    refmap: Vec<u32>,
    /// refno → decoded value, filled in decode-encounter order.
    reftab: Vec<Option<Value>>,
    refidx: usize,
}

impl Decoder<'_> {
    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.pos + n > self.end { Err(CodecError::Short) } else { Ok(()) }
    }

    fn take(&mut self, n: usize) -> Result<&[u8], CodecError> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Associates the value just materialized with the next refno from the
    /// refmap (called for values whose tag carries the has-ref flag).
    fn register(&mut self, v: &Value) -> Result<(), CodecError> {
        let refno = *self
            .refmap
            .get(self.refidx)
            .ok_or(CodecError::Invalid("more referenced values than refmap entries"))?;
        self.refidx += 1;
        self.reftab[refno as usize] = Some(v.clone());
        Ok(())
    }

    fn lookup_ref(&self, refno: u32) -> Result<Value, CodecError> {
        self.reftab
            .get(refno as usize)
            .and_then(Clone::clone)
            .ok_or(CodecError::Invalid("unexpected back-reference"))
    }

    fn decode_value(&mut self) -> Result<Value, CodecError> {
        self.need(1)?;
        let tag = self.buf[self.pos];
        let has_ref = tag & TAG_HAS_REF != 0;
        match tag & TAG_TYPE_MASK {
            TAG_NIL => {
                self.pos += 1;
                Ok(Value::Nil)
            }
            TAG_BOOL => {
                self.pos += 1;
                Ok(Value::Bool(tag >> TAG_VAL_SHIFT != 0))
            }
            TAG_INTZ => {
                self.pos += 1;
                Ok(Value::Int(i64::from(tag >> TAG_VAL_SHIFT)))
            }
            TAG_INT => {
                self.pos += 1;
                let raw = self.take(8)?;
                Ok(Value::Int(i64::from_le_bytes(raw.try_into().expect("8 bytes"))))
            }
            TAG_FLOAT => {
                self.pos += 1;
                let raw = self.take(8)?;
                Ok(Value::Float(f64::from_le_bytes(raw.try_into().expect("8 bytes"))))
            }
            TAG_STR1 | TAG_STR4 => {
                self.pos += 1;
                let len = if tag & TAG_TYPE_MASK == TAG_STR1 {
                    usize::from(*self.take(1)?.first().expect("1 byte"))
                } else {
                    let raw = self.take(4)?;
                    u32::from_le_bytes(raw.try_into().expect("4 bytes")) as usize
                };
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| CodecError::Invalid("string is not valid UTF-8"))?;
                let v = Value::str(s);
                if has_ref {
                    self.register(&v)?;
                }
                Ok(v)
            }
            TAG_ARRAY => {
                self.pos += 1;
                let raw = self.take(4)?;
                let count = u32::from_le_bytes(raw.try_into().expect("4 bytes"));
                let v = Value::array(Vec::with_capacity(count.min(4096) as usize));
                if has_ref {
                    // registered before children so cycles resolve
                    self.register(&v)?;
                }
                for _ in 0..count {
                    let item = self.decode_value()?;
                    if let Value::Array(a) = &v {
                        a.borrow_mut().push(item);
                    }
                }
                Ok(v)
            }
            TAG_DICT => {
                self.pos += 1;
                let raw = self.take(4)?;
                let count = u32::from_le_bytes(raw.try_into().expect("4 bytes"));
                let v = Value::empty_dict();
                if has_ref {
                    self.register(&v)?;
                }
                for _ in 0..count {
                    let key = DictKey::try_from_value(self.decode_value()?)
                        .map_err(|_| CodecError::Invalid("unusable dict key type"))?;
                    let val = self.decode_value()?;
                    if let Value::Dict(d) = &v {
                        d.borrow_mut().insert(key, val);
                    }
                }
                Ok(v)
            }
            TAG_FUN => {
                self.pos += 1;
                let nups = usize::from(*self.take(1)?.first().expect("1 byte"));
                let raw = self.take(4)?;
                let len = u32::from_le_bytes(raw.try_into().expect("4 bytes")) as usize;
                let code = self.take(len)?.to_vec();
                let v = Value::func(code, Vec::new());
                if has_ref {
                    self.register(&v)?;
                }
                for _ in 0..nups {
                    let up = self.decode_value()?;
                    if let Value::Func(f) = &v {
                        f.upvalues.borrow_mut().push(up);
                    }
                }
                Ok(v)
            }
            TAG_UVAL => {
                self.pos += 1;
                let uval_type = *self.take(1)?.first().expect("1 byte");
                if uval_type != UVAL_BUF {
                    return Err(CodecError::Invalid("unknown userdata type tag"));
                }
                let raw = self.take(8)?;
                let len = usize::try_from(u64::from_le_bytes(raw.try_into().expect("8 bytes")))
                    .map_err(|_| CodecError::Invalid("buffer too large"))?;
                let v = Value::buf(self.take(len)?.to_vec());
                if has_ref {
                    self.register(&v)?;
                }
                Ok(v)
            }
            TAG_REFZ => {
                self.pos += 1;
                self.lookup_ref(u32::from(tag >> TAG_VAL_SHIFT))
            }
            TAG_REF => {
                self.pos += 1;
                let raw = self.take(3)?;
                let refno = u32::from(raw[0]) | u32::from(raw[1]) << 8 | u32::from(raw[2]) << 16;
                self.lookup_ref(refno)
            }
            _ => Err(CodecError::Invalid("unexpected tag byte")),
        }
    }
}

/// Reconstructs the value sequence from an encoded stream.
///
/// # Errors
///
/// [`CodecError::Invalid`]/[`CodecError::Short`] on malformed or truncated
/// data.
pub fn decode(bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::Short);
    }
    let expect = TAG_HEADER | (CODEC_VERSION << 5);
    if bytes[0] & !TAG_HAS_REF != expect {
        return Err(CodecError::Invalid("bad header"));
    }
    let nrefs = u32::from(bytes[1]) | u32::from(bytes[2]) << 8 | u32::from(bytes[3]) << 16;

    let mut end = bytes.len();
    let mut refmap = Vec::new();
    if nrefs > 0 {
        let map_bytes =
            if nrefs <= COMPACT_REFMAP_MAX { nrefs as usize } else { nrefs as usize * 4 };
        if end < 4 + map_bytes {
            return Err(CodecError::Short);
        }
        end -= map_bytes;
        refmap.reserve(nrefs as usize);
        if nrefs <= COMPACT_REFMAP_MAX {
            refmap.extend(bytes[end..].iter().map(|b| u32::from(*b)));
        } else {
            for chunk in bytes[end..].chunks_exact(4) {
                refmap.push(u32::from_le_bytes(chunk.try_into().expect("4 bytes")));
            }
        }
        if refmap.iter().any(|n| *n >= nrefs) {
            return Err(CodecError::Invalid("refmap entry out of range"));
        }
    }

    let mut dec = Decoder {
        buf: bytes,
        pos: 4,
        end,
        refmap,
        reftab: vec![None; nrefs as usize],
        refidx: 0,
    };
    let mut out = Vec::new();
    while dec.pos < dec.end {
        out.push(dec.decode_value()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::OpaqueVal;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn round_trip(values: &[Value]) -> Vec<Value> {
        let bytes = encode(values).expect("encode");
        decode(&bytes).expect("decode")
    }

    #[test]
    fn test_scalars() {
        let input = vec![
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(15),   // fits the embedded INTZ range
            Value::Int(16),   // first full-width int
            Value::Int(-1),
            Value::Int(i64::MIN),
            Value::Float(3.5),
            Value::Float(f64::NAN),
        ];
        let out = round_trip(&input);
        assert_eq!(out.len(), input.len());
        for (a, b) in input.iter().zip(out.iter()) {
            assert!(a.deep_eq(b), "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_strings_short_and_long() {
        let long255 = "a".repeat(255);
        let long300 = "b".repeat(300);
        let out = round_trip(&[Value::str(""), Value::str("hello"), Value::str(&long255), Value::str(&long300)]);
        assert!(out[0].deep_eq(&Value::str("")));
        assert!(out[1].deep_eq(&Value::str("hello")));
        assert!(out[2].deep_eq(&Value::str(&long255)));
        assert!(out[3].deep_eq(&Value::str(&long300)));
    }

    #[test]
    fn test_shared_table_decodes_to_one_object() {
        let t = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let outer = Value::array(vec![t.clone(), t]);
        let out = round_trip(&[outer]);
        let Value::Array(outer) = &out[0] else { panic!("expected array") };
        let outer = outer.borrow();
        let (Value::Array(a), Value::Array(b)) = (&outer[0], &outer[1]) else {
            panic!("expected inner arrays")
        };
        assert!(Rc::ptr_eq(a, b), "sharing not preserved");
        // mutation through one element is visible through the other
        a.borrow_mut().push(Value::Int(4));
        assert_eq!(b.borrow().len(), 4);
    }

    #[test]
    fn test_shared_long_string_preserved() {
        let s = Value::str("s".repeat(SHORT_STR_MAX + 1));
        let out = round_trip(&[s.clone(), s.clone(), s]);
        let (Value::Str(a), Value::Str(b)) = (&out[0], &out[2]) else { panic!("expected strings") };
        assert!(Rc::ptr_eq(a, b));
    }

    #[test]
    fn test_cyclic_array() {
        let t = Value::array(vec![Value::Int(7)]);
        if let Value::Array(a) = &t {
            a.borrow_mut().push(t.clone());
        }
        let out = round_trip(&[t]);
        let Value::Array(a) = &out[0] else { panic!("expected array") };
        let inner = a.borrow();
        assert!(inner[0].deep_eq(&Value::Int(7)));
        let Value::Array(back) = &inner[1] else { panic!("expected cycle") };
        assert!(Rc::ptr_eq(a, back));
    }

    #[test]
    fn test_dict_round_trip() {
        let d = Value::dict([
            (DictKey::Str(Rc::from("name")), Value::str("skein")),
            (DictKey::Int(42), Value::Bool(true)),
            (DictKey::FloatBits(2.5f64.to_bits()), Value::Nil),
        ]);
        let out = round_trip(&[d.clone()]);
        assert!(out[0].deep_eq(&d));
    }

    #[test]
    fn test_func_with_upvalues() {
        let shared = Value::array(vec![Value::Int(9)]);
        let f = Value::func(vec![0xde, 0xad, 0xbe, 0xef], vec![shared.clone(), shared]);
        let out = round_trip(&[f.clone()]);
        assert!(out[0].deep_eq(&f));
        let Value::Func(func) = &out[0] else { panic!("expected fun") };
        let ups = func.upvalues.borrow();
        let (Value::Array(a), Value::Array(b)) = (&ups[0], &ups[1]) else { panic!() };
        assert!(Rc::ptr_eq(a, b));
    }

    #[test]
    fn test_buf_round_trip() {
        let b = Value::buf(vec![1, 2, 3, 0, 255]);
        let out = round_trip(&[b.clone(), b.clone()]);
        assert!(out[0].deep_eq(&b));
        let (Value::Buf(x), Value::Buf(y)) = (&out[0], &out[1]) else { panic!() };
        assert!(Rc::ptr_eq(x, y));
    }

    #[test]
    fn test_opaque_fails_with_invalid() {
        let v = Value::Opaque(Rc::new(OpaqueVal { type_name: "Timer" }));
        let err = encode(&[v]).unwrap_err();
        assert_eq!(err, CodecError::Unsupported("Timer"));
        assert_eq!(err.code(), ErrCode::Invalid);
    }

    #[test]
    fn test_wide_ref_numbers() {
        // More than 16 distinct shared values exercises the u24 REF form;
        // more than 256 exercises the u32 refmap.
        let tables: Vec<Value> = (0..300).map(|i| Value::array(vec![Value::Int(i)])).collect();
        let mut stream: Vec<Value> = tables.clone();
        stream.extend(tables.iter().cloned()); // every table referenced twice
        let out = round_trip(&[Value::array(stream)]);
        let Value::Array(outer) = &out[0] else { panic!() };
        let outer = outer.borrow();
        assert_eq!(outer.len(), 600);
        for i in 0..300 {
            let (Value::Array(a), Value::Array(b)) = (&outer[i], &outer[i + 300]) else { panic!() };
            assert!(Rc::ptr_eq(a, b), "table {i} not shared");
        }
    }

    #[test]
    fn test_bad_header_and_truncation() {
        assert_eq!(decode(&[]), Err(CodecError::Short));
        assert_eq!(decode(&[0xff, 0, 0, 0]), Err(CodecError::Invalid("bad header")));
        let mut good = encode(&[Value::str("hello world")]).unwrap();
        good.truncate(good.len() - 3);
        assert_eq!(decode(&good), Err(CodecError::Short));
    }
}
