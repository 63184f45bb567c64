//! GGUF container: self-describing little-endian files of typed key-value
//! metadata followed by aligned tensor payloads.
//!
//! The reader validates counts and lengths before any allocation and never
//! reinterprets raw structs; every field goes through explicit
//! little-endian decoding.

use crate::context::{Context, ContextParams};
use crate::errors::{SlipError, SlipResult};
use crate::tensor::TensorId;
use crate::types::DType;
use memmap2::Mmap;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

pub const MAGIC: [u8; 4] = *b"GGUF";
pub const VERSION: u32 = 3;
pub const DEFAULT_ALIGNMENT: usize = 32;
pub const ALIGNMENT_KEY: &str = "general.alignment";

/// Hard caps guarding against corrupted counts before any allocation.
const MAX_KV: u64 = 1 << 24;
const MAX_TENSORS: u64 = 1 << 24;
const MAX_STRING: u64 = 1 << 28;
const MAX_ARRAY: u64 = 1 << 28;
const MAX_DIMS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    Str,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    pub fn tag(self) -> u32 {
        match self {
            ValueType::U8 => 0,
            ValueType::I8 => 1,
            ValueType::U16 => 2,
            ValueType::I16 => 3,
            ValueType::U32 => 4,
            ValueType::I32 => 5,
            ValueType::F32 => 6,
            ValueType::Bool => 7,
            ValueType::Str => 8,
            ValueType::Array => 9,
            ValueType::U64 => 10,
            ValueType::I64 => 11,
            ValueType::F64 => 12,
        }
    }

    pub fn from_tag(tag: u32) -> Option<ValueType> {
        Some(match tag {
            0 => ValueType::U8,
            1 => ValueType::I8,
            2 => ValueType::U16,
            3 => ValueType::I16,
            4 => ValueType::U32,
            5 => ValueType::I32,
            6 => ValueType::F32,
            7 => ValueType::Bool,
            8 => ValueType::Str,
            9 => ValueType::Array,
            10 => ValueType::U64,
            11 => ValueType::I64,
            12 => ValueType::F64,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    Str(String),
    /// Homogeneous array; nesting is forbidden by the format.
    Array(ValueType, Vec<Value>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::U8(_) => ValueType::U8,
            Value::I8(_) => ValueType::I8,
            Value::U16(_) => ValueType::U16,
            Value::I16(_) => ValueType::I16,
            Value::U32(_) => ValueType::U32,
            Value::I32(_) => ValueType::I32,
            Value::F32(_) => ValueType::F32,
            Value::Bool(_) => ValueType::Bool,
            Value::Str(_) => ValueType::Str,
            Value::Array(..) => ValueType::Array,
            Value::U64(_) => ValueType::U64,
            Value::I64(_) => ValueType::I64,
            Value::F64(_) => ValueType::F64,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            Value::U8(v) => Some(*v as u32),
            Value::U16(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Key-value records in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    kv: Vec<(String, Value)>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.kv.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.kv.push((key.to_string(), value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.kv.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.kv.iter()
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    pub fn alignment(&self) -> usize {
        self.get(ALIGNMENT_KEY)
            .and_then(|v| v.as_u32())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_ALIGNMENT)
    }

    /// JSON rendering of the metadata, for inspection and debug dumps.
    pub fn to_json_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.kv {
            map.insert(k.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null));
        }
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub ne: Vec<u64>,
    pub dtype: DType,
    /// Byte offset inside the data section.
    pub offset: u64,
}

impl TensorInfo {
    pub fn nbytes(&self) -> usize {
        let ne0 = self.ne.first().copied().unwrap_or(1) as usize;
        let rest: u64 = self.ne.iter().skip(1).product();
        self.dtype.row_size(ne0) * rest as usize
    }
}

#[derive(Debug)]
pub struct GgufFile {
    pub metadata: Metadata,
    pub tensors: Vec<TensorInfo>,
    pub alignment: usize,
    /// Absolute file offset where the padded data section starts.
    pub data_offset: u64,
}

impl GgufFile {
    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

fn err(msg: impl Into<String>) -> SlipError {
    SlipError::Gguf(msg.into())
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> SlipResult<()> {
    r.read_exact(buf).map_err(SlipError::Io)
}

fn read_u8<R: Read>(r: &mut R) -> SlipResult<u8> {
    let mut b = [0u8; 1];
    read_exact(r, &mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> SlipResult<u32> {
    let mut b = [0u8; 4];
    read_exact(r, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> SlipResult<u64> {
    let mut b = [0u8; 8];
    read_exact(r, &mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_string<R: Read>(r: &mut R) -> SlipResult<String> {
    let len = read_u64(r)?;
    if len > MAX_STRING {
        return Err(err(format!("string length {} exceeds limit", len)));
    }
    let mut buf = vec![0u8; len as usize];
    read_exact(r, &mut buf)?;
    String::from_utf8(buf).map_err(|_| err("string is not valid UTF-8"))
}

fn read_scalar<R: Read>(r: &mut R, vt: ValueType) -> SlipResult<Value> {
    Ok(match vt {
        ValueType::U8 => Value::U8(read_u8(r)?),
        ValueType::I8 => Value::I8(read_u8(r)? as i8),
        ValueType::U16 => {
            let mut b = [0u8; 2];
            read_exact(r, &mut b)?;
            Value::U16(u16::from_le_bytes(b))
        }
        ValueType::I16 => {
            let mut b = [0u8; 2];
            read_exact(r, &mut b)?;
            Value::I16(i16::from_le_bytes(b))
        }
        ValueType::U32 => Value::U32(read_u32(r)?),
        ValueType::I32 => Value::I32(read_u32(r)? as i32),
        ValueType::F32 => Value::F32(f32::from_le_bytes({
            let mut b = [0u8; 4];
            read_exact(r, &mut b)?;
            b
        })),
        ValueType::Bool => Value::Bool(read_u8(r)? != 0),
        ValueType::Str => Value::Str(read_string(r)?),
        ValueType::U64 => Value::U64(read_u64(r)?),
        ValueType::I64 => Value::I64(read_u64(r)? as i64),
        ValueType::F64 => Value::F64(f64::from_le_bytes({
            let mut b = [0u8; 8];
            read_exact(r, &mut b)?;
            b
        })),
        ValueType::Array => unreachable!("arrays are handled by read_value"),
    })
}

fn read_value<R: Read>(r: &mut R, vt: ValueType) -> SlipResult<Value> {
    if vt != ValueType::Array {
        return read_scalar(r, vt);
    }
    let elem_tag = read_u32(r)?;
    let elem_type =
        ValueType::from_tag(elem_tag).ok_or_else(|| err(format!("bad array element type {elem_tag}")))?;
    if elem_type == ValueType::Array {
        return Err(err("nested arrays are forbidden"));
    }
    let n = read_u64(r)?;
    if n > MAX_ARRAY {
        return Err(err(format!("array length {} exceeds limit", n)));
    }
    let mut items = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        items.push(read_scalar(r, elem_type)?);
    }
    Ok(Value::Array(elem_type, items))
}

/// Parse header, key-value records and tensor descriptors. The reader is
/// left positioned at the start of the (aligned) data section.
pub fn read_meta<R: Read + Seek>(r: &mut R) -> SlipResult<GgufFile> {
    let mut magic = [0u8; 4];
    read_exact(r, &mut magic)?;
    if magic != MAGIC {
        return Err(err("bad magic, not a GGUF file"));
    }
    let version = read_u32(r)?;
    if version < 2 {
        return Err(err(format!("unsupported version {version} (need >= 2)")));
    }
    let n_tensors = read_u64(r)?;
    let n_kv = read_u64(r)?;
    if n_tensors > MAX_TENSORS || n_kv > MAX_KV {
        return Err(err("tensor/kv count exceeds limit"));
    }

    let mut metadata = Metadata::new();
    for _ in 0..n_kv {
        let key = read_string(r)?;
        let tag = read_u32(r)?;
        let vt = ValueType::from_tag(tag).ok_or_else(|| err(format!("bad value type {tag}")))?;
        let value = read_value(r, vt)?;
        metadata.insert(&key, value);
    }

    let mut tensors = Vec::with_capacity(n_tensors.min(4096) as usize);
    for _ in 0..n_tensors {
        let name = read_string(r)?;
        let n_dims = read_u32(r)?;
        if n_dims == 0 || n_dims > MAX_DIMS {
            return Err(err(format!("tensor '{name}' has {n_dims} dimensions")));
        }
        let mut ne = Vec::with_capacity(n_dims as usize);
        let mut total: u64 = 1;
        for _ in 0..n_dims {
            let d = read_u64(r)?;
            total = total
                .checked_mul(d)
                .ok_or_else(|| err(format!("tensor '{name}' shape overflows")))?;
            ne.push(d);
        }
        let tag = read_u32(r)?;
        let dtype =
            DType::from_tag(tag).ok_or_else(|| err(format!("tensor '{name}' has bad type {tag}")))?;
        let offset = read_u64(r)?;
        tensors.push(TensorInfo {
            name,
            ne,
            dtype,
            offset,
        });
    }

    let alignment = metadata.alignment();
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(err(format!("bad alignment {alignment}")));
    }
    let pos = r.stream_position()?;
    let data_offset = pad_u64(pos, alignment as u64);
    r.seek(SeekFrom::Start(data_offset))?;

    debug!(
        n_tensors = tensors.len(),
        n_kv = metadata.len(),
        alignment,
        "gguf meta read"
    );
    Ok(GgufFile {
        metadata,
        tensors,
        alignment,
        data_offset,
    })
}

fn pad_u64(n: u64, align: u64) -> u64 {
    (n + align - 1) / align * align
}

/// Memory-map a GGUF file; payload slices come out of the mapping.
pub struct MappedGguf {
    pub file: GgufFile,
    mmap: Mmap,
}

impl MappedGguf {
    pub fn open(path: impl AsRef<Path>) -> SlipResult<MappedGguf> {
        let mut f = File::open(path)?;
        let file = read_meta(&mut f)?;
        let mmap = unsafe { Mmap::map(&f)? };
        // payload bounds check before anyone slices
        for t in &file.tensors {
            let start = file.data_offset + t.offset;
            let end = start + t.nbytes() as u64;
            if end > mmap.len() as u64 {
                return Err(err(format!("tensor '{}' payload out of bounds", t.name)));
            }
        }
        Ok(MappedGguf { file, mmap })
    }

    pub fn payload(&self, info: &TensorInfo) -> &[u8] {
        let start = (self.file.data_offset + info.offset) as usize;
        &self.mmap[start..start + info.nbytes()]
    }
}

/// Load a GGUF file into a fresh context: one named tensor per descriptor,
/// payload bytes copied in.
pub fn load(path: impl AsRef<Path>) -> SlipResult<(Context, GgufFile)> {
    let mapped = MappedGguf::open(path)?;
    let payload_bytes: usize = mapped.file.tensors.iter().map(|t| t.nbytes() + 64).sum();
    let mut ctx = Context::new(ContextParams {
        mem_size: payload_bytes + (1 << 16),
        no_alloc: false,
    })?;
    for info in &mapped.file.tensors {
        let ne: Vec<i64> = info.ne.iter().map(|&d| d as i64).collect();
        let id = ctx.try_new_tensor(info.dtype, &ne)?;
        ctx.set_name(id, &info.name);
        ctx.bytes_mut(id).copy_from_slice(mapped.payload(info));
    }
    Ok((ctx, mapped.file))
}

/// Incremental GGUF writer: collect metadata and tensors, then emit the
/// whole file.
#[derive(Default)]
pub struct Writer {
    metadata: Metadata,
    tensors: Vec<(TensorInfo, Vec<u8>)>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer::default()
    }

    pub fn set_kv(&mut self, key: &str, value: Value) {
        self.metadata.insert(key, value);
    }

    pub fn add_tensor(&mut self, name: &str, dtype: DType, ne: &[u64], data: Vec<u8>) {
        let info = TensorInfo {
            name: name.to_string(),
            ne: ne.to_vec(),
            dtype,
            offset: 0,
        };
        assert_eq!(data.len(), info.nbytes(), "payload size mismatch for '{name}'");
        self.tensors.push((info, data));
    }

    /// Pull a named tensor (with payload) out of a context.
    pub fn add_from_context(&mut self, ctx: &Context, id: TensorId) {
        let t = ctx.tensor(id);
        assert!(t.is_contiguous(), "only contiguous tensors are persisted");
        let n_dims = (1..=4).rev().find(|&i| t.ne[i - 1] != 1).unwrap_or(1);
        let ne: Vec<u64> = t.ne[..n_dims].iter().map(|&d| d as u64).collect();
        let name = t.name.clone();
        self.add_tensor(&name, t.dtype, &ne, ctx.bytes(id).to_vec());
    }

    pub fn write_to(&mut self, path: impl AsRef<Path>) -> SlipResult<()> {
        let mut f = File::create(path)?;
        self.write(&mut f)
    }

    pub fn write<W: Write>(&mut self, w: &mut W) -> SlipResult<()> {
        let alignment = self.metadata.alignment() as u64;

        // lay out payload offsets
        let mut offset = 0u64;
        for (info, data) in &mut self.tensors {
            info.offset = offset;
            offset = pad_u64(offset + data.len() as u64, alignment);
        }

        w.write_all(&MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.tensors.len() as u64).to_le_bytes())?;
        w.write_all(&(self.metadata.len() as u64).to_le_bytes())?;

        for (key, value) in self.metadata.iter() {
            write_string(w, key)?;
            w.write_all(&value.value_type().tag().to_le_bytes())?;
            write_value(w, value)?;
        }

        let mut head = 4 + 4 + 8 + 8;
        for (key, value) in self.metadata.iter() {
            head += 8 + key.len() + 4 + value_size(value);
        }
        for (info, _) in &self.tensors {
            head += 8 + info.name.len() + 4 + 8 * info.ne.len() + 4 + 8;
            write_string(w, &info.name)?;
            w.write_all(&(info.ne.len() as u32).to_le_bytes())?;
            for &d in &info.ne {
                w.write_all(&d.to_le_bytes())?;
            }
            w.write_all(&info.dtype.tag().to_le_bytes())?;
            w.write_all(&info.offset.to_le_bytes())?;
        }

        // pad to the data section, then each payload to the alignment
        let data_start = pad_u64(head as u64, alignment);
        write_zeros(w, (data_start - head as u64) as usize)?;
        let mut pos = 0u64;
        for (info, data) in &self.tensors {
            write_zeros(w, (info.offset - pos) as usize)?;
            w.write_all(data)?;
            pos = info.offset + data.len() as u64;
        }
        let end = pad_u64(pos, alignment);
        write_zeros(w, (end - pos) as usize)?;
        Ok(())
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> SlipResult<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn write_zeros<W: Write>(w: &mut W, n: usize) -> SlipResult<()> {
    const Z: [u8; 64] = [0; 64];
    let mut left = n;
    while left > 0 {
        let take = left.min(Z.len());
        w.write_all(&Z[..take])?;
        left -= take;
    }
    Ok(())
}

fn write_value<W: Write>(w: &mut W, v: &Value) -> SlipResult<()> {
    match v {
        Value::U8(x) => w.write_all(&[*x])?,
        Value::I8(x) => w.write_all(&[*x as u8])?,
        Value::U16(x) => w.write_all(&x.to_le_bytes())?,
        Value::I16(x) => w.write_all(&x.to_le_bytes())?,
        Value::U32(x) => w.write_all(&x.to_le_bytes())?,
        Value::I32(x) => w.write_all(&x.to_le_bytes())?,
        Value::F32(x) => w.write_all(&x.to_le_bytes())?,
        Value::Bool(x) => w.write_all(&[*x as u8])?,
        Value::Str(s) => write_string(w, s)?,
        Value::U64(x) => w.write_all(&x.to_le_bytes())?,
        Value::I64(x) => w.write_all(&x.to_le_bytes())?,
        Value::F64(x) => w.write_all(&x.to_le_bytes())?,
        Value::Array(et, items) => {
            if *et == ValueType::Array {
                return Err(err("nested arrays are forbidden"));
            }
            w.write_all(&et.tag().to_le_bytes())?;
            w.write_all(&(items.len() as u64).to_le_bytes())?;
            for item in items {
                if item.value_type() != *et {
                    return Err(err("heterogeneous array"));
                }
                write_value(w, item)?;
            }
        }
    }
    Ok(())
}

fn value_size(v: &Value) -> usize {
    match v {
        Value::U8(_) | Value::I8(_) | Value::Bool(_) => 1,
        Value::U16(_) | Value::I16(_) => 2,
        Value::U32(_) | Value::I32(_) | Value::F32(_) => 4,
        Value::U64(_) | Value::I64(_) | Value::F64(_) => 8,
        Value::Str(s) => 8 + s.len(),
        Value::Array(_, items) => 4 + 8 + items.iter().map(value_size).sum::<usize>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn value_tags_round_trip() {
        for tag in 0..=12u32 {
            let vt = ValueType::from_tag(tag).unwrap();
            assert_eq!(vt.tag(), tag);
        }
        assert!(ValueType::from_tag(13).is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut cur = Cursor::new(b"GGML\x03\x00\x00\x00".to_vec());
        assert!(matches!(read_meta(&mut cur), Err(SlipError::Gguf(_))));
    }

    #[test]
    fn meta_round_trip_preserves_order() {
        let mut wr = Writer::new();
        wr.set_kv("zeta", Value::U32(7));
        wr.set_kv("alpha", Value::Str("hello".into()));
        wr.set_kv("list", Value::Array(ValueType::F32, vec![Value::F32(1.0), Value::F32(2.0)]));
        let mut buf = Vec::new();
        wr.write(&mut buf).unwrap();

        let mut cur = Cursor::new(buf);
        let file = read_meta(&mut cur).unwrap();
        let keys: Vec<&str> = file.metadata.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "list"]);
        assert_eq!(file.metadata.get("zeta"), Some(&Value::U32(7)));
    }

    #[test]
    fn alignment_key_overrides_default() {
        let mut wr = Writer::new();
        wr.set_kv(ALIGNMENT_KEY, Value::U32(64));
        wr.add_tensor("t", DType::F32, &[4], vec![0u8; 16]);
        let mut buf = Vec::new();
        wr.write(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        let file = read_meta(&mut cur).unwrap();
        assert_eq!(file.alignment, 64);
        assert_eq!(file.data_offset % 64, 0);
    }
}
