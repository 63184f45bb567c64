use half::f16;
use slipstream::gguf::{self, Value, ValueType, Writer};
use slipstream::DType;

#[test]
fn round_trip_metadata_and_tensor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.gguf");

    let payload: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
        .iter()
        .flat_map(|&v| f16::from_f32(v).to_le_bytes())
        .collect();

    let mut wr = Writer::new();
    wr.set_kv(gguf::ALIGNMENT_KEY, Value::U32(64));
    wr.set_kv(
        "foo",
        Value::Array(
            ValueType::F32,
            vec![Value::F32(1.0), Value::F32(2.0), Value::F32(3.0)],
        ),
    );
    wr.set_kv("bar", Value::Str("hi".into()));
    wr.add_tensor("embedding", DType::F16, &[3, 2], payload.clone());
    wr.write_to(&path).unwrap();

    let mapped = gguf::MappedGguf::open(&path).unwrap();
    assert_eq!(mapped.file.alignment, 64);
    assert_eq!(mapped.file.metadata.get("bar"), Some(&Value::Str("hi".into())));
    assert_eq!(
        mapped.file.metadata.get("foo"),
        Some(&Value::Array(
            ValueType::F32,
            vec![Value::F32(1.0), Value::F32(2.0), Value::F32(3.0)],
        ))
    );

    let info = mapped.file.tensor("embedding").unwrap();
    assert_eq!(info.ne, vec![3, 2]);
    assert_eq!(info.dtype, DType::F16);
    assert_eq!(info.offset % 64, 0);
    assert_eq!(mapped.payload(info), &payload[..]);
}

#[test]
fn byte_identical_rewrite() {
    // writing the same content twice produces the same bytes
    let build = || {
        let mut wr = Writer::new();
        wr.set_kv("a", Value::I64(-5));
        wr.set_kv("b", Value::Bool(true));
        wr.add_tensor("t", DType::F32, &[4], vec![0u8; 16]);
        let mut buf = Vec::new();
        wr.write(&mut buf).unwrap();
        buf
    };
    assert_eq!(build(), build());
}

#[test]
fn key_insertion_order_survives() {
    let mut wr = Writer::new();
    for key in ["zz", "aa", "mm", "bb"] {
        wr.set_kv(key, Value::U8(1));
    }
    let mut buf = Vec::new();
    wr.write(&mut buf).unwrap();
    let file = gguf::read_meta(&mut std::io::Cursor::new(buf)).unwrap();
    let keys: Vec<&str> = file.metadata.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["zz", "aa", "mm", "bb"]);
}

#[test]
fn load_into_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.gguf");

    let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    let mut wr = Writer::new();
    wr.add_tensor("blk.0.weight", DType::F32, &[4, 3], bytes);
    wr.write_to(&path).unwrap();

    let (ctx, file) = gguf::load(&path).unwrap();
    assert_eq!(file.tensors.len(), 1);
    let id = ctx.find("blk.0.weight").unwrap();
    assert_eq!(ctx.tensor(id).ne, [4, 3, 1, 1]);
    assert_eq!(ctx.f32s(id), &data[..]);
}

#[test]
fn truncated_file_is_rejected() {
    let mut wr = Writer::new();
    wr.set_kv("k", Value::Str("value".into()));
    wr.add_tensor("t", DType::F32, &[8], vec![1u8; 32]);
    let mut buf = Vec::new();
    wr.write(&mut buf).unwrap();

    // chop the payload: meta parses but the mapped payload is short
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.gguf");
    std::fs::write(&path, &buf[..buf.len() - 16]).unwrap();
    assert!(gguf::MappedGguf::open(&path).is_err());
}

#[test]
fn version_below_two_is_rejected() {
    let mut buf = b"GGUF".to_vec();
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    assert!(gguf::read_meta(&mut std::io::Cursor::new(buf)).is_err());
}
