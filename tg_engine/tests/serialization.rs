//! Binary tensor format round-trips.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tg_engine::prelude::*;

fn ctx() -> ComputeContext {
    ComputeContext::cpu_only().unwrap()
}

#[test]
fn test_roundtrip_preserves_shape_and_values() {
    let ctx = ctx();
    let mut rng = StdRng::seed_from_u64(41);
    for dims in [vec![1], vec![5], vec![3, 4], vec![2, 1, 3, 2]] {
        let t = ctx.random_with(&dims, &mut rng).unwrap();
        let bytes = t.to_bytes().unwrap();
        assert_eq!(bytes.len(), 4 * (dims.len() + 2) + 4 * t.numel());

        let back = ctx.tensor_from_bytes(&bytes).unwrap();
        assert_eq!(back.dims(), dims);
        assert_eq!(back.to_vec().unwrap(), t.to_vec().unwrap());
        assert!(!back.uses_grad());
    }
}

#[test]
fn test_stream_holds_consecutive_tensors() {
    let ctx = ctx();
    let a = ctx.from_values(&[2], vec![1.5, -2.5]).unwrap();
    let b = ctx.identity(3).unwrap();

    let mut stream = Vec::new();
    a.write_to(&mut stream).unwrap();
    b.write_to(&mut stream).unwrap();

    let mut reader = stream.as_slice();
    let a2 = ctx.read_tensor(&mut reader).unwrap();
    let b2 = ctx.read_tensor(&mut reader).unwrap();
    assert!(reader.is_empty());
    assert_eq!(a2.to_vec().unwrap(), vec![1.5, -2.5]);
    assert_eq!(b2.dims(), vec![3, 3]);
    assert_eq!(b2.to_vec().unwrap(), b.to_vec().unwrap());

    assert!(matches!(
        ctx.read_tensor(&mut reader),
        Err(TensorError::Serialization(_))
    ));
}

#[test]
fn test_negative_header_fields_rejected() {
    let ctx = ctx();
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&1i32.to_be_bytes());
    bytes.extend_from_slice(&(-4i32).to_be_bytes());
    bytes.extend_from_slice(&4i32.to_be_bytes());
    assert!(matches!(
        ctx.tensor_from_bytes(&bytes),
        Err(TensorError::Serialization(_))
    ));
}
