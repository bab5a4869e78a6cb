//! Binary tensor format.
//!
//! All fields are big-endian: rank (`i32`), each dimension (`i32`), the
//! element count (`i32`), then the `f32` values in row-major order.

use std::io::{self, Read, Write};

use tg_tensor::{Result, Shape, TensorError};

use crate::context::ComputeContext;
use crate::tensor::Tensor;

/// Ranks above this are rejected as corrupt headers.
const MAX_RANK: usize = 32;

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| TensorError::Serialization(format!("{what} {value} does not fit in an i32")))
}

fn read_i32<R: Read>(reader: &mut R, what: &str) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| truncated(e, what))?;
    Ok(i32::from_be_bytes(buf))
}

fn read_len<R: Read>(reader: &mut R, what: &str) -> Result<usize> {
    let value = read_i32(reader, what)?;
    usize::try_from(value)
        .map_err(|_| TensorError::Serialization(format!("negative {what}: {value}")))
}

fn truncated(e: io::Error, what: &str) -> TensorError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TensorError::Serialization(format!("stream ended while reading {what}"))
    } else {
        TensorError::Io(e)
    }
}

impl Tensor {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let dims = self.dims();
        let values = self.to_vec()?;

        writer.write_all(&to_i32(dims.len(), "rank")?.to_be_bytes())?;
        for &d in &dims {
            writer.write_all(&to_i32(d, "dimension")?.to_be_bytes())?;
        }
        writer.write_all(&to_i32(values.len(), "element count")?.to_be_bytes())?;
        let mut body = Vec::with_capacity(values.len() * 4);
        for v in values {
            body.extend_from_slice(&v.to_be_bytes());
        }
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }
}

impl ComputeContext {
    /// Reads one tensor into host memory.
    pub fn read_tensor<R: Read>(&self, reader: &mut R) -> Result<Tensor> {
        let rank = read_len(reader, "rank")?;
        if rank == 0 || rank > MAX_RANK {
            return Err(TensorError::Serialization(format!(
                "rank {rank} outside 1..={MAX_RANK}"
            )));
        }
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(read_len(reader, "dimension")?);
        }
        let shape = Shape::new(dims)
            .map_err(|e| TensorError::Serialization(format!("bad header: {e}")))?;

        let count = read_len(reader, "element count")?;
        if count != shape.numel() {
            return Err(TensorError::Serialization(format!(
                "element count {count} does not match shape {shape}"
            )));
        }

        let expected = count.checked_mul(4).ok_or_else(|| {
            TensorError::Serialization(format!("element count {count} too large"))
        })?;
        let mut body = Vec::new();
        reader
            .by_ref()
            .take(expected as u64)
            .read_to_end(&mut body)
            .map_err(|e| truncated(e, "values"))?;
        if body.len() != expected {
            return Err(TensorError::Serialization(
                "stream ended while reading values".into(),
            ));
        }
        let values = body
            .chunks_exact(4)
            .map(|b| f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.from_values(shape.dims(), values)
    }

    pub fn tensor_from_bytes(&self, mut bytes: &[u8]) -> Result<Tensor> {
        self.read_tensor(&mut bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ComputeContext {
        ComputeContext::cpu_only().unwrap()
    }

    #[test]
    fn test_layout_is_big_endian() {
        let t = ctx().from_values(&[2], vec![1.0, -2.0]).unwrap();
        let bytes = t.to_bytes().unwrap();
        let mut expected = vec![0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 2];
        expected.extend_from_slice(&1.0f32.to_be_bytes());
        expected.extend_from_slice(&(-2.0f32).to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let ctx = ctx();
        // rank 0
        assert!(matches!(
            ctx.tensor_from_bytes(&[0, 0, 0, 0]),
            Err(TensorError::Serialization(_))
        ));
        // rank 1, dim 2, count 3
        let bad_count = [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3];
        assert!(matches!(
            ctx.tensor_from_bytes(&bad_count),
            Err(TensorError::Serialization(_))
        ));
        // zero dimension
        let zero_dim = [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            ctx.tensor_from_bytes(&zero_dim),
            Err(TensorError::Serialization(_))
        ));
    }

    #[test]
    fn test_rejects_overflowing_dimensions() {
        let ctx = ctx();
        // rank 3, every dimension i32::MAX, count 1
        let mut bytes = 3i32.to_be_bytes().to_vec();
        for _ in 0..3 {
            bytes.extend_from_slice(&i32::MAX.to_be_bytes());
        }
        bytes.extend_from_slice(&1i32.to_be_bytes());
        assert!(matches!(
            ctx.tensor_from_bytes(&bytes),
            Err(TensorError::Serialization(_))
        ));
    }

    #[test]
    fn test_large_claimed_count_without_body() {
        let ctx = ctx();
        // rank 1, dim i32::MAX, count i32::MAX, no values
        let mut bytes = 1i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&i32::MAX.to_be_bytes());
        bytes.extend_from_slice(&i32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            ctx.tensor_from_bytes(&bytes),
            Err(TensorError::Serialization(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_body() {
        let ctx = ctx();
        let bytes = ctx.ones(&[3]).unwrap().to_bytes().unwrap();
        assert!(matches!(
            ctx.tensor_from_bytes(&bytes[..bytes.len() - 2]),
            Err(TensorError::Serialization(_))
        ));
    }
}
