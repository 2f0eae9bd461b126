//! Weight tensor value type.
//!
//! Arithmetic is always performed in f32. A [`Tensor`] pairs the f32 data
//! with a [`DType`] tag recording the storage precision of the weight: values
//! held under an `F16`/`Bf16` tag are kept exactly representable in that
//! precision, so casting is a value-rounding operation rather than a separate
//! storage format.

use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{CoreError, Result};

/// Storage precision of a weight tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE float.
    #[serde(rename = "float32")]
    F32,
    /// 16-bit IEEE float.
    #[serde(rename = "float16")]
    F16,
    /// bfloat16.
    #[serde(rename = "bfloat16")]
    Bf16,
}

impl DType {
    /// Round a value to the nearest representable value in this precision.
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::Bf16 => bf16::from_f32(value).to_f32(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::Bf16 => "bfloat16",
        };
        write!(f, "{name}")
    }
}

impl FromStr for DType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float32" | "fp32" => Ok(DType::F32),
            "float16" | "fp16" => Ok(DType::F16),
            "bfloat16" | "bf16" => Ok(DType::Bf16),
            other => Err(CoreError::UnknownDtype(other.to_string())),
        }
    }
}

/// An n-dimensional weight tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
    dtype: DType,
}

impl Tensor {
    /// Wrap an array, rounding values to the given storage precision.
    pub fn from_array(mut data: ArrayD<f32>, dtype: DType) -> Self {
        if dtype != DType::F32 {
            data.mapv_inplace(|v| dtype.quantize(v));
        }
        Self { data, dtype }
    }

    /// Build an f32 tensor from a flat slice and a shape.
    pub fn from_slice(values: &[f32], shape: &[usize]) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).map_err(|_| {
            CoreError::InvalidShape {
                shape: shape.to_vec(),
                len: values.len(),
            }
        })?;
        Ok(Self {
            data,
            dtype: DType::F32,
        })
    }

    /// An all-zeros tensor of the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(shape)),
            dtype,
        }
    }

    /// Storage dtype of this tensor.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape of this tensor.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor has zero elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the underlying f32 data.
    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Consume the tensor, yielding the underlying f32 data.
    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    /// Cast to another storage dtype, rounding values as needed.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype {
            self.clone()
        } else {
            Tensor::from_array(self.data.clone(), dtype)
        }
    }

    /// Cast in place to another storage dtype, consuming the tensor.
    pub fn into_dtype(mut self, dtype: DType) -> Tensor {
        if dtype != self.dtype {
            self.data.mapv_inplace(|v| dtype.quantize(v));
            self.dtype = dtype;
        }
        self
    }

    /// Whether all elements of `self` and `other` are within `tol` of each
    /// other. Shapes must match exactly.
    pub fn allclose(&self, other: &Tensor, tol: f32) -> bool {
        self.shape() == other.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_shape_checked() {
        let t = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), DType::F32);

        let err = Tensor::from_slice(&[1.0, 2.0], &[3]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidShape { .. }));
    }

    #[test]
    fn test_f16_cast_rounds_values() {
        // 1/3 is not representable in f16; the cast must round the value.
        let t = Tensor::from_slice(&[1.0 / 3.0], &[1]).unwrap();
        let half = t.to_dtype(DType::F16);

        assert_eq!(half.dtype(), DType::F16);
        let v = half.data()[[0]];
        assert_ne!(v, 1.0 / 3.0);
        assert!((v - 1.0 / 3.0).abs() < 1e-3);

        // Casting back to f32 keeps the rounded value.
        let back = half.to_dtype(DType::F32);
        assert_eq!(back.data()[[0]], v);
    }

    #[test]
    fn test_cast_same_dtype_is_identity() {
        let t = Tensor::from_slice(&[0.1, 0.2, 0.3], &[3]).unwrap();
        assert_eq!(t.to_dtype(DType::F32), t);
    }

    #[test]
    fn test_dtype_roundtrip_names() {
        for dtype in [DType::F32, DType::F16, DType::Bf16] {
            assert_eq!(dtype.to_string().parse::<DType>().unwrap(), dtype);
        }
        assert!("int8".parse::<DType>().is_err());
    }

    #[test]
    fn test_allclose() {
        let a = Tensor::from_slice(&[1.0, 2.0], &[2]).unwrap();
        let b = Tensor::from_slice(&[1.0, 2.0 + 1e-7], &[2]).unwrap();
        assert!(a.allclose(&b, 1e-6));
        assert!(!a.allclose(&b, 1e-9));

        let c = Tensor::from_slice(&[1.0, 2.0], &[2, 1]).unwrap();
        assert!(!a.allclose(&c, 1.0));
    }
}
