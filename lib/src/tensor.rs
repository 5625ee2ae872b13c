// Copyright 2023 The Tensile Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! N-dimensional payload buffers.
//!
//! A [`Tensor`] owns a flat little-endian byte buffer plus its declared
//! element type and shape. Backends store and return these buffers
//! bit-identically; equality of two tensors is equality of
//! `(dtype, shape, bytes)`.

use std::fmt;

use crate::error::RepoError;
use crate::error::Result;

/// Element type of a tensor.
///
/// The `u8` wire code of each variant is a permanent assignment; new
/// element types receive new codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    /// UTF-8 string payload, used by string columns. Shape is always `[1]`
    /// and the byte buffer holds the encoded text.
    Str,
}

impl DType {
    pub const ALL: [Self; 9] = [
        Self::F32,
        Self::F64,
        Self::I32,
        Self::I64,
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::Str,
    ];

    pub fn code(self) -> u8 {
        match self {
            Self::F32 => 0,
            Self::F64 => 1,
            Self::I32 => 2,
            Self::I64 => 3,
            Self::U8 => 4,
            Self::U16 => 5,
            Self::U32 => 6,
            Self::U64 => 7,
            Self::Str => 8,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        DType::ALL
            .into_iter()
            .find(|dtype| dtype.code() == code)
            .ok_or_else(|| RepoError::corruption(format!("unknown dtype code `{code}`")))
    }

    /// Bytes per element. Strings are byte-granular.
    pub fn item_size(self) -> usize {
        match self {
            Self::U8 | Self::Str => 1,
            Self::U16 => 2,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 | Self::U64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::Str => "str",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// An owned N-dimensional numeric buffer (or a UTF-8 string payload).
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Wraps an existing little-endian buffer, validating its length against
    /// the declared shape.
    pub fn from_le_bytes(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.item_size();
        if dtype == DType::Str {
            if shape != [data.len()] {
                return Err(RepoError::invalid_arg(format!(
                    "str payload shape {shape:?} must equal its byte length {}",
                    data.len()
                )));
            }
        } else if data.len() != expected {
            return Err(RepoError::invalid_arg(format!(
                "buffer of {} bytes does not match shape {shape:?} of dtype {dtype} \
                 (expected {expected} bytes)",
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// An all-zeros numeric tensor.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let nbytes = shape.iter().product::<usize>() * dtype.item_size();
        Self {
            dtype,
            shape: shape.to_vec(),
            data: vec![0; nbytes],
        }
    }

    /// A string payload tensor.
    pub fn from_string(value: impl Into<String>) -> Self {
        let data = value.into().into_bytes();
        Self {
            dtype: DType::Str,
            shape: vec![data.len()],
            data,
        }
    }

    /// The UTF-8 text of a [`DType::Str`] tensor.
    pub fn as_str(&self) -> Result<&str> {
        if self.dtype != DType::Str {
            return Err(RepoError::invalid_arg(format!(
                "tensor of dtype {} holds no string payload",
                self.dtype
            )));
        }
        std::str::from_utf8(&self.data)
            .map_err(|_| RepoError::corruption("string payload is not valid UTF-8"))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Total buffer size in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_le_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("nbytes", &self.data.len())
            .finish()
    }
}

macro_rules! tensor_from_elems {
    ($name:ident, $elem:ty, $dtype:expr) => {
        impl Tensor {
            /// Builds a tensor of the matching dtype from native elements in
            /// row-major order.
            pub fn $name(shape: &[usize], elems: &[$elem]) -> Result<Self> {
                if shape.iter().product::<usize>() != elems.len() {
                    return Err(RepoError::invalid_arg(format!(
                        "{} elements do not fill shape {shape:?}",
                        elems.len()
                    )));
                }
                let mut data = Vec::with_capacity(elems.len() * std::mem::size_of::<$elem>());
                for elem in elems {
                    data.extend_from_slice(&elem.to_le_bytes());
                }
                Ok(Self {
                    dtype: $dtype,
                    shape: shape.to_vec(),
                    data,
                })
            }
        }
    };
}

tensor_from_elems!(from_f32, f32, DType::F32);
tensor_from_elems!(from_f64, f64, DType::F64);
tensor_from_elems!(from_i32, i32, DType::I32);
tensor_from_elems!(from_i64, i64, DType::I64);
tensor_from_elems!(from_u8, u8, DType::U8);
tensor_from_elems!(from_u16, u16, DType::U16);
tensor_from_elems!(from_u32, u32, DType::U32);
tensor_from_elems!(from_u64, u64, DType::U64);
