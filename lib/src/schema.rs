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

//! Column schemas.

use crate::backend::BackendCode;
use crate::error::RepoError;
use crate::error::Result;
use crate::tensor::DType;
use crate::tensor::Tensor;

/// Names of columns, branches and string sample keys share one rule: ASCII
/// `[A-Za-z0-9_.-]`, one to sixteen characters.
pub const MAX_NAME_LEN: usize = 16;

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

pub(crate) fn check_valid_name(kind: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(RepoError::invalid_arg(format!(
            "{kind} name `{name}` must be 1-16 ASCII characters drawn from [A-Za-z0-9_.-]"
        )))
    }
}

/// Declared contract of a column: element type, bounding shape, shape
/// variability, nesting, and the backend its payloads default to.
///
/// Schemas are immutable once committed; the schema record's digest is part
/// of every commit that references the column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    pub dtype: DType,
    /// Declared shape. Fixed-shape columns accept exactly this shape;
    /// variable-shape columns accept any shape bounded dimension-wise by it.
    /// String columns carry an empty declared shape.
    pub shape: Vec<usize>,
    pub variable_shape: bool,
    pub contains_subsamples: bool,
    pub backend: BackendCode,
    /// Canonical backend option token (`""`, `"raw"`, `"zstd<level>"`).
    pub backend_opts: String,
}

impl Schema {
    /// Checks a value against the declared contract.
    pub fn validate_tensor(&self, tensor: &Tensor) -> Result<()> {
        if tensor.dtype() != self.dtype {
            return Err(RepoError::SchemaMismatch(format!(
                "value dtype {} does not match column dtype {}",
                tensor.dtype(),
                self.dtype
            )));
        }
        if self.dtype == DType::Str {
            // Text payloads are variable by construction.
            return Ok(());
        }
        if self.variable_shape {
            if tensor.ndim() != self.shape.len()
                || tensor.shape().iter().zip(&self.shape).any(|(dim, max)| dim > max)
            {
                return Err(RepoError::SchemaMismatch(format!(
                    "value shape {:?} exceeds declared maximum shape {:?}",
                    tensor.shape(),
                    self.shape
                )));
            }
        } else if tensor.shape() != self.shape {
            return Err(RepoError::SchemaMismatch(format!(
                "value shape {:?} does not equal fixed column shape {:?}",
                tensor.shape(),
                self.shape
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;
    use crate::error::RepoError;

    fn fixed_schema() -> Schema {
        Schema {
            dtype: DType::F64,
            shape: vec![5, 7],
            variable_shape: false,
            contains_subsamples: false,
            backend: BackendCode::PACK_V1,
            backend_opts: "zstd5".to_owned(),
        }
    }

    #[test_case("a"; "single char")]
    #[test_case("train_images"; "snake case")]
    #[test_case("v1.2-rc"; "dots and dashes")]
    #[test_case("0123456789abcdef"; "sixteen chars")]
    fn test_valid_names(name: &str) {
        assert!(is_valid_name(name));
    }

    #[test_case(""; "empty")]
    #[test_case("0123456789abcdefg"; "seventeen chars")]
    #[test_case("with space"; "space")]
    #[test_case("uni\u{00e9}"; "non ascii")]
    #[test_case("semi;colon"; "punctuation")]
    fn test_invalid_names(name: &str) {
        assert!(!is_valid_name(name));
        assert_matches!(
            check_valid_name("column", name),
            Err(RepoError::InvalidArg(_))
        );
    }

    #[test]
    fn test_fixed_shape_must_match_exactly() {
        let schema = fixed_schema();
        schema.validate_tensor(&Tensor::zeros(&[5, 7], DType::F64)).unwrap();
        assert_matches!(
            schema.validate_tensor(&Tensor::zeros(&[5, 6], DType::F64)),
            Err(RepoError::SchemaMismatch(_))
        );
        assert_matches!(
            schema.validate_tensor(&Tensor::zeros(&[5, 7], DType::F32)),
            Err(RepoError::SchemaMismatch(_))
        );
    }

    #[test]
    fn test_variable_shape_is_bounded() {
        let schema = Schema {
            variable_shape: true,
            ..fixed_schema()
        };
        schema.validate_tensor(&Tensor::zeros(&[5, 7], DType::F64)).unwrap();
        schema.validate_tensor(&Tensor::zeros(&[1, 1], DType::F64)).unwrap();
        assert_matches!(
            schema.validate_tensor(&Tensor::zeros(&[5, 8], DType::F64)),
            Err(RepoError::SchemaMismatch(_))
        );
        assert_matches!(
            schema.validate_tensor(&Tensor::zeros(&[5], DType::F64)),
            Err(RepoError::SchemaMismatch(_))
        );
    }
}
