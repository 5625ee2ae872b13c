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

//! The hash machine.
//!
//! Every stored artifact kind hashes through its own typed function, and the
//! resulting digest embeds a type code naming that function. Type codes are
//! a permanent assignment: a new hashing scheme receives a new code rather
//! than replacing an existing one, so the integrity verifier can always
//! recompute any digest ever issued.

use blake2::Blake2b512;
use digest::Digest as _;

use crate::digest::DIGEST_RAW_LEN;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::tensor::Tensor;

/// Type code of tensor payload digests.
pub const TENSOR_TCODE: char = '0';
/// Type code of schema record digests.
pub const SCHEMA_TCODE: char = '1';
/// Type code of metadata value digests.
pub const METADATA_TCODE: char = '2';
/// Type code of commit digests.
pub const COMMIT_TCODE: char = '3';

fn blake2b_trunc(parts: &[&[u8]]) -> [u8; DIGEST_RAW_LEN] {
    let mut hasher = Blake2b512::new();
    for part in parts {
        hasher.update(part);
    }
    let full = hasher.finalize();
    let mut raw = [0; DIGEST_RAW_LEN];
    raw.copy_from_slice(&full[..DIGEST_RAW_LEN]);
    raw
}

/// Digest of a tensor payload: dtype code, shape, then the raw buffer.
pub fn tensor_digest(tensor: &Tensor) -> Digest {
    let mut header = vec![tensor.dtype().code()];
    header.extend_from_slice(&(tensor.ndim() as u64).to_le_bytes());
    for dim in tensor.shape() {
        header.extend_from_slice(&(*dim as u64).to_le_bytes());
    }
    let raw = blake2b_trunc(&[&header, tensor.as_le_bytes()]);
    Digest::from_parts(TENSOR_TCODE, &raw)
}

/// Digest of an encoded schema record.
pub fn schema_digest(record: &[u8]) -> Digest {
    Digest::from_parts(SCHEMA_TCODE, &blake2b_trunc(&[record]))
}

/// Digest of a metadata value.
pub fn metadata_digest(value: &str) -> Digest {
    Digest::from_parts(METADATA_TCODE, &blake2b_trunc(&[value.as_bytes()]))
}

/// Digest of a commit: parent record, meta record, then the ordered
/// (uncompressed) refs snapshot.
pub fn commit_digest(parent_record: &[u8], meta_record: &[u8], refs_snapshot: &[u8]) -> Digest {
    let raw = blake2b_trunc(&[parent_record, meta_record, refs_snapshot]);
    Digest::from_parts(COMMIT_TCODE, &raw)
}

/// Recomputes a tensor digest with the scheme named by `tcode`.
///
/// Used by the verifier, which must honor the scheme recorded in the stored
/// digest rather than whatever the current default is.
pub fn recompute_tensor_digest(tcode: char, tensor: &Tensor) -> Result<Digest> {
    match tcode {
        TENSOR_TCODE => Ok(tensor_digest(tensor)),
        _ => Err(RepoError::corruption(format!(
            "no tensor hashing scheme registered for type code `{tcode}`"
        ))),
    }
}

/// Recomputes a schema digest with the scheme named by `tcode`.
pub fn recompute_schema_digest(tcode: char, record: &[u8]) -> Result<Digest> {
    match tcode {
        SCHEMA_TCODE => Ok(schema_digest(record)),
        _ => Err(RepoError::corruption(format!(
            "no schema hashing scheme registered for type code `{tcode}`"
        ))),
    }
}

/// Recomputes a metadata digest with the scheme named by `tcode`.
pub fn recompute_metadata_digest(tcode: char, value: &str) -> Result<Digest> {
    match tcode {
        METADATA_TCODE => Ok(metadata_digest(value)),
        _ => Err(RepoError::corruption(format!(
            "no metadata hashing scheme registered for type code `{tcode}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::RepoError;
    use crate::tensor::DType;

    #[test]
    fn test_tensor_digest_depends_on_shape_and_dtype() {
        let flat = Tensor::zeros(&[35], DType::F64);
        let grid = Tensor::zeros(&[5, 7], DType::F64);
        let ints = Tensor::zeros(&[35], DType::I64);
        // Identical buffers, distinct digests.
        assert_eq!(flat.as_le_bytes(), grid.as_le_bytes());
        assert_ne!(tensor_digest(&flat), tensor_digest(&grid));
        assert_ne!(tensor_digest(&flat), tensor_digest(&ints));
        assert_eq!(tensor_digest(&grid), tensor_digest(&grid.clone()));
        assert_eq!(tensor_digest(&grid).type_code(), TENSOR_TCODE);
    }

    #[test]
    fn test_typed_recomputation_dispatch() {
        let tensor = Tensor::zeros(&[3], DType::U8);
        let digest = tensor_digest(&tensor);
        let again = recompute_tensor_digest(digest.type_code(), &tensor).unwrap();
        assert_eq!(again, digest);
        assert_matches!(
            recompute_tensor_digest('z', &tensor),
            Err(RepoError::Corruption(_))
        );
    }

    #[test]
    fn test_metadata_digest_tcode() {
        let digest = metadata_digest("a label");
        assert_eq!(digest.type_code(), METADATA_TCODE);
        assert_eq!(
            recompute_metadata_digest(METADATA_TCODE, "a label").unwrap(),
            digest
        );
        assert_ne!(metadata_digest("other"), digest);
    }

    #[test]
    fn test_commit_digest_is_order_sensitive() {
        let a = commit_digest(b"p", b"m", b"r");
        let b = commit_digest(b"p", b"r", b"m");
        assert_ne!(a, b);
        assert_eq!(a.type_code(), COMMIT_TCODE);
    }
}
