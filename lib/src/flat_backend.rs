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

//! Backend `"10"`: one uncompressed file per payload.
//!
//! Best suited to small one-dimensional samples (tabular rows and the like)
//! where the cost of a compression round-trip outweighs its savings. The
//! file holds exactly the little-endian payload buffer; dtype and shape
//! travel in the spec.

use std::fs;
use std::io::Write as _;

use tempfile::NamedTempFile;

use crate::backend::BackendCode;
use crate::backend::BackendPaths;
use crate::backend::Capabilities;
use crate::backend::OpenMode;
use crate::backend::Spec;
use crate::backend::mint_uid;
use crate::error::RepoError;
use crate::error::Result;
use crate::file_util::persist_content_addressed_temp_file;
use crate::tensor::Tensor;

const FILE_SUFFIX: &str = ".flat";

pub const CAPABILITIES: Capabilities = Capabilities {
    islocal: true,
    numeric_payloads: true,
    str_payloads: false,
    variable_shape: true,
    subsamples: true,
    accepts_codec_opts: false,
};

#[derive(Debug)]
pub struct FlatAccessor {
    paths: BackendPaths,
    mode: Option<OpenMode>,
}

impl FlatAccessor {
    pub fn new(paths: BackendPaths) -> Self {
        Self { paths, mode: None }
    }

    pub fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.mode = Some(mode);
        Ok(())
    }

    pub fn close(&mut self) {
        self.mode = None;
    }

    fn require_open(&self, wanted: OpenMode) -> Result<()> {
        match self.mode {
            Some(OpenMode::Append) => Ok(()),
            Some(OpenMode::Read) if wanted == OpenMode::Read => Ok(()),
            _ => Err(RepoError::invalid_arg(format!(
                "backend {} accessor is not open for {wanted:?}",
                BackendCode::FLAT_V1
            ))),
        }
    }

    pub fn write_data(&mut self, tensor: &Tensor) -> Result<Spec> {
        self.require_open(OpenMode::Append)?;
        let uid = mint_uid();
        let mut temp_file = NamedTempFile::new_in(&self.paths.stage_dir)?;
        temp_file.write_all(tensor.as_le_bytes())?;
        persist_content_addressed_temp_file(
            temp_file,
            self.paths.stage_dir.join(format!("{uid}{FILE_SUFFIX}")),
        )?;
        Ok(Spec::Flat {
            uid,
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
        })
    }

    pub fn read_data(&mut self, spec: &Spec) -> Result<Tensor> {
        self.require_open(OpenMode::Read)?;
        let Spec::Flat { uid, dtype, shape } = spec else {
            return Err(RepoError::corruption(format!(
                "spec {spec:?} routed to the flat backend"
            )));
        };
        let path = self.paths.find(&format!("{uid}{FILE_SUFFIX}"))?;
        let data = fs::read(&path)?;
        Tensor::from_le_bytes(*dtype, shape.clone(), data).map_err(|_| {
            RepoError::corruption(format!(
                "payload file `{}` does not match spec shape {shape:?} of dtype {dtype}",
                path.display()
            ))
        })
    }

    /// Removes a payload written during the current staging session.
    pub fn delete_in_process_data(&mut self, spec: &Spec) -> Result<()> {
        let Spec::Flat { uid, .. } = spec else {
            return Err(RepoError::corruption(format!(
                "spec {spec:?} routed to the flat backend"
            )));
        };
        let staged = self.paths.stage_dir.join(format!("{uid}{FILE_SUFFIX}"));
        if staged.exists() {
            fs::remove_file(staged)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::tensor::DType;

    fn accessor() -> (tempfile::TempDir, FlatAccessor) {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = BackendPaths {
            stage_dir: temp_dir.path().join("stage"),
            store_dir: temp_dir.path().join("store"),
        };
        fs::create_dir(&paths.stage_dir).unwrap();
        fs::create_dir(&paths.store_dir).unwrap();
        (temp_dir, FlatAccessor::new(paths))
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, mut accessor) = accessor();
        accessor.open(OpenMode::Append).unwrap();
        let tensor = Tensor::from_f32(&[300], &[0.5; 300]).unwrap();
        let spec = accessor.write_data(&tensor).unwrap();
        assert_eq!(accessor.read_data(&spec).unwrap(), tensor);
    }

    #[test]
    fn test_read_prefers_store_dir() {
        let (_dir, mut accessor) = accessor();
        accessor.open(OpenMode::Append).unwrap();
        let tensor = Tensor::from_u8(&[4], &[1, 2, 3, 4]).unwrap();
        let spec = accessor.write_data(&tensor).unwrap();
        let Spec::Flat { uid, .. } = &spec else {
            unreachable!()
        };
        let name = format!("{uid}{FILE_SUFFIX}");
        fs::rename(
            accessor.paths.stage_dir.join(&name),
            accessor.paths.store_dir.join(&name),
        )
        .unwrap();
        assert_eq!(accessor.read_data(&spec).unwrap(), tensor);
    }

    #[test]
    fn test_requires_open() {
        let (_dir, mut accessor) = accessor();
        let tensor = Tensor::zeros(&[2], DType::U8);
        assert_matches!(
            accessor.write_data(&tensor),
            Err(RepoError::InvalidArg(_))
        );
        accessor.open(OpenMode::Read).unwrap();
        assert_matches!(
            accessor.write_data(&tensor),
            Err(RepoError::InvalidArg(_))
        );
    }

    #[test]
    fn test_delete_in_process_data() {
        let (_dir, mut accessor) = accessor();
        accessor.open(OpenMode::Append).unwrap();
        let spec = accessor
            .write_data(&Tensor::zeros(&[8], DType::U8))
            .unwrap();
        accessor.delete_in_process_data(&spec).unwrap();
        assert_matches!(accessor.read_data(&spec), Err(RepoError::NotFound(_)));
    }
}
