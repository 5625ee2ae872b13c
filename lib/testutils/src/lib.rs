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

//! Fixtures shared by the tensile-lib integration tests.

use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;
use tensile_lib::digest::Digest;
use tensile_lib::records::SampleKey;
use tensile_lib::repo::Repository;
use tensile_lib::tensor::DType;
use tensile_lib::tensor::Tensor;

pub const TEST_USER: &str = "tester";
pub const TEST_EMAIL: &str = "foo@test.bar";

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("tensile-test-")
        .tempdir()
        .unwrap()
}

/// A repository inside a temp dir that lives as long as this value.
pub struct TestRepo {
    pub repo: Repository,
    temp_dir: TempDir,
}

impl TestRepo {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let repo = Repository::init(&temp_dir.path().join("repo"), TEST_USER, TEST_EMAIL).unwrap();
        Self { repo, temp_dir }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Re-opens the repository from disk, as a fresh process would. The
    /// original handle is dropped first so the environments unlock.
    pub fn reopen(self) -> Self {
        let Self { repo, temp_dir } = self;
        let path = repo.path().to_owned();
        drop(repo);
        let repo = Repository::open(&path).unwrap();
        Self { repo, temp_dir }
    }

    /// Path of the committed payload data directory.
    pub fn store_data_dir(&self) -> PathBuf {
        self.repo.config().store_data_path(self.repo.path())
    }

    /// Path of the staged payload data directory.
    pub fn stage_data_dir(&self) -> PathBuf {
        self.repo.config().stage_data_path(self.repo.path())
    }
}

/// An all-ones f64 tensor.
pub fn ones_f64(shape: &[usize]) -> Tensor {
    let count = shape.iter().product();
    Tensor::from_f64(shape, &vec![1.0; count]).unwrap()
}

/// An f64 tensor filled with 0, 1, 2, ... in row-major order.
pub fn sequential_f64(shape: &[usize]) -> Tensor {
    let count: usize = shape.iter().product();
    let elems: Vec<f64> = (0..count).map(|i| i as f64).collect();
    Tensor::from_f64(shape, &elems).unwrap()
}

pub fn key(name: &str) -> SampleKey {
    SampleKey::str(name).unwrap()
}

/// Creates a fixed f64 column `"aset"` of shape (5, 7), writes sample
/// `"x"` = zeros, and commits. Returns the commit digest.
pub fn write_zeros_commit(repo: &Repository) -> Digest {
    let writer = repo.checkout_writer("master").unwrap();
    let columns = writer.columns().unwrap();
    let aset = columns
        .create_ndarray_column("aset", &[5, 7], DType::F64, false, false, None)
        .unwrap();
    aset.put(&key("x"), &Tensor::zeros(&[5, 7], DType::F64)).unwrap();
    let digest = writer.commit("c1").unwrap();
    writer.close().unwrap();
    digest
}
