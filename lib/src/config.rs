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

//! Process-level repository knobs.
//!
//! These used to be ambient module state; they are now an explicit struct
//! threaded through environment construction so tests can vary them per
//! fixture without global teardown.

use std::path::Path;
use std::path::PathBuf;

/// Tunables applied when opening a repository.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    /// Directory (relative to the repository root) holding backend payload
    /// files referenced by commits.
    pub store_data_dir: String,
    /// Directory (relative to the repository root) holding backend payload
    /// files written by the staging area and not yet committed.
    pub stage_data_dir: String,
    /// Page-cache budget handed to each key-value environment, in bytes.
    pub kv_cache_bytes: u64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            store_data_dir: "data_store".to_owned(),
            stage_data_dir: "data_stage".to_owned(),
            kv_cache_bytes: 64 * 1024 * 1024,
        }
    }
}

impl RepoConfig {
    pub fn store_data_path(&self, repo_path: &Path) -> PathBuf {
        repo_path.join(&self.store_data_dir)
    }

    pub fn stage_data_path(&self, repo_path: &Path) -> PathBuf {
        repo_path.join(&self.stage_data_dir)
    }
}
