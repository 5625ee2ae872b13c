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

//! Full-repository integrity audit.
//!
//! Six passes, in order: branch map, commit tree, commit ref digest
//! existence, schema records, metadata records, then payload round-trips.
//! Every stored artifact is re-read and re-hashed with the scheme named by
//! its digest's type code. Remote-only payload references cannot be proven
//! without a fetch; they are counted and reported through a non-fatal
//! warning.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::backend::BackendCode;
use crate::backend::BackendPaths;
use crate::backend::OpenMode;
use crate::commits;
use crate::config::RepoConfig;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::hashing;
use crate::heads;
use crate::kv::Environments;
use crate::kv::KvEnv;
use crate::records;
use crate::records::RefKey;
use crate::registry::Accessor;

/// Tallies of a completed verification run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub branches: usize,
    pub commits: usize,
    pub data_digests: usize,
    pub schema_digests: usize,
    pub metadata_digests: usize,
    /// Local round-trips proved nothing about these; fetch to verify.
    pub remote_unverified: usize,
}

fn verify_branches(branchenv: &KvEnv, refenv: &KvEnv) -> Result<usize> {
    let branch_names = heads::list_branch_names(branchenv)?;
    info!(total = branch_names.len(), "verifying branches");
    if branch_names.is_empty() {
        return Err(RepoError::corruption(
            "branch map compromised: a repository must contain at least one branch",
        ));
    }
    for name in &branch_names {
        let head = heads::branch_head_commit(branchenv, name)?;
        if !commits::check_commit_in_history(refenv, &head)? {
            return Err(RepoError::corruption(format!(
                "branch commit map compromised: branch `{name}` references commit digest \
                 `{head}` which does not exist in the refs db"
            )));
        }
    }
    let staging_base = heads::staging_base_branch(branchenv)?;
    if !branch_names.contains(&staging_base) {
        return Err(RepoError::corruption(format!(
            "branch commit map compromised: the staging base refers to branch `{staging_base}` \
             which does not exist in the branch db"
        )));
    }
    Ok(branch_names.len())
}

fn verify_commit_tree(refenv: &KvEnv) -> Result<usize> {
    let all_commits: HashSet<Digest> = commits::list_all_commits(refenv)?.into_iter().collect();
    info!(total = all_commits.len(), "verifying commit trees");
    let mut initial: Option<Digest> = None;
    for commit in &all_commits {
        let parents = commits::get_commit_parents(refenv, commit).map_err(|err| match err {
            RepoError::NotFound(_) => RepoError::corruption(format!(
                "parent ref of commit `{commit}` is not recorded in the refs db"
            )),
            other => other,
        })?;
        for ancestor in [&parents.master_ancestor, &parents.dev_ancestor]
            .into_iter()
            .flatten()
        {
            if !all_commits.contains(ancestor) {
                return Err(RepoError::corruption(format!(
                    "commit tree compromised: commit `{commit}` references non-existing \
                     ancestor `{ancestor}`"
                )));
            }
        }
        if parents.is_initial() {
            if let Some(first) = &initial {
                return Err(RepoError::corruption(format!(
                    "commit tree compromised: multiple initial commits (with no parents) \
                     found; first `{first}`, second `{commit}`"
                )));
            }
            initial = Some(commit.clone());
        }
    }
    if initial.is_none() && !all_commits.is_empty() {
        return Err(RepoError::corruption(
            "commit tree compromised: no initial commit (with no parents) exists",
        ));
    }
    Ok(all_commits.len())
}

fn verify_commit_ref_digests(
    hashenv: &KvEnv,
    labelenv: &KvEnv,
    refenv: &KvEnv,
) -> Result<()> {
    let all_commits = commits::list_all_commits(refenv)?;
    info!(total = all_commits.len(), "verifying commit ref digests");
    let hash_txn = hashenv.read_txn();
    let label_txn = labelenv.read_txn();
    for commit in all_commits {
        let view = commits::tmp_mount_commit_refs(refenv, &commit)?;
        for (raw_key, value) in view.iter() {
            let digest = Digest::parse(value)?;
            match RefKey::decode(raw_key)? {
                RefKey::Data { .. } => {
                    if !hash_txn.contains(records::data_hash_key(&digest))? {
                        return Err(RepoError::corruption(format!(
                            "commit `{commit}` references data digest `{digest}` which does \
                             not exist in the data hash db"
                        )));
                    }
                }
                RefKey::Schema { .. } => {
                    if !hash_txn.contains(records::schema_hash_key(&digest))? {
                        return Err(RepoError::corruption(format!(
                            "commit `{commit}` references schema digest `{digest}` which does \
                             not exist in the data hash db"
                        )));
                    }
                }
                RefKey::Meta { .. } => {
                    if !label_txn.contains(records::meta_hash_key(&digest))? {
                        return Err(RepoError::corruption(format!(
                            "commit `{commit}` references metadata digest `{digest}` which \
                             does not exist in the label hash db"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn verify_schema_integrity(hashenv: &KvEnv) -> Result<usize> {
    let pairs = hashenv.scan_prefix(records::SCHEMA_HASH_PREFIX)?;
    info!(total = pairs.len(), "verifying schemas");
    for (key, raw) in &pairs {
        let digest = Digest::parse(&key[records::SCHEMA_HASH_PREFIX.len()..])?;
        // Also proves the record parses.
        records::decode_schema(raw)?;
        let computed = hashing::recompute_schema_digest(digest.type_code(), raw)?;
        if computed != digest {
            return Err(RepoError::corruption(format!(
                "schema record mismatch. Expected digest `{digest}`, found digest `{computed}`"
            )));
        }
    }
    Ok(pairs.len())
}

fn verify_metadata_integrity(labelenv: &KvEnv) -> Result<usize> {
    let pairs = labelenv.scan_prefix(records::META_HASH_PREFIX)?;
    info!(total = pairs.len(), "verifying metadata");
    for (key, raw) in &pairs {
        let digest = Digest::parse(&key[records::META_HASH_PREFIX.len()..])?;
        let value = std::str::from_utf8(raw)
            .map_err(|_| RepoError::corruption("stored metadata value is not valid UTF-8"))?;
        let computed = hashing::recompute_metadata_digest(digest.type_code(), value)?;
        if computed != digest {
            return Err(RepoError::corruption(format!(
                "metadata value mismatch. Expected digest `{digest}`, found digest `{computed}`"
            )));
        }
    }
    Ok(pairs.len())
}

/// Accessors opened during the payload pass; every one is closed when this
/// drops, on success and failure alike.
#[derive(Default)]
struct OpenedBackends {
    open: HashMap<BackendCode, Accessor>,
}

impl OpenedBackends {
    fn accessor(&mut self, code: BackendCode, paths: &BackendPaths) -> Result<&mut Accessor> {
        if !self.open.contains_key(&code) {
            let mut accessor = Accessor::for_code(code, paths.clone())?;
            accessor.open(OpenMode::Read)?;
            self.open.insert(code, accessor);
        }
        Ok(self.open.get_mut(&code).unwrap())
    }
}

impl Drop for OpenedBackends {
    fn drop(&mut self) {
        for accessor in self.open.values_mut() {
            accessor.close();
        }
    }
}

fn verify_payload_integrity(
    hashenv: &KvEnv,
    repo_path: &Path,
    config: &RepoConfig,
) -> Result<(usize, usize)> {
    let pairs = hashenv.scan_prefix(records::DATA_HASH_PREFIX)?;
    info!(total = pairs.len(), "verifying tensor payloads");
    let paths = BackendPaths::new(repo_path, config);
    let mut backends = OpenedBackends::default();
    let mut remote = 0;
    for (key, raw) in &pairs {
        let digest = Digest::parse(&key[records::DATA_HASH_PREFIX.len()..])?;
        let spec = records::decode_spec(raw)?;
        if !spec.is_local() {
            remote += 1;
            continue;
        }
        let tensor = backends.accessor(spec.backend_code(), &paths)?.read_data(&spec)?;
        let computed = hashing::recompute_tensor_digest(digest.type_code(), &tensor)?;
        if computed != digest {
            return Err(RepoError::corruption(format!(
                "tensor payload mismatch. Expected digest `{digest}` currently mapped to spec \
                 `{spec:?}`. Found digest `{computed}`"
            )));
        }
    }
    if remote > 0 {
        warn!(
            unverified = remote,
            total = pairs.len(),
            "cannot verify integrity of partially fetched payload references; for complete \
             proof, fetch all remote data locally"
        );
    }
    Ok((pairs.len(), remote))
}

/// Runs all six audits in order.
#[instrument(skip_all)]
pub fn run_verification(
    envs: &Environments,
    repo_path: &Path,
    config: &RepoConfig,
) -> Result<IntegrityReport> {
    let branches = verify_branches(&envs.branchenv, &envs.refenv)?;
    let commits = verify_commit_tree(&envs.refenv)?;
    verify_commit_ref_digests(&envs.hashenv, &envs.labelenv, &envs.refenv)?;
    let schema_digests = verify_schema_integrity(&envs.hashenv)?;
    let metadata_digests = verify_metadata_integrity(&envs.labelenv)?;
    let (data_digests, remote_unverified) =
        verify_payload_integrity(&envs.hashenv, repo_path, config)?;
    info!("verification passed");
    Ok(IntegrityReport {
        branches,
        commits,
        data_digests,
        schema_digests,
        metadata_digests,
        remote_unverified,
    })
}
