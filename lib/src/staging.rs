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

//! The staging area: the mutable workspace whose refs become the next
//! commit.
//!
//! Status is CLEAN exactly when the staged refs equal the refs of the
//! staging base branch's head commit. Committing promotes the stage;
//! resetting discards it. Both paths also settle the staged payload files:
//! files referenced by staged hash records move into the store data dir on
//! commit, and are deleted on reset together with their hash records.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;
use tracing::instrument;

use crate::commits;
use crate::config::RepoConfig;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::file_util;
use crate::heads;
use crate::kv::Environments;
use crate::kv::KvEnv;
use crate::records;

/// Whether the staging area differs from its base commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageStatus {
    Clean,
    Dirty,
}

/// The staged refs, sorted by key.
pub fn stage_snapshot(stageenv: &KvEnv) -> Result<Vec<(String, String)>> {
    stageenv
        .scan_prefix("")?
        .into_iter()
        .map(|(key, value)| {
            String::from_utf8(value)
                .map(|value| (key, value))
                .map_err(|_| RepoError::corruption("staged ref value is not valid UTF-8"))
        })
        .collect()
}

pub fn status(envs: &Environments) -> Result<StageStatus> {
    let branch = heads::staging_base_branch(&envs.branchenv)?;
    let head = heads::branch_head_commit(&envs.branchenv, &branch)?;
    let head_refs = commits::get_commit_refs(&envs.refenv, &head)?;
    if stage_snapshot(&envs.stageenv)? == head_refs {
        Ok(StageStatus::Clean)
    } else {
        Ok(StageStatus::Dirty)
    }
}

/// File names (under the stage data dir) which staged hash records still
/// reference.
fn staged_payload_files(stagehashenv: &KvEnv) -> Result<HashSet<String>> {
    let mut referenced = HashSet::new();
    for (_, raw) in stagehashenv.scan_prefix(records::DATA_HASH_PREFIX)? {
        let spec = records::decode_spec(&raw)?;
        if let Some(name) = spec.file_name() {
            referenced.insert(name);
        }
    }
    Ok(referenced)
}

/// Settles the stage data dir at commit: every file referenced by a staged
/// hash record moves into the store data dir; anything else (aborted
/// temporaries) is deleted.
fn promote_staged_files(envs: &Environments, repo_path: &Path, config: &RepoConfig) -> Result<()> {
    let referenced = staged_payload_files(&envs.stagehashenv)?;
    let stage_dir = config.stage_data_path(repo_path);
    let store_dir = config.store_data_path(repo_path);
    for entry in stage_dir.read_dir()? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if referenced.contains(&name) {
            fs::rename(entry.path(), store_dir.join(&name))?;
        } else {
            debug!(file = %name, "collecting unreferenced staged payload file");
            file_util::remove_entry(&entry.path())
                .map_err(|err| RepoError::Io(err.source))?;
        }
    }
    Ok(())
}

/// Deletes every staged payload file.
fn discard_staged_files(repo_path: &Path, config: &RepoConfig) -> Result<()> {
    file_util::remove_dir_contents(&config.stage_data_path(repo_path))
        .map_err(|err| RepoError::Io(err.source))
}

/// Removes the hash records written during this staging session from the
/// hash and label dbs. Only valid on reset, after which their payloads are
/// deleted as well.
fn remove_staged_hash_records(envs: &Environments) -> Result<()> {
    for (key, _) in envs.stagehashenv.scan_prefix(records::DATA_HASH_PREFIX)? {
        envs.hashenv.del(&key)?;
    }
    for (key, _) in envs.stagehashenv.scan_prefix(records::SCHEMA_HASH_PREFIX)? {
        envs.hashenv.del(&key)?;
    }
    for (key, _) in envs.stagehashenv.scan_prefix(records::META_HASH_PREFIX)? {
        envs.labelenv.del(&key)?;
    }
    Ok(())
}

/// Commits the staged changes. Backend accessors must already be closed so
/// staged payload files can be moved.
#[instrument(skip(envs, config))]
pub fn commit_staged(
    envs: &Environments,
    repo_path: &Path,
    config: &RepoConfig,
    message: &str,
) -> Result<Digest> {
    if status(envs)? == StageStatus::Clean {
        return Err(RepoError::EmptyCommit("cannot commit"));
    }
    promote_staged_files(envs, repo_path, config)?;
    let digest = commits::commit_records(envs, message)?;
    envs.stagehashenv.clear()?;
    Ok(digest)
}

/// Hard-resets the staging area to the staging base branch head.
///
/// Irreversible: staged refs, staged hash records and staged payload files
/// are all deleted. Returns the head commit the stage was reset to.
#[instrument(skip(envs, config))]
pub fn reset_staged(envs: &Environments, repo_path: &Path, config: &RepoConfig) -> Result<Digest> {
    if status(envs)? == StageStatus::Clean {
        return Err(RepoError::EmptyCommit("no reset is necessary"));
    }
    remove_staged_hash_records(envs)?;
    envs.stagehashenv.clear()?;
    discard_staged_files(repo_path, config)?;

    let branch = heads::staging_base_branch(&envs.branchenv)?;
    let head = heads::branch_head_commit(&envs.branchenv, &branch)?;
    commits::replace_staging_area_with_commit(&envs.refenv, &envs.stageenv, &head)?;
    tracing::info!(commit = %head, "staging area reset to branch head");
    Ok(head)
}
