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

//! The append-only commit graph.
//!
//! A commit is three records in `refenv` keyed by its digest: the ancestor
//! pair, the user/timestamp/message record, and the compressed refs
//! snapshot. Commits are immutable once written; branches move, commits
//! never do.

use std::collections::BTreeMap;
use std::collections::HashSet;

use tracing::instrument;

use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::hashing;
use crate::heads;
use crate::kv::Environments;
use crate::kv::KvEnv;
use crate::records;
use crate::records::CommitMeta;
use crate::records::CommitParents;

pub fn list_all_commits(refenv: &KvEnv) -> Result<Vec<Digest>> {
    let pairs = refenv.scan_prefix(records::COMMIT_PARENT_PREFIX)?;
    pairs
        .into_iter()
        .map(|(key, _)| Digest::parse(&key[records::COMMIT_PARENT_PREFIX.len()..]))
        .collect()
}

pub fn check_commit_in_history(refenv: &KvEnv, commit: &Digest) -> Result<bool> {
    refenv.contains(records::commit_parent_key(commit))
}

pub fn get_commit_parents(refenv: &KvEnv, commit: &Digest) -> Result<CommitParents> {
    let raw = refenv
        .get(records::commit_parent_key(commit))?
        .ok_or_else(|| RepoError::NotFound(format!("commit `{commit}` does not exist")))?;
    CommitParents::decode(&raw)
}

pub fn get_commit_meta(refenv: &KvEnv, commit: &Digest) -> Result<CommitMeta> {
    let raw = refenv
        .get(records::commit_meta_key(commit))?
        .ok_or_else(|| RepoError::NotFound(format!("commit `{commit}` does not exist")))?;
    CommitMeta::decode(&raw)
}

/// The decoded refs snapshot of a commit, in stored (sorted) order.
pub fn get_commit_refs(refenv: &KvEnv, commit: &Digest) -> Result<Vec<(String, String)>> {
    let stored = refenv
        .get(records::commit_refs_key(commit))?
        .ok_or_else(|| RepoError::NotFound(format!("commit `{commit}` does not exist")))?;
    let raw = records::decompress_refs_snapshot(&stored)?;
    records::decode_refs_snapshot(&raw)
}

/// Walks ancestry from `head` (inclusive), master parent before dev parent,
/// each commit reported once in discovery order.
pub fn walk_ancestors(refenv: &KvEnv, head: &Digest) -> Result<Vec<Digest>> {
    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![head.clone()];
    while let Some(commit) = pending.pop() {
        if !seen.insert(commit.clone()) {
            continue;
        }
        let parents = get_commit_parents(refenv, &commit)?;
        ordered.push(commit);
        // Stack order: dev first so the master chain is walked first.
        if let Some(dev) = parents.dev_ancestor {
            pending.push(dev);
        }
        if let Some(master) = parents.master_ancestor {
            pending.push(master);
        }
    }
    Ok(ordered)
}

/// A commit's refs mounted as a transient read-only view.
///
/// Reader checkouts resolve every lookup through one of these instead of a
/// mutable environment, which pins them to the commit digest they were
/// opened at.
#[derive(Clone, Debug, Default)]
pub struct RefsView {
    map: BTreeMap<String, String>,
}

impl RefsView {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            map: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.map
            .range(prefix.to_owned()..)
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.scan_prefix(prefix).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Mounts a commit's refs for reading.
pub fn tmp_mount_commit_refs(refenv: &KvEnv, commit: &Digest) -> Result<RefsView> {
    Ok(RefsView::from_pairs(get_commit_refs(refenv, commit)?))
}

/// Writes the three records of a commit atomically and returns its digest.
///
/// The digest covers the parent record, the meta record, and the ordered
/// uncompressed snapshot, so identity is independent of storage
/// compression. Exposed for the merge and remote-sync tooling, which
/// fabricate parent pairs the staging path never produces.
pub fn write_commit_record(
    refenv: &KvEnv,
    parents: &CommitParents,
    meta: &CommitMeta,
    refs: &[(String, String)],
) -> Result<Digest> {
    let parent_record = parents.encode();
    let meta_record = meta.encode();
    let snapshot = records::encode_refs_snapshot(refs);
    let digest = hashing::commit_digest(&parent_record, &meta_record, &snapshot);

    let mut batch = sled::Batch::default();
    batch.insert(records::commit_parent_key(&digest).into_bytes(), parent_record);
    batch.insert(records::commit_meta_key(&digest).into_bytes(), meta_record);
    batch.insert(
        records::commit_refs_key(&digest).into_bytes(),
        records::compress_refs_snapshot(&snapshot)?,
    );
    let txn = refenv.write_txn();
    txn.apply_batch(batch)?;
    txn.flush()?;
    Ok(digest)
}

/// Promotes the staging area to a new commit on the staging base branch.
///
/// Snapshots `stageenv`, writes the commit, and advances the branch head.
/// The stage is left equal to the new head's refs, i.e. CLEAN.
#[instrument(skip(envs))]
pub fn commit_records(envs: &Environments, message: &str) -> Result<Digest> {
    let branch = heads::staging_base_branch(&envs.branchenv)?;
    let parent = heads::branch_head_commit(&envs.branchenv, &branch)?;
    let (user_name, user_email) = heads::user_info(&envs.branchenv)?;

    let refs: Vec<(String, String)> = envs
        .stageenv
        .scan_prefix("")?
        .into_iter()
        .map(|(key, value)| {
            String::from_utf8(value)
                .map(|value| (key, value))
                .map_err(|_| RepoError::corruption("staged ref value is not valid UTF-8"))
        })
        .collect::<Result<_>>()?;

    let meta = CommitMeta {
        user_name,
        user_email,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        message: message.to_owned(),
    };
    let parents = CommitParents {
        master_ancestor: Some(parent),
        dev_ancestor: None,
    };
    let digest = write_commit_record(&envs.refenv, &parents, &meta, &refs)?;
    heads::set_branch_head(&envs.branchenv, &branch, &digest)?;
    tracing::info!(commit = %digest, branch = %branch, "commit completed");
    Ok(digest)
}

/// Replaces the staging area contents with a commit's refs.
pub fn replace_staging_area_with_commit(
    refenv: &KvEnv,
    stageenv: &KvEnv,
    commit: &Digest,
) -> Result<()> {
    let refs = get_commit_refs(refenv, commit)?;
    let txn = stageenv.write_txn();
    txn.clear()?;
    let mut batch = sled::Batch::default();
    for (key, value) in refs {
        batch.insert(key.into_bytes(), value.into_bytes());
    }
    txn.apply_batch(batch)?;
    Ok(())
}
