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

//! Metadata entries: key -> UTF-8 string value.
//!
//! Values are content-addressed in `labelenv` by their metadata digest;
//! refs live next to the column refs in the staging area and in commit
//! snapshots.

use crate::columns::RefsSource;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::hashing;
use crate::kv::Environments;
use crate::records;
use crate::records::SampleKey;

pub(crate) fn get(envs: &Environments, refs: &RefsSource, key: &SampleKey) -> Result<String> {
    let digest = refs
        .get(envs, &records::meta_ref_key(key))?
        .ok_or_else(|| RepoError::NotFound(format!("no metadata entry for key `{key}`")))?;
    let digest = Digest::parse(&digest)?;
    let raw = envs
        .labelenv
        .get(records::meta_hash_key(&digest))?
        .ok_or_else(|| {
            RepoError::corruption(format!(
                "metadata digest `{digest}` is referenced but missing from the label hash db"
            ))
        })?;
    String::from_utf8(raw)
        .map_err(|_| RepoError::corruption("stored metadata value is not valid UTF-8"))
}

/// Stage-only: point the metadata ref at the value's digest, recording the
/// value if it is new.
pub(crate) fn put(envs: &Environments, key: &SampleKey, value: &str) -> Result<()> {
    let digest = hashing::metadata_digest(value);
    let hash_key = records::meta_hash_key(&digest);
    if !envs.labelenv.contains(&hash_key)? {
        envs.labelenv.put(&hash_key, value.as_bytes())?;
        envs.stagehashenv.put(&hash_key, value.as_bytes())?;
    }
    envs.stageenv
        .put(records::meta_ref_key(key), digest.as_bytes())
}

pub(crate) fn del(envs: &Environments, key: &SampleKey) -> Result<()> {
    if envs.stageenv.del(records::meta_ref_key(key))? {
        Ok(())
    } else {
        Err(RepoError::NotFound(format!(
            "no metadata entry for key `{key}`"
        )))
    }
}

pub(crate) fn contains(envs: &Environments, refs: &RefsSource, key: &SampleKey) -> Result<bool> {
    Ok(refs.get(envs, &records::meta_ref_key(key))?.is_some())
}

pub(crate) fn keys(envs: &Environments, refs: &RefsSource) -> Result<Vec<SampleKey>> {
    refs.scan(envs, records::REF_META_PREFIX)?
        .into_iter()
        .map(|(raw, _)| match records::RefKey::decode(&raw)? {
            records::RefKey::Meta { key } => Ok(key),
            other => Err(RepoError::corruption(format!(
                "foreign record {other:?} under the metadata prefix"
            ))),
        })
        .collect()
}

pub(crate) fn len(envs: &Environments, refs: &RefsSource) -> Result<usize> {
    refs.count(envs, records::REF_META_PREFIX)
}
