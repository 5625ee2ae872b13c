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

//! Branch heads, the staging base pointer, and the writer lock.
//!
//! All three live in `branchenv`. The writer lock is a single slot holding
//! either an availability sentinel or the token minted by the writer
//! checkout currently holding it; every write operation re-verifies the
//! carried token against the slot.

use rand::RngCore as _;
use tracing::debug;

use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::kv::KvEnv;
use crate::records;
use crate::schema::check_valid_name;

pub fn create_branch(branchenv: &KvEnv, name: &str, head: &Digest) -> Result<()> {
    check_valid_name("branch", name)?;
    let txn = branchenv.write_txn();
    let key = records::branch_key(name);
    if txn.contains(&key)? {
        return Err(RepoError::invalid_arg(format!(
            "branch `{name}` already exists"
        )));
    }
    txn.put(&key, head.as_bytes())?;
    debug!(branch = name, head = %head, "created branch");
    Ok(())
}

pub fn list_branch_names(branchenv: &KvEnv) -> Result<Vec<String>> {
    let pairs = branchenv.scan_prefix(records::BRANCH_PREFIX)?;
    Ok(pairs
        .into_iter()
        .map(|(key, _)| key[records::BRANCH_PREFIX.len()..].to_owned())
        .collect())
}

pub fn branch_head_commit(branchenv: &KvEnv, name: &str) -> Result<Digest> {
    let raw = branchenv
        .get(records::branch_key(name))?
        .ok_or_else(|| RepoError::NotFound(format!("branch `{name}` does not exist")))?;
    Digest::parse_bytes(&raw)
}

/// Advances an existing branch head.
pub fn set_branch_head(branchenv: &KvEnv, name: &str, head: &Digest) -> Result<()> {
    let txn = branchenv.write_txn();
    let key = records::branch_key(name);
    if !txn.contains(&key)? {
        return Err(RepoError::NotFound(format!("branch `{name}` does not exist")));
    }
    txn.put(&key, head.as_bytes())
}

/// Name of the branch the staging area is based on.
pub fn staging_base_branch(branchenv: &KvEnv) -> Result<String> {
    let raw = branchenv.get(records::STAGING_HEAD_KEY)?.ok_or_else(|| {
        RepoError::corruption("the staging base branch pointer is missing from the branch db")
    })?;
    String::from_utf8(raw)
        .map_err(|_| RepoError::corruption("the staging base branch pointer is not valid UTF-8"))
}

pub fn set_staging_base_branch(branchenv: &KvEnv, name: &str) -> Result<()> {
    branchenv.put(records::STAGING_HEAD_KEY, name.as_bytes())
}

pub fn set_user_info(branchenv: &KvEnv, name: &str, email: &str) -> Result<()> {
    branchenv.put(records::USER_NAME_KEY, name.as_bytes())?;
    branchenv.put(records::USER_EMAIL_KEY, email.as_bytes())
}

pub fn user_info(branchenv: &KvEnv) -> Result<(String, String)> {
    let read = |key: &str| -> Result<String> {
        let raw = branchenv
            .get(key)?
            .ok_or_else(|| RepoError::corruption(format!("`{key}` is missing from the branch db")))?;
        String::from_utf8(raw)
            .map_err(|_| RepoError::corruption(format!("`{key}` is not valid UTF-8")))
    };
    Ok((read(records::USER_NAME_KEY)?, read(records::USER_EMAIL_KEY)?))
}

// ---------------------------------------------------------------------------
// writer lock
// ---------------------------------------------------------------------------

/// Mints an opaque writer-lock token.
pub fn mint_lock_token() -> String {
    let mut raw = [0_u8; 16];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Marks the lock slot available; written once at repository init.
pub fn initialize_writer_lock(branchenv: &KvEnv) -> Result<()> {
    branchenv.put(records::WRITER_LOCK_KEY, records::WRITER_LOCK_AVAILABLE)
}

/// Installs `token` into the lock slot if it is free (or already carries
/// this very token).
pub fn acquire_writer_lock(branchenv: &KvEnv, token: &str) -> Result<()> {
    let txn = branchenv.write_txn();
    let stored = txn.get(records::WRITER_LOCK_KEY)?.ok_or_else(|| {
        RepoError::corruption("the writer lock slot is missing from the branch db")
    })?;
    if stored == records::WRITER_LOCK_AVAILABLE.as_bytes() || stored == token.as_bytes() {
        txn.put(records::WRITER_LOCK_KEY, token)?;
        debug!("writer lock acquired");
        Ok(())
    } else {
        Err(RepoError::LockHeld(
            "another writer checkout currently holds the writer lock; close it (or clear a \
             stale lock) before opening a new write-enabled checkout"
                .to_owned(),
        ))
    }
}

/// Confirms the carried token still owns the lock. Any write operation of a
/// checkout calls this before touching repository state.
pub fn verify_writer_lock(branchenv: &KvEnv, token: &str) -> Result<()> {
    let stored = branchenv.get(records::WRITER_LOCK_KEY)?.ok_or_else(|| {
        RepoError::corruption("the writer lock slot is missing from the branch db")
    })?;
    if stored == token.as_bytes() {
        Ok(())
    } else {
        Err(RepoError::LockHeld(
            "the writer lock carried by this checkout is no longer current".to_owned(),
        ))
    }
}

/// Returns the lock slot to the available sentinel.
pub fn release_writer_lock(branchenv: &KvEnv, token: &str) -> Result<()> {
    let txn = branchenv.write_txn();
    let stored = txn.get(records::WRITER_LOCK_KEY)?.ok_or_else(|| {
        RepoError::corruption("the writer lock slot is missing from the branch db")
    })?;
    if stored == records::WRITER_LOCK_AVAILABLE.as_bytes() {
        return Ok(());
    }
    if stored != token.as_bytes() {
        return Err(RepoError::LockHeld(
            "refusing to release a writer lock held by a different checkout".to_owned(),
        ));
    }
    txn.put(records::WRITER_LOCK_KEY, records::WRITER_LOCK_AVAILABLE)?;
    debug!("writer lock released");
    Ok(())
}

/// Clears the lock slot regardless of its holder. Recovery hatch for locks
/// orphaned by a process which exited without closing its writer checkout.
pub fn force_release_writer_lock(branchenv: &KvEnv) -> Result<()> {
    branchenv.put(records::WRITER_LOCK_KEY, records::WRITER_LOCK_AVAILABLE)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::RepoConfig;
    use crate::digest::DIGEST_RAW_LEN;
    use crate::kv::Environments;

    fn test_envs() -> (tempfile::TempDir, Environments) {
        let temp_dir = tempfile::tempdir().unwrap();
        let envs = Environments::open(temp_dir.path(), &RepoConfig::default()).unwrap();
        (temp_dir, envs)
    }

    fn digest(fill: u8) -> Digest {
        Digest::from_parts('3', &[fill; DIGEST_RAW_LEN])
    }

    #[test]
    fn test_branch_create_list_head() {
        let (_dir, envs) = test_envs();
        create_branch(&envs.branchenv, "master", &digest(1)).unwrap();
        create_branch(&envs.branchenv, "dev", &digest(2)).unwrap();
        assert_eq!(
            list_branch_names(&envs.branchenv).unwrap(),
            ["dev", "master"]
        );
        assert_eq!(branch_head_commit(&envs.branchenv, "dev").unwrap(), digest(2));
        assert_matches!(
            create_branch(&envs.branchenv, "master", &digest(3)),
            Err(RepoError::InvalidArg(_))
        );
        assert_matches!(
            branch_head_commit(&envs.branchenv, "gone"),
            Err(RepoError::NotFound(_))
        );
        assert_matches!(
            set_branch_head(&envs.branchenv, "gone", &digest(3)),
            Err(RepoError::NotFound(_))
        );
    }

    #[test]
    fn test_writer_lock_protocol() {
        let (_dir, envs) = test_envs();
        initialize_writer_lock(&envs.branchenv).unwrap();
        let first = mint_lock_token();
        let second = mint_lock_token();
        assert_ne!(first, second);

        acquire_writer_lock(&envs.branchenv, &first).unwrap();
        // Re-acquisition by the same holder is fine; a second holder fails.
        acquire_writer_lock(&envs.branchenv, &first).unwrap();
        assert_matches!(
            acquire_writer_lock(&envs.branchenv, &second),
            Err(RepoError::LockHeld(_))
        );
        verify_writer_lock(&envs.branchenv, &first).unwrap();
        assert_matches!(
            verify_writer_lock(&envs.branchenv, &second),
            Err(RepoError::LockHeld(_))
        );

        release_writer_lock(&envs.branchenv, &first).unwrap();
        // A stale holder can no longer verify after release.
        assert_matches!(
            verify_writer_lock(&envs.branchenv, &first),
            Err(RepoError::LockHeld(_))
        );
        acquire_writer_lock(&envs.branchenv, &second).unwrap();
    }
}
