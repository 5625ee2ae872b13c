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

//! Named embedded key-value environments.
//!
//! Every piece of repository bookkeeping lives in one of six ordered
//! key-value stores under the repository root. Each environment multiplexes
//! readers and a single writer per process through scoped guards which
//! release on every exit path.

use std::path::Path;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::config::RepoConfig;
use crate::error::RepoError;
use crate::error::Result;

pub const BRANCH_ENV_DIR: &str = "branchenv";
pub const REF_ENV_DIR: &str = "refenv";
pub const STAGE_ENV_DIR: &str = "stageenv";
pub const HASH_ENV_DIR: &str = "hashenv";
pub const LABEL_ENV_DIR: &str = "labelenv";
pub const STAGE_HASH_ENV_DIR: &str = "stagehashenv";

/// One ordered key-value store.
pub struct KvEnv {
    name: &'static str,
    db: sled::Db,
    // Process-level multiplexing: shared readers, one writer.
    rw: RwLock<()>,
}

impl std::fmt::Debug for KvEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEnv").field("name", &self.name).finish()
    }
}

impl KvEnv {
    fn open(repo_path: &Path, name: &'static str, config: &RepoConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(repo_path.join(name))
            .cache_capacity(config.kv_cache_bytes)
            .open()?;
        Ok(Self {
            name,
            db,
            rw: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Begins a shared read transaction.
    pub fn read_txn(&self) -> ReadTxn<'_> {
        ReadTxn {
            env: self,
            _guard: self.rw.read().expect("kv reader lock poisoned"),
        }
    }

    /// Begins the (per-environment exclusive) write transaction.
    pub fn write_txn(&self) -> WriteTxn<'_> {
        WriteTxn {
            env: self,
            _guard: self.rw.write().expect("kv writer lock poisoned"),
        }
    }

    // Convenience single-op wrappers; each takes and releases its own guard.

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.read_txn().get(key)
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.read_txn().contains(key)
    }

    pub fn scan_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<Vec<(String, Vec<u8>)>> {
        self.read_txn().scan_prefix(prefix)
    }

    pub fn count_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<usize> {
        self.read_txn().count_prefix(prefix)
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.write_txn().put(key, value)
    }

    pub fn del(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.write_txn().del(key)
    }

    pub fn clear(&self) -> Result<()> {
        self.write_txn().clear()
    }

    pub fn apply_batch(&self, batch: sled::Batch) -> Result<()> {
        self.write_txn().apply_batch(batch)
    }
}

fn decode_key(name: &str, raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| RepoError::corruption(format!("{name} holds a non-UTF-8 record key")))
}

/// Shared read view of one environment. Readers may coexist; the guard is
/// released when the value drops, on success and failure alike.
pub struct ReadTxn<'a> {
    env: &'a KvEnv,
    _guard: RwLockReadGuard<'a, ()>,
}

impl ReadTxn<'_> {
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(self.env.db.get(key)?.map(|ivec| ivec.to_vec()))
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.env.db.contains_key(key)?)
    }

    /// All `(key, value)` pairs under `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut pairs = Vec::new();
        for entry in self.env.db.scan_prefix(prefix) {
            let (key, value) = entry?;
            pairs.push((decode_key(self.env.name, &key)?, value.to_vec()));
        }
        Ok(pairs)
    }

    pub fn count_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<usize> {
        let mut count = 0;
        for entry in self.env.db.scan_prefix(prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

/// Exclusive write view of one environment.
///
/// Individual operations apply immediately and are atomic at the key-value
/// layer; [`WriteTxn::apply_batch`] applies a group of writes atomically.
pub struct WriteTxn<'a> {
    env: &'a KvEnv,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl WriteTxn<'_> {
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(self.env.db.get(key)?.map(|ivec| ivec.to_vec()))
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.env.db.contains_key(key)?)
    }

    pub fn scan_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut pairs = Vec::new();
        for entry in self.env.db.scan_prefix(prefix) {
            let (key, value) = entry?;
            pairs.push((decode_key(self.env.name, &key)?, value.to_vec()));
        }
        Ok(pairs)
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.env.db.insert(key.as_ref(), value.as_ref())?;
        Ok(())
    }

    /// Removes a key; returns whether it existed.
    pub fn del(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.env.db.remove(key.as_ref())?.is_some())
    }

    pub fn clear(&self) -> Result<()> {
        self.env.db.clear()?;
        Ok(())
    }

    pub fn apply_batch(&self, batch: sled::Batch) -> Result<()> {
        self.env.db.apply_batch(batch)?;
        Ok(())
    }

    /// Synchronizes applied writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.env.db.flush()?;
        Ok(())
    }
}

/// The six environments backing one repository.
#[derive(Debug)]
pub struct Environments {
    pub branchenv: KvEnv,
    pub refenv: KvEnv,
    pub stageenv: KvEnv,
    pub hashenv: KvEnv,
    pub labelenv: KvEnv,
    pub stagehashenv: KvEnv,
}

impl Environments {
    pub fn open(repo_path: &Path, config: &RepoConfig) -> Result<Self> {
        Ok(Self {
            branchenv: KvEnv::open(repo_path, BRANCH_ENV_DIR, config)?,
            refenv: KvEnv::open(repo_path, REF_ENV_DIR, config)?,
            stageenv: KvEnv::open(repo_path, STAGE_ENV_DIR, config)?,
            hashenv: KvEnv::open(repo_path, HASH_ENV_DIR, config)?,
            labelenv: KvEnv::open(repo_path, LABEL_ENV_DIR, config)?,
            stagehashenv: KvEnv::open(repo_path, STAGE_HASH_ENV_DIR, config)?,
        })
    }
}
