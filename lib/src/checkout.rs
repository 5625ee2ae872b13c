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

//! Read-only and write-enabled repository views.
//!
//! Accessors are handed out as generation-counted proxies: each proxy
//! carries the generation it was minted at, `close()` bumps the checkout's
//! generation, and any operation through an out-of-date proxy fails with
//! the closed error. This stands in for weak references without cyclic
//! ownership between the checkout and its accessors.
//!
//! A writer checkout owns the repository-wide writer lock from construction
//! to `close()`, and re-verifies its token before every operation.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::instrument;

use crate::backend::BackendPaths;
use crate::columns::ColumnSet;
use crate::commits;
use crate::config::RepoConfig;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::heads;
use crate::kv::Environments;
use crate::metadata;
use crate::records::SampleKey;
use crate::registry::BackendArg;
use crate::schema::Schema;
use crate::staging;
use crate::staging::StageStatus;
use crate::tensor::DType;
use crate::tensor::Tensor;

#[derive(Debug)]
struct CheckoutCore {
    envs: Arc<Environments>,
    /// Bumped on close; proxies minted at an older generation are dead.
    generation: AtomicU64,
    /// The writer lock token, absent for readers.
    lock_token: Option<String>,
    inner: Mutex<ColumnSet>,
}

impl CheckoutCore {
    fn check_open(&self, minted: u64) -> Result<()> {
        if self.generation.load(Ordering::SeqCst) == minted {
            Ok(())
        } else {
            Err(RepoError::Closed)
        }
    }

    /// Every operation funnel: liveness check, writer-lock re-verification,
    /// then the body under the facade mutex.
    fn guarded<R>(&self, minted: u64, f: impl FnOnce(&mut ColumnSet) -> Result<R>) -> Result<R> {
        self.check_open(minted)?;
        if let Some(token) = &self.lock_token {
            heads::verify_writer_lock(&self.envs.branchenv, token)?;
        }
        let mut inner = self.inner.lock().expect("checkout facade mutex poisoned");
        f(&mut inner)
    }
}

/// Holds backend file handles open across many operations for throughput.
///
/// Guards nest; handles opened under a guard are released when the
/// outermost guard drops, on success and failure alike.
pub struct SessionGuard {
    core: Arc<CheckoutCore>,
}

impl SessionGuard {
    fn enter(core: &Arc<CheckoutCore>, minted: u64) -> Result<Self> {
        core.guarded(minted, |inner| {
            inner.enter_session();
            Ok(())
        })?;
        Ok(Self { core: core.clone() })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.core.inner.lock() {
            inner.exit_session();
        }
    }
}

/// Access to the columns of a checkout.
pub struct ColumnsProxy {
    core: Arc<CheckoutCore>,
    minted: u64,
}

impl ColumnsProxy {
    pub fn names(&self) -> Result<Vec<String>> {
        self.core.guarded(self.minted, |inner| Ok(inner.names()))
    }

    pub fn len(&self) -> Result<usize> {
        self.core.guarded(self.minted, |inner| Ok(inner.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        self.core
            .guarded(self.minted, |inner| Ok(inner.contains(name)))
    }

    /// Hands out a handle to one column.
    pub fn column(&self, name: &str) -> Result<ColumnProxy> {
        self.core.guarded(self.minted, |inner| {
            inner.schema(name).map(|_| ())
        })?;
        Ok(ColumnProxy {
            core: self.core.clone(),
            minted: self.minted,
            name: name.to_owned(),
        })
    }

    pub fn create_ndarray_column(
        &self,
        name: &str,
        shape: &[usize],
        dtype: DType,
        variable_shape: bool,
        contains_subsamples: bool,
        backend: Option<BackendArg>,
    ) -> Result<ColumnProxy> {
        self.core.guarded(self.minted, |inner| {
            inner.create_ndarray_column(
                name,
                shape,
                dtype,
                variable_shape,
                contains_subsamples,
                backend.as_ref(),
            )
        })?;
        self.column(name)
    }

    pub fn create_str_column(
        &self,
        name: &str,
        contains_subsamples: bool,
        backend: Option<BackendArg>,
    ) -> Result<ColumnProxy> {
        self.core.guarded(self.minted, |inner| {
            inner.create_str_column(name, contains_subsamples, backend.as_ref())
        })?;
        self.column(name)
    }

    pub fn remove_column(&self, name: &str) -> Result<()> {
        self.core
            .guarded(self.minted, |inner| inner.remove_column(name))
    }
}

/// Handle to one column of a checkout.
#[derive(Debug)]
pub struct ColumnProxy {
    core: Arc<CheckoutCore>,
    minted: u64,
    name: String,
}

impl ColumnProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Result<Schema> {
        self.core.guarded(self.minted, |inner| inner.schema(&self.name))
    }

    pub fn put(&self, key: &SampleKey, value: &Tensor) -> Result<()> {
        self.core
            .guarded(self.minted, |inner| inner.put(&self.name, key, value))
    }

    pub fn get(&self, key: &SampleKey) -> Result<Tensor> {
        self.core
            .guarded(self.minted, |inner| inner.get(&self.name, key))
    }

    pub fn del(&self, key: &SampleKey) -> Result<()> {
        self.core
            .guarded(self.minted, |inner| inner.del(&self.name, key))
    }

    pub fn put_subsample(
        &self,
        key: &SampleKey,
        subkey: &SampleKey,
        value: &Tensor,
    ) -> Result<()> {
        self.core.guarded(self.minted, |inner| {
            inner.put_subsample(&self.name, key, subkey, value)
        })
    }

    /// Writes a `{subkey: value}` mapping under one sample key.
    pub fn put_subsamples(&self, key: &SampleKey, entries: &[(SampleKey, Tensor)]) -> Result<()> {
        self.core.guarded(self.minted, |inner| {
            inner.put_subsamples(
                &self.name,
                key,
                entries.iter().map(|(subkey, value)| (subkey, value)),
            )
        })
    }

    pub fn get_subsample(&self, key: &SampleKey, subkey: &SampleKey) -> Result<Tensor> {
        self.core.guarded(self.minted, |inner| {
            inner.get_subsample(&self.name, key, subkey)
        })
    }

    pub fn del_subsample(&self, key: &SampleKey, subkey: &SampleKey) -> Result<()> {
        self.core.guarded(self.minted, |inner| {
            inner.del_subsample(&self.name, key, subkey)
        })
    }

    /// Distinct sample keys.
    pub fn keys(&self) -> Result<Vec<SampleKey>> {
        self.core
            .guarded(self.minted, |inner| inner.sample_keys(&self.name))
    }

    /// Number of distinct sample keys.
    pub fn len(&self) -> Result<usize> {
        self.core
            .guarded(self.minted, |inner| inner.sample_count(&self.name))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, key: &SampleKey) -> Result<bool> {
        self.core
            .guarded(self.minted, |inner| inner.contains_sample(&self.name, key))
    }

    pub fn subsample_keys(&self, key: &SampleKey) -> Result<Vec<SampleKey>> {
        self.core
            .guarded(self.minted, |inner| inner.subsample_keys(&self.name, key))
    }

    /// Number of subsamples under one sample key.
    pub fn subsample_count(&self, key: &SampleKey) -> Result<usize> {
        self.core
            .guarded(self.minted, |inner| inner.subsample_count(&self.name, key))
    }

    /// Keeps this column's backend handles open until the guard drops.
    pub fn session(&self) -> Result<SessionGuard> {
        SessionGuard::enter(&self.core, self.minted)
    }
}

/// Access to the metadata entries of a checkout.
pub struct MetadataProxy {
    core: Arc<CheckoutCore>,
    minted: u64,
}

impl MetadataProxy {
    pub fn get(&self, key: &SampleKey) -> Result<String> {
        self.core.guarded(self.minted, |inner| {
            metadata::get(inner.envs(), &inner.refs_source(), key)
        })
    }

    pub fn put(&self, key: &SampleKey, value: &str) -> Result<()> {
        self.core.guarded(self.minted, |inner| {
            if !inner.write_enabled() {
                return Err(RepoError::invalid_arg("this checkout is not write-enabled"));
            }
            metadata::put(inner.envs(), key, value)
        })
    }

    pub fn del(&self, key: &SampleKey) -> Result<()> {
        self.core.guarded(self.minted, |inner| {
            if !inner.write_enabled() {
                return Err(RepoError::invalid_arg("this checkout is not write-enabled"));
            }
            metadata::del(inner.envs(), key)
        })
    }

    pub fn contains(&self, key: &SampleKey) -> Result<bool> {
        self.core.guarded(self.minted, |inner| {
            metadata::contains(inner.envs(), &inner.refs_source(), key)
        })
    }

    pub fn keys(&self) -> Result<Vec<SampleKey>> {
        self.core.guarded(self.minted, |inner| {
            metadata::keys(inner.envs(), &inner.refs_source())
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.core.guarded(self.minted, |inner| {
            metadata::len(inner.envs(), &inner.refs_source())
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ---------------------------------------------------------------------------
// reader
// ---------------------------------------------------------------------------

/// The repository as it existed at one commit.
#[derive(Debug)]
pub struct ReaderCheckout {
    core: Arc<CheckoutCore>,
    minted: u64,
    commit: Digest,
}

impl ReaderCheckout {
    pub(crate) fn open(
        repo_path: &Path,
        config: &RepoConfig,
        envs: Arc<Environments>,
        commit: Digest,
    ) -> Result<Self> {
        let view = Arc::new(commits::tmp_mount_commit_refs(&envs.refenv, &commit)?);
        let paths = BackendPaths::new(repo_path, config);
        let inner = ColumnSet::from_commit(envs.clone(), view, paths)?;
        debug!(commit = %commit, "opened reader checkout");
        Ok(Self {
            core: Arc::new(CheckoutCore {
                envs,
                generation: AtomicU64::new(0),
                lock_token: None,
                inner: Mutex::new(inner),
            }),
            minted: 0,
            commit: commit.clone(),
        })
    }

    /// Commit hash this read-only checkout's data is read from.
    pub fn commit_digest(&self) -> &Digest {
        &self.commit
    }

    pub fn columns(&self) -> Result<ColumnsProxy> {
        self.core.check_open(self.minted)?;
        Ok(ColumnsProxy {
            core: self.core.clone(),
            minted: self.minted,
        })
    }

    pub fn metadata(&self) -> Result<MetadataProxy> {
        self.core.check_open(self.minted)?;
        Ok(MetadataProxy {
            core: self.core.clone(),
            minted: self.minted,
        })
    }

    pub fn session(&self) -> Result<SessionGuard> {
        SessionGuard::enter(&self.core, self.minted)
    }

    /// Releases backend handles and invalidates outstanding proxies.
    pub fn close(self) -> Result<()> {
        self.core.check_open(self.minted)?;
        let mut inner = self.core.inner.lock().expect("checkout facade mutex poisoned");
        inner.close_accessors();
        self.core.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// writer
// ---------------------------------------------------------------------------

/// The write-enabled view over the staging area.
///
/// At most one of these exists per repository at a time; construction takes
/// the writer lock and `close()` releases it.
#[derive(Debug)]
pub struct WriterCheckout {
    core: Arc<CheckoutCore>,
    minted: u64,
    repo_path: PathBuf,
    config: RepoConfig,
    branch: String,
}

impl WriterCheckout {
    pub(crate) fn open(
        repo_path: &Path,
        config: &RepoConfig,
        envs: Arc<Environments>,
        branch: &str,
    ) -> Result<Self> {
        // Confirm the branch before taking the lock.
        heads::branch_head_commit(&envs.branchenv, branch)?;
        let token = heads::mint_lock_token();
        heads::acquire_writer_lock(&envs.branchenv, &token)?;
        match Self::setup(repo_path, config, &envs, branch) {
            Ok(inner) => {
                debug!(branch, "opened writer checkout");
                Ok(Self {
                    core: Arc::new(CheckoutCore {
                        envs,
                        generation: AtomicU64::new(0),
                        lock_token: Some(token),
                        inner: Mutex::new(inner),
                    }),
                    minted: 0,
                    repo_path: repo_path.to_owned(),
                    config: config.clone(),
                    branch: branch.to_owned(),
                })
            }
            Err(err) => {
                heads::release_writer_lock(&envs.branchenv, &token)?;
                Err(err)
            }
        }
    }

    /// Prepares the staging area for this branch and builds the facades.
    ///
    /// If the stage is clean and based on a different branch, it is swapped
    /// to the requested branch's head. A dirty stage pins the writer to the
    /// branch it was staged from.
    fn setup(
        repo_path: &Path,
        config: &RepoConfig,
        envs: &Arc<Environments>,
        branch: &str,
    ) -> Result<ColumnSet> {
        let current_base = heads::staging_base_branch(&envs.branchenv)?;
        if current_base != branch {
            match staging::status(envs)? {
                StageStatus::Dirty => {
                    return Err(RepoError::DirtySwitch {
                        staged: current_base,
                        requested: branch.to_owned(),
                    });
                }
                StageStatus::Clean => {
                    let head = heads::branch_head_commit(&envs.branchenv, branch)?;
                    commits::replace_staging_area_with_commit(
                        &envs.refenv,
                        &envs.stageenv,
                        &head,
                    )?;
                    heads::set_staging_base_branch(&envs.branchenv, branch)?;
                }
            }
        }
        ColumnSet::from_stage(envs.clone(), BackendPaths::new(repo_path, config))
    }

    /// Branch this write-enabled checkout's staging area is based on.
    pub fn branch_name(&self) -> &str {
        &self.branch
    }

    pub fn columns(&self) -> Result<ColumnsProxy> {
        self.core.check_open(self.minted)?;
        Ok(ColumnsProxy {
            core: self.core.clone(),
            minted: self.minted,
        })
    }

    pub fn metadata(&self) -> Result<MetadataProxy> {
        self.core.check_open(self.minted)?;
        Ok(MetadataProxy {
            core: self.core.clone(),
            minted: self.minted,
        })
    }

    pub fn session(&self) -> Result<SessionGuard> {
        SessionGuard::enter(&self.core, self.minted)
    }

    pub fn status(&self) -> Result<StageStatus> {
        self.core
            .guarded(self.minted, |_| staging::status(&self.core.envs))
    }

    /// Commits the staged changes as a new commit on the checkout branch
    /// and returns its digest.
    #[instrument(skip(self))]
    pub fn commit(&self, message: &str) -> Result<Digest> {
        let digest = self.core.guarded(self.minted, |inner| {
            if staging::status(&self.core.envs)? == StageStatus::Clean {
                return Err(RepoError::EmptyCommit("cannot commit"));
            }
            inner.close_accessors();
            let digest =
                staging::commit_staged(&self.core.envs, &self.repo_path, &self.config, message)?;
            *inner = Self::setup(&self.repo_path, &self.config, &self.core.envs, &self.branch)?;
            Ok(digest)
        })?;
        Ok(digest)
    }

    /// Hard-resets the staging area to the branch head commit, deleting all
    /// staged records and data. Returns the head commit digest.
    #[instrument(skip(self))]
    pub fn reset_staging_area(&self) -> Result<Digest> {
        self.core.guarded(self.minted, |inner| {
            if staging::status(&self.core.envs)? == StageStatus::Clean {
                return Err(RepoError::EmptyCommit("no reset is necessary"));
            }
            inner.close_accessors();
            let head = staging::reset_staged(&self.core.envs, &self.repo_path, &self.config)?;
            *inner = Self::setup(&self.repo_path, &self.config, &self.core.envs, &self.branch)?;
            Ok(head)
        })
    }

    /// Releases the writer lock, closes backend handles, and invalidates
    /// outstanding proxies.
    pub fn close(self) -> Result<()> {
        self.core.check_open(self.minted)?;
        let token = self.core.lock_token.as_deref().unwrap();
        heads::verify_writer_lock(&self.core.envs.branchenv, token)?;
        {
            let mut inner = self.core.inner.lock().expect("checkout facade mutex poisoned");
            inner.close_accessors();
        }
        heads::release_writer_lock(&self.core.envs.branchenv, token)?;
        self.core.generation.fetch_add(1, Ordering::SeqCst);
        debug!(branch = %self.branch, "writer checkout closed");
        Ok(())
    }
}
