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

//! Repository lifecycle and entry points.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing::instrument;

use crate::checkout::ReaderCheckout;
use crate::checkout::WriterCheckout;
use crate::commits;
use crate::config::RepoConfig;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::file_util;
use crate::heads;
use crate::integrity;
use crate::integrity::IntegrityReport;
use crate::kv;
use crate::kv::Environments;
use crate::records::CommitMeta;
use crate::records::CommitParents;

/// Branch created at init and used until the user branches off it.
pub const DEFAULT_BRANCH: &str = "master";

/// Where a reader checkout is pinned.
#[derive(Clone, Debug)]
pub enum ReadAt<'a> {
    /// The current head commit of a branch.
    Branch(&'a str),
    /// An explicit commit digest.
    Commit(Digest),
}

/// One commit of the history listing.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub digest: Digest,
    pub parents: CommitParents,
    pub meta: CommitMeta,
}

/// Handle to a repository on disk.
#[derive(Debug)]
pub struct Repository {
    path: PathBuf,
    config: RepoConfig,
    envs: Arc<Environments>,
}

impl Repository {
    /// Creates a repository at `path` and writes the initial commit.
    pub fn init(path: &Path, user_name: &str, user_email: &str) -> Result<Self> {
        Self::init_with_config(path, user_name, user_email, RepoConfig::default())
    }

    #[instrument(skip(config))]
    pub fn init_with_config(
        path: &Path,
        user_name: &str,
        user_email: &str,
        config: RepoConfig,
    ) -> Result<Self> {
        if user_name.is_empty() || user_email.is_empty() {
            return Err(RepoError::invalid_arg(
                "a user name and email are required to initialize a repository",
            ));
        }
        if path.join(kv::BRANCH_ENV_DIR).exists() {
            return Err(RepoError::invalid_arg(format!(
                "a repository already exists at `{}`",
                path.display()
            )));
        }
        fs::create_dir_all(path)?;
        file_util::create_or_reuse_dir(&config.store_data_path(path))?;
        file_util::create_or_reuse_dir(&config.stage_data_path(path))?;
        let envs = Arc::new(Environments::open(path, &config)?);

        heads::set_user_info(&envs.branchenv, user_name, user_email)?;
        heads::initialize_writer_lock(&envs.branchenv)?;

        let meta = CommitMeta {
            user_name: user_name.to_owned(),
            user_email: user_email.to_owned(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            message: "initial commit".to_owned(),
        };
        let initial =
            commits::write_commit_record(&envs.refenv, &CommitParents::default(), &meta, &[])?;
        heads::create_branch(&envs.branchenv, DEFAULT_BRANCH, &initial)?;
        heads::set_staging_base_branch(&envs.branchenv, DEFAULT_BRANCH)?;
        commits::replace_staging_area_with_commit(&envs.refenv, &envs.stageenv, &initial)?;

        info!(path = %path.display(), commit = %initial, "initialized repository");
        Ok(Self {
            path: path.to_owned(),
            config,
            envs,
        })
    }

    /// Opens an existing repository.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, RepoConfig::default())
    }

    pub fn open_with_config(path: &Path, config: RepoConfig) -> Result<Self> {
        if !path.join(kv::BRANCH_ENV_DIR).exists() {
            return Err(RepoError::NotFound(format!(
                "no repository exists at `{}`",
                path.display()
            )));
        }
        let envs = Arc::new(Environments::open(path, &config)?);
        // Fails loudly on a half-initialized directory.
        heads::staging_base_branch(&envs.branchenv)?;
        Ok(Self {
            path: path.to_owned(),
            config,
            envs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Opens the write-enabled checkout on a branch head, taking the writer
    /// lock.
    pub fn checkout_writer(&self, branch: &str) -> Result<WriterCheckout> {
        WriterCheckout::open(&self.path, &self.config, self.envs.clone(), branch)
    }

    /// Opens a read-only checkout pinned to a commit.
    pub fn checkout_reader(&self, at: ReadAt<'_>) -> Result<ReaderCheckout> {
        let commit = match at {
            ReadAt::Branch(name) => heads::branch_head_commit(&self.envs.branchenv, name)?,
            ReadAt::Commit(digest) => {
                if !commits::check_commit_in_history(&self.envs.refenv, &digest)? {
                    return Err(RepoError::NotFound(format!(
                        "commit `{digest}` does not exist"
                    )));
                }
                digest
            }
        };
        ReaderCheckout::open(&self.path, &self.config, self.envs.clone(), commit)
    }

    /// History of a branch (the staging base branch when `None`), most
    /// recent first.
    pub fn log(&self, branch: Option<&str>) -> Result<Vec<LogEntry>> {
        let branch = match branch {
            Some(name) => name.to_owned(),
            None => heads::staging_base_branch(&self.envs.branchenv)?,
        };
        let head = heads::branch_head_commit(&self.envs.branchenv, &branch)?;
        commits::walk_ancestors(&self.envs.refenv, &head)?
            .into_iter()
            .map(|digest| {
                Ok(LogEntry {
                    parents: commits::get_commit_parents(&self.envs.refenv, &digest)?,
                    meta: commits::get_commit_meta(&self.envs.refenv, &digest)?,
                    digest,
                })
            })
            .collect()
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        heads::list_branch_names(&self.envs.branchenv)
    }

    /// Creates a branch at `at` (the staging base branch head when `None`).
    pub fn create_branch(&self, name: &str, at: Option<&Digest>) -> Result<()> {
        let head = match at {
            Some(digest) => {
                if !commits::check_commit_in_history(&self.envs.refenv, digest)? {
                    return Err(RepoError::NotFound(format!(
                        "commit `{digest}` does not exist"
                    )));
                }
                digest.clone()
            }
            None => {
                let base = heads::staging_base_branch(&self.envs.branchenv)?;
                heads::branch_head_commit(&self.envs.branchenv, &base)?
            }
        };
        heads::create_branch(&self.envs.branchenv, name, &head)
    }

    /// Audits the whole repository; see [`crate::integrity`].
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        integrity::run_verification(&self.envs, &self.path, &self.config)
    }

    /// Clears a writer lock orphaned by a process which exited without
    /// closing its writer checkout. Never call while a writer is live.
    pub fn force_release_writer_lock(&self) -> Result<()> {
        heads::force_release_writer_lock(&self.envs.branchenv)
    }

    /// Low-level access to the key-value environments. Intended for the
    /// diagnostics and sync tooling; most callers want a checkout.
    pub fn environments(&self) -> &Arc<Environments> {
        &self.envs
    }
}
