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

use std::io;

use thiserror::Error;

/// Error type used throughout the crate.
///
/// Every failure surfaced by the repository maps to exactly one of these
/// kinds; lower layers never swallow or reclassify an error raised below
/// them.
#[derive(Error, Debug)]
pub enum RepoError {
    /// A caller-supplied value violates a contract. No repository state was
    /// mutated.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A value's dtype or shape is incompatible with the column schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A key, branch, or commit does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write-enabled checkout was requested on a branch other than the one
    /// the dirty staging area is based on.
    #[error(
        "unable to check out branch {requested} for writing as the staging area has \
         uncommitted changes on branch {staged}. Commit or reset the staged changes \
         before checking out a different branch for writing"
    )]
    DirtySwitch { staged: String, requested: String },

    /// The repository-wide writer lock is already taken, or a stale holder
    /// attempted an operation after its token was released.
    #[error("cannot acquire the writer lock: {0}")]
    LockHeld(String),

    /// Operation attempted through a closed checkout or an invalidated
    /// accessor handle.
    #[error("unable to operate on a checkout which has been closed; use a new checkout")]
    Closed,

    /// `commit` or `reset` was requested while the staging area holds no
    /// changes.
    #[error("no changes made in the staging area; {0}")]
    EmptyCommit(&'static str),

    /// A stored record failed to parse, a digest did not match its payload,
    /// or a structural invariant of the repository no longer holds.
    #[error("data corruption detected: {0}")]
    Corruption(String),

    /// The backing store failed. The repository state for the current
    /// operation is unchanged; the caller may retry.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The embedded key-value store failed.
    #[error(transparent)]
    Kv(#[from] sled::Error),
}

pub type Result<T, E = RepoError> = std::result::Result<T, E>;

impl RepoError {
    /// Constructs a [`RepoError::Corruption`], emitting a corruption-risk
    /// event so that the failure is observable even when the error itself is
    /// swallowed by an outer driver.
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(target: "tensile::corruption_risk", "{msg}");
        Self::Corruption(msg)
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    /// Process exit status for drivers which surface failures through an
    /// exit code. The assignment is part of the public contract.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArg(_)
            | Self::SchemaMismatch(_)
            | Self::NotFound(_)
            | Self::DirtySwitch { .. }
            | Self::Closed
            | Self::EmptyCommit(_) => 2,
            Self::Corruption(_) => 3,
            Self::LockHeld(_) => 4,
            Self::Io(_) | Self::Kv(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_assignment() {
        assert_eq!(RepoError::invalid_arg("x").exit_code(), 2);
        assert_eq!(RepoError::Closed.exit_code(), 2);
        assert_eq!(RepoError::Corruption("x".into()).exit_code(), 3);
        assert_eq!(RepoError::LockHeld("x".into()).exit_code(), 4);
        assert_eq!(RepoError::Io(io::Error::other("x")).exit_code(), 1);
    }
}
