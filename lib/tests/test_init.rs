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

use assert_matches::assert_matches;
use tensile_lib::error::RepoError;
use tensile_lib::repo::Repository;
use testutils::TestRepo;

#[test]
fn test_init_creates_dirs_and_initial_commit() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    assert!(test_repo.store_data_dir().is_dir());
    assert!(test_repo.stage_data_dir().is_dir());
    assert_eq!(repo.list_branches().unwrap(), ["master"]);

    let log = repo.log(None).unwrap();
    assert_eq!(log.len(), 1);
    let initial = &log[0];
    assert!(initial.parents.is_initial());
    assert_eq!(initial.meta.message, "initial commit");
    assert_eq!(initial.meta.user_name, testutils::TEST_USER);
    assert_eq!(initial.meta.user_email, testutils::TEST_EMAIL);
}

#[test]
fn test_init_twice_fails() {
    let test_repo = TestRepo::init();
    assert_matches!(
        Repository::init(test_repo.repo.path(), "tester", "foo@test.bar"),
        Err(RepoError::InvalidArg(_))
    );
}

#[test]
fn test_init_requires_user_identity() {
    let temp_dir = testutils::new_temp_dir();
    assert_matches!(
        Repository::init(&temp_dir.path().join("repo"), "", "foo@test.bar"),
        Err(RepoError::InvalidArg(_))
    );
}

#[test]
fn test_open_missing_repository() {
    let temp_dir = testutils::new_temp_dir();
    assert_matches!(
        Repository::open(&temp_dir.path().join("nothing")),
        Err(RepoError::NotFound(_))
    );
}

#[test]
fn test_reopen_preserves_history() {
    let test_repo = TestRepo::init();
    let first = testutils::write_zeros_commit(&test_repo.repo);

    let reopened = test_repo.reopen();
    let log = reopened.repo.log(Some("master")).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].digest, first);
}

#[test]
fn test_fresh_repo_verifies() {
    let test_repo = TestRepo::init();
    let report = test_repo.repo.verify_integrity().unwrap();
    assert_eq!(report.branches, 1);
    assert_eq!(report.commits, 1);
    assert_eq!(report.data_digests, 0);
    assert_eq!(report.remote_unverified, 0);
}

#[test]
fn test_create_branch_and_log() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let head = testutils::write_zeros_commit(repo);

    repo.create_branch("dev", None).unwrap();
    assert_eq!(repo.list_branches().unwrap(), ["dev", "master"]);
    let dev_log = repo.log(Some("dev")).unwrap();
    assert_eq!(dev_log[0].digest, head);

    assert_matches!(
        repo.create_branch("dev", None),
        Err(RepoError::InvalidArg(_))
    );
    assert_matches!(
        repo.create_branch("bad name", None),
        Err(RepoError::InvalidArg(_))
    );
}
