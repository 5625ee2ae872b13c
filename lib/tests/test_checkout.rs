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
use tensile_lib::repo::ReadAt;
use tensile_lib::tensor::DType;
use tensile_lib::tensor::Tensor;
use testutils::TestRepo;
use testutils::key;
use testutils::ones_f64;

/// Only one writer checkout may exist at a time; the lock frees on close.
#[test]
fn test_writer_lock_exclusivity() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    let w1 = repo.checkout_writer("master").unwrap();
    assert_matches!(
        repo.checkout_writer("master"),
        Err(RepoError::LockHeld(_))
    );
    w1.close().unwrap();

    let w3 = repo.checkout_writer("master").unwrap();
    w3.close().unwrap();
}

#[test]
fn test_stale_writer_proxies_fail_after_close() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    testutils::write_zeros_commit(repo);

    let writer = repo.checkout_writer("master").unwrap();
    let columns = writer.columns().unwrap();
    let aset = columns.column("aset").unwrap();
    let metadata = writer.metadata().unwrap();
    writer.close().unwrap();

    assert_matches!(aset.get(&key("x")), Err(RepoError::Closed));
    assert_matches!(aset.put(&key("z"), &ones_f64(&[5, 7])), Err(RepoError::Closed));
    assert_matches!(columns.names(), Err(RepoError::Closed));
    assert_matches!(metadata.len(), Err(RepoError::Closed));
}

#[test]
fn test_stale_reader_proxies_fail_after_close() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let h1 = testutils::write_zeros_commit(repo);

    let reader = repo.checkout_reader(ReadAt::Commit(h1)).unwrap();
    let aset = reader.columns().unwrap().column("aset").unwrap();
    assert!(aset.contains(&key("x")).unwrap());
    reader.close().unwrap();
    assert_matches!(aset.get(&key("x")), Err(RepoError::Closed));
}

#[test]
fn test_reader_checkouts_may_coexist_with_writer() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let h1 = testutils::write_zeros_commit(repo);

    let r1 = repo.checkout_reader(ReadAt::Commit(h1.clone())).unwrap();
    let r2 = repo.checkout_reader(ReadAt::Branch("master")).unwrap();
    let writer = repo.checkout_writer("master").unwrap();

    assert_eq!(
        r1.columns().unwrap().column("aset").unwrap().len().unwrap(),
        1
    );
    assert_eq!(
        r2.columns().unwrap().column("aset").unwrap().len().unwrap(),
        1
    );
    writer.close().unwrap();
    r1.close().unwrap();
    r2.close().unwrap();
}

#[test]
fn test_stale_holder_fails_after_forced_release() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    testutils::write_zeros_commit(repo);

    let stale = repo.checkout_writer("master").unwrap();
    // An operator clears the lock out from under the stale holder.
    repo.force_release_writer_lock().unwrap();
    let fresh = repo.checkout_writer("master").unwrap();

    let aset = stale.columns().unwrap().column("aset").unwrap();
    assert_matches!(
        aset.put(&key("y"), &ones_f64(&[5, 7])),
        Err(RepoError::LockHeld(_))
    );
    assert_matches!(stale.commit("nope"), Err(RepoError::LockHeld(_)));
    fresh.close().unwrap();
}

#[test]
fn test_reader_has_no_write_surface() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let h1 = testutils::write_zeros_commit(repo);

    let reader = repo.checkout_reader(ReadAt::Commit(h1)).unwrap();
    let aset = reader.columns().unwrap().column("aset").unwrap();
    assert_matches!(
        aset.put(&key("y"), &ones_f64(&[5, 7])),
        Err(RepoError::InvalidArg(_))
    );
    assert_matches!(
        reader.metadata().unwrap().put(&key("k"), "v"),
        Err(RepoError::InvalidArg(_))
    );
    reader.close().unwrap();
}

/// A failure inside a session block must still release the handles the
/// block opened: the subsequent commit moves the staged payload files,
/// which requires every backend handle to be closed.
#[test]
fn test_session_releases_handles_on_failure() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    let writer = repo.checkout_writer("master").unwrap();
    let columns = writer.columns().unwrap();
    let aset = columns
        .create_ndarray_column("aset", &[5, 7], DType::F64, false, false, None)
        .unwrap();

    let attempt = || -> Result<(), RepoError> {
        let _session = aset.session()?;
        aset.put(&key("good"), &ones_f64(&[5, 7]))?;
        // Wrong shape: fails mid-block, the guard drops on the error path.
        aset.put(&key("bad"), &Tensor::zeros(&[2, 2], DType::F64))?;
        Ok(())
    };
    assert_matches!(attempt(), Err(RepoError::SchemaMismatch(_)));

    // The stage still commits cleanly afterwards.
    writer.commit("partial block").unwrap();
    writer.close().unwrap();

    let reader = repo.checkout_reader(ReadAt::Branch("master")).unwrap();
    let aset = reader.columns().unwrap().column("aset").unwrap();
    assert_eq!(aset.get(&key("good")).unwrap(), ones_f64(&[5, 7]));
    assert!(!aset.contains(&key("bad")).unwrap());
    reader.close().unwrap();
}

#[test]
fn test_nested_sessions_keep_outer_handles() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    let writer = repo.checkout_writer("master").unwrap();
    let columns = writer.columns().unwrap();
    let aset = columns
        .create_ndarray_column("aset", &[3], DType::U8, false, false, None)
        .unwrap();

    let outer = writer.session().unwrap();
    aset.put(&key("a"), &Tensor::from_u8(&[3], &[1, 2, 3]).unwrap())
        .unwrap();
    {
        let _inner = aset.session().unwrap();
        aset.put(&key("b"), &Tensor::from_u8(&[3], &[4, 5, 6]).unwrap())
            .unwrap();
    }
    // Handles opened under the outer guard still serve operations.
    aset.put(&key("c"), &Tensor::from_u8(&[3], &[7, 8, 9]).unwrap())
        .unwrap();
    drop(outer);

    writer.commit("three rows").unwrap();
    writer.close().unwrap();
}
