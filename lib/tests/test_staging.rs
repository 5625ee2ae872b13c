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
use pretty_assertions::assert_eq;
use tensile_lib::error::RepoError;
use tensile_lib::registry::BackendArg;
use tensile_lib::staging::StageStatus;
use tensile_lib::tensor::DType;
use tensile_lib::tensor::Tensor;
use testutils::TestRepo;
use testutils::key;
use testutils::ones_f64;

/// Write on top of a commit, then hard-reset back to it.
#[test]
fn test_reset_discards_staged_changes() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let h1 = testutils::write_zeros_commit(repo);

    let writer = repo.checkout_writer("master").unwrap();
    let aset = writer.columns().unwrap().column("aset").unwrap();
    aset.put(&key("y"), &ones_f64(&[5, 7])).unwrap();
    assert_eq!(writer.status().unwrap(), StageStatus::Dirty);

    let reset_to = writer.reset_staging_area().unwrap();
    assert_eq!(reset_to, h1);
    assert_eq!(writer.status().unwrap(), StageStatus::Clean);

    let aset = writer.columns().unwrap().column("aset").unwrap();
    assert!(!aset.contains(&key("y")).unwrap());
    assert_eq!(
        aset.get(&key("x")).unwrap(),
        Tensor::zeros(&[5, 7], DType::F64)
    );
    writer.close().unwrap();
}

#[test]
fn test_reset_on_clean_stage_rejected() {
    let test_repo = TestRepo::init();
    let writer = test_repo.repo.checkout_writer("master").unwrap();
    assert_matches!(
        writer.reset_staging_area(),
        Err(RepoError::EmptyCommit(_))
    );
    writer.close().unwrap();
}

#[test]
fn test_reset_collects_staged_payload_files_and_hash_records() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    testutils::write_zeros_commit(repo);

    let writer = repo.checkout_writer("master").unwrap();
    let columns = writer.columns().unwrap();
    // Flat backend: one payload file per sample, easy to observe.
    let flat = columns
        .create_ndarray_column(
            "rows",
            &[16],
            DType::F32,
            false,
            false,
            Some(BackendArg::Code("10".to_owned())),
        )
        .unwrap();
    flat.put(&key("r0"), &Tensor::from_f32(&[16], &[9.0; 16]).unwrap())
        .unwrap();
    assert_eq!(test_repo.stage_data_dir().read_dir().unwrap().count(), 1);

    writer.reset_staging_area().unwrap();
    assert_eq!(test_repo.stage_data_dir().read_dir().unwrap().count(), 0);
    writer.close().unwrap();

    // The staged-only digest is gone from the hash db as well.
    let report = repo.verify_integrity().unwrap();
    assert_eq!(report.data_digests, 1);
    assert_eq!(report.schema_digests, 1);
}

#[test]
fn test_commit_promotes_staged_payload_files() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    let stored_before = test_repo.store_data_dir().read_dir().unwrap().count();
    testutils::write_zeros_commit(repo);
    assert_eq!(test_repo.stage_data_dir().read_dir().unwrap().count(), 0);
    assert_eq!(
        test_repo.store_data_dir().read_dir().unwrap().count(),
        stored_before + 1
    );
}

#[test]
fn test_clean_writer_switches_staging_branch() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    testutils::write_zeros_commit(repo);
    repo.create_branch("dev", None).unwrap();

    let writer = repo.checkout_writer("dev").unwrap();
    assert_eq!(writer.branch_name(), "dev");
    let aset = writer.columns().unwrap().column("aset").unwrap();
    aset.put(&key("dev-only"), &ones_f64(&[5, 7])).unwrap();
    let dev_head = writer.commit("on dev").unwrap();
    writer.close().unwrap();

    // master kept its head; dev advanced.
    let log = repo.log(Some("dev")).unwrap();
    assert_eq!(log[0].digest, dev_head);
    assert_eq!(repo.log(Some("master")).unwrap().len(), 2);
}

#[test]
fn test_dirty_stage_pins_writer_branch() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    testutils::write_zeros_commit(repo);
    repo.create_branch("dev", None).unwrap();

    // Dirty the stage on master.
    let writer = repo.checkout_writer("master").unwrap();
    let aset = writer.columns().unwrap().column("aset").unwrap();
    aset.put(&key("pending"), &ones_f64(&[5, 7])).unwrap();
    writer.close().unwrap();

    assert_matches!(
        repo.checkout_writer("dev"),
        Err(RepoError::DirtySwitch { staged, requested })
            if staged == "master" && requested == "dev"
    );

    // The failed bootstrap released the lock; the staged branch still opens.
    let writer = repo.checkout_writer("master").unwrap();
    assert_eq!(writer.status().unwrap(), StageStatus::Dirty);
    writer.commit("flush pending").unwrap();
    writer.close().unwrap();

    // With a clean stage the switch goes through.
    let writer = repo.checkout_writer("dev").unwrap();
    assert_eq!(writer.status().unwrap(), StageStatus::Clean);
    writer.close().unwrap();
}

#[test]
fn test_stage_survives_checkout_cycles() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    testutils::write_zeros_commit(repo);

    let writer = repo.checkout_writer("master").unwrap();
    let aset = writer.columns().unwrap().column("aset").unwrap();
    aset.put(&key("pending"), &ones_f64(&[5, 7])).unwrap();
    writer.close().unwrap();

    // Staged work is durable across close/reopen of the writer.
    let writer = repo.checkout_writer("master").unwrap();
    assert_eq!(writer.status().unwrap(), StageStatus::Dirty);
    let aset = writer.columns().unwrap().column("aset").unwrap();
    assert_eq!(aset.get(&key("pending")).unwrap(), ones_f64(&[5, 7]));
    writer.commit("picked up").unwrap();
    writer.close().unwrap();
}
