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

//! Library for Tensile - a version control system for numerical datasets.
//!
//! A repository stores N-dimensional array samples and string metadata
//! under a content-addressable model: samples are organized into named,
//! schema-bound columns; column states are grouped into immutable commits
//! arranged in a DAG with branches; and raw payloads are dispatched to one
//! of several pluggable storage backends. Access goes through checkouts:
//! a single write-enabled checkout working against the staging area, and
//! any number of read-only checkouts pinned to commits.

pub mod backend;
pub mod checkout;
mod columns;
pub mod commits;
pub mod config;
pub mod digest;
pub mod error;
pub mod file_util;
pub mod flat_backend;
pub mod hashing;
pub mod heads;
pub mod integrity;
pub mod kv;
pub mod kv_backend;
mod metadata;
pub mod pack_backend;
pub mod records;
pub mod registry;
pub mod remote_backend;
pub mod repo;
pub mod schema;
pub mod staging;
pub mod tensor;
