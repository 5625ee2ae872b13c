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

//! Column facades: the read and write paths over samples and subsamples.
//!
//! A write hashes the value, stores the payload through the column's
//! backend if the digest is new, records the `(digest -> spec)` pair in the
//! hash db, and points the staged ref at the digest. A read resolves ref ->
//! digest -> spec -> backend fetch. Backend file handles stay open across
//! operations and are dropped when the owning checkout closes (or when the
//! outermost session guard ends).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools as _;
use tracing::debug;

use crate::backend::BackendCode;
use crate::backend::BackendPaths;
use crate::backend::OpenMode;
use crate::commits::RefsView;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::hashing;
use crate::kv::Environments;
use crate::records;
use crate::records::SampleKey;
use crate::registry;
use crate::registry::Accessor;
use crate::registry::BackendArg;
use crate::schema::Schema;
use crate::schema::check_valid_name;
use crate::tensor::DType;
use crate::tensor::Tensor;

/// Where a facade resolves its refs: the mutable staging area (writer) or a
/// commit's mounted snapshot (reader).
#[derive(Clone, Debug)]
pub(crate) enum RefsSource {
    Stage,
    Commit(Arc<RefsView>),
}

impl RefsSource {
    pub(crate) fn get(&self, envs: &Environments, key: &str) -> Result<Option<String>> {
        match self {
            Self::Stage => match envs.stageenv.get(key)? {
                None => Ok(None),
                Some(raw) => String::from_utf8(raw)
                    .map(Some)
                    .map_err(|_| RepoError::corruption("staged ref value is not valid UTF-8")),
            },
            Self::Commit(view) => Ok(view.get(key).map(str::to_owned)),
        }
    }

    pub(crate) fn scan(
        &self,
        envs: &Environments,
        prefix: &str,
    ) -> Result<Vec<(String, String)>> {
        match self {
            Self::Stage => envs
                .stageenv
                .scan_prefix(prefix)?
                .into_iter()
                .map(|(key, value)| {
                    String::from_utf8(value)
                        .map(|value| (key, value))
                        .map_err(|_| RepoError::corruption("staged ref value is not valid UTF-8"))
                })
                .collect(),
            Self::Commit(view) => Ok(view
                .scan_prefix(prefix)
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect()),
        }
    }

    pub(crate) fn count(&self, envs: &Environments, prefix: &str) -> Result<usize> {
        match self {
            Self::Stage => envs.stageenv.count_prefix(prefix),
            Self::Commit(view) => Ok(view.count_prefix(prefix)),
        }
    }
}

/// Open backend accessors of one checkout, keyed by backend code.
///
/// Handles open lazily on first use and stay open for throughput. Session
/// guards nest; when the outermost guard ends every handle opened under it
/// is dropped, whether the block succeeded or failed.
#[derive(Debug)]
pub(crate) struct AccessorPool {
    paths: BackendPaths,
    mode: OpenMode,
    open: HashMap<BackendCode, Accessor>,
    session_depth: usize,
}

impl AccessorPool {
    pub(crate) fn new(paths: BackendPaths, mode: OpenMode) -> Self {
        Self {
            paths,
            mode,
            open: HashMap::new(),
            session_depth: 0,
        }
    }

    fn ensure_open(&mut self, code: BackendCode) -> Result<&mut Accessor> {
        if !self.open.contains_key(&code) {
            let mut accessor = Accessor::for_code(code, self.paths.clone())?;
            accessor.open(self.mode)?;
            self.open.insert(code, accessor);
        }
        Ok(self.open.get_mut(&code).unwrap())
    }

    pub(crate) fn close_all(&mut self) {
        for accessor in self.open.values_mut() {
            accessor.close();
        }
        self.open.clear();
    }

    pub(crate) fn enter_session(&mut self) {
        self.session_depth += 1;
    }

    pub(crate) fn exit_session(&mut self) {
        debug_assert!(self.session_depth > 0);
        self.session_depth -= 1;
        if self.session_depth == 0 {
            self.close_all();
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ColumnInfo {
    pub schema: Schema,
    pub schema_digest: Digest,
}

/// All column state of one checkout.
#[derive(Debug)]
pub(crate) struct ColumnSet {
    envs: Arc<Environments>,
    refs: RefsSource,
    pool: AccessorPool,
    columns: BTreeMap<String, ColumnInfo>,
    write_enabled: bool,
}

impl ColumnSet {
    pub(crate) fn from_stage(envs: Arc<Environments>, paths: BackendPaths) -> Result<Self> {
        Self::bootstrap(envs, RefsSource::Stage, paths, OpenMode::Append, true)
    }

    pub(crate) fn from_commit(
        envs: Arc<Environments>,
        view: Arc<RefsView>,
        paths: BackendPaths,
    ) -> Result<Self> {
        Self::bootstrap(envs, RefsSource::Commit(view), paths, OpenMode::Read, false)
    }

    fn bootstrap(
        envs: Arc<Environments>,
        refs: RefsSource,
        paths: BackendPaths,
        mode: OpenMode,
        write_enabled: bool,
    ) -> Result<Self> {
        let mut columns = BTreeMap::new();
        for (key, value) in refs.scan(&envs, records::REF_SCHEMA_PREFIX)? {
            let name = key[records::REF_SCHEMA_PREFIX.len()..].to_owned();
            let schema_digest = Digest::parse(&value)?;
            let raw = envs
                .hashenv
                .get(records::schema_hash_key(&schema_digest))?
                .ok_or_else(|| {
                    RepoError::corruption(format!(
                        "column `{name}` references schema digest `{schema_digest}` which does \
                         not exist in the hash db"
                    ))
                })?;
            let schema = records::decode_schema(&raw)?;
            columns.insert(
                name,
                ColumnInfo {
                    schema,
                    schema_digest,
                },
            );
        }
        Ok(Self {
            envs,
            refs,
            pool: AccessorPool::new(paths, mode),
            columns,
            write_enabled,
        })
    }

    fn require_write(&self) -> Result<()> {
        if self.write_enabled {
            Ok(())
        } else {
            Err(RepoError::invalid_arg(
                "this checkout is not write-enabled",
            ))
        }
    }

    fn info(&self, column: &str) -> Result<&ColumnInfo> {
        self.columns
            .get(column)
            .ok_or_else(|| RepoError::NotFound(format!("column `{column}` does not exist")))
    }

    // -- column management --------------------------------------------------

    pub(crate) fn names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub(crate) fn schema(&self, column: &str) -> Result<Schema> {
        Ok(self.info(column)?.schema.clone())
    }

    fn register_schema(&mut self, name: String, schema: Schema) -> Result<()> {
        let record = records::encode_schema(&schema);
        let digest = hashing::schema_digest(&record);
        let hash_key = records::schema_hash_key(&digest);
        if !self.envs.hashenv.contains(&hash_key)? {
            self.envs.hashenv.put(&hash_key, &record)?;
            self.envs.stagehashenv.put(&hash_key, &record)?;
        }
        self.envs
            .stageenv
            .put(records::schema_ref_key(&name), digest.as_bytes())?;
        debug!(column = %name, schema = %digest, backend = %schema.backend, "created column");
        self.columns.insert(
            name,
            ColumnInfo {
                schema,
                schema_digest: digest,
            },
        );
        Ok(())
    }

    pub(crate) fn create_ndarray_column(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: DType,
        variable_shape: bool,
        contains_subsamples: bool,
        backend: Option<&BackendArg>,
    ) -> Result<()> {
        self.require_write()?;
        check_valid_name("column", name)?;
        if self.columns.contains_key(name) {
            return Err(RepoError::invalid_arg(format!(
                "column `{name}` already exists"
            )));
        }
        if dtype == DType::Str {
            return Err(RepoError::invalid_arg(
                "ndarray columns hold numeric dtypes; use a str column for text",
            ));
        }
        if shape.is_empty() || shape.contains(&0) {
            return Err(RepoError::invalid_arg(format!(
                "column shape {shape:?} must have at least one non-zero dimension"
            )));
        }
        let prototype = Tensor::zeros(shape, dtype);
        let resolved = registry::parse_user_backend_opts(backend, &prototype, variable_shape)?;
        self.register_schema(
            name.to_owned(),
            Schema {
                dtype,
                shape: shape.to_vec(),
                variable_shape,
                contains_subsamples,
                backend: resolved.backend,
                backend_opts: resolved.opts,
            },
        )
    }

    pub(crate) fn create_str_column(
        &mut self,
        name: &str,
        contains_subsamples: bool,
        backend: Option<&BackendArg>,
    ) -> Result<()> {
        self.require_write()?;
        check_valid_name("column", name)?;
        if self.columns.contains_key(name) {
            return Err(RepoError::invalid_arg(format!(
                "column `{name}` already exists"
            )));
        }
        let prototype = Tensor::from_string("p");
        let resolved = registry::parse_user_backend_opts(backend, &prototype, true)?;
        self.register_schema(
            name.to_owned(),
            Schema {
                dtype: DType::Str,
                shape: vec![],
                variable_shape: true,
                contains_subsamples,
                backend: resolved.backend,
                backend_opts: resolved.opts,
            },
        )
    }

    /// Drops a column and all its staged refs. Payloads and hash records
    /// stay behind; they remain reachable from prior commits.
    pub(crate) fn remove_column(&mut self, name: &str) -> Result<()> {
        self.require_write()?;
        self.info(name)?;
        let txn = self.envs.stageenv.write_txn();
        let mut batch = sled::Batch::default();
        batch.remove(records::schema_ref_key(name).into_bytes());
        for (key, _) in txn.scan_prefix(records::column_data_prefix(name))? {
            batch.remove(key.into_bytes());
        }
        txn.apply_batch(batch)?;
        self.columns.remove(name);
        Ok(())
    }

    // -- payload plumbing ---------------------------------------------------

    fn store_payload(&mut self, column: &str, tensor: &Tensor) -> Result<Digest> {
        let info = self.info(column)?;
        info.schema.validate_tensor(tensor)?;
        let backend = info.schema.backend;
        let opts = info.schema.backend_opts.clone();
        let digest = hashing::tensor_digest(tensor);
        let hash_key = records::data_hash_key(&digest);
        if !self.envs.hashenv.contains(&hash_key)? {
            let accessor = self.pool.ensure_open(backend)?;
            accessor.apply_opts(&opts)?;
            let spec = accessor.write_data(tensor)?;
            let raw = records::encode_spec(&spec);
            self.envs.hashenv.put(&hash_key, &raw)?;
            self.envs.stagehashenv.put(&hash_key, &raw)?;
        }
        Ok(digest)
    }

    fn fetch_payload(&mut self, digest: &Digest) -> Result<Tensor> {
        let raw = self
            .envs
            .hashenv
            .get(records::data_hash_key(digest))?
            .ok_or_else(|| {
                RepoError::corruption(format!(
                    "data digest `{digest}` is referenced but missing from the hash db"
                ))
            })?;
        let spec = records::decode_spec(&raw)?;
        self.pool
            .ensure_open(spec.backend_code())?
            .read_data(&spec)
    }

    // -- flat sample operations ---------------------------------------------

    fn require_flat(&self, column: &str) -> Result<()> {
        if self.info(column)?.schema.contains_subsamples {
            Err(RepoError::invalid_arg(format!(
                "column `{column}` contains subsamples; address them through subsample \
                 operations"
            )))
        } else {
            Ok(())
        }
    }

    fn require_nested(&self, column: &str) -> Result<()> {
        if self.info(column)?.schema.contains_subsamples {
            Ok(())
        } else {
            Err(RepoError::invalid_arg(format!(
                "column `{column}` does not contain subsamples"
            )))
        }
    }

    pub(crate) fn put(&mut self, column: &str, key: &SampleKey, tensor: &Tensor) -> Result<()> {
        self.require_write()?;
        self.require_flat(column)?;
        let digest = self.store_payload(column, tensor)?;
        self.envs
            .stageenv
            .put(records::data_ref_key(column, key, None), digest.as_bytes())
    }

    pub(crate) fn get(&mut self, column: &str, key: &SampleKey) -> Result<Tensor> {
        self.require_flat(column)?;
        let ref_key = records::data_ref_key(column, key, None);
        let digest = self
            .refs
            .get(&self.envs, &ref_key)?
            .ok_or_else(|| {
                RepoError::NotFound(format!("column `{column}` has no sample `{key}`"))
            })?;
        let digest = Digest::parse(&digest)?;
        self.fetch_payload(&digest)
    }

    pub(crate) fn del(&mut self, column: &str, key: &SampleKey) -> Result<()> {
        self.require_write()?;
        self.info(column)?;
        let removed = if self.info(column)?.schema.contains_subsamples {
            let txn = self.envs.stageenv.write_txn();
            let staged = txn.scan_prefix(records::sample_data_prefix(column, key))?;
            let mut batch = sled::Batch::default();
            for (ref_key, _) in &staged {
                batch.remove(ref_key.clone().into_bytes());
            }
            txn.apply_batch(batch)?;
            !staged.is_empty()
        } else {
            self.envs
                .stageenv
                .del(records::data_ref_key(column, key, None))?
        };
        if removed {
            Ok(())
        } else {
            Err(RepoError::NotFound(format!(
                "column `{column}` has no sample `{key}`"
            )))
        }
    }

    // -- subsample operations -----------------------------------------------

    pub(crate) fn put_subsample(
        &mut self,
        column: &str,
        key: &SampleKey,
        subkey: &SampleKey,
        tensor: &Tensor,
    ) -> Result<()> {
        self.require_write()?;
        self.require_nested(column)?;
        let digest = self.store_payload(column, tensor)?;
        self.envs.stageenv.put(
            records::data_ref_key(column, key, Some(subkey)),
            digest.as_bytes(),
        )
    }

    /// Writes a `{subkey: value}` mapping under one sample key.
    pub(crate) fn put_subsamples<'a>(
        &mut self,
        column: &str,
        key: &SampleKey,
        entries: impl IntoIterator<Item = (&'a SampleKey, &'a Tensor)>,
    ) -> Result<()> {
        for (subkey, tensor) in entries {
            self.put_subsample(column, key, subkey, tensor)?;
        }
        Ok(())
    }

    pub(crate) fn get_subsample(
        &mut self,
        column: &str,
        key: &SampleKey,
        subkey: &SampleKey,
    ) -> Result<Tensor> {
        self.require_nested(column)?;
        let ref_key = records::data_ref_key(column, key, Some(subkey));
        let digest = self.refs.get(&self.envs, &ref_key)?.ok_or_else(|| {
            RepoError::NotFound(format!(
                "column `{column}` has no subsample `{key}/{subkey}`"
            ))
        })?;
        let digest = Digest::parse(&digest)?;
        self.fetch_payload(&digest)
    }

    pub(crate) fn del_subsample(
        &mut self,
        column: &str,
        key: &SampleKey,
        subkey: &SampleKey,
    ) -> Result<()> {
        self.require_write()?;
        self.require_nested(column)?;
        let removed = self
            .envs
            .stageenv
            .del(records::data_ref_key(column, key, Some(subkey)))?;
        if removed {
            Ok(())
        } else {
            Err(RepoError::NotFound(format!(
                "column `{column}` has no subsample `{key}/{subkey}`"
            )))
        }
    }

    // -- iteration ----------------------------------------------------------

    /// Distinct sample keys of a column, in encoded order.
    pub(crate) fn sample_keys(&self, column: &str) -> Result<Vec<SampleKey>> {
        self.info(column)?;
        let mut keys = Vec::new();
        for (raw, _) in self.refs.scan(&self.envs, &records::column_data_prefix(column))? {
            match records::RefKey::decode(&raw)? {
                records::RefKey::Data { key, .. } => keys.push(key),
                other => {
                    return Err(RepoError::corruption(format!(
                        "foreign record {other:?} under column `{column}` data prefix"
                    )));
                }
            }
        }
        // Subsample refs repeat their sample key; scan order keeps the
        // result deterministic.
        Ok(keys.into_iter().unique().collect())
    }

    /// Number of distinct sample keys.
    pub(crate) fn sample_count(&self, column: &str) -> Result<usize> {
        Ok(self.sample_keys(column)?.len())
    }

    pub(crate) fn contains_sample(&self, column: &str, key: &SampleKey) -> Result<bool> {
        if self.info(column)?.schema.contains_subsamples {
            Ok(self
                .refs
                .count(&self.envs, &records::sample_data_prefix(column, key))?
                > 0)
        } else {
            Ok(self
                .refs
                .get(&self.envs, &records::data_ref_key(column, key, None))?
                .is_some())
        }
    }

    pub(crate) fn subsample_keys(
        &self,
        column: &str,
        key: &SampleKey,
    ) -> Result<Vec<SampleKey>> {
        self.require_nested(column)?;
        let mut keys = Vec::new();
        for (raw, _) in self
            .refs
            .scan(&self.envs, &records::sample_data_prefix(column, key))?
        {
            match records::RefKey::decode(&raw)? {
                records::RefKey::Data {
                    subkey: Some(subkey),
                    ..
                } => keys.push(subkey),
                other => {
                    return Err(RepoError::corruption(format!(
                        "foreign record {other:?} under sample `{key}` of column `{column}`"
                    )));
                }
            }
        }
        Ok(keys)
    }

    /// Number of subsamples under one sample key.
    pub(crate) fn subsample_count(&self, column: &str, key: &SampleKey) -> Result<usize> {
        self.require_nested(column)?;
        self.refs
            .count(&self.envs, &records::sample_data_prefix(column, key))
    }

    // -- handle management --------------------------------------------------

    pub(crate) fn close_accessors(&mut self) {
        self.pool.close_all();
    }

    pub(crate) fn enter_session(&mut self) {
        self.pool.enter_session();
    }

    pub(crate) fn exit_session(&mut self) {
        self.pool.exit_session();
    }

    pub(crate) fn refs_source(&self) -> RefsSource {
        self.refs.clone()
    }

    pub(crate) fn envs(&self) -> &Arc<Environments> {
        &self.envs
    }

    pub(crate) fn write_enabled(&self) -> bool {
        self.write_enabled
    }
}
