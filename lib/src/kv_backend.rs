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

//! Backend `"30"`: payload rows in a directory-backed embedded store.
//!
//! The only backend accepting string payloads, and the default for string
//! columns. Each staging session writes into its own store directory under
//! the stage data dir; the directory moves wholesale into the store data
//! dir at commit.

use std::collections::HashMap;

use crate::backend::BackendCode;
use crate::backend::BackendPaths;
use crate::backend::Capabilities;
use crate::backend::OpenMode;
use crate::backend::Spec;
use crate::backend::mint_uid;
use crate::error::RepoError;
use crate::error::Result;
use crate::tensor::Tensor;

const STORE_SUFFIX: &str = ".kvdat";

pub const CAPABILITIES: Capabilities = Capabilities {
    islocal: true,
    numeric_payloads: true,
    str_payloads: true,
    variable_shape: true,
    subsamples: true,
    accepts_codec_opts: false,
};

#[derive(Debug)]
struct KvWriter {
    uid: String,
    db: sled::Db,
    next_row: u64,
}

#[derive(Debug)]
pub struct KvAccessor {
    paths: BackendPaths,
    mode: Option<OpenMode>,
    writer: Option<KvWriter>,
    readers: HashMap<String, sled::Db>,
}

impl KvAccessor {
    pub fn new(paths: BackendPaths) -> Self {
        Self {
            paths,
            mode: None,
            writer: None,
            readers: HashMap::new(),
        }
    }

    pub fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.mode = Some(mode);
        Ok(())
    }

    /// Drops every database handle so the staged store directories can be
    /// moved or deleted.
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take()
            && let Err(err) = writer.db.flush()
        {
            tracing::warn!(uid = %writer.uid, "failed to flush staged kv store: {err}");
        }
        self.readers.clear();
        self.mode = None;
    }

    fn require_open(&self, wanted: OpenMode) -> Result<()> {
        match self.mode {
            Some(OpenMode::Append) => Ok(()),
            Some(OpenMode::Read) if wanted == OpenMode::Read => Ok(()),
            _ => Err(RepoError::invalid_arg(format!(
                "backend {} accessor is not open for {wanted:?}",
                BackendCode::KV_V3
            ))),
        }
    }

    fn writer(&mut self) -> Result<&mut KvWriter> {
        if self.writer.is_none() {
            let uid = mint_uid();
            let db = sled::open(self.paths.stage_dir.join(format!("{uid}{STORE_SUFFIX}")))?;
            self.writer = Some(KvWriter {
                uid,
                db,
                next_row: 0,
            });
        }
        Ok(self.writer.as_mut().unwrap())
    }

    pub fn write_data(&mut self, tensor: &Tensor) -> Result<Spec> {
        self.require_open(OpenMode::Append)?;
        let dtype = tensor.dtype();
        let shape = tensor.shape().to_vec();
        let writer = self.writer()?;
        let row = writer.next_row;
        writer.db.insert(row.to_be_bytes(), tensor.as_le_bytes())?;
        writer.next_row += 1;
        Ok(Spec::Kv {
            uid: writer.uid.clone(),
            row,
            dtype,
            shape,
        })
    }

    fn reader(&mut self, uid: &str) -> Result<&sled::Db> {
        if !self.readers.contains_key(uid) {
            // The writer's store is readable in place before commit.
            if let Some(writer) = &self.writer
                && writer.uid == uid
            {
                return Ok(&self.writer.as_ref().unwrap().db);
            }
            let path = self.paths.find(&format!("{uid}{STORE_SUFFIX}"))?;
            self.readers.insert(uid.to_owned(), sled::open(path)?);
        }
        Ok(&self.readers[uid])
    }

    pub fn read_data(&mut self, spec: &Spec) -> Result<Tensor> {
        self.require_open(OpenMode::Read)?;
        let Spec::Kv {
            uid,
            row,
            dtype,
            shape,
        } = spec
        else {
            return Err(RepoError::corruption(format!(
                "spec {spec:?} routed to the embedded-kv backend"
            )));
        };
        let db = self.reader(uid)?;
        let data = db.get(row.to_be_bytes())?.ok_or_else(|| {
            RepoError::corruption(format!(
                "kv store `{uid}` is missing referenced row {row}"
            ))
        })?;
        Tensor::from_le_bytes(*dtype, shape.clone(), data.to_vec()).map_err(|_| {
            RepoError::corruption(format!(
                "kv store `{uid}` row {row} does not match spec shape {shape:?} of dtype {dtype}"
            ))
        })
    }

    /// Removes a row written during the current staging session.
    pub fn delete_in_process_data(&mut self, spec: &Spec) -> Result<()> {
        let Spec::Kv { uid, row, .. } = spec else {
            return Err(RepoError::corruption(format!(
                "spec {spec:?} routed to the embedded-kv backend"
            )));
        };
        if let Some(writer) = &self.writer
            && writer.uid == *uid
        {
            writer.db.remove(row.to_be_bytes())?;
        }
        Ok(())
    }
}
