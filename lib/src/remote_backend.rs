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

//! Backend `"50"`: references to payloads residing on a remote server.
//!
//! Specs of this backend describe data that has not been fetched; they are
//! written by the sync tooling, never by a local column write. Reading one
//! fails until the payload is fetched and re-recorded under a local
//! backend.

use crate::backend::Capabilities;
use crate::backend::OpenMode;
use crate::backend::Spec;
use crate::error::RepoError;
use crate::error::Result;
use crate::tensor::Tensor;

pub const CAPABILITIES: Capabilities = Capabilities {
    islocal: false,
    numeric_payloads: true,
    str_payloads: true,
    variable_shape: true,
    subsamples: true,
    accepts_codec_opts: false,
};

#[derive(Debug, Default)]
pub struct RemoteAccessor {
    mode: Option<OpenMode>,
}

impl RemoteAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.mode = Some(mode);
        Ok(())
    }

    pub fn close(&mut self) {
        self.mode = None;
    }

    pub fn write_data(&mut self, _tensor: &Tensor) -> Result<Spec> {
        Err(RepoError::invalid_arg(
            "the remote backend records references only; local writes must use a local backend",
        ))
    }

    pub fn read_data(&mut self, spec: &Spec) -> Result<Tensor> {
        let Spec::Remote { uid, .. } = spec else {
            return Err(RepoError::corruption(format!(
                "spec {spec:?} routed to the remote backend"
            )));
        };
        Err(RepoError::NotFound(format!(
            "payload `{uid}` resides on a remote server and has not been fetched"
        )))
    }

    pub fn delete_in_process_data(&mut self, _spec: &Spec) -> Result<()> {
        Ok(())
    }
}
