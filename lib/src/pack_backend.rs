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

//! Backends `"00"` and `"01"`: append-only packs of compressed payloads.
//!
//! A pack file collects many payloads written during one staging session;
//! each entry is an independently decodable frame located by
//! `(offset, stored_len)` in the spec. `"01"` is the variant tuned for
//! fixed-shape columns and differs only in its default compression level;
//! both share the entry layout, which is permanent.
//!
//! Compression falls back to the store (`raw`) codec for buffers below the
//! 16 byte compression minimum.

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;

use crate::backend::BackendCode;
use crate::backend::BackendPaths;
use crate::backend::Capabilities;
use crate::backend::Codec;
use crate::backend::OpenMode;
use crate::backend::Spec;
use crate::backend::mint_uid;
use crate::error::RepoError;
use crate::error::Result;
use crate::tensor::Tensor;

const FILE_SUFFIX: &str = ".pack";
const MAGIC_LEN: u64 = 8;

/// Smallest buffer worth handing to the compressor.
pub const COMPRESSION_MIN_BYTES: usize = 16;

pub const CAPABILITIES: Capabilities = Capabilities {
    islocal: true,
    numeric_payloads: true,
    str_payloads: false,
    variable_shape: true,
    subsamples: true,
    accepts_codec_opts: true,
};

fn magic(version: u8) -> [u8; MAGIC_LEN as usize] {
    match version {
        0 => *b"TENSPAK0",
        _ => *b"TENSPAK1",
    }
}

#[derive(Debug)]
struct PackWriter {
    uid: String,
    file: File,
    offset: u64,
}

#[derive(Debug)]
pub struct PackAccessor {
    version: u8,
    paths: BackendPaths,
    mode: Option<OpenMode>,
    /// Codec applied to new writes; carried per entry in the spec so it can
    /// change between sessions without a format break.
    codec: Codec,
    writer: Option<PackWriter>,
    readers: HashMap<String, File>,
}

impl PackAccessor {
    pub fn new(version: u8, paths: BackendPaths) -> Self {
        let default_level = if version == 0 { 3 } else { 5 };
        Self {
            version,
            paths,
            mode: None,
            codec: Codec::Zstd(default_level),
            writer: None,
            readers: HashMap::new(),
        }
    }

    pub fn code(&self) -> BackendCode {
        if self.version == 0 {
            BackendCode::PACK_V0
        } else {
            BackendCode::PACK_V1
        }
    }

    /// Applies the column's canonical codec option token.
    pub fn set_codec(&mut self, codec: Codec) {
        self.codec = codec;
    }

    pub fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.mode = Some(mode);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            // Payload bytes were flushed per write; sync is best effort here.
            if let Err(err) = writer.file.sync_data() {
                tracing::warn!(uid = %writer.uid, "failed to sync pack file: {err}");
            }
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
                self.code()
            ))),
        }
    }

    fn writer(&mut self) -> Result<&mut PackWriter> {
        if self.writer.is_none() {
            let uid = mint_uid();
            let mut file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(self.paths.stage_dir.join(format!("{uid}{FILE_SUFFIX}")))?;
            file.write_all(&magic(self.version))?;
            self.writer = Some(PackWriter {
                uid,
                file,
                offset: MAGIC_LEN,
            });
        }
        Ok(self.writer.as_mut().unwrap())
    }

    pub fn write_data(&mut self, tensor: &Tensor) -> Result<Spec> {
        self.require_open(OpenMode::Append)?;
        let codec = match self.codec {
            Codec::Zstd(_) if tensor.nbytes() < COMPRESSION_MIN_BYTES => Codec::Raw,
            codec => codec,
        };
        let stored = match codec {
            Codec::Raw => tensor.as_le_bytes().to_vec(),
            Codec::Zstd(level) => zstd::stream::encode_all(tensor.as_le_bytes(), level)?,
        };
        let version = self.version;
        let writer = self.writer()?;
        writer.file.write_all(&stored)?;
        writer.file.flush()?;
        let offset = writer.offset;
        writer.offset += stored.len() as u64;
        Ok(Spec::Pack {
            version,
            uid: writer.uid.clone(),
            offset,
            stored_len: stored.len() as u64,
            raw_len: tensor.nbytes() as u64,
            codec,
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
        })
    }

    fn reader(&mut self, uid: &str) -> Result<&mut File> {
        if !self.readers.contains_key(uid) {
            let path = self.paths.find(&format!("{uid}{FILE_SUFFIX}"))?;
            let mut file = File::open(&path)?;
            let mut found = [0_u8; MAGIC_LEN as usize];
            file.read_exact(&mut found).map_err(|_| {
                RepoError::corruption(format!("pack file `{}` is truncated", path.display()))
            })?;
            if found != magic(self.version) {
                return Err(RepoError::corruption(format!(
                    "pack file `{}` carries a foreign magic header",
                    path.display()
                )));
            }
            self.readers.insert(uid.to_owned(), file);
        }
        Ok(self.readers.get_mut(uid).unwrap())
    }

    pub fn read_data(&mut self, spec: &Spec) -> Result<Tensor> {
        self.require_open(OpenMode::Read)?;
        let Spec::Pack {
            uid,
            offset,
            stored_len,
            raw_len,
            codec,
            dtype,
            shape,
            ..
        } = spec
        else {
            return Err(RepoError::corruption(format!(
                "spec {spec:?} routed to the pack backend"
            )));
        };
        let uid = uid.clone();
        let file = self.reader(&uid)?;
        file.seek(SeekFrom::Start(*offset))?;
        let mut stored = vec![0; *stored_len as usize];
        file.read_exact(&mut stored).map_err(|_| {
            RepoError::corruption(format!(
                "pack entry `{uid}` at offset {offset} is truncated"
            ))
        })?;
        let data = match codec {
            Codec::Raw => stored,
            Codec::Zstd(_) => zstd::stream::decode_all(&stored[..]).map_err(|err| {
                RepoError::corruption(format!(
                    "pack entry `{uid}` at offset {offset} failed to decompress: {err}"
                ))
            })?,
        };
        if data.len() as u64 != *raw_len {
            return Err(RepoError::corruption(format!(
                "pack entry `{uid}` at offset {offset} decoded to {} bytes, expected {raw_len}",
                data.len()
            )));
        }
        Tensor::from_le_bytes(*dtype, shape.clone(), data).map_err(|_| {
            RepoError::corruption(format!(
                "pack entry `{uid}` does not match spec shape {shape:?} of dtype {dtype}"
            ))
        })
    }

    /// Pack entries are never punched out individually; staged pack files
    /// are collected wholesale when the staging area is reset.
    pub fn delete_in_process_data(&mut self, spec: &Spec) -> Result<()> {
        let Spec::Pack { .. } = spec else {
            return Err(RepoError::corruption(format!(
                "spec {spec:?} routed to the pack backend"
            )));
        };
        Ok(())
    }
}
