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

//! Shared model of the pluggable payload backends.
//!
//! A backend is identified by a permanent two-character code
//! `[type][version]`. A stored payload is described by a [`Spec`]: the
//! backend-private locator serialized into the hash database next to the
//! payload digest. Record formats per backend code never change; a revised
//! format is issued under a new code.

use std::fmt;
use std::path::PathBuf;

use rand::RngCore as _;

use crate::config::RepoConfig;
use crate::error::RepoError;
use crate::error::Result;
use crate::tensor::DType;

/// Two-character backend identifier `[type][version]`.
///
/// Lowercase letters and digits `0-4` in the first position name local
/// backends; uppercase letters and digits `5-9` name remote ones.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendCode([u8; 2]);

impl BackendCode {
    pub const PACK_V0: Self = Self(*b"00");
    pub const PACK_V1: Self = Self(*b"01");
    pub const FLAT_V1: Self = Self(*b"10");
    pub const KV_V3: Self = Self(*b"30");
    pub const REMOTE_V5: Self = Self(*b"50");

    /// Parses a two-character code. The code need not be assigned yet; use
    /// [`crate::registry::known_code`] to restrict to assigned codes.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() == 2 && bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self([bytes[0], bytes[1]]))
        } else {
            Err(RepoError::invalid_arg(format!(
                "backend specifier `{s}` is not a two character alphanumeric code"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap()
    }

    /// Whether payloads of this backend live on the local disk, derived from
    /// the reserved code ranges.
    pub fn is_local(&self) -> bool {
        let type_char = self.0[0];
        type_char.is_ascii_lowercase() || (b'0'..=b'4').contains(&type_char)
    }
}

impl fmt::Debug for BackendCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackendCode").field(&self.as_str()).finish()
    }
}

impl fmt::Display for BackendCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Compression codec applied to a stored pack entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    /// Stored bytes are the payload bytes.
    Raw,
    /// zstd frame at the carried compression level.
    Zstd(i32),
}

impl Codec {
    pub(crate) fn token(self) -> String {
        match self {
            Self::Raw => "raw".to_owned(),
            Self::Zstd(level) => format!("zstd{level}"),
        }
    }

    pub(crate) fn parse_token(token: &str) -> Result<Self> {
        if token == "raw" {
            Ok(Self::Raw)
        } else if let Some(level) = token.strip_prefix("zstd") {
            let level: i32 = level
                .parse()
                .map_err(|_| RepoError::corruption(format!("bad codec token `{token}`")))?;
            Ok(Self::Zstd(level))
        } else {
            Err(RepoError::corruption(format!("bad codec token `{token}`")))
        }
    }
}

/// What a backend can hold. Consulted when user-supplied options are parsed
/// so that a column is never bound to a backend that cannot store it.
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
    pub islocal: bool,
    /// Numeric dtypes accepted.
    pub numeric_payloads: bool,
    /// [`DType::Str`] payloads accepted.
    pub str_payloads: bool,
    pub variable_shape: bool,
    pub subsamples: bool,
    /// Whether codec options (`raw` / `zstd<level>`) may be supplied.
    pub accepts_codec_opts: bool,
}

impl Capabilities {
    pub fn supports_dtype(&self, dtype: DType) -> bool {
        match dtype {
            DType::Str => self.str_payloads,
            _ => self.numeric_payloads,
        }
    }
}

/// Backend-private locator for one stored payload.
///
/// The encoded byte layout of every variant (see `records::encode_spec`) is
/// permanent: data written today must remain readable by every future
/// version carrying the same backend code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Spec {
    /// `"10"`: one raw little-endian file per payload.
    Flat {
        uid: String,
        dtype: DType,
        shape: Vec<usize>,
    },
    /// `"00"` / `"01"`: an entry inside an append-only pack file.
    Pack {
        version: u8,
        uid: String,
        offset: u64,
        stored_len: u64,
        raw_len: u64,
        codec: Codec,
        dtype: DType,
        shape: Vec<usize>,
    },
    /// `"30"`: a row in a directory-backed embedded key-value store.
    Kv {
        uid: String,
        row: u64,
        dtype: DType,
        shape: Vec<usize>,
    },
    /// `"50"`: reference to a payload that lives on a remote server.
    Remote {
        uid: String,
        dtype: DType,
        shape: Vec<usize>,
    },
}

impl Spec {
    pub fn backend_code(&self) -> BackendCode {
        match self {
            Self::Flat { .. } => BackendCode::FLAT_V1,
            Self::Pack { version: 0, .. } => BackendCode::PACK_V0,
            Self::Pack { .. } => BackendCode::PACK_V1,
            Self::Kv { .. } => BackendCode::KV_V3,
            Self::Remote { .. } => BackendCode::REMOTE_V5,
        }
    }

    pub fn is_local(&self) -> bool {
        self.backend_code().is_local()
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Flat { dtype, .. }
            | Self::Pack { dtype, .. }
            | Self::Kv { dtype, .. }
            | Self::Remote { dtype, .. } => *dtype,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Flat { shape, .. }
            | Self::Pack { shape, .. }
            | Self::Kv { shape, .. }
            | Self::Remote { shape, .. } => shape,
        }
    }

    /// The payload file (or store directory) this spec points into, if it
    /// names one on the local disk.
    pub(crate) fn file_name(&self) -> Option<String> {
        match self {
            Self::Flat { uid, .. } => Some(format!("{uid}.flat")),
            Self::Pack { uid, .. } => Some(format!("{uid}.pack")),
            Self::Kv { uid, .. } => Some(format!("{uid}.kvdat")),
            Self::Remote { .. } => None,
        }
    }
}

/// Mode a backend accessor is opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Append,
}

/// Filesystem locations an accessor resolves payloads against.
#[derive(Clone, Debug)]
pub struct BackendPaths {
    pub stage_dir: PathBuf,
    pub store_dir: PathBuf,
}

impl BackendPaths {
    pub fn new(repo_path: &std::path::Path, config: &RepoConfig) -> Self {
        Self {
            stage_dir: config.stage_data_path(repo_path),
            store_dir: config.store_data_path(repo_path),
        }
    }

    /// Resolves a payload entry by uid, preferring committed data.
    pub(crate) fn find(&self, file_name: &str) -> Result<PathBuf> {
        let stored = self.store_dir.join(file_name);
        if stored.exists() {
            return Ok(stored);
        }
        let staged = self.stage_dir.join(file_name);
        if staged.exists() {
            return Ok(staged);
        }
        Err(RepoError::NotFound(format!(
            "payload entry `{file_name}` is in neither the store nor the stage data directory"
        )))
    }
}

/// Mints a unique stem for a new payload file.
pub(crate) fn mint_uid() -> String {
    let mut raw = [0_u8; 8];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;
    use crate::error::RepoError;

    #[test_case("00", true; "digit zero is local")]
    #[test_case("41", true; "digit four is local")]
    #[test_case("a0", true; "lowercase is local")]
    #[test_case("50", false; "digit five is remote")]
    #[test_case("99", false; "digit nine is remote")]
    #[test_case("A7", false; "uppercase is remote")]
    fn test_code_locality_ranges(code: &str, islocal: bool) {
        assert_eq!(BackendCode::parse(code).unwrap().is_local(), islocal);
    }

    #[test]
    fn test_code_parse_rejects_malformed() {
        assert_matches!(BackendCode::parse("0"), Err(RepoError::InvalidArg(_)));
        assert_matches!(BackendCode::parse("000"), Err(RepoError::InvalidArg(_)));
        assert_matches!(BackendCode::parse("0:"), Err(RepoError::InvalidArg(_)));
    }

    #[test]
    fn test_codec_tokens() {
        assert_eq!(Codec::parse_token("raw").unwrap(), Codec::Raw);
        assert_eq!(Codec::parse_token("zstd3").unwrap(), Codec::Zstd(3));
        assert_eq!(Codec::Zstd(19).token(), "zstd19");
        assert_matches!(Codec::parse_token("lzf"), Err(RepoError::Corruption(_)));
    }

    #[test]
    fn test_spec_code_assignment() {
        let spec = Spec::Pack {
            version: 1,
            uid: "ab".into(),
            offset: 0,
            stored_len: 1,
            raw_len: 1,
            codec: Codec::Raw,
            dtype: DType::F32,
            shape: vec![1],
        };
        assert_eq!(spec.backend_code(), BackendCode::PACK_V1);
        assert!(spec.is_local());
    }
}
