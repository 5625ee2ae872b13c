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

//! Bit-exact encode/decode of every stored record kind.
//!
//! Both the key layouts (`data-hash::<digest>`, `commit-parent::<digest>`,
//! `data::<column>::<key>`, ...) and the value byte layouts defined here are
//! PERMANENT. Records written by any released version must decode forever;
//! a revised layout requires a new record kind, never a change to an
//! existing one. Any parse failure is a corruption event.

use std::fmt;

use crate::backend::BackendCode;
use crate::backend::Codec;
use crate::backend::Spec;
use crate::digest::Digest;
use crate::error::RepoError;
use crate::error::Result;
use crate::schema::Schema;
use crate::schema::check_valid_name;
use crate::tensor::DType;

// ---------------------------------------------------------------------------
// key layouts
// ---------------------------------------------------------------------------

/// hashenv: digest of a tensor payload -> encoded [`Spec`].
pub const DATA_HASH_PREFIX: &str = "data-hash::";
/// hashenv: digest of a schema record -> encoded schema.
pub const SCHEMA_HASH_PREFIX: &str = "schema-hash::";
/// labelenv: digest of a metadata value -> the UTF-8 value.
pub const META_HASH_PREFIX: &str = "meta-hash::";
/// refenv: commit digest -> encoded ancestor pair.
pub const COMMIT_PARENT_PREFIX: &str = "commit-parent::";
/// refenv: commit digest -> encoded user/timestamp/message record.
pub const COMMIT_META_PREFIX: &str = "commit-meta::";
/// refenv: commit digest -> compressed refs snapshot.
pub const COMMIT_REFS_PREFIX: &str = "commit-refs::";
/// branchenv: branch name -> head commit digest.
pub const BRANCH_PREFIX: &str = "branch::";

/// branchenv: name of the branch the staging area is based on.
pub const STAGING_HEAD_KEY: &str = "staging-head";
/// branchenv: the repository-wide writer lock slot.
pub const WRITER_LOCK_KEY: &str = "writer-lock";
/// Sentinel stored in the lock slot while no writer holds it.
pub const WRITER_LOCK_AVAILABLE: &str = "LOCK_AVAILABLE";
/// branchenv: user identity recorded at init, stamped into commits.
pub const USER_NAME_KEY: &str = "user-name";
pub const USER_EMAIL_KEY: &str = "user-email";

/// stage/refs snapshot: column name -> schema digest.
pub const REF_SCHEMA_PREFIX: &str = "schema::";
/// stage/refs snapshot: `(column, key[, subkey])` -> payload digest.
pub const REF_DATA_PREFIX: &str = "data::";
/// stage/refs snapshot: metadata key -> metadata digest.
pub const REF_META_PREFIX: &str = "meta::";

const FIELD_SEP: char = ':';
const META_FIELD_SEP: char = '\x1f';

pub fn data_hash_key(digest: &Digest) -> String {
    format!("{DATA_HASH_PREFIX}{digest}")
}

pub fn schema_hash_key(digest: &Digest) -> String {
    format!("{SCHEMA_HASH_PREFIX}{digest}")
}

pub fn meta_hash_key(digest: &Digest) -> String {
    format!("{META_HASH_PREFIX}{digest}")
}

pub fn commit_parent_key(digest: &Digest) -> String {
    format!("{COMMIT_PARENT_PREFIX}{digest}")
}

pub fn commit_meta_key(digest: &Digest) -> String {
    format!("{COMMIT_META_PREFIX}{digest}")
}

pub fn commit_refs_key(digest: &Digest) -> String {
    format!("{COMMIT_REFS_PREFIX}{digest}")
}

pub fn branch_key(name: &str) -> String {
    format!("{BRANCH_PREFIX}{name}")
}

// ---------------------------------------------------------------------------
// sample keys
// ---------------------------------------------------------------------------

/// Key of a sample (or subsample) within a column, or of a metadata entry.
///
/// String and integer keys may be mixed within one column. They never
/// collide with each other: `Str("5")` and `Int(5)` are distinct keys, and
/// their encoded forms carry distinct `s`/`i` prefixes so the distinction
/// is permanent in the record layout as well.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SampleKey {
    Str(String),
    Int(u64),
}

/// Largest permitted integer sample key.
pub const MAX_INT_KEY: u64 = 999_999;

impl SampleKey {
    /// Validates and wraps a string key.
    pub fn str(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        check_valid_name("sample key", &name)?;
        Ok(Self::Str(name))
    }

    /// Validates and wraps an integer key.
    pub fn int(value: u64) -> Result<Self> {
        if value > MAX_INT_KEY {
            return Err(RepoError::invalid_arg(format!(
                "integer sample key {value} exceeds the maximum of {MAX_INT_KEY}"
            )));
        }
        Ok(Self::Int(value))
    }

    pub(crate) fn encode(&self) -> String {
        match self {
            Self::Str(name) => format!("s{name}"),
            Self::Int(value) => format!("i{value}"),
        }
    }

    pub(crate) fn decode(token: &str) -> Result<Self> {
        match token.split_at_checked(1) {
            Some(("s", name)) => Self::str(name),
            Some(("i", digits)) => {
                let value = digits
                    .parse()
                    .map_err(|_| RepoError::corruption(format!("bad integer key token `{token}`")))?;
                Self::int(value)
            }
            _ => Err(RepoError::corruption(format!(
                "sample key token `{token}` carries no `s`/`i` discriminant"
            ))),
        }
        .map_err(|err| match err {
            // A stored token that fails validation is corrupt, not a bad arg.
            RepoError::InvalidArg(msg) => RepoError::corruption(msg),
            other => other,
        })
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(name) => f.pad(name),
            Self::Int(value) => write!(f, "{value}"),
        }
    }
}

impl TryFrom<u64> for SampleKey {
    type Error = RepoError;

    fn try_from(value: u64) -> Result<Self> {
        Self::int(value)
    }
}

impl TryFrom<&str> for SampleKey {
    type Error = RepoError;

    fn try_from(name: &str) -> Result<Self> {
        Self::str(name)
    }
}

// ---------------------------------------------------------------------------
// refs snapshot keys
// ---------------------------------------------------------------------------

/// A parsed key of the staging area / refs snapshot layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefKey {
    Schema {
        column: String,
    },
    Data {
        column: String,
        key: SampleKey,
        subkey: Option<SampleKey>,
    },
    Meta {
        key: SampleKey,
    },
}

impl RefKey {
    pub fn encode(&self) -> String {
        match self {
            Self::Schema { column } => format!("{REF_SCHEMA_PREFIX}{column}"),
            Self::Data {
                column,
                key,
                subkey: None,
            } => format!("{REF_DATA_PREFIX}{column}::{}", key.encode()),
            Self::Data {
                column,
                key,
                subkey: Some(subkey),
            } => format!(
                "{REF_DATA_PREFIX}{column}::{}::{}",
                key.encode(),
                subkey.encode()
            ),
            Self::Meta { key } => format!("{REF_META_PREFIX}{}", key.encode()),
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        if let Some(column) = raw.strip_prefix(REF_SCHEMA_PREFIX) {
            return Ok(Self::Schema {
                column: column.to_owned(),
            });
        }
        if let Some(rest) = raw.strip_prefix(REF_DATA_PREFIX) {
            let mut parts = rest.split("::");
            let column = parts.next().unwrap_or_default().to_owned();
            let key = SampleKey::decode(
                parts
                    .next()
                    .ok_or_else(|| RepoError::corruption(format!("data ref key `{raw}` lacks a sample key")))?,
            )?;
            let subkey = parts.next().map(SampleKey::decode).transpose()?;
            if parts.next().is_some() {
                return Err(RepoError::corruption(format!(
                    "data ref key `{raw}` carries too many components"
                )));
            }
            return Ok(Self::Data {
                column,
                key,
                subkey,
            });
        }
        if let Some(token) = raw.strip_prefix(REF_META_PREFIX) {
            return Ok(Self::Meta {
                key: SampleKey::decode(token)?,
            });
        }
        Err(RepoError::corruption(format!(
            "unrecognized refs record key `{raw}`"
        )))
    }
}

/// Key prefix selecting every data ref of one column.
pub fn column_data_prefix(column: &str) -> String {
    format!("{REF_DATA_PREFIX}{column}::")
}

/// Key prefix selecting every subsample ref of one sample.
pub fn sample_data_prefix(column: &str, key: &SampleKey) -> String {
    format!("{REF_DATA_PREFIX}{column}::{}::", key.encode())
}

pub fn schema_ref_key(column: &str) -> String {
    RefKey::Schema {
        column: column.to_owned(),
    }
    .encode()
}

pub fn data_ref_key(column: &str, key: &SampleKey, subkey: Option<&SampleKey>) -> String {
    RefKey::Data {
        column: column.to_owned(),
        key: key.clone(),
        subkey: subkey.cloned(),
    }
    .encode()
}

pub fn meta_ref_key(key: &SampleKey) -> String {
    RefKey::Meta { key: key.clone() }.encode()
}

// ---------------------------------------------------------------------------
// commit records
// ---------------------------------------------------------------------------

/// Ancestors of a commit. The initial commit has neither; a merge commit
/// has both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitParents {
    pub master_ancestor: Option<Digest>,
    pub dev_ancestor: Option<Digest>,
}

impl CommitParents {
    pub fn is_initial(&self) -> bool {
        self.master_ancestor.is_none() && self.dev_ancestor.is_none()
    }

    pub fn encode(&self) -> Vec<u8> {
        let master = self.master_ancestor.as_ref().map_or("", Digest::as_str);
        let dev = self.dev_ancestor.as_ref().map_or("", Digest::as_str);
        format!("{master}|{dev}").into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| RepoError::corruption("commit parent record is not valid UTF-8"))?;
        let (master, dev) = text.split_once('|').ok_or_else(|| {
            RepoError::corruption(format!("commit parent record `{text}` lacks a separator"))
        })?;
        let parse_part = |part: &str| -> Result<Option<Digest>> {
            if part.is_empty() {
                Ok(None)
            } else {
                Digest::parse(part).map(Some)
            }
        };
        Ok(Self {
            master_ancestor: parse_part(master)?,
            dev_ancestor: parse_part(dev)?,
        })
    }
}

/// Who created a commit, when, and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitMeta {
    pub user_name: String,
    pub user_email: String,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp_ms: i64,
    pub message: String,
}

impl CommitMeta {
    pub fn encode(&self) -> Vec<u8> {
        // The message is last so it may contain the separator character.
        format!(
            "{}{META_FIELD_SEP}{}{META_FIELD_SEP}{}{META_FIELD_SEP}{}",
            self.user_name, self.user_email, self.timestamp_ms, self.message
        )
        .into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| RepoError::corruption("commit meta record is not valid UTF-8"))?;
        let mut parts = text.splitn(4, META_FIELD_SEP);
        let (Some(user_name), Some(user_email), Some(millis), Some(message)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RepoError::corruption(format!(
                "commit meta record `{text}` carries fewer than four fields"
            )));
        };
        let timestamp_ms = millis.parse().map_err(|_| {
            RepoError::corruption(format!("commit meta record carries bad timestamp `{millis}`"))
        })?;
        Ok(Self {
            user_name: user_name.to_owned(),
            user_email: user_email.to_owned(),
            timestamp_ms,
            message: message.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// refs snapshot
// ---------------------------------------------------------------------------

/// Serializes an ordered refs snapshot (pairs must be sorted bytewise by
/// key) into its canonical uncompressed byte form.
pub fn encode_refs_snapshot(pairs: &[(String, String)]) -> Vec<u8> {
    debug_assert!(pairs.is_sorted_by(|(a, _), (b, _)| a < b));
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(META_FIELD_SEP as u8);
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out
}

pub fn decode_refs_snapshot(raw: &[u8]) -> Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| RepoError::corruption("refs snapshot is not valid UTF-8"))?;
    let mut pairs = Vec::new();
    for line in text.lines() {
        let (key, value) = line.split_once(META_FIELD_SEP).ok_or_else(|| {
            RepoError::corruption(format!("refs snapshot line `{line}` lacks a separator"))
        })?;
        pairs.push((key.to_owned(), value.to_owned()));
    }
    Ok(pairs)
}

/// Storage compression level of refs snapshots. Identity hashes the
/// uncompressed form, so this can be tuned without a format break.
const REFS_SNAPSHOT_ZSTD_LEVEL: i32 = 3;

pub fn compress_refs_snapshot(raw: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::stream::encode_all(raw, REFS_SNAPSHOT_ZSTD_LEVEL)?)
}

pub fn decompress_refs_snapshot(stored: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(stored)
        .map_err(|err| RepoError::corruption(format!("refs snapshot failed to decompress: {err}")))
}

// ---------------------------------------------------------------------------
// schema records
// ---------------------------------------------------------------------------

fn encode_shape(shape: &[usize]) -> String {
    shape
        .iter()
        .map(|dim| dim.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

fn decode_shape(token: &str) -> Result<Vec<usize>> {
    if token.is_empty() {
        return Ok(vec![]);
    }
    token
        .split('x')
        .map(|dim| {
            dim.parse()
                .map_err(|_| RepoError::corruption(format!("bad shape token `{token}`")))
        })
        .collect()
}

pub fn encode_schema(schema: &Schema) -> Vec<u8> {
    format!(
        "{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}",
        schema.dtype.code(),
        encode_shape(&schema.shape),
        if schema.variable_shape { 'v' } else { 'f' },
        if schema.contains_subsamples { 'n' } else { 'p' },
        schema.backend,
        schema.backend_opts,
    )
    .into_bytes()
}

pub fn decode_schema(raw: &[u8]) -> Result<Schema> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| RepoError::corruption("schema record is not valid UTF-8"))?;
    let fields: Vec<&str> = text.split(FIELD_SEP).collect();
    let [dtype, shape, variability, nesting, backend, opts] = fields[..] else {
        return Err(RepoError::corruption(format!(
            "schema record `{text}` does not carry six fields"
        )));
    };
    let dtype = DType::from_code(
        dtype
            .parse()
            .map_err(|_| RepoError::corruption(format!("bad dtype field `{dtype}`")))?,
    )?;
    let variable_shape = match variability {
        "v" => true,
        "f" => false,
        other => {
            return Err(RepoError::corruption(format!(
                "bad shape variability flag `{other}`"
            )));
        }
    };
    let contains_subsamples = match nesting {
        "n" => true,
        "p" => false,
        other => return Err(RepoError::corruption(format!("bad nesting flag `{other}`"))),
    };
    Ok(Schema {
        dtype,
        shape: decode_shape(shape)?,
        variable_shape,
        contains_subsamples,
        backend: BackendCode::parse(backend)
            .map_err(|err| RepoError::corruption(err.to_string()))?,
        backend_opts: opts.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// backend specs
// ---------------------------------------------------------------------------

/// Serializes a backend spec. Field layout per backend code is permanent.
pub fn encode_spec(spec: &Spec) -> Vec<u8> {
    let body = match spec {
        Spec::Flat { uid, dtype, shape } => {
            format!("{uid}:{}:{}", dtype.code(), encode_shape(shape))
        }
        Spec::Pack {
            version: _,
            uid,
            offset,
            stored_len,
            raw_len,
            codec,
            dtype,
            shape,
        } => format!(
            "{uid}:{offset}:{stored_len}:{raw_len}:{}:{}:{}",
            codec.token(),
            dtype.code(),
            encode_shape(shape)
        ),
        Spec::Kv {
            uid,
            row,
            dtype,
            shape,
        } => format!("{uid}:{row}:{}:{}", dtype.code(), encode_shape(shape)),
        Spec::Remote { uid, dtype, shape } => {
            format!("{uid}:{}:{}", dtype.code(), encode_shape(shape))
        }
    };
    format!("{}:{body}", spec.backend_code()).into_bytes()
}

pub fn decode_spec(raw: &[u8]) -> Result<Spec> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| RepoError::corruption("backend spec record is not valid UTF-8"))?;
    let corrupt = || RepoError::corruption(format!("unparseable backend spec record `{text}`"));
    let (code, body) = text.split_once(FIELD_SEP).ok_or_else(corrupt)?;
    let fields: Vec<&str> = body.split(FIELD_SEP).collect();
    let parse_dtype = |field: &str| -> Result<DType> {
        DType::from_code(field.parse().map_err(|_| corrupt())?)
    };
    let parse_u64 = |field: &str| -> Result<u64> { field.parse().map_err(|_| corrupt()) };
    match code {
        "10" => {
            let [uid, dtype, shape] = fields[..] else {
                return Err(corrupt());
            };
            Ok(Spec::Flat {
                uid: uid.to_owned(),
                dtype: parse_dtype(dtype)?,
                shape: decode_shape(shape)?,
            })
        }
        "00" | "01" => {
            let [uid, offset, stored_len, raw_len, codec, dtype, shape] = fields[..] else {
                return Err(corrupt());
            };
            Ok(Spec::Pack {
                version: if code == "00" { 0 } else { 1 },
                uid: uid.to_owned(),
                offset: parse_u64(offset)?,
                stored_len: parse_u64(stored_len)?,
                raw_len: parse_u64(raw_len)?,
                codec: Codec::parse_token(codec)?,
                dtype: parse_dtype(dtype)?,
                shape: decode_shape(shape)?,
            })
        }
        "30" => {
            let [uid, row, dtype, shape] = fields[..] else {
                return Err(corrupt());
            };
            Ok(Spec::Kv {
                uid: uid.to_owned(),
                row: parse_u64(row)?,
                dtype: parse_dtype(dtype)?,
                shape: decode_shape(shape)?,
            })
        }
        "50" => {
            let [uid, dtype, shape] = fields[..] else {
                return Err(corrupt());
            };
            Ok(Spec::Remote {
                uid: uid.to_owned(),
                dtype: parse_dtype(dtype)?,
                shape: decode_shape(shape)?,
            })
        }
        _ => Err(RepoError::corruption(format!(
            "backend spec record names unknown backend code `{code}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;
    use crate::digest::DIGEST_RAW_LEN;
    use crate::error::RepoError;

    fn digest(tcode: char, fill: u8) -> Digest {
        Digest::from_parts(tcode, &[fill; DIGEST_RAW_LEN])
    }

    #[test]
    fn test_sample_key_distinct_by_native_type() {
        let as_str = SampleKey::str("5").unwrap();
        let as_int = SampleKey::int(5).unwrap();
        assert_ne!(as_str, as_int);
        assert_ne!(as_str.encode(), as_int.encode());
    }

    #[test]
    fn test_sample_key_round_trip() {
        for key in [
            SampleKey::str("train_set.v2-a").unwrap(),
            SampleKey::int(0).unwrap(),
            SampleKey::int(MAX_INT_KEY).unwrap(),
        ] {
            assert_eq!(SampleKey::decode(&key.encode()).unwrap(), key);
        }
    }

    #[test]
    fn test_sample_key_bounds() {
        assert_matches!(SampleKey::int(1_000_000), Err(RepoError::InvalidArg(_)));
        assert_matches!(SampleKey::str(""), Err(RepoError::InvalidArg(_)));
        assert_matches!(
            SampleKey::str("seventeen_chars__"),
            Err(RepoError::InvalidArg(_))
        );
        assert_matches!(SampleKey::decode("x9"), Err(RepoError::Corruption(_)));
    }

    #[test]
    fn test_ref_key_round_trip() {
        let keys = [
            RefKey::Schema {
                column: "images".to_owned(),
            },
            RefKey::Data {
                column: "images".to_owned(),
                key: SampleKey::int(12).unwrap(),
                subkey: None,
            },
            RefKey::Data {
                column: "scans".to_owned(),
                key: SampleKey::str("patient0").unwrap(),
                subkey: Some(SampleKey::int(3).unwrap()),
            },
            RefKey::Meta {
                key: SampleKey::str("run-id").unwrap(),
            },
        ];
        for key in keys {
            assert_eq!(RefKey::decode(&key.encode()).unwrap(), key);
        }
    }

    #[test]
    fn test_ref_key_rejects_extra_components() {
        assert_matches!(
            RefKey::decode("data::c::s1::s2::s3"),
            Err(RepoError::Corruption(_))
        );
        assert_matches!(RefKey::decode("bogus::x"), Err(RepoError::Corruption(_)));
    }

    #[test]
    fn test_commit_parents_round_trip() {
        let initial = CommitParents::default();
        assert!(initial.is_initial());
        assert_eq!(
            CommitParents::decode(&initial.encode()).unwrap(),
            initial
        );

        let regular = CommitParents {
            master_ancestor: Some(digest('3', 1)),
            dev_ancestor: None,
        };
        let merge = CommitParents {
            master_ancestor: Some(digest('3', 1)),
            dev_ancestor: Some(digest('3', 2)),
        };
        for parents in [regular, merge] {
            assert!(!parents.is_initial());
            assert_eq!(CommitParents::decode(&parents.encode()).unwrap(), parents);
        }
    }

    #[test]
    fn test_commit_meta_round_trip_with_awkward_message() {
        let meta = CommitMeta {
            user_name: "tester".to_owned(),
            user_email: "foo@test.bar".to_owned(),
            timestamp_ms: 1_700_000_000_123,
            message: "multi\nline \x1f message".to_owned(),
        };
        assert_eq!(CommitMeta::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn test_refs_snapshot_round_trip() {
        let pairs = vec![
            ("data::a::i0".to_owned(), digest('0', 9).to_string()),
            ("meta::srun".to_owned(), digest('2', 7).to_string()),
            ("schema::a".to_owned(), digest('1', 8).to_string()),
        ];
        let raw = encode_refs_snapshot(&pairs);
        assert_eq!(decode_refs_snapshot(&raw).unwrap(), pairs);
        let stored = compress_refs_snapshot(&raw).unwrap();
        assert_eq!(decompress_refs_snapshot(&stored).unwrap(), raw);
    }

    #[test]
    fn test_schema_record_round_trip() {
        let schema = Schema {
            dtype: DType::F32,
            shape: vec![5, 5, 5],
            variable_shape: true,
            contains_subsamples: true,
            backend: BackendCode::PACK_V0,
            backend_opts: "zstd3".to_owned(),
        };
        assert_eq!(decode_schema(&encode_schema(&schema)).unwrap(), schema);

        let str_schema = Schema {
            dtype: DType::Str,
            shape: vec![],
            variable_shape: true,
            contains_subsamples: false,
            backend: BackendCode::KV_V3,
            backend_opts: String::new(),
        };
        assert_eq!(
            decode_schema(&encode_schema(&str_schema)).unwrap(),
            str_schema
        );
    }

    #[test_case(Spec::Flat {
        uid: "0a1b2c3d4e5f6071".to_owned(),
        dtype: DType::F64,
        shape: vec![5, 7],
    }; "flat")]
    #[test_case(Spec::Pack {
        version: 0,
        uid: "ffeeddccbbaa9988".to_owned(),
        offset: 8,
        stored_len: 1021,
        raw_len: 4096,
        codec: Codec::Zstd(3),
        dtype: DType::F32,
        shape: vec![1000],
    }; "pack v0")]
    #[test_case(Spec::Pack {
        version: 1,
        uid: "0011223344556677".to_owned(),
        offset: 0,
        stored_len: 140,
        raw_len: 140,
        codec: Codec::Raw,
        dtype: DType::U8,
        shape: vec![5, 7, 4],
    }; "pack v1 raw")]
    #[test_case(Spec::Kv {
        uid: "9988776655443322".to_owned(),
        row: 42,
        dtype: DType::Str,
        shape: vec![11],
    }; "kv")]
    #[test_case(Spec::Remote {
        uid: "7766554433221100".to_owned(),
        dtype: DType::I64,
        shape: vec![128, 128],
    }; "remote")]
    fn test_spec_round_trip(spec: Spec) {
        let raw = encode_spec(&spec);
        assert_eq!(decode_spec(&raw).unwrap(), spec);
    }

    #[test]
    fn test_spec_decode_rejects_unknown_code() {
        assert_matches!(decode_spec(b"20:whatever:0:"), Err(RepoError::Corruption(_)));
        assert_matches!(decode_spec(b"garbage"), Err(RepoError::Corruption(_)));
    }
}
