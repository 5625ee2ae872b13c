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

//! Routing from backend codes to accessor implementations.
//!
//! Codes assigned to date, all permanent: `00`/`01` pack v0/v1, `10` flat,
//! `30` embedded-kv, `50` remote. `20` and `60` are reserved and unused.
//! Ranges: `[00..49]` + `[aa..zz]` local, `[50..99]` + `[AA..ZZ]` remote.

use crate::backend::BackendCode;
use crate::backend::BackendPaths;
use crate::backend::Capabilities;
use crate::backend::Codec;
use crate::backend::OpenMode;
use crate::backend::Spec;
use crate::error::RepoError;
use crate::error::Result;
use crate::flat_backend;
use crate::flat_backend::FlatAccessor;
use crate::kv_backend;
use crate::kv_backend::KvAccessor;
use crate::pack_backend;
use crate::pack_backend::COMPRESSION_MIN_BYTES;
use crate::pack_backend::PackAccessor;
use crate::remote_backend;
use crate::remote_backend::RemoteAccessor;
use crate::tensor::DType;
use crate::tensor::Tensor;

/// Every backend code with an implementation behind it.
pub const KNOWN_CODES: [BackendCode; 5] = [
    BackendCode::PACK_V0,
    BackendCode::PACK_V1,
    BackendCode::FLAT_V1,
    BackendCode::KV_V3,
    BackendCode::REMOTE_V5,
];

pub fn known_code(code: BackendCode) -> bool {
    KNOWN_CODES.contains(&code)
}

pub fn capabilities(code: BackendCode) -> Result<Capabilities> {
    match code {
        BackendCode::PACK_V0 | BackendCode::PACK_V1 => Ok(pack_backend::CAPABILITIES),
        BackendCode::FLAT_V1 => Ok(flat_backend::CAPABILITIES),
        BackendCode::KV_V3 => Ok(kv_backend::CAPABILITIES),
        BackendCode::REMOTE_V5 => Ok(remote_backend::CAPABILITIES),
        _ => Err(RepoError::invalid_arg(format!(
            "backend specifier `{code}` not known"
        ))),
    }
}

/// A backend accessor, dispatched by code.
///
/// Expressed as a closed sum so the registry is a compile-time table; the
/// code ranges guarantee no third party can extend it out from under the
/// stored record formats.
#[derive(Debug)]
pub enum Accessor {
    Flat(FlatAccessor),
    Pack(PackAccessor),
    Kv(KvAccessor),
    Remote(RemoteAccessor),
}

impl Accessor {
    pub fn for_code(code: BackendCode, paths: BackendPaths) -> Result<Self> {
        match code {
            BackendCode::PACK_V0 => Ok(Self::Pack(PackAccessor::new(0, paths))),
            BackendCode::PACK_V1 => Ok(Self::Pack(PackAccessor::new(1, paths))),
            BackendCode::FLAT_V1 => Ok(Self::Flat(FlatAccessor::new(paths))),
            BackendCode::KV_V3 => Ok(Self::Kv(KvAccessor::new(paths))),
            BackendCode::REMOTE_V5 => Ok(Self::Remote(RemoteAccessor::new())),
            _ => Err(RepoError::invalid_arg(format!(
                "backend specifier `{code}` not known"
            ))),
        }
    }

    pub fn open(&mut self, mode: OpenMode) -> Result<()> {
        match self {
            Self::Flat(accessor) => accessor.open(mode),
            Self::Pack(accessor) => accessor.open(mode),
            Self::Kv(accessor) => accessor.open(mode),
            Self::Remote(accessor) => accessor.open(mode),
        }
    }

    pub fn close(&mut self) {
        match self {
            Self::Flat(accessor) => accessor.close(),
            Self::Pack(accessor) => accessor.close(),
            Self::Kv(accessor) => accessor.close(),
            Self::Remote(accessor) => accessor.close(),
        }
    }

    pub fn write_data(&mut self, tensor: &Tensor) -> Result<Spec> {
        match self {
            Self::Flat(accessor) => accessor.write_data(tensor),
            Self::Pack(accessor) => accessor.write_data(tensor),
            Self::Kv(accessor) => accessor.write_data(tensor),
            Self::Remote(accessor) => accessor.write_data(tensor),
        }
    }

    pub fn read_data(&mut self, spec: &Spec) -> Result<Tensor> {
        match self {
            Self::Flat(accessor) => accessor.read_data(spec),
            Self::Pack(accessor) => accessor.read_data(spec),
            Self::Kv(accessor) => accessor.read_data(spec),
            Self::Remote(accessor) => accessor.read_data(spec),
        }
    }

    pub fn delete_in_process_data(&mut self, spec: &Spec) -> Result<()> {
        match self {
            Self::Flat(accessor) => accessor.delete_in_process_data(spec),
            Self::Pack(accessor) => accessor.delete_in_process_data(spec),
            Self::Kv(accessor) => accessor.delete_in_process_data(spec),
            Self::Remote(accessor) => accessor.delete_in_process_data(spec),
        }
    }

    /// Applies a column's canonical option token. Only the pack backends
    /// carry tunable options.
    pub fn apply_opts(&mut self, opts: &str) -> Result<()> {
        if opts.is_empty() {
            return Ok(());
        }
        match self {
            Self::Pack(accessor) => {
                accessor.set_codec(Codec::parse_token(opts)?);
                Ok(())
            }
            _ => Err(RepoError::corruption(format!(
                "backend options `{opts}` recorded for a backend that takes none"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// selection heuristics
// ---------------------------------------------------------------------------

/// Picks a backend for a column given a prototype of its samples.
///
/// Deterministic and free of hidden state; see the property tests.
pub fn backend_from_heuristics(prototype: &Tensor, variable_shape: bool) -> BackendCode {
    if prototype.dtype() == DType::Str {
        return BackendCode::KV_V3;
    }
    // Uncompressed per-payload files suit data whose shape is likely small
    // tabular row data (CSV and such).
    if prototype.ndim() == 1 && prototype.size() < 400 {
        BackendCode::FLAT_V1
    } else if prototype.ndim() == 1 && prototype.size() <= 10_000_000 {
        BackendCode::PACK_V0
    } else if !variable_shape {
        // Fixed shapes take the tuned pack variant.
        BackendCode::PACK_V1
    } else {
        BackendCode::PACK_V0
    }
}

/// Default option token for a backend and prototype.
///
/// Only the prototype's byte size participates (the compressor needs a
/// minimum buffer); the rest of the prototype deliberately does not
/// influence tuning.
pub fn backend_opts_from_heuristics(code: BackendCode, prototype: &Tensor) -> String {
    match code {
        BackendCode::PACK_V0 | BackendCode::PACK_V1 => {
            let level = if code == BackendCode::PACK_V0 { 3 } else { 5 };
            if prototype.nbytes() < COMPRESSION_MIN_BYTES {
                Codec::Raw.token()
            } else {
                Codec::Zstd(level).token()
            }
        }
        _ => String::new(),
    }
}

/// A user's backend selection for a new column.
#[derive(Clone, Debug)]
pub enum BackendArg {
    /// A bare format code; options are inferred.
    Code(String),
    /// A format code plus an explicit option token.
    CodeWithOpts { backend: String, opts: String },
}

/// Resolved backend selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendOpts {
    pub backend: BackendCode,
    pub opts: String,
}

fn resolve_known_code(raw: &str) -> Result<BackendCode> {
    let code = BackendCode::parse(raw)?;
    if !known_code(code) {
        return Err(RepoError::invalid_arg(format!(
            "backend specifier `{raw}` not known"
        )));
    }
    Ok(code)
}

fn check_capabilities(code: BackendCode, prototype: &Tensor, variable_shape: bool) -> Result<()> {
    let caps = capabilities(code)?;
    if !caps.supports_dtype(prototype.dtype()) {
        return Err(RepoError::invalid_arg(format!(
            "backend `{code}` does not store {} payloads",
            prototype.dtype()
        )));
    }
    if variable_shape && !caps.variable_shape {
        return Err(RepoError::invalid_arg(format!(
            "backend `{code}` does not store variable shape columns"
        )));
    }
    Ok(())
}

/// Decides the backend and options to apply from a user's selection (or its
/// absence).
pub fn parse_user_backend_opts(
    arg: Option<&BackendArg>,
    prototype: &Tensor,
    variable_shape: bool,
) -> Result<BackendOpts> {
    match arg {
        Some(BackendArg::Code(raw)) => {
            let backend = resolve_known_code(raw)?;
            check_capabilities(backend, prototype, variable_shape)?;
            Ok(BackendOpts {
                backend,
                opts: backend_opts_from_heuristics(backend, prototype),
            })
        }
        Some(BackendArg::CodeWithOpts { backend, opts }) => {
            let backend = resolve_known_code(backend)?;
            check_capabilities(backend, prototype, variable_shape)?;
            let caps = capabilities(backend)?;
            if !opts.is_empty() && !caps.accepts_codec_opts {
                return Err(RepoError::invalid_arg(format!(
                    "backend `{backend}` takes no options, got `{opts}`"
                )));
            }
            if !opts.is_empty() {
                let codec = Codec::parse_token(opts)
                    .map_err(|_| RepoError::invalid_arg(format!("unknown backend option `{opts}`")))?;
                if let Codec::Zstd(level) = codec {
                    if !(1..=19).contains(&level) {
                        return Err(RepoError::invalid_arg(format!(
                            "compression level {level} is outside 1..=19"
                        )));
                    }
                    if prototype.nbytes() < COMPRESSION_MIN_BYTES {
                        return Err(RepoError::invalid_arg(format!(
                            "compression for backend `{backend}` is not supported for buffers \
                             under {COMPRESSION_MIN_BYTES} bytes; a prototype of shape {:?} and \
                             dtype {} totals {} bytes. Modify the schema shape / dtype, or \
                             select the `raw` option or another backend",
                            prototype.shape(),
                            prototype.dtype(),
                            prototype.nbytes()
                        )));
                    }
                }
            }
            Ok(BackendOpts {
                backend,
                opts: opts.clone(),
            })
        }
        None => {
            let backend = backend_from_heuristics(prototype, variable_shape);
            check_capabilities(backend, prototype, variable_shape)?;
            Ok(BackendOpts {
                backend,
                opts: backend_opts_from_heuristics(backend, prototype),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;
    use crate::error::RepoError;

    #[test_case(Tensor::zeros(&[300], DType::F32), false, "10"; "small one dimensional")]
    #[test_case(Tensor::zeros(&[1000], DType::F32), false, "00"; "large one dimensional")]
    #[test_case(Tensor::zeros(&[5, 7], DType::F32), false, "01"; "fixed multi dimensional")]
    #[test_case(Tensor::zeros(&[5, 7], DType::F32), true, "00"; "variable multi dimensional")]
    #[test_case(Tensor::zeros(&[399], DType::F64), true, "10"; "size boundary below")]
    #[test_case(Tensor::zeros(&[400], DType::F64), true, "00"; "size boundary at")]
    #[test_case(Tensor::zeros(&[10_000_001], DType::U8), false, "01"; "past pack v0 bound fixed")]
    #[test_case(Tensor::from_string("x"), true, "30"; "string payload")]
    fn test_backend_from_heuristics(prototype: Tensor, variable_shape: bool, expected: &str) {
        assert_eq!(
            backend_from_heuristics(&prototype, variable_shape).as_str(),
            expected
        );
    }

    #[test]
    fn test_default_opts_fall_back_below_compression_minimum() {
        let tiny = Tensor::zeros(&[3], DType::U8);
        let large = Tensor::zeros(&[1000], DType::F32);
        assert_eq!(backend_opts_from_heuristics(BackendCode::PACK_V0, &tiny), "raw");
        assert_eq!(backend_opts_from_heuristics(BackendCode::PACK_V0, &large), "zstd3");
        assert_eq!(backend_opts_from_heuristics(BackendCode::PACK_V1, &large), "zstd5");
        assert_eq!(backend_opts_from_heuristics(BackendCode::FLAT_V1, &large), "");
    }

    #[test]
    fn test_parse_absent_arg_infers_both() {
        let prototype = Tensor::zeros(&[5, 7], DType::F32);
        let parsed = parse_user_backend_opts(None, &prototype, false).unwrap();
        assert_eq!(parsed.backend, BackendCode::PACK_V1);
        assert_eq!(parsed.opts, "zstd5");
    }

    #[test]
    fn test_parse_bare_code_infers_opts() {
        let prototype = Tensor::zeros(&[1000], DType::F32);
        let parsed = parse_user_backend_opts(
            Some(&BackendArg::Code("00".to_owned())),
            &prototype,
            false,
        )
        .unwrap();
        assert_eq!(parsed.backend, BackendCode::PACK_V0);
        assert_eq!(parsed.opts, "zstd3");
    }

    #[test]
    fn test_parse_rejects_unknown_code() {
        let prototype = Tensor::zeros(&[10], DType::F32);
        for raw in ["20", "60", "zz", "9"] {
            assert_matches!(
                parse_user_backend_opts(Some(&BackendArg::Code(raw.to_owned())), &prototype, false),
                Err(RepoError::InvalidArg(_))
            );
        }
    }

    #[test]
    fn test_parse_rejects_capability_conflicts() {
        // Flat backend stores no strings.
        assert_matches!(
            parse_user_backend_opts(
                Some(&BackendArg::Code("10".to_owned())),
                &Tensor::from_string("x"),
                true,
            ),
            Err(RepoError::InvalidArg(_))
        );
        // Flat backend takes no codec options.
        assert_matches!(
            parse_user_backend_opts(
                Some(&BackendArg::CodeWithOpts {
                    backend: "10".to_owned(),
                    opts: "zstd3".to_owned(),
                }),
                &Tensor::zeros(&[10], DType::F32),
                false,
            ),
            Err(RepoError::InvalidArg(_))
        );
    }

    #[test]
    fn test_parse_rejects_compression_below_minimum() {
        let tiny = Tensor::zeros(&[3], DType::U8);
        assert_matches!(
            parse_user_backend_opts(
                Some(&BackendArg::CodeWithOpts {
                    backend: "00".to_owned(),
                    opts: "zstd3".to_owned(),
                }),
                &tiny,
                false,
            ),
            Err(RepoError::InvalidArg(_))
        );
        // The store codec remains available for tiny buffers.
        let parsed = parse_user_backend_opts(
            Some(&BackendArg::CodeWithOpts {
                backend: "00".to_owned(),
                opts: "raw".to_owned(),
            }),
            &tiny,
            false,
        )
        .unwrap();
        assert_eq!(parsed.opts, "raw");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let prototype = Tensor::zeros(&[128], DType::F32);
        let first = backend_from_heuristics(&prototype, false);
        for _ in 0..8 {
            assert_eq!(backend_from_heuristics(&prototype, false), first);
        }
    }
}
