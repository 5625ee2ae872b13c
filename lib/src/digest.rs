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

//! Typed content digests.
//!
//! A digest is a one-character *type code* naming the hashing scheme,
//! followed by the hex rendering of the hash output. The type code is
//! recoverable from the digest string, which is how the integrity verifier
//! selects the recomputation function for any stored artifact.

use std::fmt;
use std::fmt::Debug;

use crate::error::RepoError;
use crate::error::Result;

/// Number of raw hash bytes carried by a digest.
pub const DIGEST_RAW_LEN: usize = 20;

/// Number of characters in the string form: type code + hex.
pub const DIGEST_STR_LEN: usize = 1 + DIGEST_RAW_LEN * 2;

/// A typed content hash, stored in its canonical string form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(String);

impl Digest {
    pub(crate) fn from_parts(tcode: char, raw: &[u8; DIGEST_RAW_LEN]) -> Self {
        let mut s = String::with_capacity(DIGEST_STR_LEN);
        s.push(tcode);
        s.push_str(&hex::encode(raw));
        Self(s)
    }

    /// Parses and validates the canonical string form.
    pub fn parse(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let tcode = chars
            .next()
            .ok_or_else(|| RepoError::corruption("empty digest string"))?;
        if !tcode.is_ascii_alphanumeric() {
            return Err(RepoError::corruption(format!(
                "digest `{s}` carries invalid type code `{tcode}`"
            )));
        }
        let hex_part = chars.as_str();
        if hex_part.len() != DIGEST_RAW_LEN * 2
            || !hex_part.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(RepoError::corruption(format!(
                "digest `{s}` is not a {DIGEST_STR_LEN} character typed hex string"
            )));
        }
        Ok(Self(s.to_owned()))
    }

    pub(crate) fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| RepoError::corruption("digest bytes are not valid UTF-8"))?;
        Self::parse(s)
    }

    /// The one-character code naming the hashing scheme.
    pub fn type_code(&self) -> char {
        self.0.as_bytes()[0] as char
    }

    /// The hex portion, without the type code.
    pub fn hex(&self) -> &str {
        &self.0[1..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("Digest").field(&self.0).finish()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::RepoError;

    fn sample() -> Digest {
        Digest::from_parts('0', &[0xab; DIGEST_RAW_LEN])
    }

    #[test]
    fn test_display_and_parts() {
        let digest = sample();
        assert_eq!(digest.type_code(), '0');
        assert_eq!(digest.hex(), "ab".repeat(DIGEST_RAW_LEN));
        assert_eq!(format!("{digest}"), digest.as_str());
        assert_eq!(digest.as_str().len(), DIGEST_STR_LEN);
    }

    #[test]
    fn test_parse_round_trip() {
        let digest = sample();
        assert_eq!(Digest::parse(digest.as_str()).unwrap(), digest);
        assert_eq!(Digest::parse_bytes(digest.as_bytes()).unwrap(), digest);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_matches!(Digest::parse(""), Err(RepoError::Corruption(_)));
        assert_matches!(Digest::parse("0abc"), Err(RepoError::Corruption(_)));
        // Uppercase hex is not canonical.
        let upper = format!("0{}", "AB".repeat(DIGEST_RAW_LEN));
        assert_matches!(Digest::parse(&upper), Err(RepoError::Corruption(_)));
        // Non-alphanumeric type code.
        let bad = format!("|{}", "ab".repeat(DIGEST_RAW_LEN));
        assert_matches!(Digest::parse(&bad), Err(RepoError::Corruption(_)));
    }
}
