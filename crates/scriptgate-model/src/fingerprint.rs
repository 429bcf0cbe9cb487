//! Content-addressed identifiers
//!
//! Provides [`Fingerprint`], the 32-byte SHA-256 key that identifies a
//! generation request across the cache and the audit log, and
//! [`SourceDigest`], the BLAKE3 digest that binds a scan verdict to the exact
//! bytes it judged.

use crate::context::{normalize_context, GenerationContext};
use crate::error::ModelError;
use crate::language::Language;
use crate::scan::PolicyId;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Generation parameters that take part in the fingerprint
///
/// A `BTreeMap` keeps key order stable so the canonical encoding never
/// depends on insertion order.
pub type GenerationParams = BTreeMap<String, serde_json::Value>;

/// A 32-byte request fingerprint (SHA-256)
///
/// Rendered as 64 lowercase hex characters, which doubles as the public
/// `script_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

/// Canonical view hashed by [`Fingerprint::compute`]
///
/// Field order is alphabetical so the JSON encoding is identical to a
/// sorted-keys dump.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    context: serde_json::Map<String, serde_json::Value>,
    language: &'a str,
    params: &'a GenerationParams,
    policy: String,
    prompt: &'a str,
}

impl Fingerprint {
    /// Create a fingerprint from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create fingerprint from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ModelError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ModelError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Fingerprint a generation request
    ///
    /// The prompt is trimmed and the policy is identified by name and
    /// version, so a reloaded policy never reuses results judged under its
    /// predecessor. Context enters in normalized form (see
    /// [`normalize_context`]); an empty context leaves the fingerprint as if
    /// none had been given.
    ///
    /// # Errors
    /// Returns error if a parameter value cannot be encoded
    pub fn compute(
        prompt: &str,
        language: Language,
        policy: &PolicyId,
        params: &GenerationParams,
        context: &GenerationContext,
    ) -> Result<Self, ModelError> {
        let canonical = CanonicalRequest {
            context: normalize_context(context),
            language: language.name(),
            params,
            policy: policy.to_string(),
            prompt: prompt.trim(),
        };
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Self(Sha256::digest(&bytes).into()))
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl serde::de::Visitor<'_> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a 32-byte fingerprint as hex string or bytes")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }

            fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_slice(value).map_err(serde::de::Error::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(FingerprintVisitor)
        } else {
            deserializer.deserialize_bytes(FingerprintVisitor)
        }
    }
}

/// BLAKE3 digest of a source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceDigest([u8; 32]);

impl SourceDigest {
    /// Digest the exact bytes of `source`
    #[inline]
    #[must_use]
    pub fn of(source: &str) -> Self {
        Self(*blake3::hash(source.as_bytes()).as_bytes())
    }

    /// Check whether `source` is the text this digest was taken from
    #[inline]
    #[must_use]
    pub fn matches(&self, source: &str) -> bool {
        *self == Self::of(source)
    }
}

impl Display for SourceDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for SourceDigest {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| ModelError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

impl serde::Serialize for SourceDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for SourceDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> PolicyId {
        PolicyId::new("moderate", 1)
    }

    fn no_context() -> GenerationContext {
        GenerationContext::new()
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let params = GenerationParams::new();
        let a = Fingerprint::compute("sum a list", Language::Python, &policy(), &params, &no_context()).unwrap();
        let b = Fingerprint::compute("sum a list", Language::Python, &policy(), &params, &no_context()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_trims_prompt() {
        let params = GenerationParams::new();
        let a = Fingerprint::compute("  sum a list\n", Language::Python, &policy(), &params, &no_context()).unwrap();
        let b = Fingerprint::compute("sum a list", Language::Python, &policy(), &params, &no_context()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_separates_components() {
        let params = GenerationParams::new();
        let base = Fingerprint::compute("task", Language::Python, &policy(), &params, &no_context()).unwrap();

        let js = Fingerprint::compute("task", Language::JavaScript, &policy(), &params, &no_context()).unwrap();
        let strict =
            Fingerprint::compute("task", Language::Python, &PolicyId::new("strict", 1), &params, &no_context())
                .unwrap();
        let bumped =
            Fingerprint::compute("task", Language::Python, &PolicyId::new("moderate", 2), &params, &no_context())
                .unwrap();

        let mut with_param = GenerationParams::new();
        with_param.insert("temperature".into(), serde_json::json!(0.2));
        let tuned = Fingerprint::compute("task", Language::Python, &policy(), &with_param, &no_context()).unwrap();

        for other in [js, strict, bumped, tuned] {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn context_counts_input_shape_not_values() {
        let params = GenerationParams::new();
        let with = |value: serde_json::Value| {
            let context: GenerationContext = serde_json::from_value(value).unwrap();
            Fingerprint::compute("add numbers", Language::Python, &policy(), &params, &context).unwrap()
        };

        let bare = Fingerprint::compute("add numbers", Language::Python, &policy(), &params, &no_context())
            .unwrap();
        assert_eq!(with(serde_json::json!({})), bare);
        assert_eq!(with(serde_json::json!({"inputs": []})), bare);

        let two_numbers = with(serde_json::json!({"inputs": [1, 2]}));
        assert_eq!(two_numbers, with(serde_json::json!({"inputs": ["40", 2.5]})));
        assert_ne!(two_numbers, bare);
        assert_ne!(two_numbers, with(serde_json::json!({"inputs": [1, 2, 3]})));
        assert_ne!(two_numbers, with(serde_json::json!({"inputs": [1, "two"]})));

        assert_eq!(
            with(serde_json::json!({"files": ["a.csv", "b.csv"]})),
            with(serde_json::json!({"files": ["b.csv", "a.csv"]}))
        );
        assert_ne!(
            with(serde_json::json!({"data": "sales"})),
            with(serde_json::json!({"data": "stock"}))
        );
    }

    #[test]
    fn fingerprint_display_and_parse() {
        let fp = Fingerprint::compute("x", Language::Python, &policy(), &GenerationParams::new(), &no_context())
            .unwrap();
        let text = fp.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Fingerprint>().unwrap(), fp);
        assert!(text.starts_with(&fp.short()));
    }

    #[test]
    fn fingerprint_rejects_bad_length() {
        let err = "abcd".parse::<Fingerprint>().unwrap_err();
        assert!(matches!(err, ModelError::InvalidLength { expected: 32, actual: 2 }));
    }

    #[test]
    fn fingerprint_serde_as_hex() {
        let fp = Fingerprint::new([7u8; 32]);
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(32)));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn source_digest_binds_exact_bytes() {
        let digest = SourceDigest::of("print(1)\n");
        assert!(digest.matches("print(1)\n"));
        assert!(!digest.matches("print(1)"));
    }

    proptest! {
        #[test]
        fn param_insertion_order_does_not_matter(a in 0i64..1000, b in "[a-z]{1,8}") {
            let mut first = GenerationParams::new();
            first.insert("alpha".into(), serde_json::json!(a));
            first.insert("beta".into(), serde_json::json!(b.clone()));

            let mut second = GenerationParams::new();
            second.insert("beta".into(), serde_json::json!(b));
            second.insert("alpha".into(), serde_json::json!(a));

            let x = Fingerprint::compute("p", Language::Python, &policy(), &first, &no_context()).unwrap();
            let y = Fingerprint::compute("p", Language::Python, &policy(), &second, &no_context()).unwrap();
            prop_assert_eq!(x, y);
        }
    }
}
