//! Deterministic identifiers and resource names.
//!
//! Model ids are a short digest of the program source plus an environment
//! fingerprint, so compiling the same program twice on the same toolchain
//! always lands on the same cache entry. Fit ids are digests of the call
//! (function, model, arguments) when the arguments pin the random seed, and
//! random otherwise.
//!
//! Names follow a fixed hierarchy:
//!
//! ```text
//! models/{model_id}
//! models/{model_id}/fits/{fit_id}
//! operations/{fit_id}
//! ```
//!
//! Everything in this module is pure apart from [`EnvFingerprint::detect`]
//! and the random branch of [`compute_fit_id`].

use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Digest bytes kept from the hash. Five bytes puts the expected first
/// collision at roughly a million ids.
pub const DIGEST_SIZE: usize = 5;

/// Length of an encoded id (base32 of [`DIGEST_SIZE`] bytes, no padding).
pub const ID_LEN: usize = (DIGEST_SIZE * 8).div_ceil(5);

/// Argument whose presence makes a fit deterministic.
pub const SEED_ARGUMENT: &str = "random_seed";

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("`{0}` is not a valid id")]
    InvalidId(String),
    #[error("`{0}` is not a valid {1} name")]
    InvalidName(String, &'static str),
}

/// Identity of the build environment mixed into every digest.
///
/// Changing the service version, the compiler, the target platform or the
/// installed binary yields new ids, which keeps stale artifacts from being
/// served to an incompatible runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvFingerprint {
    toolchain_version: String,
    platform: String,
    interpreter: String,
}

impl EnvFingerprint {
    pub fn new(
        toolchain_version: impl Into<String>,
        platform: impl Into<String>,
        interpreter: impl Into<String>,
    ) -> Self {
        Self {
            toolchain_version: toolchain_version.into(),
            platform: platform.into(),
            interpreter: interpreter.into(),
        }
    }

    /// Fingerprint of the running process, given the external compiler's
    /// version string.
    pub fn detect(compiler_version: &str) -> Self {
        let toolchain_version = format!("{}+{}", env!("CARGO_PKG_VERSION"), compiler_version);
        let platform = option_env!("VERGEN_CARGO_TARGET_TRIPLE")
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "{}-{}-{}",
                    std::env::consts::ARCH,
                    std::env::consts::OS,
                    usize::BITS
                )
            });
        let interpreter = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self::new(toolchain_version, platform, interpreter)
    }

    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.toolchain_version.as_bytes());
        hasher.update(self.platform.as_bytes());
        hasher.update(self.interpreter.as_bytes());
    }
}

macro_rules! short_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate an id taken from untrusted input (URL segments,
            /// directory listings).
            pub fn parse(raw: &str) -> Result<Self, NameError> {
                if is_valid_id(raw) {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(NameError::InvalidId(raw.to_string()))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

short_id!(
    /// Id of a compiled model.
    ModelId
);
short_id!(
    /// Id of a fit; also the id of the operation producing it.
    FitId
);

impl ModelId {
    /// `models/{id}`
    pub fn name(&self) -> String {
        format!("models/{}", self.0)
    }
}

/// Fully qualified fit: a fit only exists underneath its model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FitName {
    pub model: ModelId,
    pub fit: FitId,
}

impl FitName {
    pub fn new(model: ModelId, fit: FitId) -> Self {
        Self { model, fit }
    }

    /// Parse `models/{model_id}/fits/{fit_id}`.
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let invalid = || NameError::InvalidName(name.to_string(), "fit");
        let rest = name.strip_prefix("models/").ok_or_else(invalid)?;
        let (model, fit) = rest.split_once("/fits/").ok_or_else(invalid)?;
        Ok(Self {
            model: ModelId::parse(model)?,
            fit: FitId::parse(fit)?,
        })
    }

    /// `operations/{fit_id}`
    pub fn operation_name(&self) -> String {
        format!("operations/{}", self.fit)
    }
}

impl fmt::Display for FitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "models/{}/fits/{}", self.model, self.fit)
    }
}

/// Parse `operations/{id}` or a bare id.
pub fn operation_id(name: &str) -> Result<FitId, NameError> {
    FitId::parse(name.strip_prefix("operations/").unwrap_or(name))
}

/// Id of the model compiled from `source_text` in environment `env`.
pub fn compute_model_id(source_text: &str, env: &EnvFingerprint) -> ModelId {
    let mut hasher = Sha256::new();
    hasher.update(source_text.as_bytes());
    env.feed(&mut hasher);
    ModelId(encode_digest(&hasher.finalize()))
}

/// Id of the fit produced by calling `function` on `model` with `arguments`.
///
/// Deterministic only when `arguments` carries [`SEED_ARGUMENT`]; otherwise
/// a random id of the same shape is returned and the fit can never be served
/// from cache. `arguments` must be the caller-supplied arguments before any
/// default is merged in.
pub fn compute_fit_id(
    function: &str,
    model: &ModelId,
    arguments: &BTreeMap<String, serde_json::Value>,
    env: &EnvFingerprint,
) -> Result<FitId, serde_json::Error> {
    if !arguments.contains_key(SEED_ARGUMENT) {
        let mut bytes = [0u8; DIGEST_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        return Ok(FitId(base32_lower(&bytes)));
    }

    let mut hasher = Sha256::new();
    hasher.update(function.as_bytes());
    hasher.update(model.as_str().as_bytes());
    hasher.update(canonical_arguments(arguments)?);
    env.feed(&mut hasher);
    Ok(FitId(encode_digest(&hasher.finalize())))
}

/// Stable byte form of the arguments: JSON with keys sorted at every level.
fn canonical_arguments(
    arguments: &BTreeMap<String, serde_json::Value>,
) -> Result<Vec<u8>, serde_json::Error> {
    // serde_json::Map is ordered by key unless `preserve_order` is enabled,
    // which this crate never does.
    serde_json::to_vec(arguments)
}

fn encode_digest(digest: &[u8]) -> String {
    base32_lower(&digest[..DIGEST_SIZE])
}

/// RFC 4648 base32, lowercase, without padding.
fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[usize::from((buffer >> bits) & 0x1f)] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[usize::from((buffer << (5 - bits)) & 0x1f)] as char);
    }
    out
}

fn is_valid_id(raw: &str) -> bool {
    raw.len() == ID_LEN && raw.bytes().all(|b| BASE32_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> EnvFingerprint {
        EnvFingerprint::new("0.3.0+2.26", "x86_64-unknown-linux-gnu", "/usr/bin/fitserve")
    }

    fn args(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn base32_matches_rfc4648_vectors() {
        assert_eq!(base32_lower(b""), "");
        assert_eq!(base32_lower(b"f"), "my");
        assert_eq!(base32_lower(b"fo"), "mzxq");
        assert_eq!(base32_lower(b"foo"), "mzxw6");
        assert_eq!(base32_lower(b"fooba"), "mzxw6ytb");
        assert_eq!(base32_lower(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn model_id_is_deterministic() {
        let source = "parameters {real y;} model {y ~ normal(0,1);}";
        let a = compute_model_id(source, &env());
        let b = compute_model_id(source, &env());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ID_LEN);
        assert!(a.name().starts_with("models/"));
    }

    #[test]
    fn model_id_depends_on_source_and_environment() {
        let source = "parameters {real y;} model {y ~ normal(0,1);}";
        let base = compute_model_id(source, &env());
        assert_ne!(base, compute_model_id("parameters {real z;}", &env()));
        let other_env = EnvFingerprint::new("0.3.0+2.27", "x86_64-unknown-linux-gnu", "/usr/bin/fitserve");
        assert_ne!(base, compute_model_id(source, &other_env));
    }

    #[test]
    fn fit_id_with_seed_is_deterministic() {
        let model = compute_model_id("model {}", &env());
        let a = args(&[("random_seed", json!(123)), ("num_samples", json!(10))]);
        let b = args(&[("num_samples", json!(10)), ("random_seed", json!(123))]);
        assert_eq!(
            compute_fit_id("sample", &model, &a, &env()).unwrap(),
            compute_fit_id("sample", &model, &b, &env()).unwrap()
        );
        let c = args(&[("random_seed", json!(124)), ("num_samples", json!(10))]);
        assert_ne!(
            compute_fit_id("sample", &model, &a, &env()).unwrap(),
            compute_fit_id("sample", &model, &c, &env()).unwrap()
        );
    }

    #[test]
    fn fit_id_without_seed_is_random() {
        let model = compute_model_id("model {}", &env());
        let a = args(&[("num_samples", json!(10))]);
        let first = compute_fit_id("sample", &model, &a, &env()).unwrap();
        let second = compute_fit_id("sample", &model, &a, &env()).unwrap();
        assert_ne!(first, second);
        assert!(FitId::parse(first.as_str()).is_ok());
    }

    #[test]
    fn names_round_trip() {
        let model = ModelId::parse("abcdefgh").unwrap();
        let fit = FitId::parse("234567ab").unwrap();
        let name = FitName::new(model.clone(), fit.clone());
        assert_eq!(name.to_string(), "models/abcdefgh/fits/234567ab");
        assert_eq!(FitName::parse(&name.to_string()).unwrap(), name);
        assert_eq!(name.operation_name(), "operations/234567ab");
        assert_eq!(operation_id("operations/234567ab").unwrap(), fit);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(ModelId::parse("../../etc").is_err());
        assert!(ModelId::parse("ABCDEFGH").is_err());
        assert!(ModelId::parse("abc").is_err());
        assert!(FitName::parse("models/abcdefgh/oops/234567ab").is_err());
    }
}
