#![forbid(unsafe_code)]

pub mod eviction;

pub use eviction::{CacheStats, ExecutableCache, LruConfig};

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tt_core::ShapedArray;

/// Everything that decides whether a compiled executable can serve a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureKeyInput {
    pub backend: String,
    pub policy: String,
    pub without_host: bool,
    pub compile_options: BTreeMap<String, String>,
    pub in_avals: Vec<ShapedArray>,
    /// One entry per argument, parallel to `in_avals`.
    pub arg_identities: Vec<ArgIdentity>,
}

/// How an argument handle relates to the other handles a traced function
/// sees. Two calls with equal avals but different aliasing lower to
/// different programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgIdentity {
    Distinct,
    /// Same handle as an earlier argument.
    SameAs(usize),
    /// Same handle as a tensor some compiled trace captured.
    Capture(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.namespace, self.digest_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKeyError {
    EmptyBackend,
}

impl std::fmt::Display for CacheKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyBackend => write!(f, "cache key requires a non-empty backend name"),
        }
    }
}

impl std::error::Error for CacheKeyError {}

pub fn build_cache_key(input: &SignatureKeyInput) -> Result<CacheKey, CacheKeyError> {
    if input.backend.trim().is_empty() {
        return Err(CacheKeyError::EmptyBackend);
    }

    let mut hasher = Sha256::new();
    hash_canonical_payload(&mut hasher, input);
    let digest = hasher.finalize();

    Ok(CacheKey {
        namespace: "ttx",
        digest_hex: bytes_to_hex(&digest),
    })
}

/// Stream the canonical payload into the hasher:
/// `backend=..|policy=..|host=..|compile=k=v;..|avals=f32[1,3],i64[]|alias=d,a0,c1`
#[inline]
fn hash_canonical_payload(hasher: &mut Sha256, input: &SignatureKeyInput) {
    hasher.update(b"backend=");
    hasher.update(input.backend.as_bytes());
    hasher.update(b"|policy=");
    hasher.update(input.policy.as_bytes());
    hasher.update(b"|host=");
    hasher.update(if input.without_host { b"0" } else { b"1" });

    hasher.update(b"|compile=");
    for (i, (key, value)) in input.compile_options.iter().enumerate() {
        if i > 0 {
            hasher.update(b";");
        }
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }

    hasher.update(b"|avals=");
    for (i, aval) in input.in_avals.iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        hasher.update(aval.signature().as_bytes());
    }

    hasher.update(b"|alias=");
    for (i, identity) in input.arg_identities.iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        match identity {
            ArgIdentity::Distinct => hasher.update(b"d"),
            ArgIdentity::SameAs(index) => hasher.update(format!("a{index}").as_bytes()),
            ArgIdentity::Capture(index) => hasher.update(format!("c{index}").as_bytes()),
        }
    }
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    const HEX_LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_LUT[(byte >> 4) as usize] as char);
        out.push(HEX_LUT[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{ArgIdentity, CacheKeyError, SignatureKeyInput, build_cache_key};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tt_core::{DType, Shape, ShapedArray};

    fn baseline_input() -> SignatureKeyInput {
        SignatureKeyInput {
            backend: "xla".to_owned(),
            policy: "retrace".to_owned(),
            without_host: true,
            compile_options: BTreeMap::new(),
            in_avals: vec![ShapedArray::new(
                DType::F32,
                Shape::from(&[1_u32, 3, 3, 3][..]),
            )],
            arg_identities: vec![ArgIdentity::Distinct],
        }
    }

    fn key_hex(input: &SignatureKeyInput) -> String {
        build_cache_key(input).expect("key gen").digest_hex
    }

    #[test]
    fn empty_backend_is_rejected() {
        let mut input = baseline_input();
        input.backend = String::new();
        assert_eq!(build_cache_key(&input), Err(CacheKeyError::EmptyBackend));
    }

    #[test]
    fn cache_key_is_stable_for_identical_inputs() {
        let key_a = build_cache_key(&baseline_input()).expect("key generation should succeed");
        let key_b = build_cache_key(&baseline_input()).expect("key generation should succeed");
        assert_eq!(key_a, key_b);
        assert!(key_a.as_string().starts_with("ttx-"));
        assert_eq!(key_a.digest_hex.len(), 64);
    }

    // ── Key Sensitivity: each field change → different key ────────

    #[test]
    fn key_sensitivity_backend_change() {
        let mut alt = baseline_input();
        alt.backend = "interpreter".to_owned();
        assert_ne!(key_hex(&baseline_input()), key_hex(&alt));
    }

    #[test]
    fn key_sensitivity_policy_change() {
        let mut alt = baseline_input();
        alt.policy = "fallback_to_eager".to_owned();
        assert_ne!(key_hex(&baseline_input()), key_hex(&alt));
    }

    #[test]
    fn key_sensitivity_host_flag_change() {
        let mut alt = baseline_input();
        alt.without_host = false;
        assert_ne!(key_hex(&baseline_input()), key_hex(&alt));
    }

    #[test]
    fn key_sensitivity_compile_options_change() {
        let mut alt = baseline_input();
        alt.compile_options
            .insert("opt_level".to_owned(), "3".to_owned());
        assert_ne!(key_hex(&baseline_input()), key_hex(&alt));
    }

    #[test]
    fn key_sensitivity_shape_and_dtype_change() {
        let mut scalar = baseline_input();
        scalar.in_avals = vec![ShapedArray::scalar(DType::F32)];
        assert_ne!(key_hex(&baseline_input()), key_hex(&scalar));

        let mut f64_input = baseline_input();
        f64_input.in_avals[0].dtype = DType::F64;
        assert_ne!(key_hex(&baseline_input()), key_hex(&f64_input));
    }

    #[test]
    fn argument_boundaries_are_part_of_the_key() {
        let mut split = baseline_input();
        split.in_avals = vec![
            ShapedArray::new(DType::F32, Shape::vector(1)),
            ShapedArray::new(DType::F32, Shape::vector(3)),
        ];
        let mut joined = baseline_input();
        joined.in_avals = vec![ShapedArray::new(DType::F32, Shape::matrix(1, 3))];
        assert_ne!(key_hex(&split), key_hex(&joined));
    }

    #[test]
    fn argument_aliasing_is_part_of_the_key() {
        let pair = |identities: Vec<ArgIdentity>| {
            let mut input = baseline_input();
            input.in_avals = vec![ShapedArray::scalar(DType::F32); 2];
            input.arg_identities = identities;
            key_hex(&input)
        };
        let distinct = pair(vec![ArgIdentity::Distinct, ArgIdentity::Distinct]);
        let aliased = pair(vec![ArgIdentity::Distinct, ArgIdentity::SameAs(0)]);
        let captured = pair(vec![ArgIdentity::Distinct, ArgIdentity::Capture(0)]);
        assert_ne!(distinct, aliased);
        assert_ne!(distinct, captured);
        assert_ne!(aliased, captured);
        assert_ne!(
            pair(vec![ArgIdentity::Capture(0), ArgIdentity::Distinct]),
            pair(vec![ArgIdentity::Capture(1), ArgIdentity::Distinct])
        );
    }

    proptest! {
        #[test]
        fn prop_cache_key_stability(
            backend in "[a-z]{3,6}",
            dims in proptest::collection::vec(1_u32..8, 0..4),
        ) {
            let input = SignatureKeyInput {
                backend,
                policy: "retrace".to_owned(),
                without_host: false,
                compile_options: BTreeMap::new(),
                in_avals: vec![ShapedArray::new(DType::F64, Shape { dims })],
                arg_identities: vec![ArgIdentity::Distinct],
            };
            let key_a = build_cache_key(&input).expect("key gen");
            let key_b = build_cache_key(&input.clone()).expect("key gen");
            prop_assert_eq!(key_a, key_b);
        }
    }
}
