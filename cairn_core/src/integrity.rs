//! Integrity values: one or more cryptographic digests of a payload.
//!
//! The textual form is `algo-<base64 digest>`, with several hashes joined
//! by spaces. Hashes are always kept strongest-first so serialization and
//! content path selection are deterministic.

use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Supported hash algorithms.
///
/// Variants are declared weakest-first so that `Ord` ranks the strongest
/// algorithm highest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    /// SHA-256.
    Sha256,
    /// BLAKE3 with 256-bit output.
    Blake3,
    /// SHA-384.
    Sha384,
    /// SHA-512, the default.
    #[default]
    Sha512,
}

impl Algorithm {
    /// Returns the string representation used in integrity strings and content paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Blake3 => "blake3",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Parse algorithm from string (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Algorithm::Sha256),
            "blake3" => Ok(Algorithm::Blake3),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }

    /// Digest size in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Algorithm::Sha256 | Algorithm::Blake3 => 32,
            Algorithm::Sha384 => 48,
            Algorithm::Sha512 => 64,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::parse(s)
    }
}

/// A single digest under one algorithm.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: Algorithm,
    digest: Vec<u8>,
}

impl Hash {
    /// Create a Hash from raw digest bytes, checking the length.
    pub fn new(algorithm: Algorithm, digest: Vec<u8>) -> Result<Self> {
        if digest.len() != algorithm.digest_len() {
            return Err(Error::invalid_integrity(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_len(),
                digest.len()
            )));
        }
        Ok(Hash { algorithm, digest })
    }

    /// Parse a single `algo-base64` token.
    fn parse_token(token: &str) -> Result<Self> {
        let (algo, rest) = token
            .split_once('-')
            .ok_or_else(|| Error::invalid_integrity(format!("Missing algorithm in {token:?}")))?;
        let algorithm = Algorithm::parse(algo)?;
        // Options after `?` are accepted but not interpreted.
        let encoded = rest.split_once('?').map_or(rest, |(digest, _)| digest);
        let digest = BASE64
            .decode(encoded)
            .map_err(|e| Error::invalid_integrity(format!("Invalid base64 in {token:?}: {e}")))?;
        Hash::new(algorithm, digest)
    }

    /// Get the raw digest bytes.
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Lower-case hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Base64 encoding of the digest.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.digest)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, self.to_base64())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// An integrity value: a non-empty, strongest-first set of hashes.
///
/// Two integrity values are equal when they share at least one algorithm
/// with a matching digest. That relation is not transitive, so `Integrity`
/// deliberately does not implement `Eq` or `std::hash::Hash`.
#[derive(Clone)]
pub struct Integrity {
    hashes: Vec<Hash>,
}

impl Integrity {
    fn from_hashes(hashes: Vec<Hash>) -> Result<Self> {
        if hashes.is_empty() {
            return Err(Error::invalid_integrity("no hashes"));
        }
        Ok(Self::sorted(hashes))
    }

    /// Callers guarantee `hashes` is non-empty.
    fn sorted(mut hashes: Vec<Hash>) -> Self {
        // Stable: several digests under one algorithm keep their order.
        hashes.sort_by(|a, b| b.algorithm.cmp(&a.algorithm));
        let mut unique: Vec<Hash> = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if !unique.contains(&hash) {
                unique.push(hash);
            }
        }
        Integrity { hashes: unique }
    }

    /// Hash `data` with the default algorithm.
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        Self::compute(data, &[Algorithm::default()])
    }

    /// Hash `data` under each of `algorithms` (the default one if empty).
    pub fn compute(data: impl AsRef<[u8]>, algorithms: &[Algorithm]) -> Self {
        let mut opts = IntegrityOpts::new();
        for algo in algorithms {
            opts = opts.algorithm(*algo);
        }
        opts.input(data.as_ref());
        opts.result()
    }

    /// Hash everything a reader yields with the default algorithm.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut opts = IntegrityOpts::new();
        std::io::copy(&mut reader, &mut opts)?;
        Ok(opts.result())
    }

    /// Build an integrity value from a hex digest (as found in content paths).
    pub fn from_hex(hex_str: &str, algorithm: Algorithm) -> Result<Self> {
        let digest = hex::decode(hex_str)
            .map_err(|e| Error::invalid_integrity(format!("Invalid hex: {}", e)))?;
        Self::from_hashes(vec![Hash::new(algorithm, digest)?])
    }

    /// All hashes, strongest algorithm first.
    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    /// The strongest hash; used for the content address.
    pub fn strongest(&self) -> &Hash {
        &self.hashes[0]
    }

    /// The strongest algorithm present.
    pub fn pick_algorithm(&self) -> Algorithm {
        self.strongest().algorithm
    }

    /// Distinct algorithms present, strongest first.
    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut algos: Vec<Algorithm> = self.hashes.iter().map(|h| h.algorithm).collect();
        algos.dedup();
        algos
    }

    /// Merge another integrity value into this one (multi-value digests).
    pub fn concat(&self, other: &Integrity) -> Integrity {
        let mut hashes = self.hashes.clone();
        hashes.extend(other.hashes.iter().cloned());
        Integrity::sorted(hashes)
    }

    /// The strongest algorithm under which any digest of `self` equals any of `other`.
    pub fn matches(&self, other: &Integrity) -> Option<Algorithm> {
        self.hashes
            .iter()
            .find(|mine| other.hashes.iter().any(|theirs| *mine == theirs))
            .map(|h| h.algorithm)
    }

    /// Verify `data` against this integrity value.
    pub fn check(&self, data: impl AsRef<[u8]>) -> Result<Algorithm> {
        let mut checker = IntegrityChecker::new(self.clone());
        checker.input(data.as_ref());
        checker.result()
    }

    /// Verify everything a reader yields against this integrity value.
    pub fn check_reader<R: Read>(&self, mut reader: R) -> Result<Algorithm> {
        let mut checker = IntegrityChecker::new(self.clone());
        std::io::copy(&mut reader, &mut checker)?;
        checker.result()
    }
}

impl From<Hash> for Integrity {
    fn from(hash: Hash) -> Self {
        Integrity { hashes: vec![hash] }
    }
}

impl PartialEq for Integrity {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other).is_some()
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hash) in self.hashes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{hash}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Integrity({self})")
    }
}

impl FromStr for Integrity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let hashes = s
            .split_whitespace()
            .map(Hash::parse_token)
            .collect::<Result<Vec<_>>>()?;
        Integrity::from_hashes(hashes)
    }
}

impl Serialize for Integrity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Integrity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

enum Hasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
            Algorithm::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            Algorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> Hash {
        let (algorithm, digest) = match self {
            Hasher::Sha256(h) => (Algorithm::Sha256, h.finalize().to_vec()),
            Hasher::Blake3(h) => (Algorithm::Blake3, h.finalize().as_bytes().to_vec()),
            Hasher::Sha384(h) => (Algorithm::Sha384, h.finalize().to_vec()),
            Hasher::Sha512(h) => (Algorithm::Sha512, h.finalize().to_vec()),
        };
        Hash { algorithm, digest }
    }
}

/// Incremental, multi-algorithm hasher.
///
/// With no algorithm selected it hashes with [`Algorithm::default`].
#[derive(Default)]
pub struct IntegrityOpts {
    hashers: Vec<(Algorithm, Hasher)>,
}

impl IntegrityOpts {
    /// Create a hasher with no algorithms selected yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an algorithm (duplicates are ignored).
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        if !self.hashers.iter().any(|(a, _)| *a == algorithm) {
            self.hashers.push((algorithm, Hasher::new(algorithm)));
        }
        self
    }

    /// Feed bytes to every hasher.
    pub fn input(&mut self, data: &[u8]) {
        if self.hashers.is_empty() {
            let algo = Algorithm::default();
            self.hashers.push((algo, Hasher::new(algo)));
        }
        for (_, hasher) in &mut self.hashers {
            hasher.update(data);
        }
    }

    /// Finish hashing.
    pub fn result(mut self) -> Integrity {
        if self.hashers.is_empty() {
            self.input(&[]);
        }
        Integrity::sorted(self.hashers.into_iter().map(|(_, h)| h.finish()).collect())
    }
}

impl std::io::Write for IntegrityOpts {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.input(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Incremental verifier for an expected integrity value.
pub struct IntegrityChecker {
    expected: Integrity,
    opts: IntegrityOpts,
}

impl IntegrityChecker {
    /// Create a checker hashing with every algorithm in `expected`.
    pub fn new(expected: Integrity) -> Self {
        let opts = expected
            .algorithms()
            .into_iter()
            .fold(IntegrityOpts::new(), IntegrityOpts::algorithm);
        IntegrityChecker { expected, opts }
    }

    /// Feed bytes.
    pub fn input(&mut self, data: &[u8]) {
        self.opts.input(data);
    }

    /// Finish and compare, returning the algorithm that matched.
    pub fn result(self) -> Result<Algorithm> {
        let found = self.opts.result();
        self.expected
            .matches(&found)
            .ok_or_else(|| Error::integrity_mismatch(&self.expected, &found))
    }
}

impl std::io::Write for IntegrityChecker {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.input(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_empty_vector() {
        let sri = Integrity::compute(b"", &[Algorithm::Sha256]);
        assert_eq!(
            sri.to_string(),
            "sha256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
        assert_eq!(
            sri.strongest().to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_blake3_hello_world() {
        let sri = Integrity::compute(b"hello world", &[Algorithm::Blake3]);
        assert_eq!(
            sri.strongest().to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_default_is_sha512() {
        let sri = Integrity::from_bytes(b"hello");
        assert_eq!(sri.pick_algorithm(), Algorithm::Sha512);
        assert!(sri.to_string().starts_with("sha512-"));
        assert_eq!(sri.strongest().digest().len(), 64);
    }

    #[test]
    fn test_strongest_first_ordering() {
        let sri = Integrity::compute(
            b"data",
            &[Algorithm::Sha256, Algorithm::Blake3, Algorithm::Sha512],
        );
        assert_eq!(
            sri.algorithms(),
            vec![Algorithm::Sha512, Algorithm::Blake3, Algorithm::Sha256]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Integrity>().is_err());
        assert!("   ".parse::<Integrity>().is_err());
        assert!("nodash".parse::<Integrity>().is_err());
        assert!("md5-AAAA".parse::<Integrity>().is_err());
        assert!("sha256-!!!notbase64".parse::<Integrity>().is_err());
        // Valid base64 but wrong digest length.
        assert!("sha256-AAAA".parse::<Integrity>().is_err());
    }

    #[test]
    fn test_parse_multiple_and_options() {
        let a = Integrity::compute(b"a", &[Algorithm::Sha256]);
        let b = Integrity::compute(b"a", &[Algorithm::Sha512]);
        let text = format!("  {}?foo {}  ", a, b);
        let parsed: Integrity = text.parse().unwrap();
        assert_eq!(parsed.hashes().len(), 2);
        assert_eq!(parsed.pick_algorithm(), Algorithm::Sha512);
    }

    #[test]
    fn test_equality_needs_one_shared_digest() {
        let both = Integrity::compute(b"x", &[Algorithm::Sha512, Algorithm::Sha256]);
        let only256 = Integrity::compute(b"x", &[Algorithm::Sha256]);
        let other = Integrity::compute(b"y", &[Algorithm::Sha256]);
        let disjoint = Integrity::compute(b"x", &[Algorithm::Blake3]);

        assert_eq!(both, only256);
        assert_ne!(both, other);
        // No shared algorithm means no equality, even for identical data.
        assert_ne!(only256, disjoint);
    }

    #[test]
    fn test_check_reports_expected_and_found() {
        let sri = Integrity::from_bytes(b"good");
        assert_eq!(sri.check(b"good").unwrap(), Algorithm::Sha512);

        match sri.check(b"bad") {
            Err(Error::IntegrityMismatch { expected, found }) => {
                assert_eq!(expected, sri.to_string());
                assert_eq!(found, Integrity::from_bytes(b"bad").to_string());
            }
            other => panic!("expected integrity mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_multi_value_digest_matches_any() {
        let old = Integrity::from_bytes(b"v1");
        let new = Integrity::from_bytes(b"v2");
        let both = old.concat(&new);
        assert_eq!(both.hashes().len(), 2);
        assert!(both.check(b"v1").is_ok());
        assert!(both.check(b"v2").is_ok());
        assert!(both.check(b"v3").is_err());
    }

    #[test]
    fn test_from_hex_roundtrip() {
        let sri = Integrity::from_bytes(b"test data");
        let hex = sri.strongest().to_hex();
        let parsed = Integrity::from_hex(&hex, Algorithm::Sha512).unwrap();
        assert_eq!(parsed.to_string(), sri.to_string());
        assert!(Integrity::from_hex("zz", Algorithm::Sha512).is_err());
        assert!(Integrity::from_hex("abcd", Algorithm::Sha512).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let sri = Integrity::from_bytes(b"serde");
        let json = serde_json::to_string(&sri).unwrap();
        assert_eq!(json, format!("\"{}\"", sri));
        let back: Integrity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), sri.to_string());
        assert!(serde_json::from_str::<Integrity>("\"bogus\"").is_err());
    }

    #[test]
    fn test_algorithm_conversions() {
        assert_eq!(Algorithm::parse("SHA512").unwrap(), Algorithm::Sha512);
        assert_eq!(Algorithm::parse("blake3").unwrap(), Algorithm::Blake3);
        assert!(Algorithm::parse("unknown").is_err());
        assert!(Algorithm::Sha512 > Algorithm::Sha384);
        assert!(Algorithm::Blake3 > Algorithm::Sha256);
    }

    // Property-based tests
    use proptest::prelude::*;

    fn any_algorithm() -> impl Strategy<Value = Algorithm> {
        prop::sample::select(vec![
            Algorithm::Sha256,
            Algorithm::Blake3,
            Algorithm::Sha384,
            Algorithm::Sha512,
        ])
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            max_shrink_iters: 1000,
            ..ProptestConfig::default()
        })]

        /// Hashing is deterministic and the textual form parses back.
        #[test]
        fn prop_serialize_parse(
            data in prop::collection::vec(any::<u8>(), 0..1024),
            algo in any_algorithm()
        ) {
            let sri = Integrity::compute(&data, &[algo]);
            let parsed: Integrity = sri.to_string().parse()?;
            prop_assert_eq!(parsed.to_string(), sri.to_string());
            prop_assert_eq!(Integrity::compute(&data, &[algo]).to_string(), sri.to_string());
        }

        /// Streaming in arbitrary splits gives the same digest as one shot.
        #[test]
        fn prop_incremental_equals_oneshot(
            data in prop::collection::vec(any::<u8>(), 0..1024),
            split in 0usize..512
        ) {
            let split = split.min(data.len());
            let mut opts = IntegrityOpts::new().algorithm(Algorithm::Sha512);
            opts.input(&data[..split]);
            opts.input(&data[split..]);
            prop_assert_eq!(opts.result().to_string(), Integrity::from_bytes(&data).to_string());
        }

        /// Any single flipped byte is detected.
        #[test]
        fn prop_flip_detected(
            mut data in prop::collection::vec(any::<u8>(), 1..256),
            idx in any::<usize>()
        ) {
            let sri = Integrity::from_bytes(&data);
            let i = idx % data.len();
            data[i] ^= 0x01;
            prop_assert!(sri.check(&data).is_err());
        }
    }
}
