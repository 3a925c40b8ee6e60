//! Merkle-tree challenge/response proof-of-storage audits.
//!
//! A renter generates `N` independent random challenges over a shard before it ever
//! leaves the renter's machine ([`AuditGenerator`]); the farmer later proves it still
//! holds the shard by answering one challenge at a time ([`build_proof`]); the renter
//! checks the answer without re-reading the shard ([`verify`]).

use rand::RngCore;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use storj_crypto::hash160;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const CHALLENGE_LEN: usize = 16;

/// A single-use random nonce bound to one leaf of the audit tree.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge(#[serde(with = "hex_array")] pub [u8; CHALLENGE_LEN]);

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Challenge({})", hex::encode(self.0))
    }
}

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

/// Errors raised while generating, answering, or verifying an audit.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("no leaf in the public record matches this challenge")]
    UnknownChallenge,
    #[error("proof depth {actual} does not match the expected depth {expected}")]
    DepthMismatch { actual: u32, expected: u32 },
    #[error("proof has a malformed shape: an interior pair has no continuation")]
    MalformedProof,
    #[error("reading the shard stream failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Held by the renter only: the challenges, the tree root, and its depth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivateRecord {
    pub challenges: Vec<Challenge>,
    pub root: [u8; 20],
    pub depth: u32,
}

/// Given to the farmer alongside the shard: one leaf per challenge, in the same order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicRecord {
    pub leaves: Vec<[u8; 20]>,
}

/// Streaming generator for an audit set. Feed shard bytes via [`update`](Self::update);
/// on success, [`finalize`](Self::finalize) yields both halves of the audit record.
///
/// If the caller's byte source errors partway through, the generator should simply be
/// dropped: no partial record is ever produced, since both halves only come out of
/// `finalize`, which consumes the generator.
pub struct AuditGenerator {
    nonces: Vec<[u8; CHALLENGE_LEN]>,
    hashers: Vec<Sha256>,
}

impl AuditGenerator {
    /// Creates a generator for `count` independent challenges, seeding each challenge's
    /// hasher with its own nonce up front.
    pub fn new(count: usize) -> Self {
        let mut rng = rand::rngs::OsRng;
        let nonces: Vec<[u8; CHALLENGE_LEN]> = (0..count)
            .map(|_| {
                let mut nonce = [0u8; CHALLENGE_LEN];
                rng.fill_bytes(&mut nonce);
                nonce
            })
            .collect();
        let hashers = nonces
            .iter()
            .map(|nonce| {
                let mut hasher = Sha256::new();
                hasher.update(nonce);
                hasher
            })
            .collect();
        Self { nonces, hashers }
    }

    /// Feeds the next chunk of shard bytes to every in-flight challenge hasher.
    pub fn update(&mut self, chunk: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(chunk);
        }
    }

    /// Reads `reader` to EOF, generating the audit set over its full contents.
    pub async fn generate(count: usize, mut reader: impl AsyncRead + Unpin) -> Result<(PrivateRecord, PublicRecord), AuditError> {
        let mut generator = Self::new(count);
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            generator.update(&buf[..n]);
        }
        Ok(generator.finalize())
    }

    /// Finalizes every hasher, builds the Merkle tree, and splits the result into the
    /// private (renter-only) and public (farmer-facing) halves.
    pub fn finalize(self) -> (PrivateRecord, PublicRecord) {
        let leaves: Vec<[u8; 20]> = self
            .hashers
            .into_iter()
            .map(|hasher| {
                let sha = hasher.finalize();
                let leaf_preimage = Ripemd160::digest(sha);
                hash160(&leaf_preimage)
            })
            .collect();
        let tree = MerkleTree::build(&leaves);
        let challenges = self.nonces.into_iter().map(Challenge).collect();
        let private = PrivateRecord { challenges, root: tree.root(), depth: tree.depth() };
        let public = PublicRecord { leaves };
        (private, public)
    }
}

/// A complete Merkle audit tree, rebuildable by either party from just the leaves.
struct MerkleTree {
    levels: Vec<Vec<[u8; 20]>>,
}

impl MerkleTree {
    fn build(leaves: &[[u8; 20]]) -> Self {
        let padded_len = leaves.len().next_power_of_two().max(1);
        let pad_leaf = hash160(b"");
        let mut level: Vec<[u8; 20]> = leaves.to_vec();
        level.resize(padded_len, pad_leaf);
        let mut levels = vec![level];
        while levels.last().expect("at least one level").len() > 1 {
            let prev = levels.last().expect("at least one level");
            let next = prev
                .chunks(2)
                .map(|pair| {
                    let mut buf = Vec::with_capacity(40);
                    buf.extend_from_slice(&pair[0]);
                    buf.extend_from_slice(&pair[1]);
                    hash160(&buf)
                })
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    fn root(&self) -> [u8; 20] {
        self.levels.last().expect("at least one level")[0]
    }

    fn depth(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    /// Assembles the authentication path for leaf `index`, substituting `response` (the
    /// farmer's claimed `H(challenge || shard)`, not yet leaf-hashed) at the deepest
    /// position.
    fn proof_for(&self, mut index: usize, response: [u8; 20]) -> Proof {
        let mut node = Proof::Response(response);
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = level[index ^ 1];
            node = if index % 2 == 0 {
                Proof::Pair(Box::new(ProofSide::Nested(node)), Box::new(ProofSide::Sibling(sibling)))
            } else {
                Proof::Pair(Box::new(ProofSide::Sibling(sibling)), Box::new(ProofSide::Nested(node)))
            };
            index /= 2;
        }
        node
    }
}

/// The Merkle authentication path for one challenge, as a nested structure mirroring
/// tree traversal: `Pair(left, right)` at each interior level, with exactly one side
/// continuing to nest toward the deepest [`Proof::Response`] and the other a plain
/// sibling hash. Left/right position is preserved by which field holds which.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Proof {
    Response(#[serde(with = "hex20")] [u8; 20]),
    Pair(Box<ProofSide>, Box<ProofSide>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProofSide {
    Sibling(#[serde(with = "hex20")] [u8; 20]),
    Nested(Proof),
}

mod hex20 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 20], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("expected 20 bytes"))
    }
}

/// Farmer side: given the public leaves, a single challenge, and the shard bytes,
/// locates the matching leaf and assembles its authentication path.
///
/// Returns `(proof, depth)`; `depth` is carried alongside since the farmer is the only
/// party that rebuilds the tree and the renter needs it to validate proof shape.
pub fn build_proof(
    public_leaves: &[[u8; 20]],
    challenge: &Challenge,
    shard: &[u8],
) -> Result<(Proof, u32), AuditError> {
    let mut hasher = Sha256::new();
    hasher.update(challenge.0);
    hasher.update(shard);
    let sha = hasher.finalize();
    let response: [u8; 20] = Ripemd160::digest(sha).into();
    let leaf = hash160(&response);
    let index = public_leaves.iter().position(|l| *l == leaf).ok_or(AuditError::UnknownChallenge)?;
    let tree = MerkleTree::build(public_leaves);
    let depth = tree.depth();
    Ok((tree.proof_for(index, response), depth))
}

fn resolve(proof: &Proof) -> [u8; 20] {
    match proof {
        Proof::Response(response) => hash160(response),
        Proof::Pair(left, right) => {
            let mut buf = Vec::with_capacity(40);
            buf.extend_from_slice(&resolve_side(left));
            buf.extend_from_slice(&resolve_side(right));
            hash160(&buf)
        }
    }
}

fn resolve_side(side: &ProofSide) -> [u8; 20] {
    match side {
        ProofSide::Sibling(hash) => *hash,
        ProofSide::Nested(proof) => resolve(proof),
    }
}

fn proof_depth(proof: &Proof) -> Result<u32, AuditError> {
    match proof {
        Proof::Response(_) => Ok(0),
        Proof::Pair(left, right) => {
            let nested = match (left.as_ref(), right.as_ref()) {
                (ProofSide::Nested(n), _) => n,
                (_, ProofSide::Nested(n)) => n,
                _ => return Err(AuditError::MalformedProof),
            };
            Ok(1 + proof_depth(nested)?)
        }
    }
}

/// Renter side: recomputes the root from `proof` and returns `(computed, expected)` for
/// the caller to compare. Depth mismatch is a hard error, matching §4.1's rule that it
/// rejects rather than silently fails open.
pub fn verify(proof: &Proof, depth: u32, expected_root: [u8; 20]) -> Result<([u8; 20], [u8; 20]), AuditError> {
    let actual = proof_depth(proof)?;
    if actual != depth {
        return Err(AuditError::DepthMismatch { actual, expected: depth });
    }
    Ok((resolve(proof), expected_root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_matches_scenario_s3() {
        let shard = b"hello storj";
        let (private, public) = AuditGenerator::generate(12, &shard[..]).await.unwrap();
        assert_eq!(private.challenges.len(), 12);
        assert_eq!(public.leaves.len(), 16); // padded to next power of two

        let challenge = private.challenges[5];
        let (proof, depth) = build_proof(&public.leaves, &challenge, shard).unwrap();
        assert_eq!(depth, private.depth);

        let (computed, expected) = verify(&proof, private.depth, private.root).unwrap();
        assert_eq!(computed, expected);
    }

    #[test]
    fn unknown_challenge_is_rejected() {
        let (private, public) = {
            let mut gen = AuditGenerator::new(4);
            gen.update(b"shard bytes");
            gen.finalize()
        };
        let bogus = Challenge([0xffu8; 16]);
        assert!(!private.challenges.contains(&bogus));
        let err = build_proof(&public.leaves, &bogus, b"shard bytes").unwrap_err();
        assert!(matches!(err, AuditError::UnknownChallenge));
    }

    #[test]
    fn depth_mismatch_is_rejected() {
        let mut gen = AuditGenerator::new(4);
        gen.update(b"data");
        let (private, public) = gen.finalize();
        let (proof, _depth) = build_proof(&public.leaves, &private.challenges[0], b"data").unwrap();
        let err = verify(&proof, private.depth + 1, private.root).unwrap_err();
        assert!(matches!(err, AuditError::DepthMismatch { .. }));
    }

    #[test]
    fn every_challenge_over_the_shard_verifies() {
        let mut gen = AuditGenerator::new(7);
        gen.update(b"abc");
        gen.update(b"def");
        let (private, public) = gen.finalize();
        for challenge in &private.challenges {
            let (proof, depth) = build_proof(&public.leaves, challenge, b"abcdef").unwrap();
            let (computed, expected) = verify(&proof, depth, private.root).unwrap();
            assert_eq!(computed, expected);
        }
    }
}
