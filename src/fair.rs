//! Provably-fair outcome commitment and crash-point derivation.
//!
//! Each round commits to its outcome before betting opens: the server draws a
//! 256-bit seed, publishes `SHA-256(seed)`, and derives the crash point from
//! `HMAC-SHA-256(key = seed, msg = client_seed ∥ nonce)`. After the reveal
//! grace period anyone can rehash the seed and re-run [`crash_from_draw`] to
//! confirm the round was fixed at commit time.

use crate::error::{Error, Result};
use crate::types::Multiplier;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Bits of the HMAC digest interpreted as the uniform draw.
const DRAW_BITS: u32 = 52;

/// Everything the engine needs for one round, produced before betting opens.
#[derive(Debug, Clone)]
pub struct RoundFairness {
    pub server_seed: [u8; 32],
    pub server_seed_hash: [u8; 32],
    pub client_seed: String,
    pub nonce: u64,
    pub crash_point: Multiplier,
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Uniform 52-bit draw from the committed seeds.
pub fn draw(server_seed: &[u8; 32], client_seed: &str, nonce: u64) -> u64 {
    let mut mac = HmacSha256::new_from_slice(server_seed).expect("hmac accepts any key length");
    mac.update(client_seed.as_bytes());
    mac.update(&nonce.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) >> (64 - DRAW_BITS)
}

/// Crash multiplier (hundredths) for a 52-bit draw `x` and a house edge in
/// basis points.
///
/// Integer form of `max(1.00, (1 - h) · 2^52 / (2^52 - X))`, truncated to two
/// decimals: `P(crash ≥ m) ≈ (1 - h) / m`, giving a long-run house margin of
/// exactly `h`.
pub fn crash_from_draw(x: u64, edge_bp: u16) -> Multiplier {
    let e: u128 = 1 << DRAW_BITS;
    let num = (10_000 - edge_bp as u128) * e;
    let den = (e - x as u128) * 100;
    Multiplier::from_hundredths(((num / den) as u64).max(100))
}

pub fn derive_crash_point(
    server_seed: &[u8; 32],
    client_seed: &str,
    nonce: u64,
    edge_bp: u16,
) -> Multiplier {
    crash_from_draw(draw(server_seed, client_seed, nonce), edge_bp)
}

/// Audit check: the revealed seed must rehash to the commitment and reproduce
/// the stored crash point.
pub fn verify_round(
    server_seed: &[u8; 32],
    server_seed_hash: &[u8; 32],
    client_seed: &str,
    nonce: u64,
    crash_point: Multiplier,
    edge_bp: u16,
) -> bool {
    sha256(server_seed) == *server_seed_hash
        && derive_crash_point(server_seed, client_seed, nonce, edge_bp) == crash_point
}

/// Per-round seed source. Owns the monotonically increasing nonce.
pub struct FairnessOracle {
    edge_bp: u16,
    client_seed: String,
    nonce: u64,
}

impl FairnessOracle {
    pub fn new(edge_bp: u16, client_seed: impl Into<String>) -> Self {
        Self {
            edge_bp,
            client_seed: client_seed.into(),
            nonce: 0,
        }
    }

    /// Resume the nonce sequence after a restart.
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Produce seed material and crash point for the next round.
    ///
    /// Refuses (and leaves the nonce untouched) if the OS randomness source
    /// is unavailable; the engine pauses rather than run an uncommitted round.
    pub fn next_round(&mut self) -> Result<RoundFairness> {
        let mut server_seed = [0u8; 32];
        getrandom::getrandom(&mut server_seed)
            .map_err(|e| Error::FailedPrecondition(format!("entropy source unavailable: {e}")))?;

        let nonce = self.nonce;
        self.nonce += 1;

        Ok(RoundFairness {
            server_seed,
            server_seed_hash: sha256(&server_seed),
            client_seed: self.client_seed.clone(),
            nonce,
            crash_point: derive_crash_point(&server_seed, &self.client_seed, nonce, self.edge_bp),
        })
    }

    pub fn edge_bp(&self) -> u16 {
        self.edge_bp
    }
}
