//! Key and SPI derivation for the GRE/IPsec and WireGuard drivers.
//!
//! These derivations are part of the wire-compatibility contract: both
//! endpoints of a tunnel must land on the same values without exchanging
//! anything beyond a shared passphrase (GRE/IPsec) or a public key
//! (WireGuard). None of this is forward-secret; see the module-level docs
//! in the tunnel driver for the limitations this implies.

use std::net::Ipv4Addr;

use md5::{Digest as Md5Digest, Md5};
use rand::RngCore;
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid base64 private key")]
    InvalidBase64,
    #[error("private key must decode to exactly 32 bytes")]
    InvalidKeyLength,
}

/// SHA-256 of an ASCII passphrase, formatted as `0x` followed by lowercase hex.
/// Used directly as the IPsec auth/enc key material.
pub fn hash_passphrase(passphrase: &str) -> String {
    let digest = Sha256::digest(passphrase.as_bytes());
    format!("0x{}", hex::encode(digest))
}

/// GRE demultiplexing key: the 32-bit wrapping sum of the ASCII codes of the
/// hex auth key string (the `0x...` form returned by [`hash_passphrase`]),
/// with the `0x` prefix stripped first. Deliberately weak; preserved for wire
/// compatibility with existing peers.
pub fn gre_key(hex_auth_key: &str) -> u32 {
    hex_auth_key
        .strip_prefix("0x")
        .unwrap_or(hex_auth_key)
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_add(b as u32))
}

/// A pair of IPsec SPIs, one per direction, agreed by both endpoints without
/// negotiation because both sort the endpoint pair the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiPair {
    pub spi_one: u32,
    pub spi_two: u32,
}

/// Derives the SPI pair for a tunnel between `a` and `b`. The endpoints are
/// sorted byte-wise over octets (larger first) before hashing the
/// dotted-decimal string concatenation, so both sides of the tunnel compute
/// identical values regardless of which is "local".
pub fn spi_pair(a: Ipv4Addr, b: Ipv4Addr) -> SpiPair {
    let (low, high) = if a.octets() <= b.octets() { (a, b) } else { (b, a) };

    let high_low = format!("{high}{low}");
    let low_high = format!("{low}{high}");

    SpiPair {
        spi_one: first_u32(&Md5::digest(high_low.as_bytes())),
        spi_two: first_u32(&Md5::digest(low_high.as_bytes())),
    }
}

fn first_u32(digest: &[u8]) -> u32 {
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A Curve25519 key pair for a WireGuard peer.
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generates a fresh WireGuard key pair: 32 random bytes, clamped per the
/// Curve25519 scalar convention, standard-base64 encoded.
pub fn generate_keypair() -> KeyPair {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    clamp(&mut bytes);

    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);

    KeyPair {
        private_key: encode_b64(&bytes),
        public_key: encode_b64(public.as_bytes()),
    }
}

/// Recomputes the public key for an existing base64-encoded private key.
pub fn public_from_private(private_key_b64: &str) -> Result<String, Error> {
    let bytes = decode_b64(private_key_b64)?;
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(encode_b64(public.as_bytes()))
}

fn clamp(bytes: &mut [u8; 32]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

fn encode_b64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_b64(s: &str) -> Result<[u8; 32], Error> {
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|_| Error::InvalidBase64)?;
    decoded.try_into().map_err(|_| Error::InvalidKeyLength)
}
