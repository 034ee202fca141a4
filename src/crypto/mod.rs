//! Cryptographic utilities for authentication and crypto binding.
//!
//! This module provides:
//! - MD4 (for the MS-CHAPv2 NT password hash)
//! - MS-CHAPv2 response and key derivation
//! - Hash-protocol dispatch for the SSTP compound MAC

pub mod md4;
pub mod mschap;

pub use md4::Md4;

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::codec::sstp::{HASH_PROTOCOL_SHA1, HASH_PROTOCOL_SHA256};

/// Hash protocol negotiated for SSTP crypto binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashProtocol {
    Sha1,
    Sha256,
}

impl HashProtocol {
    /// The wire byte for the Crypto-Binding attribute.
    pub fn wire_byte(self) -> u8 {
        match self {
            HashProtocol::Sha1 => HASH_PROTOCOL_SHA1,
            HashProtocol::Sha256 => HASH_PROTOCOL_SHA256,
        }
    }

    /// MAC size in bytes.
    pub fn mac_len(self) -> usize {
        match self {
            HashProtocol::Sha1 => 20,
            HashProtocol::Sha256 => 32,
        }
    }
}

/// HMAC under the negotiated hash protocol. The result is the raw MAC,
/// 20 or 32 bytes.
pub fn hmac(proto: HashProtocol, key: &[u8], data: &[u8]) -> Vec<u8> {
    match proto {
        HashProtocol::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashProtocol::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Hash of the server leaf certificate, zero-padded to the fixed 32-byte
/// Crypto-Binding field.
pub fn cert_hash(proto: HashProtocol, der: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    match proto {
        HashProtocol::Sha1 => {
            let digest = Sha1::digest(der);
            out[..20].copy_from_slice(&digest);
        }
        HashProtocol::Sha256 => {
            let digest = Sha256::digest(der);
            out.copy_from_slice(&digest);
        }
    }
    out
}

/// Generate random bytes using a cryptographically secure RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate random bytes into a slice.
pub fn fill_random(dest: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(dest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha1_rfc2202_case1() {
        let key = [0x0Bu8; 20];
        let mac = hmac(HashProtocol::Sha1, &key, b"Hi There");
        let expected = [
            0xB6, 0x17, 0x31, 0x86, 0x55, 0x05, 0x72, 0x64, 0xE2, 0x8B, 0xC0, 0xB6, 0xFB, 0x37,
            0x8C, 0x8E, 0xF1, 0x46, 0xBE, 0x00,
        ];
        assert_eq!(mac, expected);
    }

    #[test]
    fn hmac_sha256_rfc4231_case1() {
        let key = [0x0Bu8; 20];
        let mac = hmac(HashProtocol::Sha256, &key, b"Hi There");
        let expected = [
            0xB0, 0x34, 0x4C, 0x61, 0xD8, 0xDB, 0x38, 0x53, 0x5C, 0xA8, 0xAF, 0xCE, 0xAF, 0x0B,
            0xF1, 0x2B, 0x88, 0x1D, 0xC2, 0x00, 0xC9, 0x83, 0x3D, 0xA7, 0x26, 0xE9, 0x37, 0x6C,
            0x2E, 0x32, 0xCF, 0xF7,
        ];
        assert_eq!(mac, expected);
    }

    #[test]
    fn sha1_cert_hash_is_zero_padded() {
        let hash = cert_hash(HashProtocol::Sha1, b"certificate");
        assert_eq!(&hash[20..], &[0u8; 12]);
        assert_ne!(&hash[..20], &[0u8; 20]);
    }

    #[test]
    fn random_bytes_differ() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }
}
