//! MS-CHAPv2 computations - RFC 2759, key derivation per RFC 3079.
//!
//! The NT password hash is MD4 over the UTF-16LE password; the 24-byte
//! challenge response is three single-block DES encryptions of an 8-byte
//! challenge hash under the 21-byte zero-padded password hash.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use sha1::{Digest, Sha1};

use super::md4::Md4;

/// "Magic server to client signing constant"
const MAGIC1: &[u8] = &[
    0x4D, 0x61, 0x67, 0x69, 0x63, 0x20, 0x73, 0x65, 0x72, 0x76, 0x65, 0x72, 0x20, 0x74, 0x6F,
    0x20, 0x63, 0x6C, 0x69, 0x65, 0x6E, 0x74, 0x20, 0x73, 0x69, 0x67, 0x6E, 0x69, 0x6E, 0x67,
    0x20, 0x63, 0x6F, 0x6E, 0x73, 0x74, 0x61, 0x6E, 0x74,
];

/// "Pad to make it do more than one iteration"
const MAGIC2: &[u8] = &[
    0x50, 0x61, 0x64, 0x20, 0x74, 0x6F, 0x20, 0x6D, 0x61, 0x6B, 0x65, 0x20, 0x69, 0x74, 0x20,
    0x64, 0x6F, 0x20, 0x6D, 0x6F, 0x72, 0x65, 0x20, 0x74, 0x68, 0x61, 0x6E, 0x20, 0x6F, 0x6E,
    0x65, 0x20, 0x69, 0x74, 0x65, 0x72, 0x61, 0x74, 0x69, 0x6F, 0x6E,
];

/// "This is the MPPE Master Key"
const MASTER_KEY_MAGIC: &[u8] = b"This is the MPPE Master Key";

/// MD4 of the UTF-16LE password (NtPasswordHash).
pub fn nt_password_hash(password: &str) -> [u8; 16] {
    let mut utf16 = Vec::with_capacity(password.len() * 2);
    for unit in password.encode_utf16() {
        utf16.extend_from_slice(&unit.to_le_bytes());
    }
    Md4::hash(&utf16)
}

/// First 8 bytes of SHA1(PeerChallenge | AuthenticatorChallenge | UserName).
pub fn challenge_hash(
    peer_challenge: &[u8; 16],
    authenticator_challenge: &[u8; 16],
    username: &str,
) -> [u8; 8] {
    let mut hasher = Sha1::new();
    hasher.update(peer_challenge);
    hasher.update(authenticator_challenge);
    hasher.update(username.as_bytes());
    let digest = hasher.finalize();

    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Expand a 7-byte key to the 8-byte DES key layout (parity bits unset;
/// the cipher ignores them).
fn expand_des_key(key7: &[u8]) -> [u8; 8] {
    [
        key7[0],
        (key7[0] << 7) | (key7[1] >> 1),
        (key7[1] << 6) | (key7[2] >> 2),
        (key7[2] << 5) | (key7[3] >> 3),
        (key7[3] << 4) | (key7[4] >> 4),
        (key7[4] << 3) | (key7[5] >> 5),
        (key7[5] << 2) | (key7[6] >> 6),
        key7[6] << 1,
    ]
}

/// One DES block encryption of `clear` under a 7-byte key.
fn des_encrypt_block(key7: &[u8], clear: &[u8; 8]) -> [u8; 8] {
    let key = expand_des_key(key7);
    let cipher = Des::new_from_slice(&key).expect("DES key is always 8 bytes");
    let mut block = (*clear).into();
    cipher.encrypt_block(&mut block);
    block.into()
}

/// The 24-byte ChallengeResponse (RFC 2759 §8.5).
pub fn challenge_response(challenge: &[u8; 8], password_hash: &[u8; 16]) -> [u8; 24] {
    let mut zhash = [0u8; 21];
    zhash[..16].copy_from_slice(password_hash);

    let mut response = [0u8; 24];
    for i in 0..3 {
        let block = des_encrypt_block(&zhash[i * 7..(i + 1) * 7], challenge);
        response[i * 8..(i + 1) * 8].copy_from_slice(&block);
    }
    response
}

/// The full 24-byte NT-Response for a Response packet.
pub fn nt_response(
    authenticator_challenge: &[u8; 16],
    peer_challenge: &[u8; 16],
    username: &str,
    password: &str,
) -> [u8; 24] {
    let challenge = challenge_hash(peer_challenge, authenticator_challenge, username);
    let hash = nt_password_hash(password);
    challenge_response(&challenge, &hash)
}

/// The "S=<40 hex digits>" string the server must send back in Success
/// (RFC 2759 §8.7).
pub fn authenticator_response(
    password: &str,
    nt_response: &[u8; 24],
    peer_challenge: &[u8; 16],
    authenticator_challenge: &[u8; 16],
    username: &str,
) -> String {
    let password_hash = nt_password_hash(password);
    let password_hash_hash = Md4::hash(&password_hash);

    let mut hasher = Sha1::new();
    hasher.update(password_hash_hash);
    hasher.update(nt_response);
    hasher.update(MAGIC1);
    let digest = hasher.finalize();

    let challenge = challenge_hash(peer_challenge, authenticator_challenge, username);

    let mut hasher = Sha1::new();
    hasher.update(digest);
    hasher.update(challenge);
    hasher.update(MAGIC2);
    let response = hasher.finalize();

    let mut out = String::with_capacity(42);
    out.push_str("S=");
    for byte in response {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// The 16-byte MPPE master key (RFC 3079 §3.4), used as the
/// higher-layer authentication key for SSTP crypto binding.
pub fn master_key(password: &str, nt_response: &[u8; 24]) -> [u8; 16] {
    let password_hash = nt_password_hash(password);
    let password_hash_hash = Md4::hash(&password_hash);

    let mut hasher = Sha1::new();
    hasher.update(password_hash_hash);
    hasher.update(nt_response);
    hasher.update(MASTER_KEY_MAGIC);
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    // Shared vectors from RFC 2759 §9.2.
    const USERNAME: &str = "User";
    const PASSWORD: &str = "clientPass";
    const AUTH_CHALLENGE: [u8; 16] = [
        0x5B, 0x5D, 0x7C, 0x7D, 0x7B, 0x3F, 0x2F, 0x3E, 0x3C, 0x2C, 0x60, 0x21, 0x32, 0x26, 0x26,
        0x28,
    ];
    const PEER_CHALLENGE: [u8; 16] = [
        0x21, 0x40, 0x23, 0x24, 0x25, 0x5E, 0x26, 0x2A, 0x28, 0x29, 0x5F, 0x2B, 0x3A, 0x33, 0x7C,
        0x7E,
    ];
    const NT_RESPONSE: [u8; 24] = [
        0x82, 0x30, 0x9E, 0xCD, 0x8D, 0x70, 0x8B, 0x5E, 0xA0, 0x8F, 0xAA, 0x39, 0x81, 0xCD, 0x83,
        0x54, 0x42, 0x33, 0x11, 0x4A, 0x3D, 0x85, 0xD6, 0xDF,
    ];

    #[test]
    fn test_nt_password_hash() {
        let expected = [
            0x44, 0xEB, 0xBA, 0x8D, 0x53, 0x12, 0xB8, 0xD6, 0x11, 0x47, 0x44, 0x11, 0xF5, 0x69,
            0x89, 0xAE,
        ];
        assert_eq!(nt_password_hash(PASSWORD), expected);
    }

    #[test]
    fn test_challenge_hash() {
        let expected = [0xD0, 0x2E, 0x43, 0x86, 0xBC, 0xE9, 0x12, 0x26];
        assert_eq!(
            challenge_hash(&PEER_CHALLENGE, &AUTH_CHALLENGE, USERNAME),
            expected
        );
    }

    #[test]
    fn test_nt_response() {
        assert_eq!(
            nt_response(&AUTH_CHALLENGE, &PEER_CHALLENGE, USERNAME, PASSWORD),
            NT_RESPONSE
        );
    }

    #[test]
    fn test_authenticator_response() {
        let response = authenticator_response(
            PASSWORD,
            &NT_RESPONSE,
            &PEER_CHALLENGE,
            &AUTH_CHALLENGE,
            USERNAME,
        );
        assert_eq!(response, "S=407A5589115FD0D6209F510FE9C04566932CDA56");
    }

    #[test]
    fn test_master_key() {
        // RFC 3079 §3.5.3
        let expected = [
            0xFD, 0xEC, 0xE3, 0x71, 0x7A, 0x8C, 0x83, 0x8C, 0xB3, 0x88, 0xE5, 0x27, 0xAE, 0x3C,
            0xDD, 0x31,
        ];
        assert_eq!(master_key(PASSWORD, &NT_RESPONSE), expected);
    }
}
