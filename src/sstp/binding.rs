//! SSTP crypto binding.
//!
//! The Call-Connected packet ties the authenticated PPP session to the
//! TLS leaf certificate: a compound MAC over the whole packet, keyed by
//! a key derived from the higher-layer authentication key.

use crate::codec::sstp::{Attribute, ControlPacket, CryptoBinding, MessageType};
use crate::crypto::{self, HashProtocol};

/// Seed string for the compound MAC key derivation.
const CMK_SEED: &[u8] = b"SSTP inner method derived CMK";

/// Offset of the compound MAC inside the serialized Call-Connected
/// packet: SSTP header (4) + message header (4) + attribute header (4)
/// + reserved/hash (4) + nonce (32) + cert hash (32).
const CMAC_OFFSET: usize = 80;

/// Derive the compound MAC key from the HLAK:
/// `HMAC(hlak, seed || LE16(mac length) || 0x01)`.
pub fn compound_mac_key(proto: HashProtocol, hlak: &[u8]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(CMK_SEED.len() + 3);
    seed.extend_from_slice(CMK_SEED);
    seed.extend_from_slice(&(proto.mac_len() as u16).to_le_bytes());
    seed.push(0x01);
    crypto::hmac(proto, hlak, &seed)
}

/// Build the complete Call-Connected packet: Crypto-Binding attribute
/// with the echoed nonce, the certificate hash, and the compound MAC
/// computed over the packet with a zeroed MAC field.
pub fn build_call_connected(
    proto: HashProtocol,
    hlak: &[u8],
    nonce: [u8; 32],
    cert_hash: [u8; 32],
) -> Vec<u8> {
    let packet = ControlPacket::with_attributes(
        MessageType::CallConnected,
        vec![Attribute::CryptoBinding(CryptoBinding {
            hash_protocol: proto.wire_byte(),
            nonce,
            cert_hash,
            compound_mac: [0u8; 32],
        })],
    );

    let mut wire = packet.write();
    let cmk = compound_mac_key(proto, hlak);
    let cmac = crypto::hmac(proto, &cmk, &wire);
    // SHA-1 MACs occupy the first 20 bytes; the rest stays zero.
    wire[CMAC_OFFSET..CMAC_OFFSET + cmac.len()].copy_from_slice(&cmac);
    wire
}
