//! SSTP control packet codec.
//!
//! An SSTP packet is `[type:u16][total_length:u16][body]`. DATA packets
//! carry a PPP frame (see [`super::ppp`]); CONTROL packets carry
//! `[message_type:u16][attribute_count:u16]` followed by attributes.

use bytes::{BufMut, BytesMut};

use super::{read_bytes, read_u16};
use crate::error::{Error, Result};

/// Packet type word for DATA packets.
pub const PACKET_DATA: u16 = 0x1000;

/// Packet type word for CONTROL packets.
pub const PACKET_CONTROL: u16 = 0x1001;

/// Size of the SSTP packet header.
pub const HEADER_LEN: usize = 4;

/// Hash-protocol byte for SHA-1 crypto binding.
pub const HASH_PROTOCOL_SHA1: u8 = 1;

/// Hash-protocol byte for SHA-256 crypto binding.
pub const HASH_PROTOCOL_SHA256: u8 = 2;

/// SSTP control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    CallConnectRequest = 1,
    CallConnectAck = 2,
    CallConnectNak = 3,
    CallConnected = 4,
    CallAbort = 5,
    CallDisconnect = 6,
    CallDisconnectAck = 7,
    EchoRequest = 8,
    EchoResponse = 9,
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::CallConnectRequest),
            2 => Ok(Self::CallConnectAck),
            3 => Ok(Self::CallConnectNak),
            4 => Ok(Self::CallConnected),
            5 => Ok(Self::CallAbort),
            6 => Ok(Self::CallDisconnect),
            7 => Ok(Self::CallDisconnectAck),
            8 => Ok(Self::EchoRequest),
            9 => Ok(Self::EchoResponse),
            other => Err(Error::unknown(format!("SSTP message type 0x{other:04X}"))),
        }
    }
}

/// Attribute IDs.
pub mod attribute_ids {
    pub const ENCAPSULATED_PROTOCOL: u8 = 1;
    pub const STATUS_INFO: u8 = 2;
    pub const CRYPTO_BINDING: u8 = 3;
    pub const CRYPTO_BINDING_REQUEST: u8 = 4;
}

/// Crypto-Binding-Request attribute body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoBindingRequest {
    /// Bitmask of hash protocols the server accepts (bit 0 SHA-1, bit 1 SHA-256)
    pub hash_bitmask: u8,
    /// Server nonce to echo in the Crypto-Binding
    pub nonce: [u8; 32],
}

/// Crypto-Binding attribute body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoBinding {
    /// Chosen hash protocol (1 SHA-1, 2 SHA-256)
    pub hash_protocol: u8,
    /// Nonce echoed from the Call-Connect-Ack
    pub nonce: [u8; 32],
    /// Server leaf certificate hash, zero-padded to 32 bytes for SHA-1
    pub cert_hash: [u8; 32],
    /// Compound MAC over the Call-Connected packet
    pub compound_mac: [u8; 32],
}

/// One SSTP control attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Encapsulated-Protocol-Id; value 1 means PPP
    EncapsulatedProtocol(u16),
    /// Status-Info, kept raw
    StatusInfo(Vec<u8>),
    /// Crypto-Binding (client → server, inside Call-Connected)
    CryptoBinding(CryptoBinding),
    /// Crypto-Binding-Request (server → client, inside Call-Connect-Ack)
    CryptoBindingRequest(CryptoBindingRequest),
    /// Any attribute we do not interpret, preserved verbatim
    Unknown { id: u8, data: Vec<u8> },
}

impl Attribute {
    /// Attribute ID on the wire.
    pub fn id(&self) -> u8 {
        match self {
            Attribute::EncapsulatedProtocol(_) => attribute_ids::ENCAPSULATED_PROTOCOL,
            Attribute::StatusInfo(_) => attribute_ids::STATUS_INFO,
            Attribute::CryptoBinding(_) => attribute_ids::CRYPTO_BINDING,
            Attribute::CryptoBindingRequest(_) => attribute_ids::CRYPTO_BINDING_REQUEST,
            Attribute::Unknown { id, .. } => *id,
        }
    }

    /// Body length, without the 4-byte attribute header.
    fn body_len(&self) -> usize {
        match self {
            Attribute::EncapsulatedProtocol(_) => 2,
            Attribute::StatusInfo(data) => data.len(),
            Attribute::CryptoBinding(_) => 100,
            Attribute::CryptoBindingRequest(_) => 36,
            Attribute::Unknown { data, .. } => data.len(),
        }
    }

    fn parse(id: u8, body: &[u8]) -> Result<Self> {
        match id {
            attribute_ids::ENCAPSULATED_PROTOCOL => {
                if body.len() != 2 {
                    return Err(Error::parse(format!(
                        "Encapsulated-Protocol-Id body is {} bytes",
                        body.len()
                    )));
                }
                Ok(Attribute::EncapsulatedProtocol(read_u16(body, 0)?))
            }
            attribute_ids::STATUS_INFO => Ok(Attribute::StatusInfo(body.to_vec())),
            attribute_ids::CRYPTO_BINDING => {
                if body.len() != 100 {
                    return Err(Error::parse(format!(
                        "Crypto-Binding body is {} bytes",
                        body.len()
                    )));
                }
                let mut nonce = [0u8; 32];
                let mut cert_hash = [0u8; 32];
                let mut compound_mac = [0u8; 32];
                nonce.copy_from_slice(&body[4..36]);
                cert_hash.copy_from_slice(&body[36..68]);
                compound_mac.copy_from_slice(&body[68..100]);
                Ok(Attribute::CryptoBinding(CryptoBinding {
                    hash_protocol: body[3],
                    nonce,
                    cert_hash,
                    compound_mac,
                }))
            }
            attribute_ids::CRYPTO_BINDING_REQUEST => {
                if body.len() != 36 {
                    return Err(Error::parse(format!(
                        "Crypto-Binding-Request body is {} bytes",
                        body.len()
                    )));
                }
                let mut nonce = [0u8; 32];
                nonce.copy_from_slice(&body[4..36]);
                Ok(Attribute::CryptoBindingRequest(CryptoBindingRequest {
                    hash_bitmask: body[3],
                    nonce,
                }))
            }
            other => Ok(Attribute::Unknown {
                id: other,
                data: body.to_vec(),
            }),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(0); // reserved
        buf.put_u8(self.id());
        buf.put_u16((4 + self.body_len()) as u16);
        match self {
            Attribute::EncapsulatedProtocol(proto) => buf.put_u16(*proto),
            Attribute::StatusInfo(data) => buf.put_slice(data),
            Attribute::CryptoBinding(cb) => {
                buf.put_slice(&[0, 0, 0]);
                buf.put_u8(cb.hash_protocol);
                buf.put_slice(&cb.nonce);
                buf.put_slice(&cb.cert_hash);
                buf.put_slice(&cb.compound_mac);
            }
            Attribute::CryptoBindingRequest(req) => {
                buf.put_slice(&[0, 0, 0]);
                buf.put_u8(req.hash_bitmask);
                buf.put_slice(&req.nonce);
            }
            Attribute::Unknown { data, .. } => buf.put_slice(data),
        }
    }
}

/// A parsed SSTP CONTROL packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// Message type word
    pub message_type: MessageType,
    /// Attributes in wire order
    pub attributes: Vec<Attribute>,
}

impl ControlPacket {
    /// A control packet without attributes.
    pub fn bare(message_type: MessageType) -> Self {
        Self {
            message_type,
            attributes: Vec::new(),
        }
    }

    /// A control packet with attributes.
    pub fn with_attributes(message_type: MessageType, attributes: Vec<Attribute>) -> Self {
        Self {
            message_type,
            attributes,
        }
    }

    /// The standard Call-Connect-Request (one Encapsulated-Protocol-Id = PPP).
    pub fn call_connect_request() -> Self {
        Self::with_attributes(
            MessageType::CallConnectRequest,
            vec![Attribute::EncapsulatedProtocol(1)],
        )
    }

    /// Parse a complete CONTROL packet, SSTP header included.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if read_u16(buf, 0)? != PACKET_CONTROL {
            return Err(Error::parse("not an SSTP control packet"));
        }
        let total = read_u16(buf, 2)? as usize;
        if total != buf.len() {
            return Err(Error::parse(format!(
                "SSTP length field {} disagrees with packet size {}",
                total,
                buf.len()
            )));
        }

        let message_type = MessageType::try_from(read_u16(buf, 4)?)?;
        let count = read_u16(buf, 6)? as usize;

        let mut attributes = Vec::with_capacity(count);
        let mut off = 8;
        for _ in 0..count {
            // reserved byte at off is ignored on read
            let id = *read_bytes(buf, off + 1, 1)?.first().unwrap();
            let attr_len = read_u16(buf, off + 2)? as usize;
            if attr_len < 4 {
                return Err(Error::parse(format!(
                    "attribute length {attr_len} below header size"
                )));
            }
            let body = read_bytes(buf, off + 4, attr_len - 4)?;
            attributes.push(Attribute::parse(id, body)?);
            off += attr_len;
        }
        if off != buf.len() {
            return Err(Error::parse(format!(
                "{} trailing bytes after attributes",
                buf.len() - off
            )));
        }

        Ok(Self {
            message_type,
            attributes,
        })
    }

    /// Serialize to a complete CONTROL packet, SSTP header included.
    pub fn write(&self) -> Vec<u8> {
        let body: usize = self.attributes.iter().map(|a| 4 + a.body_len()).sum();
        let total = (HEADER_LEN + 4 + body) as u16;

        let mut buf = BytesMut::with_capacity(total as usize);
        buf.put_u16(PACKET_CONTROL);
        buf.put_u16(total);
        buf.put_u16(self.message_type as u16);
        buf.put_u16(self.attributes.len() as u16);
        for attr in &self.attributes {
            attr.write(&mut buf);
        }
        buf.to_vec()
    }

    /// The first attribute, if exactly one is expected by the caller.
    pub fn single_attribute(&self) -> Option<&Attribute> {
        match self.attributes.as_slice() {
            [attr] => Some(attr),
            _ => None,
        }
    }
}
