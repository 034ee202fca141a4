//! PPP frame and option codec - RFC 1661 framing inside SSTP DATA packets.
//!
//! PPP-over-SSTP keeps the fixed `FF 03` HDLC address/control prefix.
//! A control frame is `[FF 03][protocol][code][id][length][payload]`
//! where `length` covers code, id, length and payload.

use bytes::{BufMut, BytesMut};

use super::{read_bytes, read_u16};
use crate::error::{Error, Result};

/// HDLC address/control prefix retained by PPP-over-SSTP.
pub const HDLC_HEADER: [u8; 2] = [0xFF, 0x03];

/// Size of the HDLC prefix plus the protocol field.
pub const PPP_HEADER_LEN: usize = 4;

/// Size of the code/id/length header of a PPP control frame.
pub const CONTROL_HEADER_LEN: usize = 4;

/// PPP protocol numbers.
pub mod protocols {
    /// Internet Protocol version 4
    pub const IPV4: u16 = 0x0021;
    /// Internet Protocol version 6
    pub const IPV6: u16 = 0x0057;
    /// Internet Protocol Control Protocol
    pub const IPCP: u16 = 0x8021;
    /// IPv6 Control Protocol
    pub const IPV6CP: u16 = 0x8057;
    /// Link Control Protocol
    pub const LCP: u16 = 0xC021;
    /// Password Authentication Protocol
    pub const PAP: u16 = 0xC023;
    /// Challenge Handshake Authentication Protocol
    pub const CHAP: u16 = 0xC223;
    /// Extensible Authentication Protocol
    pub const EAP: u16 = 0xC227;
}

/// PPP frame codes shared by the configure protocols (RFC 1661 §5).
pub mod codes {
    pub const CONFIGURE_REQUEST: u8 = 1;
    pub const CONFIGURE_ACK: u8 = 2;
    pub const CONFIGURE_NAK: u8 = 3;
    pub const CONFIGURE_REJECT: u8 = 4;
    pub const TERMINATE_REQUEST: u8 = 5;
    pub const TERMINATE_ACK: u8 = 6;
    pub const CODE_REJECT: u8 = 7;
    pub const PROTOCOL_REJECT: u8 = 8;
    pub const ECHO_REQUEST: u8 = 9;
    pub const ECHO_REPLY: u8 = 10;
    pub const DISCARD_REQUEST: u8 = 11;
}

/// A parsed PPP control frame.
///
/// `payload` is everything after the code/id/length header: an option
/// list for Configure frames, protocol-specific data otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PppPacket {
    /// PPP protocol number (LCP, PAP, IPCP, ...)
    pub protocol: u16,
    /// Frame code
    pub code: u8,
    /// Frame identifier
    pub id: u8,
    /// Frame body
    pub payload: Vec<u8>,
}

impl PppPacket {
    /// Create a frame from raw payload bytes.
    pub fn new(protocol: u16, code: u8, id: u8, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            code,
            id,
            payload,
        }
    }

    /// Create a Configure-class frame from an option list.
    pub fn with_options(protocol: u16, code: u8, id: u8, options: &[RawOption]) -> Self {
        Self::new(protocol, code, id, write_options(options))
    }

    /// Parse a PPP frame starting at the HDLC header.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if read_bytes(buf, 0, 2)? != HDLC_HEADER {
            return Err(Error::parse("missing HDLC header"));
        }
        let protocol = read_u16(buf, 2)?;
        let code = *read_bytes(buf, 4, 1)?.first().unwrap();
        let id = *read_bytes(buf, 5, 1)?.first().unwrap();
        let length = read_u16(buf, 6)? as usize;

        if length < CONTROL_HEADER_LEN {
            return Err(Error::parse(format!("PPP length {length} below header size")));
        }
        if buf.len() != PPP_HEADER_LEN + length {
            return Err(Error::parse(format!(
                "PPP length field {} disagrees with frame size {}",
                length,
                buf.len()
            )));
        }

        let payload = buf[PPP_HEADER_LEN + CONTROL_HEADER_LEN..].to_vec();
        Ok(Self {
            protocol,
            code,
            id,
            payload,
        })
    }

    /// Serialize to the PPP portion only (HDLC header onward).
    pub fn write(&self) -> Vec<u8> {
        let length = (CONTROL_HEADER_LEN + self.payload.len()) as u16;
        let mut buf = BytesMut::with_capacity(PPP_HEADER_LEN + length as usize);
        buf.put_slice(&HDLC_HEADER);
        buf.put_u16(self.protocol);
        buf.put_u8(self.code);
        buf.put_u8(self.id);
        buf.put_u16(length);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Serialize to a complete SSTP DATA packet.
    pub fn write_data_packet(&self) -> Vec<u8> {
        wrap_data_packet(&self.write())
    }

    /// Parse the payload as a Configure option list.
    pub fn options(&self) -> Result<Vec<RawOption>> {
        parse_options(&self.payload)
    }
}

/// Wrap an already-framed PPP portion (HDLC onward) in an SSTP DATA header.
pub fn wrap_data_packet(ppp: &[u8]) -> Vec<u8> {
    let total = (super::sstp::HEADER_LEN + ppp.len()) as u16;
    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_u16(super::sstp::PACKET_DATA);
    buf.put_u16(total);
    buf.put_slice(ppp);
    buf.to_vec()
}

/// Wrap an L3 datagram in SSTP DATA + HDLC + protocol headers.
pub fn wrap_datagram(protocol: u16, datagram: &[u8]) -> Vec<u8> {
    let total = (super::sstp::HEADER_LEN + PPP_HEADER_LEN + datagram.len()) as u16;
    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_u16(super::sstp::PACKET_DATA);
    buf.put_u16(total);
    buf.put_slice(&HDLC_HEADER);
    buf.put_u16(protocol);
    buf.put_slice(datagram);
    buf.to_vec()
}

/// One Configure option, kept raw so unknown types survive a round trip
/// byte-for-byte and in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    /// Option type
    pub kind: u8,
    /// Option value (without the two TLV header bytes)
    pub data: Vec<u8>,
}

impl RawOption {
    /// Create an option from its value bytes.
    pub fn new(kind: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// An option holding a single big-endian u16.
    pub fn u16(kind: u8, value: u16) -> Self {
        Self::new(kind, value.to_be_bytes().to_vec())
    }

    /// Interpret the value as a big-endian u16.
    pub fn as_u16(&self) -> Result<u16> {
        read_u16(&self.data, 0)
    }

    /// Wire length of this option including the TLV header.
    pub fn wire_len(&self) -> usize {
        2 + self.data.len()
    }
}

/// Parse a Configure option list; the whole buffer must be consumed.
pub fn parse_options(buf: &[u8]) -> Result<Vec<RawOption>> {
    let mut options = Vec::new();
    let mut off = 0;

    while off < buf.len() {
        let kind = *read_bytes(buf, off, 1)?.first().unwrap();
        let len = *read_bytes(buf, off + 1, 1)?.first().unwrap() as usize;
        if len < 2 {
            return Err(Error::parse(format!("option length {len} below TLV header")));
        }
        let data = read_bytes(buf, off + 2, len - 2)?.to_vec();
        options.push(RawOption { kind, data });
        off += len;
    }

    Ok(options)
}

/// Serialize a Configure option list.
pub fn write_options(options: &[RawOption]) -> Vec<u8> {
    let total: usize = options.iter().map(RawOption::wire_len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for opt in options {
        buf.put_u8(opt.kind);
        buf.put_u8(opt.wire_len() as u8);
        buf.put_slice(&opt.data);
    }
    buf.to_vec()
}

/// Find the first option of a given type.
pub fn find_option<'a>(options: &'a [RawOption], kind: u8) -> Option<&'a RawOption> {
    options.iter().find(|o| o.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lcp_configure_request() {
        // MRU 1500 + magic number
        let frame = [
            0xFF, 0x03, 0xC0, 0x21, 0x01, 0x07, 0x00, 0x0E, 0x01, 0x04, 0x05, 0xDC, 0x05, 0x06,
            0x11, 0x22, 0x33, 0x44,
        ];

        let packet = PppPacket::parse(&frame).unwrap();
        assert_eq!(packet.protocol, protocols::LCP);
        assert_eq!(packet.code, codes::CONFIGURE_REQUEST);
        assert_eq!(packet.id, 7);

        let options = packet.options().unwrap();
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].as_u16().unwrap(), 1500);
        assert_eq!(options[1].data, vec![0x11, 0x22, 0x33, 0x44]);

        assert_eq!(packet.write(), frame);
    }

    #[test]
    fn length_field_must_match_frame_size() {
        let mut frame = vec![
            0xFF, 0x03, 0xC0, 0x21, 0x01, 0x01, 0x00, 0x08, 0x01, 0x04, 0x05, 0xDC,
        ];
        assert!(PppPacket::parse(&frame).is_ok());

        frame[7] = 0x09; // length disagrees with buffer
        assert!(PppPacket::parse(&frame).is_err());
    }

    #[test]
    fn rejects_missing_hdlc_header() {
        let frame = [0x00, 0x03, 0xC0, 0x21, 0x01, 0x01, 0x00, 0x04];
        assert!(PppPacket::parse(&frame).is_err());
    }

    #[test]
    fn unknown_options_survive_round_trip_in_order() {
        // known MRU, unknown type 0x99, known magic
        let payload = [
            0x01, 0x04, 0x05, 0xDC, 0x99, 0x03, 0xAB, 0x05, 0x06, 0x01, 0x02, 0x03, 0x04,
        ];
        let options = parse_options(&payload).unwrap();
        assert_eq!(options.len(), 3);
        assert_eq!(options[1].kind, 0x99);
        assert_eq!(write_options(&options), payload);
    }

    #[test]
    fn malformed_option_length_fails() {
        assert!(parse_options(&[0x01, 0x01]).is_err());
        assert!(parse_options(&[0x01, 0x06, 0x05, 0xDC]).is_err());
    }

    #[test]
    fn datagram_wrap_layout() {
        let ip = [0x45, 0x00, 0x00, 0x14];
        let packet = wrap_datagram(protocols::IPV4, &ip);
        assert_eq!(&packet[..4], &[0x10, 0x00, 0x00, 0x0C]);
        assert_eq!(&packet[4..8], &[0xFF, 0x03, 0x00, 0x21]);
        assert_eq!(&packet[8..], &ip);
    }

    #[test]
    fn data_packet_round_trip() {
        let packet = PppPacket::with_options(
            protocols::IPCP,
            codes::CONFIGURE_REQUEST,
            3,
            &[RawOption::new(0x03, vec![10, 0, 0, 5])],
        );
        let wire = packet.write_data_packet();
        // SSTP header + HDLC + protocol + code/id/len + option
        assert_eq!(wire.len(), 4 + 4 + 4 + 6);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]) as usize, wire.len());

        let back = PppPacket::parse(&wire[4..]).unwrap();
        assert_eq!(back, packet);
    }
}
