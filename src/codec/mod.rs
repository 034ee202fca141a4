//! Wire codecs for the tunnel protocols.
//!
//! Everything on the wire is big-endian. Parsers return
//! `Error::ParsingFailed` on any size mismatch; writers always produce
//! buffers of exactly the declared length so that `write(parse(b)) == b`
//! holds for every valid input.

pub mod ppp;
pub mod sstp;

use crate::error::{Error, Result};

/// Read a big-endian u16 at `off`, or fail with a parse error.
pub(crate) fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    let bytes = buf
        .get(off..off + 2)
        .ok_or_else(|| Error::parse(format!("short read for u16 at offset {off}")))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read exactly `len` bytes at `off`, or fail with a parse error.
pub(crate) fn read_bytes<'a>(buf: &'a [u8], off: usize, len: usize) -> Result<&'a [u8]> {
    buf.get(off..off + len)
        .ok_or_else(|| Error::parse(format!("short read for {len} bytes at offset {off}")))
}
