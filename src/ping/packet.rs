//! ICMP echo header access and internet checksum arithmetic.
//!
//! Layout shared by ICMPv4 (RFC 792) and ICMPv6 (RFC 4443) echo messages:
//!
//! ```text
//!  0      1      2      3      4      5      6      7
//! +------+------+------+------+------+------+------+------+
//! | type | code |  checksum   |  identifier |  sequence   |
//! +------+------+------+------+------+------+------+------+
//! ```

use crate::base::destination::IpFamily;
use crate::base::neterror::NetError;

pub const ECHO_HEADER_LEN: usize = 8;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

pub fn is_echo_reply(family: IpFamily, icmp_type: u8) -> bool {
    match family {
        IpFamily::V4 => icmp_type == ICMPV4_ECHO_REPLY,
        IpFamily::V6 => icmp_type == ICMPV6_ECHO_REPLY,
    }
}

/// One's complement sum of two 16-bit words.
#[inline]
pub fn ones_add(a: u16, b: u16) -> u16 {
    let sum = a as u32 + b as u32;
    ((sum & 0xffff) + (sum >> 16)) as u16
}

/// Internet checksum (RFC 1071) of `data`. Zero for a packet whose checksum
/// field is already correct.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    let mut sum = chunks
        .by_ref()
        .fold(0u16, |acc, word| ones_add(acc, u16::from_be_bytes([word[0], word[1]])));
    if let [last] = chunks.remainder() {
        sum = ones_add(sum, u16::from_be_bytes([*last, 0]));
    }
    !sum
}

/// Checksum after replacing one 16-bit field from `old` to `new` (RFC 1624).
#[inline]
pub fn adjust_checksum(checksum: u16, old: u16, new: u16) -> u16 {
    !ones_add(ones_add(!checksum, !old), new)
}

/// Mutable view of an echo request/reply header.
#[derive(Debug)]
pub struct EchoPacket<'a> {
    buf: &'a mut [u8],
}

impl<'a> EchoPacket<'a> {
    pub fn new(buf: &'a mut [u8]) -> Result<Self, NetError> {
        if buf.len() < ECHO_HEADER_LEN {
            return Err(NetError::InvalidPacket);
        }
        Ok(Self { buf })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buf[0]
    }

    pub fn set_icmp_type(&mut self, icmp_type: u8) {
        self.buf[0] = icmp_type;
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(2)
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.write_u16(2, checksum);
    }

    pub fn ident(&self) -> u16 {
        self.read_u16(4)
    }

    pub fn set_ident(&mut self, ident: u16) {
        self.write_u16(4, ident);
    }

    pub fn sequence(&self) -> u16 {
        self.read_u16(6)
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        self.write_u16(6, sequence);
    }

    /// Rewrite the identifier and patch the checksum incrementally.
    pub fn set_ident_with_checksum_update(&mut self, ident: u16) {
        let checksum = adjust_checksum(self.checksum(), self.ident(), ident);
        self.set_ident(ident);
        self.set_checksum(checksum);
    }

    /// Rewrite the sequence and patch the checksum incrementally.
    pub fn set_sequence_with_checksum_update(&mut self, sequence: u16) {
        let checksum = adjust_checksum(self.checksum(), self.sequence(), sequence);
        self.set_sequence(sequence);
        self.set_checksum(checksum);
    }

    /// Recompute the checksum over the whole message (ICMPv4 only; ICMPv6
    /// needs the pseudo-header and is left to the stack).
    pub fn update_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = internet_checksum(self.buf);
        self.set_checksum(checksum);
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf
    }

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
    }

    fn write_u16(&mut self, at: usize, value: u16) {
        self.buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }
}
