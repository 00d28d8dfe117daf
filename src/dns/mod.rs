//! DNS message construction and reply decoding
//!
//! The builder turns a textual query descriptor (`"<name> <type>"`) into a
//! wire-format query message with a caller-chosen transaction id. Reply
//! decoding is header-only: the engine correlates by transaction id and
//! classifies by rcode, nothing else.

mod request;
mod tsig;

pub use request::{Builder, EdnsOption};
pub use tsig::TsigKey;

use thiserror::Error;

/// Largest plain UDP response we expect
pub const MAX_UDP_PACKET: usize = 512;

/// Largest message when EDNS is in play; also the advertised UDP payload
/// size in the OPT record
pub const MAX_EDNS_PACKET: usize = 4096;

/// Rcode names indexed by the low 4 bits of the header flags word.
pub const RCODE_STRINGS: [&str; 16] = [
    "NOERROR",
    "FORMERR",
    "SERVFAIL",
    "NXDOMAIN",
    "NOTIMP",
    "REFUSED",
    "YXDOMAIN",
    "YXRRSET",
    "NXRRSET",
    "NOTAUTH",
    "NOTZONE",
    "BADVERS",
    "RESERVED12",
    "RESERVED13",
    "RESERVED14",
    "RESERVED15",
];

/// Transaction id of a reply. Caller must have checked `buf.len() >= 4`.
#[inline]
pub fn reply_qid(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Rcode of a reply: the low 4 bits of the second header word.
#[inline]
pub fn reply_rcode(buf: &[u8]) -> u8 {
    buf[3] & 0x0F
}

/// DNS build errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("invalid query descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("domain name too long: {0}")]
    NameTooLong(String),

    #[error("label too long in name: {0}")]
    LabelTooLong(String),

    #[error("unknown query type: {0}")]
    UnknownType(String),

    #[error("invalid TSIG key: {0}")]
    InvalidTsigKey(String),

    #[error("invalid EDNS option: {0}")]
    InvalidEdnsOption(String),
}

pub type DnsResult<T> = Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_header_decoding() {
        // qid 0x1234, QR+RD+RA flags with rcode NXDOMAIN (3)
        let reply = [0x12, 0x34, 0x81, 0x83, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(reply_qid(&reply), 0x1234);
        assert_eq!(reply_rcode(&reply), 3);
        assert_eq!(RCODE_STRINGS[reply_rcode(&reply) as usize], "NXDOMAIN");
    }
}
