//! Query message builder

use super::tsig::TsigKey;
use super::{DnsError, DnsResult, MAX_EDNS_PACKET};

const FLAG_RD: u16 = 0x0100;

const TYPE_OPT: u16 = 41;
const CLASS_IN: u16 = 1;

/// A single EDNS option attached to the OPT record, given on the command
/// line as `code:hexvalue`.
#[derive(Debug, Clone)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

impl std::str::FromStr for EdnsOption {
    type Err = DnsError;

    fn from_str(s: &str) -> DnsResult<Self> {
        let (code, value) = s
            .split_once(':')
            .ok_or_else(|| DnsError::InvalidEdnsOption(format!("'{}' (expected code:value)", s)))?;
        let code = code
            .parse::<u16>()
            .map_err(|_| DnsError::InvalidEdnsOption(format!("bad option code '{}'", code)))?;
        let data = decode_hex(value)
            .ok_or_else(|| DnsError::InvalidEdnsOption(format!("bad hex value '{}'", value)))?;
        Ok(EdnsOption { code, data })
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Builds wire-format query messages from textual descriptors.
///
/// One builder is shared read-only by all sender threads; it carries the
/// per-run options (EDNS, DNSSEC OK, TSIG key, extra EDNS option).
#[derive(Debug)]
pub struct Builder {
    edns: bool,
    dnssec: bool,
    tsig: Option<TsigKey>,
    edns_option: Option<EdnsOption>,
}

impl Builder {
    pub fn new(
        edns: bool,
        dnssec: bool,
        tsig: Option<TsigKey>,
        edns_option: Option<EdnsOption>,
    ) -> Self {
        Builder {
            edns,
            dnssec,
            tsig,
            edns_option,
        }
    }

    /// Build a query for the descriptor `text` (`"<name> [<type>]"`, type
    /// defaulting to A) with transaction id `qid`, appending the wire
    /// message to `out` (cleared first).
    pub fn build(&self, text: &str, qid: u16, out: &mut Vec<u8>) -> DnsResult<()> {
        let mut fields = text.split_whitespace();
        let name = fields
            .next()
            .ok_or_else(|| DnsError::InvalidDescriptor(text.to_string()))?;
        let qtype = match fields.next() {
            Some(t) => parse_qtype(t)?,
            None => 1, // A
        };

        out.clear();

        // Header
        out.extend_from_slice(&qid.to_be_bytes());
        out.extend_from_slice(&FLAG_RD.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&0u16.to_be_bytes()); // ancount
        out.extend_from_slice(&0u16.to_be_bytes()); // nscount
        out.extend_from_slice(&0u16.to_be_bytes()); // arcount

        // Question
        encode_name(name, out)?;
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());

        if self.edns {
            self.append_opt(out);
        }

        if let Some(key) = &self.tsig {
            key.sign(out)?;
        }

        if out.len() > MAX_EDNS_PACKET {
            return Err(DnsError::NameTooLong(name.to_string()));
        }
        Ok(())
    }

    /// Append the EDNS0 OPT pseudo-record and bump arcount.
    fn append_opt(&self, out: &mut Vec<u8>) {
        out.push(0); // root owner name
        out.extend_from_slice(&TYPE_OPT.to_be_bytes());
        out.extend_from_slice(&(MAX_EDNS_PACKET as u16).to_be_bytes()); // udp payload size
        let ttl: u32 = if self.dnssec { 0x0000_8000 } else { 0 }; // DO bit
        out.extend_from_slice(&ttl.to_be_bytes());
        match &self.edns_option {
            Some(opt) => {
                let rdlen = 4 + opt.data.len() as u16;
                out.extend_from_slice(&rdlen.to_be_bytes());
                out.extend_from_slice(&opt.code.to_be_bytes());
                out.extend_from_slice(&(opt.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&opt.data);
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        bump_arcount(out);
    }
}

/// Increment the header arcount in place.
pub(super) fn bump_arcount(msg: &mut [u8]) {
    let arcount = u16::from_be_bytes([msg[10], msg[11]]) + 1;
    msg[10..12].copy_from_slice(&arcount.to_be_bytes());
}

/// Encode a domain name in uncompressed wire format.
pub(super) fn encode_name(name: &str, out: &mut Vec<u8>) -> DnsResult<()> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let start = out.len();
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(DnsError::LabelTooLong(name.to_string()));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    if out.len() - start > 255 {
        return Err(DnsError::NameTooLong(name.to_string()));
    }
    Ok(())
}

fn parse_qtype(t: &str) -> DnsResult<u16> {
    let qtype = match t.to_ascii_uppercase().as_str() {
        "A" => 1,
        "NS" => 2,
        "CNAME" => 5,
        "SOA" => 6,
        "PTR" => 12,
        "MX" => 15,
        "TXT" => 16,
        "AAAA" => 28,
        "SRV" => 33,
        "NAPTR" => 35,
        "DS" => 43,
        "RRSIG" => 46,
        "DNSKEY" => 48,
        "SPF" => 99,
        "AXFR" => 252,
        "ANY" => 255,
        other => {
            if let Some(num) = other.strip_prefix("TYPE") {
                num.parse::<u16>()
                    .map_err(|_| DnsError::UnknownType(t.to_string()))?
            } else {
                return Err(DnsError::UnknownType(t.to_string()));
            }
        }
    };
    Ok(qtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_query_layout() {
        let builder = Builder::new(false, false, None, None);
        let mut msg = Vec::new();
        builder.build("example.com A", 0x2b67, &mut msg).unwrap();

        assert_eq!(&msg[0..2], &[0x2b, 0x67]); // qid
        assert_eq!(&msg[2..4], &[0x01, 0x00]); // RD
        assert_eq!(&msg[4..6], &[0, 1]); // qdcount
        assert_eq!(&msg[10..12], &[0, 0]); // arcount

        // question: 7"example"3"com"0, type A, class IN
        let question = &msg[12..];
        assert_eq!(question[0], 7);
        assert_eq!(&question[1..8], b"example");
        assert_eq!(question[8], 3);
        assert_eq!(&question[9..12], b"com");
        assert_eq!(question[12], 0);
        assert_eq!(&question[13..15], &[0, 1]);
        assert_eq!(&question[15..17], &[0, 1]);
        assert_eq!(msg.len(), 12 + 17);
    }

    #[test]
    fn test_type_defaults_to_a() {
        let builder = Builder::new(false, false, None, None);
        let mut with_type = Vec::new();
        let mut without = Vec::new();
        builder.build("example.com A", 7, &mut with_type).unwrap();
        builder.build("example.com", 7, &mut without).unwrap();
        assert_eq!(with_type, without);
    }

    #[test]
    fn test_numeric_type_escape() {
        let builder = Builder::new(false, false, None, None);
        let mut msg = Vec::new();
        builder.build("example.com TYPE65", 1, &mut msg).unwrap();
        let qtype = u16::from_be_bytes([msg[msg.len() - 4], msg[msg.len() - 3]]);
        assert_eq!(qtype, 65);
    }

    #[test]
    fn test_edns_opt_record() {
        let builder = Builder::new(true, true, None, None);
        let mut msg = Vec::new();
        builder.build("example.com AAAA", 9, &mut msg).unwrap();

        assert_eq!(&msg[10..12], &[0, 1]); // arcount
        let opt = &msg[msg.len() - 11..];
        assert_eq!(opt[0], 0); // root
        assert_eq!(&opt[1..3], &[0, 41]); // OPT
        assert_eq!(u16::from_be_bytes([opt[3], opt[4]]), 4096);
        assert_eq!(&opt[5..9], &[0, 0, 0x80, 0]); // DO bit
        assert_eq!(&opt[9..11], &[0, 0]); // rdlen
    }

    #[test]
    fn test_edns_option_payload() {
        let opt: EdnsOption = "10:c0ffee".parse().unwrap();
        assert_eq!(opt.code, 10);
        assert_eq!(opt.data, vec![0xc0, 0xff, 0xee]);

        let builder = Builder::new(true, false, None, Some(opt));
        let mut msg = Vec::new();
        builder.build("example.com", 1, &mut msg).unwrap();
        let tail = &msg[msg.len() - 9..];
        assert_eq!(&tail[0..2], &[0, 7]); // rdlen = 4 + 3
        assert_eq!(&tail[2..4], &[0, 10]); // option code
        assert_eq!(&tail[4..6], &[0, 3]); // option length
        assert_eq!(&tail[6..9], &[0xc0, 0xff, 0xee]);
    }

    #[test]
    fn test_bad_descriptors() {
        let builder = Builder::new(false, false, None, None);
        let mut msg = Vec::new();
        assert!(builder.build("", 1, &mut msg).is_err());
        assert!(builder.build("example.com BOGUS", 1, &mut msg).is_err());
        let long_label = format!("{}.com", "a".repeat(64));
        assert!(builder.build(&long_label, 1, &mut msg).is_err());
    }

    #[test]
    fn test_root_name() {
        let mut out = Vec::new();
        encode_name(".", &mut out).unwrap();
        assert_eq!(out, vec![0]);
    }
}
