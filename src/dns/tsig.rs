//! TSIG request signing (RFC 2845, hmac-sha256 only)

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::request::{bump_arcount, encode_name};
use super::{DnsError, DnsResult};

type HmacSha256 = Hmac<Sha256>;

const TYPE_TSIG: u16 = 250;
const CLASS_ANY: u16 = 255;
const ALGORITHM: &str = "hmac-sha256";
const FUDGE_SECS: u16 = 300;

/// A TSIG signing key, given on the command line as
/// `[hmac-sha256:]name:base64secret`.
#[derive(Debug, Clone)]
pub struct TsigKey {
    name: String,
    secret: Vec<u8>,
}

impl std::str::FromStr for TsigKey {
    type Err = DnsError;

    fn from_str(s: &str) -> DnsResult<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (name, secret) = match parts.as_slice() {
            [name, secret] => (*name, *secret),
            [alg, name, secret] => {
                if !alg.eq_ignore_ascii_case(ALGORITHM) {
                    return Err(DnsError::InvalidTsigKey(format!(
                        "unsupported algorithm '{}' (only {} is supported)",
                        alg, ALGORITHM
                    )));
                }
                (*name, *secret)
            }
            _ => {
                return Err(DnsError::InvalidTsigKey(format!(
                    "'{}' (expected [alg:]name:secret)",
                    s
                )))
            }
        };
        let secret = base64::engine::general_purpose::STANDARD
            .decode(secret)
            .map_err(|_| DnsError::InvalidTsigKey("secret is not valid base64".to_string()))?;
        if name.is_empty() || secret.is_empty() {
            return Err(DnsError::InvalidTsigKey(
                "key name and secret must be non-empty".to_string(),
            ));
        }
        Ok(TsigKey {
            name: name.to_ascii_lowercase(),
            secret,
        })
    }
}

impl TsigKey {
    /// Sign `msg` in place: compute the request MAC over the unsigned
    /// message plus the TSIG variables, then append the TSIG record to
    /// the additional section.
    pub fn sign(&self, msg: &mut Vec<u8>) -> DnsResult<()> {
        let qid = u16::from_be_bytes([msg[0], msg[1]]);
        let time_signed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut key_name = Vec::new();
        encode_name(&self.name, &mut key_name)?;
        let mut alg_name = Vec::new();
        encode_name(ALGORITHM, &mut alg_name)?;

        // Digest: message, then the TSIG variables.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| DnsError::InvalidTsigKey("unusable secret".to_string()))?;
        mac.update(msg);
        mac.update(&key_name);
        mac.update(&CLASS_ANY.to_be_bytes());
        mac.update(&0u32.to_be_bytes()); // ttl
        mac.update(&alg_name);
        mac.update(&time48(time_signed));
        mac.update(&FUDGE_SECS.to_be_bytes());
        mac.update(&0u16.to_be_bytes()); // error
        mac.update(&0u16.to_be_bytes()); // other len
        let digest = mac.finalize().into_bytes();

        // TSIG record.
        msg.extend_from_slice(&key_name);
        msg.extend_from_slice(&TYPE_TSIG.to_be_bytes());
        msg.extend_from_slice(&CLASS_ANY.to_be_bytes());
        msg.extend_from_slice(&0u32.to_be_bytes()); // ttl
        let rdlen = alg_name.len() + 6 + 2 + 2 + digest.len() + 2 + 2 + 2;
        msg.extend_from_slice(&(rdlen as u16).to_be_bytes());
        msg.extend_from_slice(&alg_name);
        msg.extend_from_slice(&time48(time_signed));
        msg.extend_from_slice(&FUDGE_SECS.to_be_bytes());
        msg.extend_from_slice(&(digest.len() as u16).to_be_bytes());
        msg.extend_from_slice(&digest);
        msg.extend_from_slice(&qid.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes()); // error
        msg.extend_from_slice(&0u16.to_be_bytes()); // other len

        bump_arcount(msg);
        Ok(())
    }
}

fn time48(secs: u64) -> [u8; 6] {
    let b = secs.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::Builder;

    fn test_key() -> TsigKey {
        // "testsecret.." base64
        "testkey:dGVzdHNlY3JldA==".parse().unwrap()
    }

    #[test]
    fn test_key_parsing() {
        let key = test_key();
        assert_eq!(key.name, "testkey");
        assert_eq!(key.secret, b"testsecret");

        let with_alg: TsigKey = "hmac-sha256:k:dGVzdHNlY3JldA==".parse().unwrap();
        assert_eq!(with_alg.name, "k");

        assert!("hmac-md5:k:dGVzdA==".parse::<TsigKey>().is_err());
        assert!("noseparator".parse::<TsigKey>().is_err());
        assert!("k:!!!notbase64!!!".parse::<TsigKey>().is_err());
    }

    #[test]
    fn test_signed_message_structure() {
        let builder = Builder::new(false, false, Some(test_key()), None);
        let mut msg = Vec::new();
        builder.build("example.com A", 0x0101, &mut msg).unwrap();

        // arcount bumped to 1
        assert_eq!(&msg[10..12], &[0, 1]);

        // TSIG record sits after the question (offset 12 + 17)
        let tsig = &msg[29..];
        assert_eq!(tsig[0], 7);
        assert_eq!(&tsig[1..8], b"testkey");
        assert_eq!(tsig[8], 0);
        assert_eq!(&tsig[9..11], &TYPE_TSIG.to_be_bytes());
        assert_eq!(&tsig[11..13], &CLASS_ANY.to_be_bytes());

        // rdata: alg name (13) + time (6) + fudge (2) + mac len (2) +
        // mac (32) + original id (2) + error (2) + other len (2)
        let rdlen = u16::from_be_bytes([tsig[17], tsig[18]]) as usize;
        assert_eq!(rdlen, 13 + 6 + 2 + 2 + 32 + 2 + 2 + 2);
        assert_eq!(msg.len(), 29 + 19 + rdlen);

        // original id field matches the header qid
        let original_id = &msg[msg.len() - 6..msg.len() - 4];
        assert_eq!(original_id, &[0x01, 0x01]);
    }

    #[test]
    fn test_same_input_same_mac_within_second() {
        let key = test_key();
        let builder = Builder::new(false, false, Some(key), None);
        let mut a = Vec::new();
        let mut b = Vec::new();
        builder.build("example.com A", 1, &mut a).unwrap();
        builder.build("example.com A", 1, &mut b).unwrap();
        // Either identical (same signing second) or differing only in
        // time/mac bytes; lengths always match.
        assert_eq!(a.len(), b.len());
    }
}
