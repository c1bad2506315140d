//! Payload codec: gzip framing and the shared-secret integrity digest.
//!
//! The digest always covers the plain JSON bytes, never the compressed or
//! encrypted form; both ends of the wire reconstruct that byte sequence
//! before verifying.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// `hex(sha256(data || key))`.
pub fn sign(data: &[u8], key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify(data: &[u8], key: &str, digest: &str) -> bool {
    sign(data, key) == digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let payload = br#"[{"id":"req","type":"counter","delta":5}]"#;
        let packed = compress(payload).unwrap();
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress(b"definitely not gzip").is_err());
    }

    #[test]
    fn digest_accepts_matching_key() {
        let body = b"payload bytes";
        let digest = sign(body, "secret");
        assert!(verify(body, "secret", &digest));
    }

    #[test]
    fn digest_rejects_other_key_or_body() {
        let body = b"payload bytes";
        let digest = sign(body, "secret");
        assert!(!verify(body, "other", &digest));
        assert!(!verify(b"tampered", "secret", &digest));
    }
}
