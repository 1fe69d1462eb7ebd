use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::{Sha256, Sha512};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadDigest(String),
    DigestMismatch,
    SizeMismatch,
    DigestAlgorithmNotHandled(DigestAlgorithm),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// oci_spec::image::Digest validates the grammar, but we additionally refuse
// anything that could traverse a directory when the digest is later used as a
// storage path component
pub fn parse_digest(s: &str) -> Result<Digest, Error> {
    if s.contains('/') || s.contains("..") {
        return Err(Error::BadDigest(s.to_string()));
    }
    s.parse().map_err(|_| Error::BadDigest(s.to_string()))
}

pub fn payload_digest(data: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest;
    use std::str::FromStr;
    oci_spec::image::Sha256Digest::from_str(&hex::encode(Sha256::digest(data)))
        .unwrap()
        .into()
}

// check content against a digest of either supported algorithm. a blob can be
// known under a sha256 and a sha512 name at the same time, so both have to
// verify here, not just the algorithm we would have picked ourselves
pub fn verify_payload(expected: &Digest, data: &[u8]) -> Result<(), Error> {
    let matches = match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            use sha2::Digest;
            let mut hasher = Sha256::new();
            hasher.update(data);
            digest_eq(expected.digest(), hasher)
        }
        DigestAlgorithm::Sha512 => {
            use sha2::Digest;
            let mut hasher = Sha512::new();
            hasher.update(data);
            digest_eq(expected.digest(), hasher)
        }
        algo => {
            log::error!("digest algo not handled {}", algo);
            return Err(Error::DigestAlgorithmNotHandled(algo.clone()));
        }
    };
    if matches { Ok(()) } else { Err(Error::DigestMismatch) }
}

pub fn verify_sized_payload(expected: &Digest, declared: u64, data: &[u8]) -> Result<(), Error> {
    if declared != data.len() as u64 {
        return Err(Error::SizeMismatch);
    }
    verify_payload(expected, data)
}

// compares without allocating the hex string for the computed digest
// requires digest_lower_hex_str to be lower hex, which oci_spec guarantees,
// and produced with an algo matching the passed in hasher
pub fn digest_eq(digest_lower_hex_str: &str, digest: impl sha2::Digest) -> bool {
    let digest_bytes = digest.finalize();
    let l = digest_lower_hex_str.len();
    if l != 2 * digest_bytes.len() {
        return false;
    }

    // table mapping nibble to lower hex ascii
    #[rustfmt::skip]
    const LUT: [u8; 16] = [
        //0  1   2   3   4   5   6   7   8   9
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        //a  b   c    d    e    f
        97, 98, 99, 100, 101, 102,
    ];
    // checked length was even
    let as_byte_pairs = <str as AsRef<[u8]>>::as_ref(digest_lower_hex_str).chunks_exact(2);

    as_byte_pairs.zip(digest_bytes).all(|(pair, byte)| {
        LUT[(byte >> 4) as usize] == pair[0] && LUT[(byte & 0xf) as usize] == pair[1]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digest_rejects_traversal() {
        assert!(parse_digest("sha256/../../etc/passwd").is_err());
        assert!(parse_digest("sha256:").is_err());
        assert!(
            parse_digest("sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                .is_ok()
        );
    }

    #[test]
    fn test_verify_payload_sha256() {
        let d = payload_digest(b"abc");
        assert!(verify_payload(&d, b"abc").is_ok());
        assert!(matches!(
            verify_payload(&d, b"abd"),
            Err(Error::DigestMismatch)
        ));
    }

    #[test]
    fn test_verify_payload_sha512() {
        // sha512 of "abc"
        let d = parse_digest(concat!(
            "sha512:ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a",
            "2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        ))
        .unwrap();
        assert!(verify_payload(&d, b"abc").is_ok());
        assert!(verify_payload(&d, b"abd").is_err());
    }

    #[test]
    fn test_verify_sized_payload() {
        let d = payload_digest(b"abc");
        assert!(matches!(
            verify_sized_payload(&d, 2, b"abc"),
            Err(Error::SizeMismatch)
        ));
        assert!(verify_sized_payload(&d, 3, b"abc").is_ok());
    }
}
