//! Password generation, digests, and authenticated upload filenames.

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Length of generated upload filenames.
const FILENAME_LEN: usize = 16;

/// Generates the passwords sent to the app and the upload filenames.
pub struct PwdGen {
    rng: StdRng,
}

impl Default for PwdGen {
    fn default() -> Self {
        Self::new()
    }
}

impl PwdGen {
    pub fn new() -> Self {
        PwdGen {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn generate(&mut self, len: usize) -> String {
        (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}

/// Hex SHA-256 of `input`.  Stored passwords are kept in this form.
pub fn hex_digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Hex SHA-256 of `input` under `key`; used to authenticate upload paths
/// against the image server's shared key.
pub fn keyed_hex_digest(input: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fixed-time comparison for stored-vs-computed password digests.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// One authenticated upload URL:
/// `<mms_host>/<a>/<b>/<cc>/<name>:<digest>` where the digest covers
/// `/<a>/<b>/<cc>/<name>` under `mms_key`.
pub fn filename_url(mms_host: &str, mms_key: &str, generator: &mut PwdGen) -> String {
    let name = generator.generate(FILENAME_LEN);
    let rel_path = format!("/{}/{}/{}/{}", &name[0..1], &name[1..2], &name[2..4], name);
    let digest = keyed_hex_digest(&rel_path, mms_key);
    format!("{mms_host}{rel_path}:{digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_passwords_have_the_requested_length() {
        let mut generator = PwdGen::new();
        let pwd = generator.generate(10);
        assert_eq!(pwd.len(), 10);
        assert!(pwd.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(generator.generate(10), generator.generate(10));
    }

    #[test]
    fn digest_is_stable_and_hex_encoded() {
        let digest = hex_digest("secret");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hex_digest("secret"));
        assert_ne!(digest, hex_digest("secre t"));
    }

    #[test]
    fn keyed_digest_depends_on_the_key() {
        assert_ne!(keyed_hex_digest("/a/b", "k1"), keyed_hex_digest("/a/b", "k2"));
        assert_ne!(keyed_hex_digest("/a/b", "k1"), hex_digest("/a/b"));
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn filename_urls_carry_a_verifiable_digest() {
        let mut generator = PwdGen::new();
        let url = filename_url("https://img.example.com", "mms-key", &mut generator);
        let path_and_digest = url.strip_prefix("https://img.example.com").unwrap();
        let (path, digest) = path_and_digest.rsplit_once(':').unwrap();
        assert_eq!(keyed_hex_digest(path, "mms-key"), digest);
        // /<a>/<b>/<cc>/<name>
        let segments: Vec<&str> = path.split('/').skip(1).collect();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].len(), 1);
        assert_eq!(segments[1].len(), 1);
        assert_eq!(segments[2].len(), 2);
        assert_eq!(segments[3].len(), FILENAME_LEN);
        assert!(segments[3].starts_with(segments[0]));
    }
}
