use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine as _;
use sha1::{Digest, Sha1};

pub fn sha1_digest(data: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data.as_ref());
    let result = hasher.finalize();
    let mut buf = [0u8; 20];
    buf.copy_from_slice(&result);
    buf
}

/// SHA-1 of the UTF-8 input, base64 encoded with the standard padded alphabet.
///
/// This is the digest format the Realtime Database server uses for snapshot
/// hashes, so it must not change.
pub fn sha1_base64(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(sha1_digest(data))
}
