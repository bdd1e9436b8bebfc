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

/// SHA-1 digest encoded with the standard padded base64 alphabet, the form the
/// Realtime Database wire protocol uses for data hashes.
pub fn sha1_base64(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(sha1_digest(data))
}
