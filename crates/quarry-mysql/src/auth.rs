//! The `mysql_native_password` authentication scramble.
//!
//! Password scramble algorithm:
//! ```text
//! SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password)))
//! ```

use sha1::{Digest, Sha1};

/// Compute the 20-byte authentication response for a server challenge.
///
/// Returns an empty vec when the password is empty; the login packet then
/// carries a bare zero length byte.
pub fn native_password_scramble(password: &str, challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // Servers tack a NUL onto the 20-byte challenge; only the first 20
    // bytes participate.
    let challenge = if challenge.len() > 20 {
        &challenge[..20]
    } else {
        challenge
    };

    // Stage 1: SHA1(password)
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1: [u8; 20] = hasher.finalize().into();

    // Stage 2: SHA1(SHA1(password))
    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2: [u8; 20] = hasher.finalize().into();

    // Stage 3: SHA1(challenge + stage2)
    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}
