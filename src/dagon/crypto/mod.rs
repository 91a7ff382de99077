//! Digest support for link passwords.
//!
//! Connect blocks marked `encrypted` store the lowercase hex SHA-256
//! digest of the link password instead of the cleartext.

use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

/// A SHA-256 digest.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    /// Digests the given bytes.
    pub fn of(data: &[u8]) -> Self {
        let d = digest::digest(&SHA256, data);
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(d.as_ref());
        Self(inner)
    }

    /// Returns the lowercase hex representation of this digest.
    pub fn hex(&self) -> String {
        let mut s = String::with_capacity(Self::LENGTH * 2);
        for b in self.0.iter() {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compares a presented cleartext password against a stored credential.
///
/// `encrypted` selects between a direct compare and a hex digest
/// compare. The digest compare is case insensitive on the stored side.
pub fn password_matches(stored: &str, presented: &str, encrypted: bool) -> bool {
    if encrypted {
        Digest::of(presented.as_bytes()).hex() == stored.to_ascii_lowercase()
    } else {
        stored == presented
    }
}
