//! Owned passphrase buffer.

use std::fmt;
use zeroize::Zeroizing;

/// Secret bytes handed to the disk-encryption consumer.
///
/// Deliberately not `Clone`: the value moves from whichever component produced it to
/// the output writer, and the buffer is wiped when dropped. `Debug` only shows the length.
pub struct Passphrase(Zeroizing<Vec<u8>>);

impl Passphrase {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Passphrase {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passphrase(<redacted>, {} bytes)", self.0.len())
    }
}
