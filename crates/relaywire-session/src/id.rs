//! Session identity.

use std::fmt;

use sha2::{Digest, Sha512};

/// A session's identity: the lowercase hex SHA-512 digest of the
/// transport's connection key.
///
/// Two sockets with the same key map to the same id, which is how a
/// reconnecting peer finds its private state and rooms again. Every
/// session is also a member of the room named by its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_connection_key(key: &[u8]) -> Self {
        Self(hex::encode(Sha512::digest(key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}
