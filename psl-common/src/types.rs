//! # Endpoint Keys
//!
//! Identity of a poolable remote session: the `(host, port, user)` triple.
//!
//! ## Design Principles
//!
//! 1. **Owned Keys**: `EndpointKey` deep-copies host and user, so callers may
//!    pass transient strings.
//! 2. **Borrowed Probes**: `EndpointRef` hashes and compares exactly like the
//!    owned key, letting lookups skip allocation.
//! 3. **Case-Folded Hosts**: hostnames compare case-insensitively (DNS
//!    semantics); port and user compare exactly.
//!
//! ## Display Format
//!
//! ```text
//! user@host:port
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::PslResult;

/// Owned endpoint identity stored in the pool index.
#[derive(Clone)]
pub struct EndpointKey {
    hostname: String,
    port: u16,
    username: String,
}

impl EndpointKey {
    /// Builds a key, copying both strings.
    ///
    /// # Errors
    /// Returns `PslError::NoMemory` if either copy cannot be allocated.
    pub fn try_new(hostname: &str, port: u16, username: &str) -> PslResult<Self> {
        Ok(EndpointKey {
            hostname: try_copy(hostname)?,
            port,
            username: try_copy(username)?,
        })
    }

    /// Returns the hostname as given at creation (case preserved).
    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the username.
    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Borrows the key as a probe.
    #[inline]
    pub fn as_probe(&self) -> EndpointRef<'_> {
        EndpointRef::new(&self.hostname, self.port, &self.username)
    }
}

fn try_copy(value: &str) -> PslResult<String> {
    let mut owned = String::new();
    owned.try_reserve_exact(value.len())?;
    owned.push_str(value);
    Ok(owned)
}

/// Borrowed endpoint identity used for lookups.
#[derive(Debug, Clone, Copy)]
pub struct EndpointRef<'a> {
    pub hostname: &'a str,
    pub port: u16,
    pub username: &'a str,
}

impl<'a> EndpointRef<'a> {
    /// Builds a probe from borrowed parts.
    #[inline]
    pub const fn new(hostname: &'a str, port: u16, username: &'a str) -> Self {
        EndpointRef {
            hostname,
            port,
            username,
        }
    }

    /// Returns true when this probe identifies `key`.
    pub fn matches(&self, key: &EndpointKey) -> bool {
        self.hostname.eq_ignore_ascii_case(&key.hostname)
            && self.port == key.port
            && self.username == key.username
    }

    /// Copies the probe into an owned key.
    pub fn to_key(&self) -> PslResult<EndpointKey> {
        EndpointKey::try_new(self.hostname, self.port, self.username)
    }
}

// Hostname bytes are folded before hashing so that hash agrees with eq.
fn hash_parts<H: Hasher>(hostname: &str, port: u16, username: &str, state: &mut H) {
    for byte in hostname.bytes() {
        state.write_u8(byte.to_ascii_lowercase());
    }
    state.write_u8(0xff);
    port.hash(state);
    username.hash(state);
}

impl Hash for EndpointRef<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_parts(self.hostname, self.port, self.username, state);
    }
}

impl PartialEq for EndpointKey {
    fn eq(&self, other: &Self) -> bool {
        other.as_probe().matches(self)
    }
}

impl Eq for EndpointKey {}

impl Hash for EndpointKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_parts(&self.hostname, self.port, &self.username, state);
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointKey")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish()
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_hostname_is_case_insensitive() {
        let a = EndpointKey::try_new("Storage-01.Example", 600, "alice").unwrap();
        let b = EndpointKey::try_new("storage-01.example", 600, "alice").unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.hostname(), "Storage-01.Example");
    }

    #[test]
    fn test_port_and_user_are_exact() {
        let base = EndpointKey::try_new("node", 600, "alice").unwrap();
        assert_ne!(base, EndpointKey::try_new("node", 601, "alice").unwrap());
        assert_ne!(base, EndpointKey::try_new("node", 600, "Alice").unwrap());
    }

    #[test]
    fn test_probe_hash_matches_key() {
        let key = EndpointKey::try_new("NODE", 601, "bob").unwrap();
        let probe = EndpointRef::new("node", 601, "bob");
        assert!(probe.matches(&key));
        assert_eq!(hash_of(&key), hash_of(&probe));
    }

    #[test]
    fn test_display() {
        let key = EndpointKey::try_new("meta", 601, "carol").unwrap();
        assert_eq!(key.to_string(), "carol@meta:601");
    }
}
