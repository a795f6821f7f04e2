//! Cache key derivation.
//!
//! A [`CacheKey`] identifies a cacheable resource *and* the access context it
//! was fetched under. The same URL requested with different credentials maps
//! to different keys, so one user's authenticated image is never served to
//! another.

use std::fmt;

use sha2::{Digest, Sha256};

/// HTTP basic-auth credentials attached to an image request.
///
/// The `Debug` impl never prints the password.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Builds credentials from the optional pair a view exposes.
    ///
    /// Returns `None` when neither a username nor a password is set. A
    /// missing half is treated as the empty string.
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (None, None) => None,
            (u, p) => Some(Self::new(u.unwrap_or_default(), p.unwrap_or_default())),
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Deterministic identifier for a cached image.
///
/// The key is the hex SHA-256 digest of the URL, the username and a digest of
/// the password, so it is safe to use as an on-disk file name and never
/// contains the password in clear text.
///
/// # Examples
///
/// ```
/// use imcache::key::{CacheKey, Credentials};
///
/// let anon = CacheKey::derive("http://x/img.png", None);
/// let alice = CacheKey::derive("http://x/img.png", Some(&Credentials::new("alice", "secret1")));
///
/// assert_eq!(anon, CacheKey::derive("http://x/img.png", None));
/// assert_ne!(anon, alice);
/// assert_eq!(anon.as_str().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for `url` fetched with `credentials`.
    pub fn derive(url: &str, credentials: Option<&Credentials>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        match credentials {
            // Field tags keep `(user "a", no password)` apart from anonymous access.
            Some(creds) => {
                hasher.update(b"auth\n");
                hasher.update(creds.username.as_bytes());
                hasher.update(b"\n");
                hasher.update(Sha256::digest(creds.password.as_bytes()));
            }
            None => hasher.update(b"anon"),
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Re-creates a key from its string form, as found in a disk-tier file name.
    ///
    /// Returns `None` unless `s` is 64 lowercase hex digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_owned()))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
