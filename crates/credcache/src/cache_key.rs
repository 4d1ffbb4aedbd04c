use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// A stable key for cached credentials.
///
/// The key is the SHA-256 hash of human-readable metadata describing everything that
/// contributed to the cached credentials. Two keys are equal iff their hashes are equal.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.hex()
    }
}

impl CacheKey {
    /// Creates a [`CacheKeyBuilder`] for keys of the given kind of credentials.
    ///
    /// The `kind` is written as the first line of the metadata, which keeps keys for different
    /// kinds of credentials apart even when all of their other inputs happen to be equal.
    pub fn builder(kind: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: format!("kind: {kind}\n"),
        }
    }

    /// Hashes a raw string as-is, without any additional metadata.
    pub fn from_raw(raw: &str) -> Self {
        CacheKeyBuilder {
            metadata: raw.to_owned(),
        }
        .build()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the lowercase hex representation of the hash, as used by the stores.
    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input. Fields are written one per
/// line, and lists are written in the order given, so callers that treat a list as a set need
/// to sort it first.
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes a `name: value` line.
    pub fn field(mut self, name: &str, value: impl fmt::Display) -> Self {
        // Writing into a `String` can not fail.
        let _ = writeln!(self.metadata, "{name}: {value}");
        self
    }

    /// Writes a `name: value` line, or `name: <none>` if `value` is absent.
    ///
    /// The field is always written, so an absent value can not shift the following fields.
    pub fn optional_field(self, name: &str, value: Option<impl fmt::Display>) -> Self {
        match value {
            Some(value) => self.field(name, value),
            None => self.field(name, "<none>"),
        }
    }

    /// Writes a list of values as a single comma separated `name: a,b,c` line.
    pub fn list_field<I>(self, name: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        let mut joined = String::new();
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                joined.push(',');
            }
            let _ = write!(joined, "{value}");
        }
        self.field(name, joined)
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
