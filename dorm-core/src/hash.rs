//! Content hashing for list correlation
//!
//! Items of an entity list are matched between the current and the old graph
//! by a content digest rather than by reference, since freshly constructed
//! entities have no stable key yet.

use crate::error::Result;
use crate::metadata::{Entity, Value};
use sha2::{Digest, Sha256};

/// SHA-256 digest identifying a list item across snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Structural hash over an entity
pub trait ContentHash {
    fn hash(&self, entity: &dyn Entity) -> Result<ContentDigest>;
}

/// Hashes the primary key when it is fully assigned, all simple
/// properties otherwise.
///
/// Keyed hashing lets an existing row whose columns changed be matched with
/// its old self and reported as a modification. Rows without an assigned
/// key fall back to their full content.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedContentHash;

impl ContentHash for KeyedContentHash {
    fn hash(&self, entity: &dyn Entity) -> Result<ContentDigest> {
        let descriptor = entity.descriptor();
        let keys = entity.key_values();
        let keyed = !keys.is_empty()
            && keys
                .iter()
                .all(|(_, v)| v.as_ref().is_some_and(|v| !v.is_default()));

        let mut hasher = Sha256::new();
        hasher.update(descriptor.name.as_bytes());
        if keyed {
            hasher.update(b"\0key");
            for (p, v) in &keys {
                feed(&mut hasher, p.name, v.as_ref())?;
            }
        } else {
            hasher.update(b"\0content");
            for p in descriptor.columns() {
                feed(&mut hasher, p.name, entity.value(p.name).as_ref())?;
            }
        }
        Ok(ContentDigest(hasher.finalize().into()))
    }
}

fn feed(hasher: &mut Sha256, name: &str, value: Option<&Value>) -> Result<()> {
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    match value {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update(bincode::serialize(v)?);
        }
        None => hasher.update([0u8]),
    }
    Ok(())
}
