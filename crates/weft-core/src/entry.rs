//! Content-addressed log entries.
//!
//! An [`Entry`] is one immutable mutation of a CRDT instance together with
//! the ids of the entries it causally depends on. Its [`EntryId`] is a BLAKE3
//! hash over the author, the sorted parent ids and the canonical JSON of the
//! payload, so two entries with identical content are the same entry.
//!
//! # Hash input
//!
//! ```text
//! author \t parent_1,parent_2,... \t canonical_payload_json \n
//! ```
//!
//! Object keys in the payload are sorted at every depth before hashing, which
//! makes the id independent of how a peer happened to serialize the payload.
//! The `authentication` token is deliberately excluded: it is produced after
//! the id is known and is carried alongside, never hashed.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Prefix on every entry id.
pub const ID_PREFIX: &str = "blake3:";

/// Hex digits in a BLAKE3 digest.
const DIGEST_LEN: usize = 64;

/// An id string that is not `blake3:` followed by 64 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed entry id {0:?}: expected blake3: and 64 lowercase hex digits")]
pub struct InvalidEntryId(pub String);

/// Content-addressed identifier of an [`Entry`], formatted `blake3:<hex>`.
///
/// Ids decoded from the wire are validated, so a peer cannot smuggle a path
/// or any other string into a store lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Parse an id, rejecting anything but `blake3:<64 lowercase hex>`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEntryId`] carrying the rejected string.
    pub fn parse(id: impl Into<String>) -> Result<Self, InvalidEntryId> {
        let id = id.into();
        match id.strip_prefix(ID_PREFIX) {
            Some(digest) if is_digest(digest) => Ok(Self(id)),
            _ => Err(InvalidEntryId(id)),
        }
    }

    /// Wrap an id string without validating its format.
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns `true` if the id has the shape [`parse`](Self::parse) accepts.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.strip_prefix(ID_PREFIX).is_some_and(is_digest)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digest without the `blake3:` prefix.
    #[must_use]
    pub fn digest(&self) -> &str {
        self.0.strip_prefix(ID_PREFIX).unwrap_or(&self.0)
    }
}

/// `true` for exactly 64 lowercase hex digits.
fn is_digest(digest: &str) -> bool {
    digest.len() == DIGEST_LEN && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single entry in a replica's causal log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// BLAKE3 hash of `(author, parents, payload)`.
    pub id: EntryId,

    /// Type-policy message produced by a mutator.
    pub payload: Value,

    /// Heads of the authoring log at append time, sorted and deduplicated.
    /// Empty for the first entry of a log.
    pub parents: Vec<EntryId>,

    /// Replica that appended the entry.
    pub author: String,

    /// Opaque token from the authoring replica's authenticator.
    #[serde(default)]
    pub authentication: String,
}

impl Entry {
    /// Build an unauthenticated entry and compute its id.
    pub fn new(
        payload: Value,
        parents: impl IntoIterator<Item = EntryId>,
        author: impl Into<String>,
    ) -> Self {
        let mut parents: Vec<EntryId> = parents.into_iter().collect();
        parents.sort();
        parents.dedup();
        let author = author.into();
        let id = compute_entry_id(&payload, &parents, &author);
        Self {
            id,
            payload,
            parents,
            author,
            authentication: String::new(),
        }
    }

    /// Returns `true` if the stored id matches the id recomputed from content.
    #[must_use]
    pub fn verify_id(&self) -> bool {
        compute_entry_id(&self.payload, &self.parents, &self.author) == self.id
    }

    /// Returns `true` for the first entry of a log.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Compute the content id for an entry.
///
/// `parents` are hashed in the order given; [`Entry::new`] sorts them first.
#[must_use]
pub fn compute_entry_id(payload: &Value, parents: &[EntryId], author: &str) -> EntryId {
    let parents = parents
        .iter()
        .map(EntryId::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let hash_input = format!("{author}\t{parents}\t{}\n", canonicalize_json(payload));
    let hash = blake3::hash(hash_input.as_bytes());
    EntryId(format!("{ID_PREFIX}{hash}"))
}

/// Produce compact JSON with object keys sorted lexicographically at every
/// nesting level.
#[must_use]
pub fn canonicalize_json(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Null => buf.push_str("null"),
        Value::Bool(b) => buf.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => buf.push_str(&n.to_string()),
        Value::String(s) => {
            buf.push_str(&quoted(s));
        }
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            buf.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(&quoted(key));
                buf.push(':');
                if let Some(val) = map.get(*key) {
                    write_canonical(val, buf);
                }
            }
            buf.push('}');
        }
    }
}

/// JSON string literal with escapes, as `Value`'s `Display` writes it.
fn quoted(s: &str) -> String {
    Value::from(s).to_string()
}
