//! Authentication tokens for appended entries.
//!
//! The log asks an injected [`Authenticator`] for a token on every append and
//! stores it on the entry. The engine never interprets or verifies tokens;
//! verification of remote entries belongs to a layer built on top.

use crate::entry::{Entry, EntryId};
use crate::error::ErrorCode;

/// Failure reported by an [`Authenticator`]; propagates out of `append`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authentication failed: {0}")]
pub struct AuthError(pub String);

impl AuthError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::AuthenticationFailed
    }
}

/// Produces an opaque token for an entry about to be stored.
pub trait Authenticator: Send + Sync {
    /// `entry.authentication` is empty when this is called.
    fn authenticate(&self, entry: &Entry, parents: &[EntryId]) -> Result<String, AuthError>;
}

impl<F> Authenticator for F
where
    F: Fn(&Entry, &[EntryId]) -> Result<String, AuthError> + Send + Sync,
{
    fn authenticate(&self, entry: &Entry, parents: &[EntryId]) -> Result<String, AuthError> {
        self(entry, parents)
    }
}

/// Authenticator that attaches an empty token.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unauthenticated;

impl Authenticator for Unauthenticated {
    fn authenticate(&self, _entry: &Entry, _parents: &[EntryId]) -> Result<String, AuthError> {
        Ok(String::new())
    }
}

/// Keyed BLAKE3 MAC over the entry id and its parents.
///
/// Token format: `keyed-blake3:<hex>`.
#[derive(Clone)]
pub struct KeyedAuthenticator {
    key: [u8; 32],
}

impl KeyedAuthenticator {
    #[must_use]
    pub const fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive a key from a passphrase-like context string.
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        Self::new(blake3::derive_key("weft entry authentication v1", secret.as_bytes()))
    }

    /// Recompute the token for `entry` and compare it with the stored one.
    #[must_use]
    pub fn verify(&self, entry: &Entry) -> bool {
        self.token(entry, &entry.parents) == entry.authentication
    }

    fn token(&self, entry: &Entry, parents: &[EntryId]) -> String {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(entry.id.as_str().as_bytes());
        for parent in parents {
            hasher.update(b"\n");
            hasher.update(parent.as_str().as_bytes());
        }
        format!("keyed-blake3:{}", hasher.finalize())
    }
}

impl Authenticator for KeyedAuthenticator {
    fn authenticate(&self, entry: &Entry, parents: &[EntryId]) -> Result<String, AuthError> {
        Ok(self.token(entry, parents))
    }
}

impl std::fmt::Debug for KeyedAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedAuthenticator").finish_non_exhaustive()
    }
}
