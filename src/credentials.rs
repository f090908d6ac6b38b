//! Credential storage for the current client session.
//!
//! DESIGN
//! ======
//! Pure storage: no network, no refresh logic. After login the refresh
//! coordinator is the only writer, so readers take a snapshot with `get()`
//! and never need change notifications.
//!
//! Expiry is derived from the access token's JWT `exp` claim. Tokens that are
//! not decodable JWTs carry no expiry and are only renewed after a 401.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// CREDENTIAL
// =============================================================================

/// Access/refresh token pair for the signed-in user.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds after which the access token is no longer accepted.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// User profile returned alongside the tokens, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

impl Credential {
    /// Build a credential, deriving expiry from the access token claims.
    #[must_use]
    pub fn from_tokens(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let access_token = access_token.into();
        let expires_at = token_expiry(&access_token);
        Self {
            access_token,
            refresh_token: refresh_token.into(),
            expires_at,
            user: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: Option<Value>) -> Self {
        self.user = user;
        self
    }

    /// Whether the token is expired at `now`, treating it as expired
    /// `skew_secs` early so it is not rejected in flight.
    #[must_use]
    pub fn is_expired_at(&self, now: i64, skew_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|exp| exp.saturating_sub(skew_secs) <= now)
    }

    #[must_use]
    pub fn is_expired(&self, skew_secs: i64) -> bool {
        self.is_expired_at(unix_now(), skew_secs)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Read the `exp` claim from a JWT without verifying its signature.
#[must_use]
pub fn token_expiry(token: &str) -> Option<i64> {
    let claims_segment = token.split('.').nth(1)?;
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(claims_segment.trim_end_matches('=')) else {
        return None;
    };
    let Ok(claims) = serde_json::from_slice::<Value>(&bytes) else {
        return None;
    };
    let exp = claims.get("exp")?;
    exp.as_i64().or_else(|| exp.as_f64().map(|secs| secs as i64))
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

// =============================================================================
// STORE
// =============================================================================

/// Errors raised while loading persisted credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Holder of the single live credential.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<Credential>;
    fn set(&self, credential: Credential);
    fn clear(&self);
}

/// Credential store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, credential: Credential) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Credential store mirrored to a JSON file so sessions survive restarts.
///
/// The in-memory copy is authoritative; write failures are logged and do not
/// lose the credential for the running process.
pub struct FileCredentialStore {
    path: PathBuf,
    slot: Mutex<Option<Credential>>,
}

impl FileCredentialStore {
    /// Open the store at `path`, loading any credential already saved there.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] when the file exists but cannot be read
    /// and [`CredentialError::Corrupt`] when it does not hold a credential.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let loaded = match std::fs::read(&path) {
            Ok(bytes) => Some(
                serde_json::from_slice::<Credential>(&bytes)
                    .map_err(|source| CredentialError::Corrupt { path: path.clone(), source })?,
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), loaded = loaded.is_some(), "credential store opened");
        Ok(Self {
            path,
            slot: Mutex::new(loaded),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(credential)
            .map_err(|source| CredentialError::Corrupt { path: self.path.clone(), source })?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, credential: Credential) {
        if let Err(e) = self.persist(&credential) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to persist credential");
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to remove credential file");
            }
        }
    }
}

#[cfg(test)]
#[path = "credentials_test.rs"]
mod tests;
