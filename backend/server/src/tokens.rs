//! # Ephemeral Tokens
//!
//! Short lived links handed out as QR codes so a patient's own device can register, view their
//! record, or leave feedback without logging in.
//!
//! ## Kinds
//! - Registration: carries pre-filled patient details, single use, consumed into a patient record
//! - Patient access: carries a patient id, read only until expiry
//! - Feedback: carries an optional patient id, read only until expiry
//!
//! ## Lifecycle
//! - Issued on demand with a fixed TTL of 24 hours, token is 32 bytes from the OS random source
//! - Lookups past expiry evict the entry, so an expired token never validates again
//! - Registration consumption holds a [`Claim`] on the entry, writes the patient, then commits it
//! - A failed, panicked or cancelled write drops the claim, which releases the token
//! - Expiry beats a claim: lookups and the sweep evict expired entries even while claimed
//! - Optional periodic sweep drops expired entries nobody touched
//!
//! Everything lives in process memory. A restart discards all outstanding tokens.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    patients::PatientDetails,
    utils::{random_token, redact},
};

pub const TOKEN_TTL_HOURS: i64 = 24;
pub const EXPIRES_IN: &str = "24 hours";

pub fn token_ttl() -> Duration {
    Duration::hours(TOKEN_TTL_HOURS)
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token not found")]
    NotFound,

    #[error("Token expired")]
    Expired,

    #[error("Token is already being consumed")]
    Claimed,

    #[error("Entropy source failure: {0}")]
    Entropy(#[from] rand::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Registration,
    PatientAccess,
    Feedback,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Registration => "registration",
            TokenKind::PatientAccess => "patient-access",
            TokenKind::Feedback => "feedback",
        }
    }

    /// Frontend route the shareable URL points at.
    pub fn url_path(self) -> &'static str {
        match self {
            TokenKind::Registration => "register",
            TokenKind::PatientAccess => "patient-access",
            TokenKind::Feedback => "feedback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

struct Entry<P> {
    payload: P,
    expires_at: DateTime<Utc>,
    claimed: bool,
}

impl<P> Entry<P> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One namespace of tokens. Every operation takes the single lock, so a lookup and the
/// eviction or claim that follows it are atomic.
pub struct TokenStore<P> {
    kind: TokenKind,
    entries: Mutex<HashMap<String, Entry<P>>>,
}

impl<P: Clone> TokenStore<P> {
    pub fn new(kind: TokenKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    // A panic while holding the lock cannot leave an entry half written.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<P>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issue(&self, payload: P, base_url: &str) -> Result<IssuedToken, TokenError> {
        self.issue_at(payload, base_url, Utc::now())
    }

    /// Generates the token before touching the store, so an entropy failure leaves nothing behind.
    pub fn issue_at(
        &self,
        payload: P,
        base_url: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let token = random_token()?;
        let expires_at = self.put_at(token.clone(), payload, token_ttl(), now);
        let url = format!("{base_url}/{}/{token}", self.kind.url_path());

        info!(
            kind = self.kind.as_str(),
            token = redact(&token),
            %expires_at,
            "Issued token"
        );

        Ok(IssuedToken {
            token,
            url,
            expires_at,
        })
    }

    pub fn put(&self, token: String, payload: P, ttl: Duration) -> DateTime<Utc> {
        self.put_at(token, payload, ttl, Utc::now())
    }

    /// Overwrites on collision.
    pub fn put_at(
        &self,
        token: String,
        payload: P,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let expires_at = now + ttl;

        self.entries().insert(
            token,
            Entry {
                payload,
                expires_at,
                claimed: false,
            },
        );

        expires_at
    }

    pub fn get(&self, token: &str) -> Result<P, TokenError> {
        self.get_at(token, Utc::now())
    }

    pub fn get_at(&self, token: &str, now: DateTime<Utc>) -> Result<P, TokenError> {
        let mut entries = self.entries();

        let Some(entry) = entries.get(token) else {
            warn!(kind = self.kind.as_str(), token = redact(token), "Unknown token");
            return Err(TokenError::NotFound);
        };

        // Expiry wins over a claim, an abandoned consumer must not pin the entry.
        if entry.is_expired(now) {
            entries.remove(token);
            debug!(kind = self.kind.as_str(), token = redact(token), "Evicted expired token");

            warn!(kind = self.kind.as_str(), token = redact(token), "Expired token");
            return Err(TokenError::Expired);
        }

        Ok(entry.payload.clone())
    }

    pub fn delete(&self, token: &str) -> bool {
        self.entries().remove(token).is_some()
    }

    pub fn claim(&self, token: &str) -> Result<Claim<'_, P>, TokenError> {
        self.claim_at(token, Utc::now())
    }

    /// Marks a valid entry as in flight and hands back a [`Claim`] on it. Only one caller can
    /// hold the claim; every other caller sees [`TokenError::Claimed`] until the guard is dropped
    /// without [`Claim::commit`].
    pub fn claim_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claim<'_, P>, TokenError> {
        let mut entries = self.entries();

        let Some(entry) = entries.get_mut(token) else {
            return Err(TokenError::NotFound);
        };

        if entry.is_expired(now) {
            entries.remove(token);
            debug!(kind = self.kind.as_str(), token = redact(token), "Evicted expired token");

            return Err(TokenError::Expired);
        }

        if entry.claimed {
            return Err(TokenError::Claimed);
        }

        entry.claimed = true;

        Ok(Claim {
            store: self,
            token: token.to_string(),
            payload: entry.payload.clone(),
            committed: false,
        })
    }

    fn release(&self, token: &str) {
        if let Some(entry) = self.entries().get_mut(token) {
            entry.claimed = false;
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drops every expired entry, claimed or not, returns how many went.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries();
        let before = entries.len();

        entries.retain(|_, entry| !entry.is_expired(now));

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Exclusive hold on a claimed entry. Dropping it without [`Claim::commit`] releases the entry,
/// so a consumer that errors, panics or is cancelled mid await never burns the token.
#[must_use = "dropping a claim releases it immediately"]
pub struct Claim<'a, P: Clone> {
    store: &'a TokenStore<P>,
    token: String,
    payload: P,
    committed: bool,
}

impl<P: Clone> Claim<'_, P> {
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Deletes the entry for good.
    pub fn commit(mut self) {
        self.committed = true;
        self.store.delete(&self.token);
    }
}

impl<P: Clone> Drop for Claim<'_, P> {
    fn drop(&mut self) {
        if !self.committed {
            self.store.release(&self.token);
            debug!(
                kind = self.store.kind.as_str(),
                token = redact(&self.token),
                "Released claim"
            );
        }
    }
}

pub struct TokenStores {
    pub registration: TokenStore<PatientDetails>,
    pub patient_access: TokenStore<String>,
    pub feedback: TokenStore<Option<String>>,
}

impl TokenStores {
    pub fn new() -> Self {
        Self {
            registration: TokenStore::new(TokenKind::Registration),
            patient_access: TokenStore::new(TokenKind::PatientAccess),
            feedback: TokenStore::new(TokenKind::Feedback),
        }
    }

    pub fn sweep(&self) -> usize {
        self.registration.sweep() + self.patient_access.sweep() + self.feedback.sweep()
    }
}

impl Default for TokenStores {
    fn default() -> Self {
        Self::new()
    }
}
