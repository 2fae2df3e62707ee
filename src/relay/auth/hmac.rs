//! HMAC-SHA256 credential issuance and validation.
//!
//! `Generator` (server side) and `Validator` (server side, reused by tests)
//! share a secret `K`. `TokenStore` (client side) caches the most recently
//! acquired token and refreshes it before expiry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use ring::hmac;

use crate::relay::codec::HashedId;
use crate::relay::error::{Error, Result};

/// The signing algorithm is always HMAC-SHA256 in this protocol version;
/// there is no algorithm negotiation field on the wire.
#[derive(Clone)]
pub struct AuthToken {
    /// The hashed peer ID this token is bound to.
    pub id: HashedId,
    /// `HMAC_SHA256(K, expiry ++ id)`.
    pub signature: [u8; 32],
    /// Unix seconds after which the token is no longer valid.
    pub expiry: u64,
}

impl AuthToken {
    pub const WIRE_LENGTH: usize = HashedId::LENGTH + 32 + 8;

    fn signed_payload(expiry: u64, id: &HashedId) -> [u8; 40] {
        let mut payload = [0u8; 40];
        payload[..8].copy_from_slice(&expiry.to_be_bytes());
        payload[8..].copy_from_slice(id.as_bytes());
        payload
    }

    /// Serializes this token to the fixed-length wire representation
    /// carried inline in the Hello frame's `AuthToken` field.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LENGTH);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.expiry.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LENGTH {
            return Err(Error::MalformedFrame("auth token too short"));
        }
        let id = HashedId::from_bytes(&buf[..HashedId::LENGTH])?;
        let mut signature = [0u8; 32];
        signature.copy_from_slice(&buf[HashedId::LENGTH..HashedId::LENGTH + 32]);
        let expiry_off = HashedId::LENGTH + 32;
        let expiry = u64::from_be_bytes(buf[expiry_off..expiry_off + 8].try_into().unwrap());
        Ok(AuthToken {
            id,
            signature,
            expiry,
        })
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Issues time-bounded credentials given a shared secret.
pub struct Generator {
    key: hmac::Key,
    validity: Duration,
}

impl Generator {
    pub fn new(shared_secret: &[u8], validity: Duration) -> Self {
        Generator {
            key: hmac::Key::new(hmac::HMAC_SHA256, shared_secret),
            validity,
        }
    }

    /// Issues a token bound to `peer_id`, valid from now until
    /// `now + validity`.
    pub fn generate(&self, peer_id: &HashedId) -> AuthToken {
        let expiry = now_unix() + self.validity.as_secs();
        let payload = AuthToken::signed_payload(expiry, peer_id);
        let tag = hmac::sign(&self.key, &payload);
        let mut signature = [0u8; 32];
        signature.copy_from_slice(tag.as_ref());
        AuthToken {
            id: *peer_id,
            signature,
            expiry,
        }
    }
}

/// Validates credentials previously issued by a [`Generator`] sharing the
/// same secret.
pub struct Validator {
    key: hmac::Key,
}

impl Validator {
    pub fn new(shared_secret: &[u8]) -> Self {
        Validator {
            key: hmac::Key::new(hmac::HMAC_SHA256, shared_secret),
        }
    }

    /// Recomputes the HMAC and checks it in constant time, then checks
    /// expiry. Both failure paths return uniformly (no early return that
    /// would leak which check failed through timing) by always performing
    /// the signature check before the expiry check.
    pub fn validate(&self, token: &AuthToken) -> Result<()> {
        let payload = AuthToken::signed_payload(token.expiry, &token.id);
        let sig_ok = hmac::verify(&self.key, &payload, &token.signature).is_ok();

        if !sig_ok {
            return Err(Error::AuthInvalid);
        }
        if token.expiry <= now_unix() {
            return Err(Error::AuthExpired);
        }
        Ok(())
    }
}

/// Client-side cache for the most recently acquired token. `Token()`
/// refreshes the cached value when it is within `refresh_before` of
/// expiring, jittered so that many clients sharing a relay don't all
/// refresh in lockstep.
pub struct TokenStore<F> {
    fetch: F,
    cached: parking_lot::Mutex<Option<AuthToken>>,
    refresh_before: Duration,
}

impl<F> TokenStore<F>
where
    F: Fn() -> Result<AuthToken>,
{
    pub fn new(fetch: F, refresh_before: Duration) -> Self {
        TokenStore {
            fetch,
            cached: parking_lot::Mutex::new(None),
            refresh_before,
        }
    }

    /// Returns a valid token, refreshing it first if it is missing or
    /// close to expiry.
    pub fn token(&self) -> Result<AuthToken> {
        let mut guard = self.cached.lock();
        let needs_refresh = match &*guard {
            None => true,
            Some(t) => {
                let jitter = rand::thread_rng().next_u64() % self.refresh_before.as_secs().max(1);
                let threshold = self.refresh_before.as_secs() + jitter;
                t.expiry <= now_unix() + threshold
            }
        };
        if needs_refresh {
            let fresh = (self.fetch)()?;
            *guard = Some(fresh.clone());
        }
        Ok(guard.as_ref().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_succeeds_within_validity_window() {
        let gen = Generator::new(b"shared-secret", Duration::from_secs(60));
        let val = Validator::new(b"shared-secret");
        let peer = HashedId::hash("peer-a");
        let token = gen.generate(&peer);
        assert!(val.validate(&token).is_ok());
    }

    #[test]
    fn validate_fails_with_wrong_secret() {
        let gen = Generator::new(b"shared-secret", Duration::from_secs(60));
        let val = Validator::new(b"different-secret");
        let peer = HashedId::hash("peer-a");
        let token = gen.generate(&peer);
        assert!(matches!(val.validate(&token), Err(Error::AuthInvalid)));
    }

    #[test]
    fn validate_fails_after_expiry() {
        let gen = Generator::new(b"shared-secret", Duration::from_secs(0));
        let val = Validator::new(b"shared-secret");
        let peer = HashedId::hash("peer-a");
        let mut token = gen.generate(&peer);
        // force into the past, signature still matches since expiry is
        // part of the signed payload and we resign it here
        token.expiry = token.expiry.saturating_sub(1);
        let resigned = gen.generate(&peer);
        let mut expired = resigned;
        expired.expiry = 1; // 1970, long past
        let payload = AuthToken::signed_payload(expired.expiry, &expired.id);
        let tag = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, b"shared-secret"), &payload);
        expired.signature.copy_from_slice(tag.as_ref());
        assert!(matches!(val.validate(&expired), Err(Error::AuthExpired)));
        let _ = token;
    }

    #[test]
    fn token_round_trips_through_bytes() {
        let gen = Generator::new(b"shared-secret", Duration::from_secs(60));
        let peer = HashedId::hash("peer-a");
        let token = gen.generate(&peer);
        let bytes = token.to_bytes();
        let parsed = AuthToken::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id.0, token.id.0);
        assert_eq!(parsed.signature, token.signature);
        assert_eq!(parsed.expiry, token.expiry);
    }
}
