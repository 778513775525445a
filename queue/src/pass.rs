//! Signed queue-pass capabilities.
//!
//! A pass is a compact HS256 JWT binding `(user, event)` to an expiry. The
//! signature makes the capability tamper-evident on its own; the store's
//! canonical copy (checked separately by the controller) makes it revocable
//! and single-use.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use stampede_core::types::{EventId, UserId};

/// Claims carried inside a queue pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassClaims {
    /// The admitted user.
    pub sub: String,
    /// The event the pass admits to.
    pub evt: String,
    /// Issued-at, epoch seconds.
    pub iat: i64,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

/// Mints and verifies queue passes with a server secret.
pub struct PassSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl PassSigner {
    /// Create a signer from the server secret.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mint a pass for `(user, event)` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns the serialization error message if signing fails (only
    /// possible with a malformed key).
    pub fn mint(
        &self,
        user_id: &UserId,
        event_id: &EventId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<String, String> {
        let claims = PassClaims {
            sub: user_id.to_string(),
            evt: event_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| e.to_string())
    }

    /// Verify signature, expiry, and `(user, event)` binding.
    #[must_use]
    pub fn verify(&self, pass: &str, user_id: &UserId, event_id: &EventId) -> bool {
        decode::<PassClaims>(pass, &self.decoding, &self.validation).is_ok_and(|data| {
            data.claims.sub == user_id.as_str() && data.claims.evt == event_id.as_str()
        })
    }

    /// Read the expiry out of a pass without trusting anything else in it.
    #[must_use]
    pub fn peek_expiry(&self, pass: &str) -> Option<DateTime<Utc>> {
        decode::<PassClaims>(pass, &self.decoding, &self.validation)
            .ok()
            .and_then(|data| DateTime::from_timestamp(data.claims.exp, 0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn signer() -> PassSigner {
        PassSigner::new(b"test-secret")
    }

    #[test]
    fn minted_pass_verifies_for_its_binding() {
        let signer = signer();
        let user = UserId::new("u1");
        let event = EventId::new("e1");

        let pass = signer
            .mint(&user, &event, Utc::now(), Duration::seconds(300))
            .unwrap();

        assert!(signer.verify(&pass, &user, &event));
        assert!(!signer.verify(&pass, &UserId::new("u2"), &event));
        assert!(!signer.verify(&pass, &user, &EventId::new("e2")));
    }

    #[test]
    fn expired_pass_is_rejected() {
        let signer = signer();
        let user = UserId::new("u1");
        let event = EventId::new("e1");

        // jsonwebtoken applies default expiry leeway, so back-date well past it.
        let issued = Utc::now() - Duration::seconds(600);
        let pass = signer
            .mint(&user, &event, issued, Duration::seconds(300))
            .unwrap();

        assert!(!signer.verify(&pass, &user, &event));
    }

    #[test]
    fn tampered_pass_is_rejected() {
        let signer = signer();
        let other = PassSigner::new(b"other-secret");
        let user = UserId::new("u1");
        let event = EventId::new("e1");

        let forged = other
            .mint(&user, &event, Utc::now(), Duration::seconds(300))
            .unwrap();
        assert!(!signer.verify(&forged, &user, &event));
    }

    #[test]
    fn peek_expiry_reads_the_exp_claim() {
        let signer = signer();
        let now = Utc::now();
        let pass = signer
            .mint(&UserId::new("u1"), &EventId::new("e1"), now, Duration::seconds(300))
            .unwrap();

        let expiry = signer.peek_expiry(&pass).unwrap();
        assert_eq!(expiry.timestamp(), (now + Duration::seconds(300)).timestamp());
    }
}
