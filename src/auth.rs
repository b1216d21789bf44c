//! Connection token verification
//!
//! Tokens are `base64url("<user_id>:<unix_exp>.<hex hmac_sha256(secret, "<user_id>:<unix_exp>")>")`,
//! without padding. They carry no display name; the identity is completed
//! from the directory at admission time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

/// Token lifetime for `hours`, or `None` when it does not fit in seconds
pub fn ttl_from_hours(hours: u64) -> Option<Duration> {
    hours.checked_mul(3600).map(Duration::from_secs)
}

/// Verifies a presented credential and yields the stable user id behind it
pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<Uuid, AuthError>;
}

#[derive(Clone)]
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
    ttl: Duration,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.secret).unwrap_or_else(|_| unreachable!())
    }

    /// Issue a token for `user_id` valid for the configured ttl
    pub fn issue(&self, user_id: Uuid) -> String {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let exp = Utc::now().timestamp().saturating_add(ttl);
        self.issue_with_expiry(user_id, exp)
    }

    fn issue_with_expiry(&self, user_id: Uuid, exp: i64) -> String {
        let payload = format!("{user_id}:{exp}");
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        URL_SAFE_NO_PAD.encode(format!("{payload}.{sig}"))
    }
}

impl Authenticator for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| AuthError::Malformed)?;
        let raw = String::from_utf8(raw).map_err(|_| AuthError::Malformed)?;

        let (payload, sig) = raw.split_once('.').ok_or(AuthError::Malformed)?;
        let sig = hex::decode(sig).map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

        let (user_id, exp) = payload.split_once(':').ok_or(AuthError::Malformed)?;
        let exp: i64 = exp.parse().map_err(|_| AuthError::Malformed)?;
        if Utc::now().timestamp() > exp {
            return Err(AuthError::Expired);
        }

        Uuid::parse_str(user_id).map_err(|_| AuthError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> HmacTokenVerifier {
        HmacTokenVerifier::new("test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn ttl_hours_reject_overflow() {
        assert_eq!(ttl_from_hours(72), Some(Duration::from_secs(72 * 3600)));
        assert_eq!(ttl_from_hours(u64::MAX), None);
        assert_eq!(ttl_from_hours(u64::MAX / 3600 + 1), None);
    }

    #[test]
    fn huge_ttl_still_issues_a_valid_token() {
        let verifier = HmacTokenVerifier::new("test-secret", Duration::from_secs(u64::MAX));
        let user = Uuid::new_v4();
        assert_eq!(verifier.verify(&verifier.issue(user)), Ok(user));
    }

    #[test]
    fn issued_token_verifies() {
        let v = verifier();
        let user = Uuid::new_v4();
        assert_eq!(v.verify(&v.issue(user)), Ok(user));
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let other = HmacTokenVerifier::new("other-secret", Duration::from_secs(3600));
        let token = other.issue(Uuid::new_v4());
        assert_eq!(verifier().verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let v = verifier();
        let token = v.issue(Uuid::new_v4());
        let raw = String::from_utf8(URL_SAFE_NO_PAD.decode(&token).unwrap()).unwrap();
        let (_, sig) = raw.split_once('.').unwrap();
        let forged = URL_SAFE_NO_PAD.encode(format!("{}:{}.{}", Uuid::new_v4(), i64::MAX, sig));
        assert_eq!(v.verify(&forged), Err(AuthError::BadSignature));
    }

    #[test]
    fn expired_token_is_rejected() {
        let v = verifier();
        let token = v.issue_with_expiry(Uuid::new_v4(), Utc::now().timestamp() - 10);
        assert_eq!(v.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn garbage_is_malformed() {
        let v = verifier();
        assert_eq!(v.verify("%%%"), Err(AuthError::Malformed));
        assert_eq!(
            v.verify(&URL_SAFE_NO_PAD.encode("no-separator")),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            v.verify(&URL_SAFE_NO_PAD.encode("a:b.zz")),
            Err(AuthError::Malformed)
        );
    }
}
