/**
 * ACTION TOKENS - correlate discovery and execution of host-targeted actions
 *
 * Format: base64url(JSON claims) "." base64url(HMAC-SHA256(claims))
 *
 * The token carries everything the execution phase needs (principal, VM,
 * action, the candidate host names offered) so the kernel keeps no
 * per-request state between the two phases.
 */

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::authz::Action;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionClaims {
    pub principal: String,
    pub pool: String,
    pub vm: String,
    pub action: Action,
    pub candidates: Vec<String>,
    /// unix seconds
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self { key: secret.as_ref().to_vec(), ttl }
    }

    /// Per-process secret: tokens do not survive a restart.
    pub fn random(ttl: Duration) -> Self {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self { key, ttl }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.key).unwrap_or_else(|_| unreachable!())
    }

    pub fn issue(&self, mut claims: ActionClaims, now: OffsetDateTime) -> String {
        claims.expires_at = (now + self.ttl).unix_timestamp();
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let mut mac = self.mac();
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), URL_SAFE_NO_PAD.encode(sig))
    }

    pub fn verify(&self, token: &str, now: OffsetDateTime) -> Result<ActionClaims, TokenError> {
        let (payload, sig) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD.decode(payload).map_err(|_| TokenError::Malformed)?;
        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let claims: ActionClaims = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if now.unix_timestamp() >= claims.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> ActionClaims {
        ActionClaims {
            principal: "alice".into(),
            pool: "lab".into(),
            vm: "web01".into(),
            action: Action::Migrate,
            candidates: vec!["xs2".into(), "xs3".into()],
            expires_at: 0,
        }
    }

    #[test]
    fn issued_token_verifies_until_expiry() {
        let signer = TokenSigner::new("secret", Duration::seconds(300));
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let token = signer.issue(claims(), now);

        let back = signer.verify(&token, now + Duration::seconds(299)).unwrap();
        assert_eq!(back.candidates, vec!["xs2", "xs3"]);
        assert_eq!(back.expires_at, 1_700_000_300);
        assert_eq!(signer.verify(&token, now + Duration::seconds(300)), Err(TokenError::Expired));
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let signer = TokenSigner::new("secret", Duration::seconds(300));
        let now = OffsetDateTime::now_utc();
        let token = signer.issue(claims(), now);

        let other = TokenSigner::new("another secret", Duration::seconds(300));
        assert_eq!(other.verify(&token, now), Err(TokenError::BadSignature));

        // swap the payload for one naming a different VM, keep the signature
        let (_, sig) = token.split_once('.').unwrap();
        let mut forged = claims();
        forged.vm = "db01".into();
        forged.expires_at = now.unix_timestamp() + 300;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap()), sig);
        assert_eq!(signer.verify(&forged, now), Err(TokenError::BadSignature));

        assert_eq!(signer.verify("garbage", now), Err(TokenError::Malformed));
    }

    #[test]
    fn random_signers_do_not_trust_each_other() {
        let a = TokenSigner::random(Duration::seconds(60));
        let b = TokenSigner::random(Duration::seconds(60));
        let now = OffsetDateTime::now_utc();
        assert!(b.verify(&a.issue(claims(), now), now).is_err());
    }
}
