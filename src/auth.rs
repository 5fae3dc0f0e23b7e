//! Authentication for the private (account) side of the websocket API
//!
//! The exchange authenticates a websocket session with a single `auth` event
//! carrying the API key, a payload of the form `AUTH<nonce>`, and a signature
//! over that payload. The signature scheme is pluggable through [`Signer`];
//! [`HmacSigner`] implements the exchange's HMAC-SHA384 scheme.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha384;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "BFX_API_KEY";
/// Environment variable holding the API secret
pub const API_SECRET_ENV: &str = "BFX_API_SECRET";

type HmacSha384 = Hmac<Sha384>;

/// Capability that turns an authentication payload into a signature
pub trait Signer: Send + Sync {
    fn sign(&self, payload: &str) -> Result<String>;
}

/// Hex-encoded HMAC-SHA384 signer keyed with the API secret
#[derive(Clone)]
pub struct HmacSigner {
    secret: String,
}

impl HmacSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

impl Signer for HmacSigner {
    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha384::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Auth(format!("Invalid secret: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// API key plus the signer holding its secret
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    signer: Arc<dyn Signer>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Create credentials signed with the exchange's HMAC scheme
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_signer(api_key, Arc::new(HmacSigner::new(api_secret)))
    }

    /// Create credentials backed by an external signer
    pub fn with_signer(api_key: impl Into<String>, signer: Arc<dyn Signer>) -> Self {
        Self {
            api_key: api_key.into(),
            signer,
        }
    }

    /// Load credentials from `BFX_API_KEY` / `BFX_API_SECRET`
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| Error::NoCredentials(format!("{API_KEY_ENV} is not set")))?;
        let secret = std::env::var(API_SECRET_ENV)
            .map_err(|_| Error::NoCredentials(format!("{API_SECRET_ENV} is not set")))?;
        Ok(Self::new(key, secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Build a signed `auth` event for the given nonce
    pub fn auth_request(&self, nonce: u64) -> Result<AuthRequest> {
        if self.api_key.is_empty() {
            return Err(Error::NoCredentials("api key is empty".to_string()));
        }

        let payload = auth_payload(nonce);
        let signature = self.signer.sign(&payload)?;

        Ok(AuthRequest {
            event: "auth",
            api_key: self.api_key.clone(),
            auth_sig: signature,
            auth_payload: payload,
            auth_nonce: nonce,
        })
    }
}

/// The payload string signed during authentication
pub fn auth_payload(nonce: u64) -> String {
    format!("AUTH{nonce}")
}

/// Wire format of the `auth` event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub event: &'static str,
    pub api_key: String,
    pub auth_sig: String,
    pub auth_payload: String,
    pub auth_nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSigner;

    impl Signer for FixedSigner {
        fn sign(&self, payload: &str) -> Result<String> {
            Ok(format!("signed:{payload}"))
        }
    }

    #[test]
    fn test_auth_payload_format() {
        assert_eq!(auth_payload(1567590617442000), "AUTH1567590617442000");
    }

    #[test]
    fn test_hmac_signer_produces_sha384_hex() {
        let signer = HmacSigner::new("secret");
        let sig = signer.sign("AUTH1").unwrap();

        // SHA-384 digests are 48 bytes
        assert_eq!(sig.len(), 96);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hmac_signer_is_deterministic() {
        let a = HmacSigner::new("secret").sign("AUTH42").unwrap();
        let b = HmacSigner::new("secret").sign("AUTH42").unwrap();
        let c = HmacSigner::new("other").sign("AUTH42").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_auth_request_serialization() {
        let creds = Credentials::with_signer("key", Arc::new(FixedSigner));
        let request = creds.auth_request(99).unwrap();
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["event"], "auth");
        assert_eq!(json["apiKey"], "key");
        assert_eq!(json["authPayload"], "AUTH99");
        assert_eq!(json["authSig"], "signed:AUTH99");
        assert_eq!(json["authNonce"], 99);
    }

    #[test]
    fn test_auth_request_requires_key() {
        let creds = Credentials::new("", "secret");
        let result = creds.auth_request(1);
        assert!(matches!(result, Err(Error::NoCredentials(_))));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::new("public-key", "very-secret");
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("public-key"));
        assert!(!debug_str.contains("very-secret"));
    }

    #[test]
    fn test_credentials_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Credentials>();
        assert_sync::<Credentials>();
    }
}
