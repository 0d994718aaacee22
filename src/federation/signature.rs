//! Request signatures for federation traffic
//!
//! Every federated request and every signed response carries three headers:
//! `x-signature`, `x-signed-at` (unix seconds) and `x-signed-by` (signer URI),
//! plus a `digest` of the body. The signature is Ed25519 over the canonical
//! string:
//!
//! ```text
//! {method-lowercase} {path-and-query} {signed_at} {digest}
//! ```
//!
//! where `digest` is `SHA-256=base64(sha256(body))` over the exact bytes sent.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use http::HeaderMap;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::data::Actor;
use crate::error::AppError;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const SIGNED_AT_HEADER: &str = "x-signed-at";
pub const SIGNED_BY_HEADER: &str = "x-signed-by";
pub const DIGEST_HEADER: &str = "digest";

/// Private signing material of a local actor
pub struct SigningIdentity {
    actor_uri: String,
    signing_key: SigningKey,
}

impl SigningIdentity {
    /// Build from a base64 Ed25519 seed
    pub fn new(actor_uri: impl Into<String>, private_key_b64: &str) -> Result<Self, AppError> {
        let seed: [u8; 32] = BASE64
            .decode(private_key_b64.trim())
            .map_err(|e| AppError::Config(format!("Invalid private key encoding: {}", e)))?
            .try_into()
            .map_err(|_| AppError::Config("Private key must be 32 bytes".to_string()))?;

        Ok(Self {
            actor_uri: actor_uri.into(),
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Signing identity of a local actor
    ///
    /// # Errors
    /// `Forbidden` for remote actors, which hold no private key
    pub fn from_actor(actor: &Actor) -> Result<Self, AppError> {
        let private_key = actor
            .private_key
            .as_deref()
            .filter(|_| !actor.is_remote)
            .ok_or(AppError::Forbidden)?;
        Self::new(&actor.uri, private_key)
    }

    pub fn actor_uri(&self) -> &str {
        &self.actor_uri
    }

    /// Base64 verifying key matching this identity
    pub fn public_key(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }
}

/// Signature envelope of one request or response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHeaders {
    /// Base64 Ed25519 signature (64 bytes)
    pub signature: String,
    /// Unix seconds at signing time
    pub signed_at: i64,
    /// URI of the signing actor
    pub signed_by: String,
    /// `SHA-256=...` digest of the body, if the sender included one
    pub digest: Option<String>,
}

impl SignatureHeaders {
    /// Read the envelope from request headers
    ///
    /// # Errors
    /// `InvalidSignature` if a mandatory header is missing or unreadable
    pub fn from_header_map(headers: &HeaderMap) -> Result<Self, AppError> {
        let signature = required_header(headers, SIGNATURE_HEADER)?;
        let signed_at = required_header(headers, SIGNED_AT_HEADER)?
            .parse::<i64>()
            .map_err(|_| AppError::InvalidSignature("Invalid x-signed-at header".to_string()))?;
        let signed_by = required_header(headers, SIGNED_BY_HEADER)?;
        let digest = headers
            .get(DIGEST_HEADER)
            .map(|value| {
                value
                    .to_str()
                    .map(str::to_string)
                    .map_err(|_| AppError::InvalidSignature("Invalid digest header".to_string()))
            })
            .transpose()?;

        Ok(Self {
            signature,
            signed_at,
            signed_by,
            digest,
        })
    }

    /// Header name/value pairs to attach to an outgoing message
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (SIGNATURE_HEADER, self.signature.clone()),
            (SIGNED_AT_HEADER, self.signed_at.to_string()),
            (SIGNED_BY_HEADER, self.signed_by.clone()),
        ];
        if let Some(digest) = &self.digest {
            pairs.push((DIGEST_HEADER, digest.clone()));
        }
        pairs
    }
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::InvalidSignature(format!("Missing {} header", name)))?
        .to_str()
        .map(str::to_string)
        .map_err(|_| AppError::InvalidSignature(format!("Invalid {} header", name)))
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Canonical signing string
pub fn canonical_string(method: &str, path_and_query: &str, signed_at: i64, digest: &str) -> String {
    format!(
        "{} {} {} {}",
        method.to_ascii_lowercase(),
        path_and_query,
        signed_at,
        digest
    )
}

/// Generate a fresh Ed25519 keypair
///
/// # Returns
/// `(private_key_b64, public_key_b64)`
pub fn generate_keypair() -> (String, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (
        BASE64.encode(signing_key.to_bytes()),
        BASE64.encode(signing_key.verifying_key().to_bytes()),
    )
}

fn path_and_query(url: &str) -> Result<String, AppError> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    Ok(match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    })
}

/// Sign an outgoing request
///
/// # Arguments
/// * `identity` - Local actor signing the request
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full target URL
/// * `body` - Exact body bytes that will be sent (empty for GET)
pub fn sign_request(
    identity: &SigningIdentity,
    method: &str,
    url: &str,
    body: &[u8],
) -> Result<SignatureHeaders, AppError> {
    let target = path_and_query(url)?;
    Ok(sign_at(identity, method, &target, body, Utc::now().timestamp()))
}

/// Sign a response body served at `path`
///
/// Responses use the `get` method in the canonical string.
pub fn sign_response(identity: &SigningIdentity, path: &str, body: &[u8]) -> SignatureHeaders {
    sign_at(identity, "get", path, body, Utc::now().timestamp())
}

/// Sign with an explicit timestamp
pub fn sign_at(
    identity: &SigningIdentity,
    method: &str,
    path_and_query: &str,
    body: &[u8],
    signed_at: i64,
) -> SignatureHeaders {
    let digest = generate_digest(body);
    let canonical = canonical_string(method, path_and_query, signed_at, &digest);
    let signature = identity.signing_key.sign(canonical.as_bytes());

    SignatureHeaders {
        signature: BASE64.encode(signature.to_bytes()),
        signed_at,
        signed_by: identity.actor_uri.clone(),
        digest: Some(digest),
    }
}

/// Reject timestamps outside `max_age` of `reference`, in either direction
pub fn check_freshness(
    signed_at: i64,
    reference: DateTime<Utc>,
    max_age: Duration,
) -> Result<(), AppError> {
    let skew = reference.timestamp().abs_diff(signed_at);
    if skew > max_age.as_secs() {
        return Err(AppError::InvalidSignature(
            "Signature timestamp outside the accepted window".to_string(),
        ));
    }
    Ok(())
}

fn decode_verifying_key(public_key_b64: &str) -> Result<VerifyingKey, AppError> {
    let bytes: [u8; 32] = BASE64
        .decode(public_key_b64.trim())
        .map_err(|e| AppError::InvalidSignature(format!("Invalid public key encoding: {}", e)))?
        .try_into()
        .map_err(|_| AppError::InvalidSignature("Public key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| AppError::InvalidSignature(format!("Invalid Ed25519 public key: {}", e)))
}

fn decode_signature(signature_b64: &str) -> Result<Signature, AppError> {
    let bytes: [u8; 64] = BASE64
        .decode(signature_b64.trim())
        .map_err(|e| AppError::InvalidSignature(format!("Invalid signature encoding: {}", e)))?
        .try_into()
        .map_err(|_| AppError::InvalidSignature("Signature must be 64 bytes".to_string()))?;

    Ok(Signature::from_bytes(&bytes))
}

/// Verify a signature envelope against a known public key
///
/// # Arguments
/// * `method` - HTTP method of the received request
/// * `path_and_query` - Target path as received
/// * `headers` - Signature envelope
/// * `body` - Raw received body
/// * `public_key_b64` - Signer's Ed25519 verifying key
/// * `max_age` - Accepted clock distance of `signed_at`
/// * `reference` - Time the request was received
///
/// # Errors
/// `InvalidSignature` on a stale timestamp, digest mismatch or bad signature
pub fn verify_signature(
    method: &str,
    path_and_query: &str,
    headers: &SignatureHeaders,
    body: &[u8],
    public_key_b64: &str,
    max_age: Duration,
    reference: DateTime<Utc>,
) -> Result<(), AppError> {
    check_freshness(headers.signed_at, reference, max_age)?;

    let expected_digest = generate_digest(body);
    if let Some(digest) = &headers.digest {
        if digest != &expected_digest {
            return Err(AppError::InvalidSignature("Digest mismatch".to_string()));
        }
    }

    let verifying_key = decode_verifying_key(public_key_b64)?;
    let signature = decode_signature(&headers.signature)?;
    let canonical = canonical_string(method, path_and_query, headers.signed_at, &expected_digest);

    verifying_key
        .verify(canonical.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature("Signature verification failed".to_string()))
}

/// Source of signer public keys
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Base64 public key of the actor at `actor_uri`
    ///
    /// # Returns
    /// None when the actor cannot be resolved.
    async fn public_key(&self, actor_uri: &str) -> Result<Option<String>, AppError>;
}

/// Verify a received request, resolving the signer's key
///
/// Cheap checks run before the resolver is consulted, so stale or
/// malformed requests never trigger a remote fetch.
///
/// # Returns
/// The verified signer URI.
pub async fn verify_request(
    resolver: &dyn KeyResolver,
    method: &str,
    path_and_query: &str,
    headers: &SignatureHeaders,
    body: &[u8],
    max_age: Duration,
    reference: DateTime<Utc>,
) -> Result<String, AppError> {
    let outcome: Result<String, AppError> = async {
        check_freshness(headers.signed_at, reference, max_age)?;

        let public_key = resolver
            .public_key(&headers.signed_by)
            .await?
            .ok_or_else(|| {
                AppError::InvalidSignature(format!(
                    "Signer could not be resolved: {}",
                    headers.signed_by
                ))
            })?;

        verify_signature(
            method,
            path_and_query,
            headers,
            body,
            &public_key,
            max_age,
            reference,
        )?;

        Ok(headers.signed_by.clone())
    }
    .await;

    let label = match &outcome {
        Ok(_) => "valid",
        Err(error) if error.is_authentication() => "invalid",
        Err(_) => "error",
    };
    crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL
        .with_label_values(&[label])
        .inc();

    outcome
}
